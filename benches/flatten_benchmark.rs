use criterion::{black_box, criterion_group, criterion_main, Criterion};
use monobc::{flatten, Jet, RawEvent, RawEvents, SelectionCuts};

fn synthetic_events(n_events: usize) -> RawEvents {
    let mut rng = fastrand::Rng::with_seed(42);
    let events: Vec<RawEvent> = (0..n_events)
        .map(|_| {
            let jets: Vec<Jet> = (0..rng.usize(0..8))
                .map(|_| Jet {
                    pt: 20.0 + 400.0 * rng.f64(),
                    eta: 6.0 * rng.f64() - 3.0,
                    phi: std::f64::consts::TAU * rng.f64() - std::f64::consts::PI,
                    btag: i64::from(rng.u8(0..10) == 0),
                })
                .collect();
            let ht = jets.iter().map(|jet| jet.pt).sum();
            RawEvent {
                jets,
                met: 500.0 * rng.f64(),
                met_phi: std::f64::consts::TAU * rng.f64() - std::f64::consts::PI,
                ht,
                cross_section: 1.0,
                event_weight: 1.0,
            }
        })
        .collect();
    RawEvents::from_events(&events)
}

fn flatten_benchmark(c: &mut Criterion) {
    let events = synthetic_events(100_000);
    let cuts = SelectionCuts::default();
    c.bench_function("flatten benchmark", |b| {
        b.iter(|| {
            black_box(flatten(&events, &cuts).unwrap());
        });
    });
}

criterion_group!(benches, flatten_benchmark);
criterion_main!(benches);
