use std::{
    f64::consts::{PI, TAU},
    fmt::Display,
};

use serde::{Deserialize, Serialize};

use crate::{
    data::{Category, CategoryTables, FlatEvent, Jet, RawEvents, RawSchema, RecordStore},
    MonoBcError, MonoBcResult,
};

/// Kinematic thresholds applied during flattening. Every comparison is inclusive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionCuts {
    /// Minimum number of jets in the event.
    pub min_jets: usize,
    /// Minimum transverse momentum of the leading jet.
    pub jet1_min_pt: f64,
    /// Maximum absolute pseudorapidity of the leading jet.
    pub jet1_max_abs_eta: f64,
    /// Minimum transverse momentum of the subleading jet.
    pub jet2_min_pt: f64,
    /// Maximum absolute pseudorapidity of the subleading jet.
    pub jet2_max_abs_eta: f64,
    /// Minimum missing transverse energy.
    pub min_met: f64,
}

impl Default for SelectionCuts {
    fn default() -> Self {
        Self {
            min_jets: 2,
            jet1_min_pt: 150.0,
            jet1_max_abs_eta: 2.4,
            jet2_min_pt: 30.0,
            jet2_max_abs_eta: 2.8,
            min_met: 200.0,
        }
    }
}

impl SelectionCuts {
    fn passes_jet1(&self, jet: &Jet) -> bool {
        jet.pt >= self.jet1_min_pt && jet.eta.abs() <= self.jet1_max_abs_eta
    }

    fn passes_jet2(&self, jet: &Jet) -> bool {
        jet.pt >= self.jet2_min_pt && jet.eta.abs() <= self.jet2_max_abs_eta
    }
}

/// The two highest-`pt` jets of an event, or [`None`] with fewer than two jets.
///
/// Jets are stable-sorted by descending `pt`, so jets with identical `pt` keep the order in
/// which they were recorded.
pub fn leading_jets(jets: &[Jet]) -> Option<(Jet, Jet)> {
    if jets.len() < 2 {
        return None;
    }
    let mut sorted = jets.to_vec();
    sorted.sort_by(|a, b| b.pt.total_cmp(&a.pt));
    Some((sorted[0], sorted[1]))
}

/// Absolute azimuthal separation of two angles, wrapped into `[0, π]`.
pub fn delta_phi(phi_a: f64, phi_b: f64) -> f64 {
    ((phi_a - phi_b + PI).rem_euclid(TAU) - PI).abs()
}

/// `met / sqrt(ht)`, or zero when `ht` is not strictly positive.
pub fn met_significance(met: f64, ht: f64) -> f64 {
    if ht > 0.0 {
        met / ht.sqrt()
    } else {
        0.0
    }
}

/// One event still passing the selection, carrying its leading jet pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Survivor {
    /// Index of the event in its input.
    pub index: usize,
    /// Leading jet.
    pub jet1: Jet,
    /// Subleading jet.
    pub jet2: Jet,
}

/// The ordered set of events surviving the stages applied so far.
///
/// Indices are strictly increasing and smaller than the number of input events; this is
/// checked every time a stage is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct SurvivorSet {
    n_events: usize,
    survivors: Vec<Survivor>,
}

impl SurvivorSet {
    /// Seed the set with every event of `events` that has at least `min_jets` jets (and never
    /// fewer than two).
    pub fn with_leading_jets(events: &RawEvents, min_jets: usize) -> MonoBcResult<Self> {
        let survivors = (0..events.n_events())
            .filter(|&i| events.n_jets(i) >= min_jets)
            .filter_map(|i| {
                leading_jets(&events.jets(i)).map(|(jet1, jet2)| Survivor {
                    index: i,
                    jet1,
                    jet2,
                })
            })
            .collect();
        let set = Self {
            n_events: events.n_events(),
            survivors,
        };
        set.check()?;
        Ok(set)
    }

    /// Keep the survivors for which `keep` holds.
    pub fn retain<F>(mut self, keep: F) -> MonoBcResult<Self>
    where
        F: Fn(&Survivor) -> bool,
    {
        self.survivors.retain(|s| keep(s));
        self.check()?;
        Ok(self)
    }

    fn check(&self) -> MonoBcResult<()> {
        if let Some(pair) = self
            .survivors
            .windows(2)
            .find(|pair| pair[0].index >= pair[1].index)
        {
            return Err(MonoBcError::Custom(format!(
                "Surviving indices out of order ({} then {})",
                pair[0].index, pair[1].index
            )));
        }
        if let Some(last) = self.survivors.last() {
            if last.index >= self.n_events {
                return Err(MonoBcError::Custom(format!(
                    "Surviving index {} out of range for {} events",
                    last.index, self.n_events
                )));
            }
        }
        Ok(())
    }

    /// Number of surviving events.
    pub fn len(&self) -> usize {
        self.survivors.len()
    }

    /// Returns `true` if no event survives.
    pub fn is_empty(&self) -> bool {
        self.survivors.is_empty()
    }

    /// Surviving event indices in increasing order.
    pub fn indices(&self) -> Vec<usize> {
        self.survivors.iter().map(|s| s.index).collect()
    }

    /// Iterate over the survivors in increasing index order.
    pub fn iter(&self) -> impl Iterator<Item = &Survivor> + '_ {
        self.survivors.iter()
    }
}

/// One row of a [`Cutflow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CutflowEntry {
    /// Stage name.
    pub stage: String,
    /// Events remaining after the stage.
    pub events: usize,
}

/// Number of events remaining after each selection stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cutflow {
    entries: Vec<CutflowEntry>,
}

impl Cutflow {
    /// Record the number of events left after `stage`.
    pub fn push<S: Into<String>>(&mut self, stage: S, events: usize) {
        self.entries.push(CutflowEntry {
            stage: stage.into(),
            events,
        });
    }

    /// All recorded stages in order.
    pub fn entries(&self) -> &[CutflowEntry] {
        &self.entries
    }

    /// Events remaining after `stage`, if it was recorded.
    pub fn events_after(&self, stage: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|entry| entry.stage == stage)
            .map(|entry| entry.events)
    }

    /// Events remaining after the last stage.
    pub fn passing(&self) -> usize {
        self.entries.last().map_or(0, |entry| entry.events)
    }
}

impl Display for Cutflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stages = self
            .entries
            .iter()
            .map(|entry| format!("{}: {}", entry.stage, entry.events))
            .collect::<Vec<_>>();
        write!(f, "{}", stages.join(" -> "))
    }
}

/// Cutflow stage names, in application order.
pub mod stages {
    /// Every input event.
    pub const ALL: &str = "all";
    /// At least the minimum number of jets.
    pub const JETS: &str = "n_jets";
    /// Leading jet kinematics.
    pub const JET1: &str = "jet1";
    /// Subleading jet kinematics.
    pub const JET2: &str = "jet2";
    /// Missing transverse energy.
    pub const MET: &str = "met";
}

/// The result of flattening one input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Flattened {
    /// Passing events with at least one tagged jet.
    pub tagged: Vec<FlatEvent>,
    /// Passing events without a tagged jet.
    pub untagged: Vec<FlatEvent>,
    /// Events remaining after each stage.
    pub cutflow: Cutflow,
}

impl Flattened {
    /// Events in `category`.
    pub fn events(&self, category: Category) -> &[FlatEvent] {
        match category {
            Category::Tagged => &self.tagged,
            Category::Untagged => &self.untagged,
        }
    }

    /// Total number of passing events.
    pub fn len(&self) -> usize {
        self.tagged.len() + self.untagged.len()
    }

    /// Returns `true` if no event passed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write both categories to `store` using the given table names. Empty categories are
    /// written as empty tables.
    pub fn write_to(&self, store: &mut dyn RecordStore, tables: &CategoryTables) -> MonoBcResult<()> {
        for category in Category::ALL {
            let table = FlatEvent::to_table(self.events(category))?;
            store.write_table(tables.table(category), &table)?;
        }
        Ok(())
    }
}

/// Apply the selection to `events` and split the passing events by [`Category`].
pub fn flatten(events: &RawEvents, cuts: &SelectionCuts) -> MonoBcResult<Flattened> {
    let mut cutflow = Cutflow::default();
    cutflow.push(stages::ALL, events.n_events());

    let survivors = SurvivorSet::with_leading_jets(events, cuts.min_jets)?;
    cutflow.push(stages::JETS, survivors.len());
    let survivors = survivors.retain(|s| cuts.passes_jet1(&s.jet1))?;
    cutflow.push(stages::JET1, survivors.len());
    let survivors = survivors.retain(|s| cuts.passes_jet2(&s.jet2))?;
    cutflow.push(stages::JET2, survivors.len());
    let survivors = survivors.retain(|s| events.met(s.index) >= cuts.min_met)?;
    cutflow.push(stages::MET, survivors.len());

    let mut flattened = Flattened {
        cutflow,
        ..Default::default()
    };
    for survivor in survivors.iter() {
        let i = survivor.index;
        let n_bjets = events.n_tagged(i) as i64;
        let flat = FlatEvent {
            jet1_pt: survivor.jet1.pt,
            jet2_pt: survivor.jet2.pt,
            jet1_eta: survivor.jet1.eta,
            jet2_eta: survivor.jet2.eta,
            jet1_phi: survivor.jet1.phi,
            jet2_phi: survivor.jet2.phi,
            met_pt: events.met(i),
            jet1_met_dphi: delta_phi(survivor.jet1.phi, events.met_phi(i)),
            met_sig: met_significance(events.met(i), events.ht(i)),
            n_jets: events.n_jets(i) as i64,
            n_bjets,
            cross_section: events.cross_section(i),
            event_weight: events.event_weight(i),
        };
        match Category::of(n_bjets) {
            Category::Tagged => flattened.tagged.push(flat),
            Category::Untagged => flattened.untagged.push(flat),
        }
    }
    Ok(flattened)
}

/// Read the raw event table described by `schema` from `input` and flatten it.
pub fn flatten_store(
    input: &dyn RecordStore,
    schema: &RawSchema,
    cuts: &SelectionCuts,
) -> MonoBcResult<Flattened> {
    let table = input.read_columns(&schema.tree, &schema.columns())?;
    let events = RawEvents::from_table(&table, schema)?;
    if !events.has_btag() {
        log::warn!(
            "No '{}' column in '{}'; treating every jet as untagged",
            schema.jet_btag,
            input.name()
        );
    }
    flatten(&events, cuts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{test_events, MemoryStore, RawEvent};
    use approx::assert_relative_eq;

    fn jet(pt: f64, eta: f64, phi: f64, btag: i64) -> Jet {
        Jet { pt, eta, phi, btag }
    }

    fn flatten_events(events: &[RawEvent], cuts: &SelectionCuts) -> Flattened {
        flatten(&RawEvents::from_events(events), cuts).unwrap()
    }

    #[test]
    fn test_leading_jets_sorted_by_pt() {
        let jets = [
            jet(50.0, 0.0, 0.0, 0),
            jet(200.0, 1.0, 0.1, 0),
            jet(100.0, -1.0, 0.2, 1),
        ];
        let (jet1, jet2) = leading_jets(&jets).unwrap();
        assert_eq!(jet1.pt, 200.0);
        assert_eq!(jet2.pt, 100.0);
        assert_eq!(jet2.btag, 1);
        assert!(leading_jets(&jets[..1]).is_none());
        assert!(leading_jets(&[]).is_none());
    }

    #[test]
    fn test_leading_jets_ties_keep_input_order() {
        let jets = [
            jet(80.0, 0.1, 0.0, 0),
            jet(120.0, 0.2, 0.0, 0),
            jet(120.0, 0.3, 0.0, 0),
        ];
        let (jet1, jet2) = leading_jets(&jets).unwrap();
        assert_eq!(jet1.eta, 0.2);
        assert_eq!(jet2.eta, 0.3);
    }

    #[test]
    fn test_delta_phi_wraps_into_range() {
        assert_relative_eq!(delta_phi(0.1, 0.0), 0.1, epsilon = 1e-12);
        assert_relative_eq!(delta_phi(3.0, -3.0), TAU - 6.0, epsilon = 1e-12);
        assert_relative_eq!(delta_phi(-3.0, 3.0), TAU - 6.0, epsilon = 1e-12);
        assert_relative_eq!(delta_phi(PI, 0.0), PI, epsilon = 1e-12);
        for k in -20..=20 {
            for m in -20..=20 {
                let dphi = delta_phi(0.37 * k as f64, 0.29 * m as f64);
                assert!((0.0..=PI).contains(&dphi));
            }
        }
    }

    #[test]
    fn test_met_significance_guards_ht() {
        assert_relative_eq!(met_significance(250.0, 100.0), 25.0);
        assert_eq!(met_significance(250.0, 0.0), 0.0);
        assert_eq!(met_significance(250.0, -4.0), 0.0);
        assert_eq!(met_significance(250.0, f64::NAN), 0.0);
    }

    #[test]
    fn test_flatten_passing_event() {
        let flat = flatten_events(&test_events()[..1], &SelectionCuts::default());
        assert!(flat.untagged.is_empty());
        assert_eq!(flat.tagged.len(), 1);
        let event = flat.tagged[0];
        assert_eq!(event.jet1_pt, 200.0);
        assert_eq!(event.jet2_pt, 100.0);
        assert_eq!(event.jet2_eta, -1.0);
        assert_relative_eq!(event.met_sig, 25.0);
        assert_relative_eq!(event.jet1_met_dphi, 0.1, epsilon = 1e-12);
        assert_eq!(event.n_jets, 3);
        assert_eq!(event.n_bjets, 1);
        assert_eq!(event.cross_section, 1.5);
    }

    #[test]
    fn test_flatten_rejects_single_jet_and_forward_leading_jet() {
        let events = test_events();
        let flat = flatten_events(&events[1..2], &SelectionCuts::default());
        assert!(flat.is_empty());
        assert_eq!(flat.cutflow.events_after(stages::JETS), Some(0));
        let flat = flatten_events(&events[2..3], &SelectionCuts::default());
        assert!(flat.is_empty());
        assert_eq!(flat.cutflow.events_after(stages::JETS), Some(1));
        assert_eq!(flat.cutflow.events_after(stages::JET1), Some(0));
    }

    #[test]
    fn test_flatten_full_sample() {
        let flat = flatten_events(&test_events(), &SelectionCuts::default());
        let counts: Vec<usize> = flat.cutflow.entries().iter().map(|e| e.events).collect();
        assert_eq!(counts, vec![5, 4, 3, 3, 2]);
        assert_eq!(flat.tagged.len(), 1);
        assert_eq!(flat.untagged.len(), 1);
        assert_eq!(flat.len(), flat.cutflow.passing());
        let untagged = flat.untagged[0];
        assert_eq!(untagged.jet1_pt, 180.0);
        assert_eq!(untagged.jet2_pt, 40.0);
        assert_eq!(untagged.met_sig, 0.0);
        assert_relative_eq!(untagged.jet1_met_dphi, TAU - 6.0, epsilon = 1e-12);
        for event in flat.tagged.iter().chain(&flat.untagged) {
            assert!(event.jet1_pt >= event.jet2_pt);
            assert!((0.0..=PI).contains(&event.jet1_met_dphi));
            assert!(event.met_sig >= 0.0);
        }
    }

    #[test]
    fn test_flatten_without_btag_is_untagged() {
        let events = RawEvents::from_events(&test_events()).without_btag();
        let flat = flatten(&events, &SelectionCuts::default()).unwrap();
        assert!(flat.tagged.is_empty());
        assert_eq!(flat.untagged.len(), 2);
        assert!(flat.untagged.iter().all(|e| e.n_bjets == 0));
    }

    #[test]
    fn test_tagging_counts_every_jet() {
        let events = [RawEvent {
            jets: vec![
                jet(300.0, 0.0, 0.0, 0),
                jet(200.0, 0.0, 1.0, 0),
                jet(20.0, 4.0, 2.0, 1),
            ],
            met: 400.0,
            met_phi: 0.0,
            ht: 520.0,
            cross_section: 1.0,
            event_weight: 1.0,
        }];
        let flat = flatten_events(&events, &SelectionCuts::default());
        assert_eq!(flat.tagged.len(), 1);
        assert_eq!(flat.tagged[0].n_bjets, 1);
    }

    #[test]
    fn test_selection_is_monotonic() {
        let events = RawEvents::from_events(&test_events());
        let mut previous = usize::MAX;
        for met in [0.0, 200.0, 210.0, 240.0, 250.0, 260.0, 1000.0] {
            let cuts = SelectionCuts {
                min_met: met,
                ..Default::default()
            };
            let passing = flatten(&events, &cuts).unwrap().len();
            assert!(passing <= previous);
            previous = passing;
        }
        let loose = flatten(&events, &SelectionCuts::default()).unwrap().len();
        let tight = flatten(
            &events,
            &SelectionCuts {
                jet1_min_pt: 190.0,
                ..Default::default()
            },
        )
        .unwrap()
        .len();
        assert!(tight <= loose);
        assert_eq!(tight, 1);
    }

    #[test]
    fn test_cuts_are_inclusive() {
        let events = [RawEvent {
            jets: vec![jet(150.0, 2.4, 0.0, 0), jet(30.0, -2.8, 1.0, 0)],
            met: 200.0,
            met_phi: 0.0,
            ht: 180.0,
            cross_section: 1.0,
            event_weight: 1.0,
        }];
        assert_eq!(flatten_events(&events, &SelectionCuts::default()).len(), 1);
    }

    #[test]
    fn test_survivor_set_indices() {
        let events = RawEvents::from_events(&test_events());
        let set = SurvivorSet::with_leading_jets(&events, 2).unwrap();
        assert_eq!(set.indices(), vec![0, 2, 3, 4]);
        let set = set.retain(|s| s.index % 2 == 0).unwrap();
        assert_eq!(set.indices(), vec![0, 2, 4]);
    }

    #[test]
    fn test_flatten_store_writes_both_categories() {
        let schema = RawSchema::default();
        let input = MemoryStore::new("input").with_table(
            schema.tree.clone(),
            RawEvents::from_events(&test_events())
                .to_table(&schema)
                .unwrap(),
        );
        let flat = flatten_store(&input, &schema, &SelectionCuts::default()).unwrap();
        let mut output = MemoryStore::new("output");
        let tables = CategoryTables {
            tagged: "c_tagged".to_string(),
            ..Default::default()
        };
        flat.write_to(&mut output, &tables).unwrap();
        assert_eq!(output.n_rows("c_tagged").unwrap(), 1);
        assert_eq!(output.n_rows("untagged").unwrap(), 1);

        let empty = MemoryStore::new("empty");
        assert!(matches!(
            flatten_store(&empty, &schema, &SelectionCuts::default()),
            Err(MonoBcError::MissingTable { .. })
        ));
    }
}
