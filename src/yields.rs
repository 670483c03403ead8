use accurate::{sum::Klein, traits::*};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{histogram::Histogram, MonoBcError, MonoBcResult};

/// Reference quantities the signal yields are expressed against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YieldConstants {
    /// Expected yield of the reference process.
    pub reference_target_yield: f64,
    /// Cross section of the reference process, in pb.
    pub reference_cross_section_pb: f64,
    /// Selection efficiency of the reference process.
    pub reference_efficiency: f64,
}

impl Default for YieldConstants {
    fn default() -> Self {
        Self {
            reference_target_yield: 702063.8,
            reference_cross_section_pb: 1063.2,
            reference_efficiency: 1.0,
        }
    }
}

/// Multiplicative factors applied to signal yields so small signals remain visible.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Magnification {
    /// Factor per signal kind (e.g. `LQ`).
    pub by_kind: IndexMap<String, f64>,
    /// Factor per signal point, taking precedence over [`Magnification::by_kind`].
    pub by_point: IndexMap<String, f64>,
}

impl Magnification {
    /// The factor for `point`: point-specific if present, else kind-specific, else `1.0`.
    pub fn factor(&self, point: &SignalPoint) -> f64 {
        self.by_point
            .get(&point.name)
            .or_else(|| self.by_kind.get(&point.kind))
            .copied()
            .unwrap_or(1.0)
    }
}

/// One signal hypothesis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalPoint {
    /// Point name, e.g. `LQ_2TeV`.
    pub name: String,
    /// Signal kind, e.g. `LQ` or `DM`.
    pub kind: String,
    /// Mass label, e.g. `2 TeV`.
    pub mass: String,
    /// Production cross section, in pb.
    pub cross_section_pb: f64,
    /// Number of events in the flattened sample.
    pub n_generated: f64,
    /// Events surviving generator-level filtering.
    pub surviving: f64,
    /// Events produced before generator-level filtering.
    pub produced: f64,
    /// Flattened sample, relative to the ntuple base path.
    pub sample: String,
}

/// Target yield and scale factor of a [`SignalPoint`].
#[derive(Clone, Debug, PartialEq)]
pub struct SignalYield {
    /// `surviving / produced`
    pub efficiency: f64,
    /// Signal over reference cross section.
    pub cross_section_ratio: f64,
    /// Signal over reference efficiency.
    pub efficiency_ratio: f64,
    /// Yield before magnification.
    pub base_target_yield: f64,
    /// Magnification applied.
    pub magnification: f64,
    /// Yield after magnification.
    pub scaled_yield: f64,
    /// Weight turning one flattened signal event into the scaled yield.
    pub scale_factor: f64,
}

fn positive(value: f64, what: &str, point: &str) -> MonoBcResult<f64> {
    if value > 0.0 && value.is_finite() {
        Ok(value)
    } else {
        Err(MonoBcError::InvalidConfig {
            reason: format!("{what} must be positive for '{point}', got {value}"),
        })
    }
}

impl SignalYield {
    /// Compute the yields of `point` against `constants`.
    ///
    /// Every denominator must be strictly positive.
    pub fn compute(
        point: &SignalPoint,
        constants: &YieldConstants,
        magnification: &Magnification,
    ) -> MonoBcResult<Self> {
        let produced = positive(point.produced, "produced", &point.name)?;
        let n_generated = positive(point.n_generated, "n_generated", &point.name)?;
        let reference_cross_section = positive(
            constants.reference_cross_section_pb,
            "reference_cross_section_pb",
            &point.name,
        )?;
        let reference_efficiency = positive(
            constants.reference_efficiency,
            "reference_efficiency",
            &point.name,
        )?;

        let efficiency = point.surviving / produced;
        let cross_section_ratio = point.cross_section_pb / reference_cross_section;
        let efficiency_ratio = efficiency / reference_efficiency;
        let base_target_yield =
            constants.reference_target_yield * cross_section_ratio * efficiency_ratio;
        let magnification = magnification.factor(point);
        let scaled_yield = base_target_yield * magnification;
        Ok(Self {
            efficiency,
            cross_section_ratio,
            efficiency_ratio,
            base_target_yield,
            magnification,
            scaled_yield,
            scale_factor: scaled_yield / n_generated,
        })
    }

    /// Share of the scaled yield falling in a category holding `raw_in_category` of
    /// `total_raw` flattened events.
    pub fn category_yield(&self, raw_in_category: usize, total_raw: usize) -> f64 {
        signal_category_yield(self.scaled_yield, raw_in_category, total_raw)
    }
}

/// `scaled_yield * raw_in_category / total_raw`, or zero when `total_raw` is zero.
pub fn signal_category_yield(scaled_yield: f64, raw_in_category: usize, total_raw: usize) -> f64 {
    if total_raw == 0 {
        0.0
    } else {
        scaled_yield * raw_in_category as f64 / total_raw as f64
    }
}

/// Expected yield of a background process in one category.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackgroundTarget {
    /// Yield as counted (or given) for the category.
    pub raw_yield: f64,
    /// Factor turning the raw yield into the expected yield.
    #[serde(default = "unit")]
    pub normalization_factor: f64,
}

fn unit() -> f64 {
    1.0
}

impl BackgroundTarget {
    /// A target with a normalization factor of one.
    pub fn fixed(raw_yield: f64) -> Self {
        Self {
            raw_yield,
            normalization_factor: 1.0,
        }
    }

    /// `raw_yield * normalization_factor`
    pub fn target(&self) -> f64 {
        self.raw_yield * self.normalization_factor
    }
}

/// Accumulates normalized shapes at their target yields into one Asimov histogram.
#[derive(Clone, Debug)]
pub struct AsimovBuilder {
    histogram: Histogram,
    contributors: IndexMap<String, f64>,
    skipped: Vec<String>,
}

impl AsimovBuilder {
    /// Start an empty Asimov histogram over `edges`.
    pub fn new(edges: &[f64]) -> MonoBcResult<Self> {
        Ok(Self {
            histogram: Histogram::from_edges(edges.to_vec())?,
            contributors: IndexMap::new(),
            skipped: Vec::new(),
        })
    }

    /// Add `shape` normalized to unit integral and scaled to `target_yield`.
    ///
    /// A missing shape or one whose integral is not positive contributes nothing and
    /// `Ok(false)` is returned. Shapes must share the builder's edges.
    pub fn add(
        &mut self,
        name: &str,
        shape: Option<&Histogram>,
        target_yield: f64,
    ) -> MonoBcResult<bool> {
        if !(target_yield >= 0.0 && target_yield.is_finite()) {
            return Err(MonoBcError::InvalidConfig {
                reason: format!("target yield of '{name}' must be non-negative, got {target_yield}"),
            });
        }
        let Some(shape) = shape else {
            self.skipped.push(name.to_string());
            return Ok(false);
        };
        if !self.histogram.same_binning(shape) {
            return Err(MonoBcError::BinningMismatch {
                name: name.to_string(),
            });
        }
        let Some(unit) = shape.normalized() else {
            log::debug!("Shape of '{name}' has no entries; skipping");
            self.skipped.push(name.to_string());
            return Ok(false);
        };
        self.histogram.add(&unit.scaled(target_yield), name)?;
        *self.contributors.entry(name.to_string()).or_insert(0.0) += target_yield;
        Ok(true)
    }

    /// Target yields of every contributor, in insertion order.
    pub fn contributors(&self) -> &IndexMap<String, f64> {
        &self.contributors
    }

    /// Names of the inputs which contributed nothing.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// Sum of the target yields of the contributors, which the finished histogram integrates
    /// to.
    pub fn expected_integral(&self) -> f64 {
        self.contributors
            .values()
            .copied()
            .sum_with_accumulator::<Klein<f64>>()
    }

    /// The histogram accumulated so far.
    pub fn histogram(&self) -> &Histogram {
        &self.histogram
    }

    /// Finish building.
    pub fn build(self) -> Histogram {
        self.histogram
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::get_bin_edges;
    use approx::assert_relative_eq;

    fn point(name: &str, kind: &str) -> SignalPoint {
        SignalPoint {
            name: name.to_string(),
            kind: kind.to_string(),
            mass: "2 TeV".to_string(),
            cross_section_pb: 0.05,
            n_generated: 35282.0,
            surviving: 500561.0,
            produced: 600000.0,
            sample: "sig/flat_tuple_lq.parquet".to_string(),
        }
    }

    fn magnification() -> Magnification {
        Magnification {
            by_kind: IndexMap::from([("LQ".to_string(), 1000.0)]),
            by_point: IndexMap::from([("DM_1p5TeV".to_string(), 10000.0)]),
        }
    }

    #[test]
    fn test_magnification_lookup_order() {
        let factors = magnification();
        assert_eq!(factors.factor(&point("LQ_2TeV", "LQ")), 1000.0);
        assert_eq!(factors.factor(&point("DM_1p5TeV", "DM")), 10000.0);
        assert_eq!(factors.factor(&point("DM_2p5TeV", "DM")), 1.0);
        let mut overriding = factors.clone();
        overriding.by_point.insert("LQ_2TeV".to_string(), 5.0);
        assert_eq!(overriding.factor(&point("LQ_2TeV", "LQ")), 5.0);
    }

    #[test]
    fn test_signal_yield() {
        let lq = point("LQ_2TeV", "LQ");
        let result = SignalYield::compute(&lq, &YieldConstants::default(), &magnification())
            .unwrap();
        let efficiency = 500561.0 / 600000.0;
        let base = 702063.8 * (0.05 / 1063.2) * efficiency;
        assert_relative_eq!(result.efficiency, efficiency);
        assert_relative_eq!(result.base_target_yield, base, max_relative = 1e-12);
        assert_relative_eq!(result.scaled_yield, base * 1000.0, max_relative = 1e-12);
        assert_relative_eq!(
            result.scale_factor,
            base * 1000.0 / 35282.0,
            max_relative = 1e-12
        );
        assert_relative_eq!(result.scale_factor, 0.7807, max_relative = 1e-4);
    }

    #[test]
    fn test_signal_yield_rejects_bad_denominators() {
        let mut bad = point("LQ_2TeV", "LQ");
        bad.produced = 0.0;
        assert!(matches!(
            SignalYield::compute(&bad, &YieldConstants::default(), &Magnification::default()),
            Err(MonoBcError::InvalidConfig { .. })
        ));
        let constants = YieldConstants {
            reference_cross_section_pb: 0.0,
            ..Default::default()
        };
        assert!(SignalYield::compute(
            &point("LQ_2TeV", "LQ"),
            &constants,
            &Magnification::default()
        )
        .is_err());
    }

    #[test]
    fn test_category_split() {
        assert_relative_eq!(signal_category_yield(1000.0, 25, 100), 250.0);
        assert_eq!(signal_category_yield(1000.0, 0, 0), 0.0);
        let lq = SignalYield::compute(
            &point("LQ_2TeV", "LQ"),
            &YieldConstants::default(),
            &Magnification::default(),
        )
        .unwrap();
        let total = lq.category_yield(30, 100) + lq.category_yield(70, 100);
        assert_relative_eq!(total, lq.scaled_yield, max_relative = 1e-12);
    }

    #[test]
    fn test_background_target() {
        assert_relative_eq!(BackgroundTarget::fixed(53414.6).target(), 53414.6);
        let ctag = BackgroundTarget {
            raw_yield: 121.0,
            normalization_factor: 101.736,
        };
        assert_relative_eq!(ctag.target(), 121.0 * 101.736);
    }

    #[test]
    fn test_asimov_single_contributor() {
        let edges = vec![0.0, 1.0, 2.0, 3.0];
        let shape = Histogram::new(vec![10.0, 0.0, 0.0], edges.clone()).unwrap();
        let mut builder = AsimovBuilder::new(&edges).unwrap();
        assert!(builder.add("znunu", Some(&shape), 100.0).unwrap());
        assert_eq!(builder.build().counts, vec![100.0, 0.0, 0.0]);
    }

    #[test]
    fn test_asimov_integral_matches_targets() {
        let edges = get_bin_edges(15, (0.0, 30.0));
        let shapes = [
            ("znunu", vec![5.0, 9.0, 14.0, 3.0, 1.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0], 53414.6),
            ("ttbar", vec![0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], 44972.5),
            ("wjets", vec![2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0], 18745.3),
            ("LQ_2TeV", vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 3.0, 4.0, 5.0, 6.0, 0.0, 0.0, 0.0, 0.0], 2512.7),
        ];
        let mut builder = AsimovBuilder::new(&edges).unwrap();
        for (name, counts, target) in &shapes {
            let shape = Histogram::new(counts.clone(), edges.clone()).unwrap();
            assert!(builder.add(name, Some(&shape), *target).unwrap());
        }
        let expected: f64 = shapes.iter().map(|(_, _, target)| target).sum();
        assert_relative_eq!(builder.expected_integral(), expected, max_relative = 1e-12);
        let asimov = builder.build();
        assert_relative_eq!(asimov.integral(), expected, max_relative = 1e-9);
        assert!(asimov.counts.iter().all(|count| *count >= 0.0));
    }

    #[test]
    fn test_asimov_skips_empty_and_missing_shapes() {
        let edges = vec![0.0, 1.0, 2.0];
        let empty = Histogram::from_edges(edges.clone()).unwrap();
        let mut builder = AsimovBuilder::new(&edges).unwrap();
        assert!(!builder.add("wjets", Some(&empty), 1.0).unwrap());
        assert!(!builder.add("ttbar", None, 15.0).unwrap());
        assert_eq!(builder.skipped(), &["wjets".to_string(), "ttbar".to_string()]);
        assert_eq!(builder.expected_integral(), 0.0);
        assert_eq!(builder.build().integral(), 0.0);
    }

    #[test]
    fn test_asimov_rejects_foreign_binning_and_negative_yields() {
        let mut builder = AsimovBuilder::new(&[0.0, 1.0, 2.0]).unwrap();
        let other = Histogram::new(vec![1.0, 1.0, 1.0], vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        assert!(matches!(
            builder.add("znunu", Some(&other), 10.0),
            Err(MonoBcError::BinningMismatch { .. })
        ));
        let shape = Histogram::new(vec![1.0, 1.0], vec![0.0, 1.0, 2.0]).unwrap();
        assert!(builder.add("znunu", Some(&shape), -1.0).is_err());
        assert!(builder.add("znunu", Some(&shape), f64::NAN).is_err());
    }
}
