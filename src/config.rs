use std::{collections::HashSet, fs, path::PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    data::{Category, CategoryTables, FloatPrecision, RawSchema, StoreFormat},
    fit::{parse_substitutions, DiscriminantSettings, FitRunner, Substitutions},
    histogram::{get_bin_edges, validate_edges},
    selection::SelectionCuts,
    yields::{BackgroundTarget, Magnification, SignalPoint, YieldConstants},
    MonoBcError, MonoBcResult,
};

fn invalid<T>(reason: String) -> MonoBcResult<T> {
    Err(MonoBcError::InvalidConfig { reason })
}

/// Histogram binning, either evenly spaced or explicit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Binning {
    /// `bins` evenly spaced bins over `range`.
    Uniform {
        /// Number of bins.
        bins: usize,
        /// Lower and upper edge.
        range: (f64, f64),
    },
    /// Explicit bin edges.
    Edges {
        /// Strictly increasing edges.
        edges: Vec<f64>,
    },
}

impl Default for Binning {
    fn default() -> Self {
        Binning::Uniform {
            bins: 15,
            range: (0.0, 30.0),
        }
    }
}

impl Binning {
    /// The validated bin edges.
    pub fn edges(&self) -> MonoBcResult<Vec<f64>> {
        let edges = match self {
            Binning::Uniform { bins: 0, .. } => {
                return Err(MonoBcError::InvalidBinning {
                    reason: "number of bins must be greater than zero".to_string(),
                })
            }
            Binning::Uniform { bins, range } => get_bin_edges(*bins, *range),
            Binning::Edges { edges } => edges.clone(),
        };
        validate_edges(&edges)?;
        Ok(edges)
    }
}

/// Settings of the flattening stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlattenSettings {
    /// Raw input stores.
    pub inputs: Vec<String>,
    /// Directory for flattened outputs; next to each input when unset.
    pub output_dir: Option<String>,
    /// Token of the input name replaced to name the output.
    pub input_token: String,
    /// Replacement for [`FlattenSettings::input_token`].
    pub output_token: String,
    /// Column names of the raw events.
    pub schema: RawSchema,
    /// Precision of written floating-point columns.
    pub precision: FloatPrecision,
    /// Layout of the flattened outputs.
    pub format: StoreFormat,
}

impl Default for FlattenSettings {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            output_dir: None,
            input_token: "delphes".to_string(),
            output_token: "flat_tuple".to_string(),
            schema: RawSchema::default(),
            precision: FloatPrecision::F32,
            format: StoreFormat::Parquet,
        }
    }
}

/// Per-category background yields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CategoryYields {
    /// Yield in the tagged category.
    pub tagged: f64,
    /// Yield in the untagged category.
    pub untagged: f64,
}

impl CategoryYields {
    /// The yield for `category`.
    pub fn get(&self, category: Category) -> f64 {
        match category {
            Category::Tagged => self.tagged,
            Category::Untagged => self.untagged,
        }
    }
}

/// A background process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackgroundConfig {
    /// Flattened sample, relative to the ntuple base path.
    pub sample: String,
    /// Factor applied to both category yields.
    #[serde(default = "unit")]
    pub normalization_factor: f64,
    /// Raw yields per category.
    pub yields: CategoryYields,
}

fn unit() -> f64 {
    1.0
}

impl BackgroundConfig {
    /// The expected yield of this background in `category`.
    pub fn target(&self, category: Category) -> BackgroundTarget {
        BackgroundTarget {
            raw_yield: self.yields.get(category),
            normalization_factor: self.normalization_factor,
        }
    }
}

/// Settings of the fit stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitSettings {
    /// Appended to signal point names to form job names, e.g. `_ctagged`.
    pub analysis_tag: String,
    /// Fit configuration template.
    pub template: Option<String>,
    /// External executable.
    #[serde(flatten)]
    pub runner: FitRunner,
    /// Discriminant settings per signal kind.
    pub discriminants: IndexMap<String, DiscriminantSettings>,
    /// Extra placeholder values, keyed by placeholder token.
    pub placeholders: IndexMap<String, String>,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            analysis_tag: String::new(),
            template: None,
            runner: FitRunner::default(),
            discriminants: IndexMap::new(),
            placeholders: IndexMap::new(),
        }
    }
}

impl FitSettings {
    /// [`FitSettings::placeholders`] parsed into [`Substitutions`].
    pub fn overrides(&self) -> MonoBcResult<Substitutions> {
        parse_substitutions(&self.placeholders)
    }
}

/// Configuration of a full analysis run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Base directory of the flattened samples.
    pub ntuple_base_path: String,
    /// Directory receiving histogram stores and fit configurations.
    pub output_dir: String,
    /// Flattened column to histogram.
    pub variable: String,
    /// Binning of every histogram.
    pub binning: Binning,
    /// Table names of the categories.
    pub categories: CategoryTables,
    /// Event selection.
    pub selection: SelectionCuts,
    /// Flattening stage.
    pub flatten: FlattenSettings,
    /// Reference quantities of the signal yields.
    pub constants: YieldConstants,
    /// Signal magnification factors.
    pub magnification: Magnification,
    /// Background processes in combination order.
    pub backgrounds: IndexMap<String, BackgroundConfig>,
    /// Signal points.
    pub signals: Vec<SignalPoint>,
    /// Fit stage.
    pub fit: FitSettings,
    /// Write Asimov histograms even when their integral is zero.
    pub write_empty_asimov: bool,
    /// Worker threads; the global pool is used when unset.
    pub threads: Option<usize>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            ntuple_base_path: ".".to_string(),
            output_dir: ".".to_string(),
            variable: "met_sig".to_string(),
            binning: Binning::default(),
            categories: CategoryTables::default(),
            selection: SelectionCuts::default(),
            flatten: FlattenSettings::default(),
            constants: YieldConstants::default(),
            magnification: Magnification::default(),
            backgrounds: IndexMap::new(),
            signals: Vec::new(),
            fit: FitSettings::default(),
            write_empty_asimov: false,
            threads: None,
        }
    }
}

fn expand(path: &str) -> MonoBcResult<PathBuf> {
    Ok(PathBuf::from(&*shellexpand::full(path)?))
}

impl AnalysisConfig {
    /// Parse and validate YAML text.
    pub fn from_yaml_str(text: &str) -> MonoBcResult<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file. The path is shell-expanded.
    pub fn from_path(path: &str) -> MonoBcResult<Self> {
        let path = expand(path)?;
        let config = Self::from_yaml_str(&fs::read_to_string(&path)?)?;
        log::debug!("Loaded configuration from '{}'", path.display());
        Ok(config)
    }

    /// Reject values which would make a later stage fail or divide by zero.
    pub fn validate(&self) -> MonoBcResult<()> {
        if self.variable.trim().is_empty() {
            return invalid("variable must not be empty".to_string());
        }
        self.binning.edges()?;
        if self.categories.tagged == self.categories.untagged {
            return invalid(format!(
                "category tables must differ, both are '{}'",
                self.categories.tagged
            ));
        }
        if self.flatten.input_token.is_empty() {
            return invalid("flatten.input_token must not be empty".to_string());
        }
        if self.flatten.input_token == self.flatten.output_token {
            return invalid(format!(
                "flatten.output_token must differ from flatten.input_token ('{}')",
                self.flatten.input_token
            ));
        }
        if self.threads == Some(0) {
            return invalid("threads must be at least one".to_string());
        }
        let constants = &self.constants;
        if !(constants.reference_cross_section_pb > 0.0) {
            return invalid("constants.reference_cross_section_pb must be positive".to_string());
        }
        if !(constants.reference_efficiency > 0.0) {
            return invalid("constants.reference_efficiency must be positive".to_string());
        }
        for (name, background) in &self.backgrounds {
            let values = [
                background.normalization_factor,
                background.yields.tagged,
                background.yields.untagged,
            ];
            if values.iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
                return invalid(format!(
                    "background '{name}' needs non-negative yields and normalization factor"
                ));
            }
        }
        let mut names = HashSet::new();
        for point in &self.signals {
            if !names.insert(point.name.as_str()) {
                return invalid(format!("signal point '{}' is listed twice", point.name));
            }
            if self.backgrounds.contains_key(&point.name) {
                return invalid(format!(
                    "signal point '{}' shares its name with a background",
                    point.name
                ));
            }
            if !(point.produced > 0.0) {
                return invalid(format!("signal point '{}' needs produced > 0", point.name));
            }
            if !(point.n_generated > 0.0) {
                return invalid(format!(
                    "signal point '{}' needs n_generated > 0",
                    point.name
                ));
            }
        }
        self.fit.overrides()?;
        Ok(())
    }

    /// The validated histogram edges.
    pub fn edges(&self) -> MonoBcResult<Vec<f64>> {
        self.binning.edges()
    }

    /// Location of a flattened sample given relative to the ntuple base path.
    pub fn sample_path(&self, sample: &str) -> MonoBcResult<PathBuf> {
        Ok(expand(&self.ntuple_base_path)?.join(sample))
    }

    /// Location of an output named `name`.
    pub fn output_path(&self, name: &str) -> MonoBcResult<PathBuf> {
        Ok(expand(&self.output_dir)?.join(name))
    }

    /// Every process with its sample, backgrounds first.
    pub fn processes(&self) -> Vec<(&str, &str)> {
        self.backgrounds
            .iter()
            .map(|(name, background)| (name.as_str(), background.sample.as_str()))
            .chain(
                self.signals
                    .iter()
                    .map(|point| (point.name.as_str(), point.sample.as_str())),
            )
            .collect()
    }

    /// Template path, required by the fit stage.
    pub fn template_path(&self) -> MonoBcResult<PathBuf> {
        match &self.fit.template {
            Some(template) => expand(template),
            None => invalid("fit.template must be set to run fits".to_string()),
        }
    }
}
