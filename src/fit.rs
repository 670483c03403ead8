use std::{fmt::Display, fs, path::Path, process::Command, str::FromStr};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    yields::{SignalPoint, SignalYield},
    MonoBcError, MonoBcResult,
};

/// The placeholders recognized in a fit configuration template.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Placeholder {
    /// Name of the fit job.
    JobName,
    /// Directory the fit writes into.
    OutputDirectory,
    /// Human-readable signal label.
    SignalLabel,
    /// Histogram store holding the Asimov data.
    AsimovHistFile,
    /// Histogram store holding the signal shapes.
    HistoSignalFile,
    /// Path of the flattened signal sample.
    SignalNtuplePath,
    /// Store holding discriminant ntuples.
    NtupleFileName,
    /// Discriminant column name.
    DiscriminantBranch,
    /// Signal sample name.
    SignalName,
    /// Per-kind suffix.
    Suffix,
    /// Signal scale factor.
    SignalScaleFactor,
    /// Histogram table of the tagged region.
    HistoNameTagged,
    /// Histogram table of the untagged region.
    HistoNameUntagged,
}

impl Placeholder {
    /// Every placeholder.
    pub const ALL: [Placeholder; 13] = [
        Placeholder::JobName,
        Placeholder::OutputDirectory,
        Placeholder::SignalLabel,
        Placeholder::AsimovHistFile,
        Placeholder::HistoSignalFile,
        Placeholder::SignalNtuplePath,
        Placeholder::NtupleFileName,
        Placeholder::DiscriminantBranch,
        Placeholder::SignalName,
        Placeholder::Suffix,
        Placeholder::SignalScaleFactor,
        Placeholder::HistoNameTagged,
        Placeholder::HistoNameUntagged,
    ];

    /// The literal token replaced in the template text.
    pub fn token(&self) -> &'static str {
        match self {
            Placeholder::JobName => "JOB_NAME",
            Placeholder::OutputDirectory => "OUTPUT_DIRECTORY",
            Placeholder::SignalLabel => "SIGNAL_LABEL",
            Placeholder::AsimovHistFile => "ASIMOV_HIST_FILE",
            Placeholder::HistoSignalFile => "HISTO_SIGNAL_FILE",
            Placeholder::SignalNtuplePath => "SIGNAL_NTUPLE_PATH",
            Placeholder::NtupleFileName => "NTUPLE_FILE_NAME",
            Placeholder::DiscriminantBranch => "DISCRIMINANT_BRANCH",
            Placeholder::SignalName => "SIGNAL_NAME",
            Placeholder::Suffix => "SUFFIX",
            Placeholder::SignalScaleFactor => "SIGNAL_SCALE_FACTOR",
            Placeholder::HistoNameTagged => "HISTO_NAME_TAGGED",
            Placeholder::HistoNameUntagged => "HISTO_NAME_UNTAGGED",
        }
    }
}

impl Display for Placeholder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.token())
    }
}

impl FromStr for Placeholder {
    type Err = MonoBcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Placeholder::ALL
            .into_iter()
            .find(|placeholder| placeholder.token() == s)
            .ok_or_else(|| MonoBcError::UnknownPlaceholder {
                name: s.to_string(),
            })
    }
}

/// Values for a set of [`Placeholder`]s.
pub type Substitutions = IndexMap<Placeholder, String>;

/// Parse string-keyed values, rejecting keys outside the [`Placeholder`] set.
pub fn parse_substitutions<K, V, I>(pairs: I) -> MonoBcResult<Substitutions>
where
    K: AsRef<str>,
    V: Into<String>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(key, value)| Ok((key.as_ref().parse::<Placeholder>()?, value.into())))
        .collect()
}

/// A fit configuration with placeholder tokens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FitTemplate {
    text: String,
}

impl FitTemplate {
    /// Wrap template text.
    pub fn new<S: Into<String>>(text: S) -> Self {
        Self { text: text.into() }
    }

    /// Read a template from disk.
    pub fn from_path<P: AsRef<Path>>(path: P) -> MonoBcResult<Self> {
        Ok(Self::new(fs::read_to_string(path)?))
    }

    /// The unrendered text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Placeholders whose tokens occur in `text`.
    pub fn placeholders_in(text: &str) -> Vec<Placeholder> {
        Placeholder::ALL
            .into_iter()
            .filter(|placeholder| text.contains(placeholder.token()))
            .collect()
    }

    /// Replace every token with its value in a single left-to-right pass over the template,
    /// taking the longest token at each position. Substituted values are never scanned again.
    /// Tokens left without a value are logged.
    pub fn render(&self, values: &Substitutions) -> String {
        let mut tokens: Vec<(&str, &str)> = values
            .iter()
            .map(|(placeholder, value)| (placeholder.token(), value.as_str()))
            .collect();
        tokens.sort_by_key(|(token, _)| std::cmp::Reverse(token.len()));

        let mut rendered = String::with_capacity(self.text.len());
        let mut rest = self.text.as_str();
        while let Some(c) = rest.chars().next() {
            match tokens.iter().find(|(token, _)| rest.starts_with(token)) {
                Some((token, value)) => {
                    rendered.push_str(value);
                    rest = &rest[token.len()..];
                }
                None => {
                    rendered.push(c);
                    rest = &rest[c.len_utf8()..];
                }
            }
        }
        for placeholder in Self::placeholders_in(&self.text) {
            if !values.contains_key(&placeholder) {
                log::warn!("Placeholder '{placeholder}' left unsubstituted in fit configuration");
            }
        }
        rendered
    }
}

/// Per-kind settings for discriminant-based fits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscriminantSettings {
    /// Store holding the discriminant ntuples.
    pub ntuple_file: String,
    /// Suffix appended to the discriminant column name.
    pub suffix: String,
}

impl DiscriminantSettings {
    /// Name of the discriminant column.
    pub fn branch(&self) -> String {
        format!("discriminant{}", self.suffix)
    }
}

/// Everything needed to render and run the fit of one signal point.
#[derive(Clone, Debug, PartialEq)]
pub struct FitJob {
    /// Job name, `<point><analysis tag>`.
    pub name: String,
    /// Placeholder values.
    pub substitutions: Substitutions,
}

impl FitJob {
    /// Derive the job of `point` from its computed yield.
    pub fn new(
        point: &SignalPoint,
        signal_yield: &SignalYield,
        analysis_tag: &str,
        signal_ntuple_path: &str,
        discriminant: Option<&DiscriminantSettings>,
    ) -> Self {
        let name = format!("{}{analysis_tag}", point.name);
        let mut substitutions = Substitutions::new();
        substitutions.insert(Placeholder::JobName, name.clone());
        substitutions.insert(Placeholder::OutputDirectory, format!("./{name}_fit"));
        substitutions.insert(
            Placeholder::SignalLabel,
            format!(
                "{} {} (x{})",
                point.kind,
                point.mass,
                signal_yield.magnification.trunc() as i64
            ),
        );
        substitutions.insert(
            Placeholder::AsimovHistFile,
            format!("asimov_histograms_{name}"),
        );
        substitutions.insert(
            Placeholder::HistoSignalFile,
            format!("histo_{}", point.name),
        );
        substitutions.insert(
            Placeholder::SignalNtuplePath,
            signal_ntuple_path.to_string(),
        );
        substitutions.insert(Placeholder::SignalName, point.name.clone());
        if let Some(discriminant) = discriminant {
            substitutions.insert(
                Placeholder::NtupleFileName,
                discriminant.ntuple_file.clone(),
            );
            substitutions.insert(Placeholder::DiscriminantBranch, discriminant.branch());
            substitutions.insert(Placeholder::Suffix, discriminant.suffix.clone());
        }
        substitutions.insert(
            Placeholder::SignalScaleFactor,
            format!("{:.8}", signal_yield.scale_factor),
        );
        Self {
            name,
            substitutions,
        }
    }

    /// Name the histogram tables of the tagged and untagged regions.
    pub fn with_region_histograms(mut self, tagged: &str, untagged: &str) -> Self {
        self.substitutions
            .insert(Placeholder::HistoNameTagged, tagged.to_string());
        self.substitutions
            .insert(Placeholder::HistoNameUntagged, untagged.to_string());
        self
    }

    /// Override or add values, e.g. from configuration.
    pub fn with_overrides(mut self, overrides: &Substitutions) -> Self {
        for (placeholder, value) in overrides {
            self.substitutions.insert(*placeholder, value.clone());
        }
        self
    }

    /// File name of the rendered configuration.
    pub fn config_file_name(&self) -> String {
        format!("config_{}.txt", self.name)
    }
}

/// Invokes the external fit executable as `<executable> <subcommand> <config>` from the
/// directory holding the histogram stores.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitRunner {
    /// Program to run.
    pub executable: String,
    /// Sub-command token passed before the configuration path.
    pub subcommand: String,
}

impl Default for FitRunner {
    fn default() -> Self {
        Self {
            executable: "trex-fitter".to_string(),
            subcommand: "hwdpf".to_string(),
        }
    }
}

impl FitRunner {
    /// Run the fit for `job` inside `work_dir` on the rendered configuration `config`, given
    /// relative to `work_dir`, waiting for it to finish.
    pub fn run(&self, job: &str, work_dir: &Path, config: &Path) -> MonoBcResult<()> {
        log::info!(
            "Executing in '{}': {} {} {}",
            work_dir.display(),
            self.executable,
            self.subcommand,
            config.display()
        );
        let status = Command::new(&self.executable)
            .current_dir(work_dir)
            .arg(&self.subcommand)
            .arg(config)
            .status()
            .map_err(|source| MonoBcError::ExternalToolMissing {
                program: self.executable.clone(),
                source,
            })?;
        if !status.success() {
            return Err(MonoBcError::ExternalToolFailed {
                program: self.executable.clone(),
                job: job.to_string(),
                status: status.to_string(),
            });
        }
        log::info!("Completed fit for '{job}'");
        Ok(())
    }
}
