use std::{
    fmt::Display,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use indexmap::IndexMap;
#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::{
    config::AnalysisConfig,
    data::{
        io::{canonicalize_store_path, open_store, recreate_store, ParquetStore},
        root::ROOT_EXTENSION,
        Category, RecordStore, StoreFormat, WriteOptions,
    },
    fit::{FitJob, FitTemplate, Placeholder},
    histogram::{build_shape, histogram_table_name, write_histogram, Histogram},
    selection::{flatten_store, Cutflow},
    yields::{AsimovBuilder, SignalPoint, SignalYield},
    MonoBcError, MonoBcResult,
};

/// One stage of the batch driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Flatten raw inputs.
    Flatten,
    /// Bin every process into shape histograms.
    Shapes,
    /// Build Asimov histograms per signal point.
    Asimov,
    /// Render fit configurations and run the fits.
    Fit,
}

impl Stage {
    /// Every stage in execution order.
    pub const ALL: [Stage; 4] = [Stage::Flatten, Stage::Shapes, Stage::Asimov, Stage::Fit];
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Flatten => write!(f, "flatten"),
            Stage::Shapes => write!(f, "shapes"),
            Stage::Asimov => write!(f, "asimov"),
            Stage::Fit => write!(f, "fit"),
        }
    }
}

impl FromStr for Stage {
    type Err = MonoBcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "flatten" => Ok(Self::Flatten),
            "shapes" | "histograms" => Ok(Self::Shapes),
            "asimov" => Ok(Self::Asimov),
            "fit" | "fits" => Ok(Self::Fit),
            _ => Err(MonoBcError::ParseError {
                name: s.to_string(),
                object: "Stage".to_string(),
            }),
        }
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Name the flattened output of `input` by replacing the first `from` in its file name with
/// `to`. The directory part is left alone.
pub fn flat_output_name(input: &Path, from: &str, to: &str) -> MonoBcResult<PathBuf> {
    let name = input
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| MonoBcError::InvalidConfig {
            reason: format!("'{}' has no usable file name", input.display()),
        })?;
    if from.is_empty() || !name.contains(from) {
        return Err(MonoBcError::InvalidConfig {
            reason: format!("input '{name}' does not contain '{from}'"),
        });
    }
    Ok(input.with_file_name(name.replacen(from, to, 1)))
}

/// What flattening one input produced.
#[derive(Debug, Clone, PartialEq)]
pub struct FlattenOutcome {
    /// Raw input store.
    pub input: PathBuf,
    /// Flattened output store.
    pub output: PathBuf,
    /// Events written to the tagged table.
    pub tagged: usize,
    /// Events written to the untagged table.
    pub untagged: usize,
    /// Events remaining after each stage.
    pub cutflow: Cutflow,
}

/// Flatten one raw input store and write its tagged and untagged tables.
///
/// An output which resolves to the input itself is refused before anything is written.
pub fn flatten_file(config: &AnalysisConfig, input: &str) -> MonoBcResult<FlattenOutcome> {
    let settings = &config.flatten;
    let input_path = canonicalize_store_path(input)?;
    let mut output = flat_output_name(&input_path, &settings.input_token, &settings.output_token)?;
    if let Some(dir) = &settings.output_dir {
        let name = output.file_name().map(|name| name.to_os_string());
        output = PathBuf::from(&*shellexpand::full(dir)?);
        if let Some(name) = name {
            output.push(name);
        }
    }
    if settings.format == StoreFormat::Root
        && output.extension().and_then(|ext| ext.to_str()) != Some(ROOT_EXTENSION)
    {
        let mut name = output.file_name().map(|name| name.to_os_string()).unwrap_or_default();
        name.push(format!(".{ROOT_EXTENSION}"));
        output.set_file_name(name);
    }
    if output.exists() && output.canonicalize()? == input_path {
        return Err(MonoBcError::InvalidConfig {
            reason: format!(
                "flattened output '{}' would overwrite its input",
                output.display()
            ),
        });
    }

    let store = open_store(input)?;
    let flattened = flatten_store(store.as_ref(), &settings.schema, &config.selection)?;
    log::info!("Cutflow for '{}': {}", store.name(), flattened.cutflow);

    let mut out = recreate_store(
        &path_str(&output),
        settings.format,
        WriteOptions::default().precision(settings.precision),
    )?;
    flattened.write_to(out.as_mut(), &config.categories)?;
    log::info!(
        "Saved {} tagged and {} untagged events to '{}'",
        flattened.tagged.len(),
        flattened.untagged.len(),
        output.display()
    );
    Ok(FlattenOutcome {
        input: input_path,
        output,
        tagged: flattened.tagged.len(),
        untagged: flattened.untagged.len(),
        cutflow: flattened.cutflow,
    })
}

/// Flatten every configured input. Inputs which fail are logged and skipped.
pub fn flatten_inputs(config: &AnalysisConfig) -> MonoBcResult<Vec<FlattenOutcome>> {
    let inputs = &config.flatten.inputs;
    #[cfg(feature = "rayon")]
    let results: Vec<_> = inputs
        .par_iter()
        .map(|input| (input, flatten_file(config, input)))
        .collect();
    #[cfg(not(feature = "rayon"))]
    let results: Vec<_> = inputs
        .iter()
        .map(|input| (input, flatten_file(config, input)))
        .collect();

    let mut outcomes = Vec::with_capacity(results.len());
    for (input, result) in results {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => log::warn!("Skipping input '{input}': {err}"),
        }
    }
    log::info!(
        "Flattened {} of {} inputs",
        outcomes.len(),
        inputs.len()
    );
    Ok(outcomes)
}

/// Shapes and raw category counts of one flattened sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessShapes {
    shapes: IndexMap<Category, Option<Histogram>>,
    raw_counts: IndexMap<Category, usize>,
}

impl ProcessShapes {
    /// The shape in `category`, if the sample has one.
    pub fn shape(&self, category: Category) -> Option<&Histogram> {
        self.shapes.get(&category).and_then(Option::as_ref)
    }

    /// Number of flattened events in `category`.
    pub fn raw_count(&self, category: Category) -> usize {
        self.raw_counts.get(&category).copied().unwrap_or(0)
    }

    /// Number of flattened events over both categories.
    pub fn total_raw(&self) -> usize {
        self.raw_counts.values().sum()
    }
}

/// Bin the configured variable in both categories of `sample`.
///
/// Returns [`None`] with a warning when the sample does not exist.
pub fn load_process_shapes(
    config: &AnalysisConfig,
    process: &str,
    sample: &str,
    edges: &[f64],
) -> MonoBcResult<Option<ProcessShapes>> {
    let path = config.sample_path(sample)?;
    if !path.exists() {
        log::warn!(
            "Input not found for '{process}': {}. Skipping.",
            path.display()
        );
        return Ok(None);
    }
    let store = open_store(&path_str(&path))?;
    let mut shapes = IndexMap::new();
    let mut raw_counts = IndexMap::new();
    for category in Category::ALL {
        let table = config.categories.table(category);
        shapes.insert(
            category,
            build_shape(store.as_ref(), table, &config.variable, edges)?,
        );
        raw_counts.insert(category, store.n_rows(table)?);
    }
    Ok(Some(ProcessShapes { shapes, raw_counts }))
}

fn load_all<'a>(
    config: &AnalysisConfig,
    processes: &[(&'a str, &'a str)],
    edges: &[f64],
) -> Vec<(&'a str, MonoBcResult<Option<ProcessShapes>>)> {
    #[cfg(feature = "rayon")]
    return processes
        .par_iter()
        .map(|(process, sample)| {
            (*process, load_process_shapes(config, process, sample, edges))
        })
        .collect();
    #[cfg(not(feature = "rayon"))]
    return processes
        .iter()
        .map(|(process, sample)| {
            (*process, load_process_shapes(config, process, sample, edges))
        })
        .collect();
}

/// Write the raw shape histograms of every process to `histo_<process>`. Returns the number
/// of histogram stores written.
pub fn create_shape_histograms(config: &AnalysisConfig) -> MonoBcResult<usize> {
    let edges = config.edges()?;
    let processes = config.processes();
    let mut written = 0;
    for (process, result) in load_all(config, &processes, &edges) {
        let shapes = match result {
            Ok(Some(shapes)) => shapes,
            Ok(None) => continue,
            Err(err) => {
                log::warn!("Skipping '{process}': {err}");
                continue;
            }
        };
        let path = config.output_path(&format!("histo_{process}"))?;
        let mut store = ParquetStore::recreate(&path_str(&path))?;
        for category in Category::ALL {
            if let Some(shape) = shapes.shape(category) {
                let name = histogram_table_name(&config.variable, config.categories.table(category));
                write_histogram(&mut store, &name, shape)?;
                log::info!(
                    "Created '{name}' in '{}' ({} raw entries)",
                    path.display(),
                    shape.integral()
                );
            }
        }
        written += 1;
    }
    Ok(written)
}

/// Build and write the Asimov histograms of one signal point. Returns the number of
/// histograms written.
pub fn create_asimov_for_point(
    config: &AnalysisConfig,
    point: &SignalPoint,
    backgrounds: &IndexMap<&str, Option<ProcessShapes>>,
    edges: &[f64],
) -> MonoBcResult<usize> {
    let job = format!("{}{}", point.name, config.fit.analysis_tag);
    log::info!("Processing Asimov data for '{job}'");
    let signal_yield = SignalYield::compute(point, &config.constants, &config.magnification)?;
    let signal = load_process_shapes(config, &point.name, &point.sample, edges)?;
    let total_raw = signal.as_ref().map_or(0, ProcessShapes::total_raw);

    let path = config.output_path(&format!("asimov_histograms_{job}"))?;
    if path.is_dir() {
        fs::remove_dir_all(&path)?;
    }

    let mut histograms = Vec::new();
    for category in Category::ALL {
        let mut builder = AsimovBuilder::new(edges)?;
        for (name, background) in &config.backgrounds {
            let shape = backgrounds
                .get(name.as_str())
                .and_then(Option::as_ref)
                .and_then(|shapes| shapes.shape(category));
            builder.add(name, shape, background.target(category).target())?;
        }
        let raw = signal.as_ref().map_or(0, |shapes| shapes.raw_count(category));
        builder.add(
            &point.name,
            signal.as_ref().and_then(|shapes| shapes.shape(category)),
            signal_yield.category_yield(raw, total_raw),
        )?;

        let name = histogram_table_name(&config.variable, config.categories.table(category));
        let expected = builder.expected_integral();
        let asimov = builder.build();
        if asimov.integral() > 0.0 {
            log::info!(
                "Asimov '{name}' for '{job}': integral {:.6} (expected {expected:.6})",
                asimov.integral()
            );
            histograms.push((name, asimov));
        } else if config.write_empty_asimov {
            log::warn!("Asimov histogram '{name}' for '{job}' is empty");
            histograms.push((name, asimov));
        } else {
            log::warn!("Asimov histogram '{name}' for '{job}' is empty and will not be written");
        }
    }

    if !histograms.is_empty() {
        let mut store = ParquetStore::create(&path_str(&path))?;
        for (name, histogram) in &histograms {
            write_histogram(&mut store, name, histogram)?;
        }
        log::info!("Saved Asimov data to '{}'", path.display());
    }
    Ok(histograms.len())
}

/// Build the Asimov histograms of every signal point. Points which fail are logged and
/// skipped. Returns the number of histograms written.
pub fn create_asimov_data(config: &AnalysisConfig) -> MonoBcResult<usize> {
    let edges = config.edges()?;
    let processes: Vec<(&str, &str)> = config
        .backgrounds
        .iter()
        .map(|(name, background)| (name.as_str(), background.sample.as_str()))
        .collect();
    let backgrounds: IndexMap<&str, Option<ProcessShapes>> = load_all(config, &processes, &edges)
        .into_iter()
        .map(|(process, result)| {
            let shapes = result.unwrap_or_else(|err| {
                log::warn!("Background '{process}' contributes nothing: {err}");
                None
            });
            (process, shapes)
        })
        .collect();

    let mut written = 0;
    for point in &config.signals {
        match create_asimov_for_point(config, point, &backgrounds, &edges) {
            Ok(n) => written += n,
            Err(err) => log::warn!("Skipping Asimov data for '{}': {err}", point.name),
        }
    }
    Ok(written)
}

/// The fit job of `point`, naming the histogram tables written by the shape and Asimov
/// stages.
pub fn fit_job(config: &AnalysisConfig, point: &SignalPoint) -> MonoBcResult<FitJob> {
    let signal_yield = SignalYield::compute(point, &config.constants, &config.magnification)?;
    let ntuple = config.sample_path(&point.sample)?;
    let region_histogram =
        |category| histogram_table_name(&config.variable, config.categories.table(category));
    Ok(FitJob::new(
        point,
        &signal_yield,
        &config.fit.analysis_tag,
        &path_str(&ntuple),
        config.fit.discriminants.get(&point.kind),
    )
    .with_region_histograms(
        &region_histogram(Category::Tagged),
        &region_histogram(Category::Untagged),
    )
    .with_overrides(&config.fit.overrides()?))
}

/// Render the fit configuration of every signal point into the output directory and run the
/// fit executable on it from there, one point at a time. The first failure stops the loop and
/// is returned.
pub fn run_fits(config: &AnalysisConfig) -> MonoBcResult<usize> {
    let template = FitTemplate::from_path(config.template_path()?)?;
    let output_dir = config.output_path("")?;
    fs::create_dir_all(&output_dir)?;

    let mut completed = 0;
    for point in &config.signals {
        let job = fit_job(config, point)?;
        log::info!(
            "Processing '{}': signal scale factor {}",
            job.name,
            job.substitutions
                .get(&Placeholder::SignalScaleFactor)
                .map_or("", String::as_str)
        );
        let file_name = job.config_file_name();
        let path = output_dir.join(&file_name);
        fs::write(&path, template.render(&job.substitutions))?;
        log::info!("Generated config '{}'", path.display());
        config
            .fit
            .runner
            .run(&job.name, &output_dir, Path::new(&file_name))?;
        completed += 1;
    }
    Ok(completed)
}

#[cfg(feature = "rayon")]
fn with_thread_pool<T, F>(threads: Option<usize>, op: F) -> MonoBcResult<T>
where
    T: Send,
    F: FnOnce() -> MonoBcResult<T> + Send,
{
    match threads {
        Some(n_threads) => rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build()?
            .install(op),
        None => op(),
    }
}

#[cfg(not(feature = "rayon"))]
fn with_thread_pool<T, F>(_threads: Option<usize>, op: F) -> MonoBcResult<T>
where
    F: FnOnce() -> MonoBcResult<T>,
{
    op()
}

/// Run `stages` in order.
pub fn run(config: &AnalysisConfig, stages: &[Stage]) -> MonoBcResult<()> {
    with_thread_pool(config.threads, || {
        for stage in stages {
            log::info!("--- Stage: {stage} ---");
            match stage {
                Stage::Flatten => {
                    flatten_inputs(config)?;
                }
                Stage::Shapes => {
                    let written = create_shape_histograms(config)?;
                    log::info!("Wrote {written} shape histogram stores");
                }
                Stage::Asimov => {
                    let written = create_asimov_data(config)?;
                    log::info!("Wrote {written} Asimov histograms");
                }
                Stage::Fit => {
                    let completed = run_fits(config)?;
                    log::info!("Completed {completed} fits");
                }
            }
        }
        Ok(())
    })
}
