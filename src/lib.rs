//! # monobc
//!
//! `monobc` reduces per-event collision records into flat, fixed-schema tables passing a
//! mono-jet style selection, bins those tables into per-process shape histograms, and combines
//! the shapes into synthetic ("Asimov") datasets at externally specified yields.
//!
//! The crate is organised leaf first:
//!
//! - [`data`]: columnar tables with scalar and jagged columns, and the [`RecordStore`] trait
//!   with in-memory, Parquet-backed and ROOT-backed implementations.
//! - [`selection`]: the selection and flattening engine producing tagged and untagged
//!   [`FlatEvent`] tables.
//! - [`histogram`]: fixed-edge histograms and shape building from flattened tables.
//! - [`yields`]: signal yield arithmetic and Asimov histogram construction.
//! - [`fit`]: placeholder substitution for the external fit configuration and invocation of
//!   the fit executable.
//! - [`config`] and [`pipeline`]: YAML configuration and the batch driver tying it together.
#![warn(clippy::perf, clippy::style)]
#![allow(clippy::excessive_precision)]

use thiserror::Error;

/// YAML configuration of a full analysis run.
pub mod config;
/// Columnar tables and the [`RecordStore`] abstraction.
pub mod data;
/// Fit-configuration rendering and the external fit executable.
pub mod fit;
/// Binned histograms and shape building.
pub mod histogram;
/// Batch orchestration over files, processes and signal points.
pub mod pipeline;
/// Event selection and flattening.
pub mod selection;
/// Yield normalization and Asimov histogram construction.
pub mod yields;

pub use crate::config::AnalysisConfig;
pub use crate::data::{
    io::{open_store, recreate_store, ParquetStore},
    root::RootStore,
    Category, CategoryTables, Column, FlatEvent, FloatPrecision, Jagged, Jet, MemoryStore,
    RawEvent, RawEvents, RawSchema, RecordStore, StoreFormat, Table,
};
pub use crate::fit::{FitRunner, FitTemplate, Placeholder};
pub use crate::histogram::{build_shape, get_bin_edges, Histogram};
pub use crate::selection::{flatten, Cutflow, Flattened, SelectionCuts};
pub use crate::yields::{
    AsimovBuilder, BackgroundTarget, Magnification, SignalPoint, SignalYield, YieldConstants,
};

/// A [`Result`] carrying a [`MonoBcError`].
pub type MonoBcResult<T> = Result<T, MonoBcError>;

/// The error type used by all `monobc` methods
#[derive(Error, Debug)]
pub enum MonoBcError {
    /// An alias for [`std::io::Error`].
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
    /// An alias for [`parquet::errors::ParquetError`].
    #[error("Parquet Error: {0}")]
    ParquetError(#[from] parquet::errors::ParquetError),
    /// An alias for [`arrow::error::ArrowError`].
    #[error("Arrow Error: {0}")]
    ArrowError(#[from] arrow::error::ArrowError),
    /// An alias for [`shellexpand::LookupError`].
    #[error("Failed to expand path: {0}")]
    LookupError(#[from] shellexpand::LookupError<std::env::VarError>),
    /// An alias for [`serde_yaml::Error`].
    #[error("Failed to parse configuration: {0}")]
    YamlError(#[from] serde_yaml::Error),
    /// A required column is absent from a table.
    #[error("Column \"{name}\" not found!")]
    MissingColumn {
        /// Name of the missing column
        name: String,
    },
    /// A required table is absent from a store.
    #[error("Table \"{name}\" not found in \"{store}\"!")]
    MissingTable {
        /// Name of the missing table
        name: String,
        /// Display name of the store that was searched
        store: String,
    },
    /// A column exists but holds a type which cannot be interpreted as requested.
    #[error("Column \"{name}\" has unsupported type {datatype}")]
    InvalidColumnType {
        /// Name of the column
        name: String,
        /// Description of the type that was found
        datatype: String,
    },
    /// Two quantities which must agree in length do not.
    #[error("{context}: expected length {expected}, found {actual}")]
    LengthMismatch {
        /// Where the mismatch was detected
        context: String,
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },
    /// A set of bin edges is unusable.
    #[error("Invalid binning: {reason}")]
    InvalidBinning {
        /// Why the edges were rejected
        reason: String,
    },
    /// Two histograms were combined with different bin edges.
    #[error("Histogram \"{name}\" does not share the target binning")]
    BinningMismatch {
        /// Name of the offending histogram
        name: String,
    },
    /// A configuration value is outside its allowed domain.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Why the configuration was rejected
        reason: String,
    },
    /// A fit template key outside the recognized placeholder set.
    #[error("Unknown placeholder \"{name}\"")]
    UnknownPlaceholder {
        /// The rejected key
        name: String,
    },
    /// An error which occurs when the user tries to parse an invalid string of text, typically
    /// into an enum variant.
    #[error("Failed to parse string: \"{name}\" does not correspond to a valid \"{object}\"!")]
    ParseError {
        /// The string which was parsed
        name: String,
        /// The name of the object it failed to parse into
        object: String,
    },
    /// The external fit executable could not be started.
    #[error("Could not launch \"{program}\": {source}")]
    ExternalToolMissing {
        /// Program that was invoked
        program: String,
        /// Underlying launch error
        source: std::io::Error,
    },
    /// The external fit executable exited unsuccessfully.
    #[error("\"{program}\" failed for job \"{job}\" ({status})")]
    ExternalToolFailed {
        /// Program that was invoked
        program: String,
        /// Job which was being processed
        job: String,
        /// Exit status description
        status: String,
    },
    /// An error type for [`rayon`] thread pools
    #[cfg(feature = "rayon")]
    #[error("Error building thread pool: {0}")]
    ThreadPoolError(#[from] rayon::ThreadPoolBuildError),
    /// A custom fallback error for errors too complex or too infrequent to warrant their own error
    /// category.
    #[error("{0}")]
    Custom(String),
}
