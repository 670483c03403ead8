use std::{fmt::Display, str::FromStr};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{MonoBcError, MonoBcResult};

/// Parquet-backed [`RecordStore`] implementation and Arrow conversions.
pub mod io;
/// ROOT-file [`RecordStore`] holding flat trees.
pub mod root;

/// A variable-length per-row sequence stored as one flat buffer plus row offsets.
///
/// Row `i` spans `values[offsets[i]..offsets[i + 1]]`, so `offsets` always holds one more
/// entry than there are rows and starts at zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Jagged<T> {
    values: Vec<T>,
    offsets: Vec<usize>,
}

impl<T> Default for Jagged<T> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            offsets: vec![0],
        }
    }
}

impl<T> Jagged<T> {
    /// Build a [`Jagged`] sequence from a flat buffer and its row offsets, checking that the
    /// offsets start at zero, never decrease, and end at the buffer length.
    pub fn new(values: Vec<T>, offsets: Vec<usize>) -> MonoBcResult<Self> {
        if offsets.first() != Some(&0) {
            return Err(MonoBcError::Custom(
                "Jagged offsets must start at zero".to_string(),
            ));
        }
        if offsets.windows(2).any(|w| w[1] < w[0]) {
            return Err(MonoBcError::Custom(
                "Jagged offsets must be non-decreasing".to_string(),
            ));
        }
        let end = offsets[offsets.len() - 1];
        if end != values.len() {
            return Err(MonoBcError::LengthMismatch {
                context: "Jagged value buffer".to_string(),
                expected: end,
                actual: values.len(),
            });
        }
        Ok(Self { values, offsets })
    }

    /// Build a [`Jagged`] sequence from owned rows.
    pub fn from_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = Vec<T>>,
    {
        let mut jagged = Self::default();
        for row in rows {
            jagged.push_row(row);
        }
        jagged
    }

    /// Append one row.
    pub fn push_row<I: IntoIterator<Item = T>>(&mut self, row: I) {
        self.values.extend(row);
        self.offsets.push(self.values.len());
    }

    /// Number of rows.
    pub fn n_rows(&self) -> usize {
        self.offsets.len() - 1
    }

    /// The values of row `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.n_rows()`.
    pub fn row(&self, index: usize) -> &[T] {
        &self.values[self.offsets[index]..self.offsets[index + 1]]
    }

    /// Number of values in row `index`.
    pub fn row_len(&self, index: usize) -> usize {
        self.offsets[index + 1] - self.offsets[index]
    }

    /// The flat value buffer.
    pub fn values(&self) -> &[T] {
        &self.values
    }

    /// The row offsets (length `n_rows() + 1`).
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Iterate over rows as slices.
    pub fn iter(&self) -> impl Iterator<Item = &[T]> + '_ {
        (0..self.n_rows()).map(move |i| self.row(i))
    }

    /// Apply `f` to every value, keeping the row structure.
    pub fn map<U, F: FnMut(&T) -> U>(&self, f: F) -> Jagged<U> {
        Jagged {
            values: self.values.iter().map(f).collect(),
            offsets: self.offsets.clone(),
        }
    }
}

/// One named column of a [`Table`].
///
/// Scalar columns hold one value per row; list columns hold a variable number of values per
/// row.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// One floating-point value per row.
    Float(Vec<f64>),
    /// One integer value per row.
    Int(Vec<i64>),
    /// A variable-length sequence of floating-point values per row.
    FloatList(Jagged<f64>),
    /// A variable-length sequence of integer values per row.
    IntList(Jagged<i64>),
}

impl Column {
    /// Number of rows in the column.
    pub fn len(&self) -> usize {
        match self {
            Column::Float(values) => values.len(),
            Column::Int(values) => values.len(),
            Column::FloatList(values) => values.n_rows(),
            Column::IntList(values) => values.n_rows(),
        }
    }

    /// Returns `true` if the column holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A short description of the column type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Column::Float(_) => "float",
            Column::Int(_) => "int",
            Column::FloatList(_) => "list<float>",
            Column::IntList(_) => "list<int>",
        }
    }

    /// Interpret the column as one floating-point value per row.
    ///
    /// List columns are accepted when every row holds exactly one value, which is how
    /// event-level quantities such as the missing transverse energy are commonly stored.
    pub fn to_scalars(&self, name: &str) -> MonoBcResult<Vec<f64>> {
        match self {
            Column::Float(values) => Ok(values.clone()),
            Column::Int(values) => Ok(values.iter().map(|v| *v as f64).collect()),
            Column::FloatList(values) => single_per_row(values, name, |v| *v),
            Column::IntList(values) => single_per_row(values, name, |v| *v as f64),
        }
    }

    /// Interpret the column as a variable-length floating-point sequence per row.
    pub fn to_float_lists(&self, name: &str) -> MonoBcResult<Jagged<f64>> {
        match self {
            Column::FloatList(values) => Ok(values.clone()),
            Column::IntList(values) => Ok(values.map(|v| *v as f64)),
            other => Err(MonoBcError::InvalidColumnType {
                name: name.to_string(),
                datatype: other.type_name().to_string(),
            }),
        }
    }

    /// Interpret the column as a variable-length integer sequence per row.
    pub fn to_int_lists(&self, name: &str) -> MonoBcResult<Jagged<i64>> {
        match self {
            Column::IntList(values) => Ok(values.clone()),
            Column::FloatList(values) => Ok(values.map(|v| *v as i64)),
            other => Err(MonoBcError::InvalidColumnType {
                name: name.to_string(),
                datatype: other.type_name().to_string(),
            }),
        }
    }
}

fn single_per_row<T, F>(values: &Jagged<T>, name: &str, convert: F) -> MonoBcResult<Vec<f64>>
where
    F: Fn(&T) -> f64,
{
    values
        .iter()
        .enumerate()
        .map(|(row, entries)| match entries {
            [single] => Ok(convert(single)),
            _ => Err(MonoBcError::LengthMismatch {
                context: format!("Column '{name}' at row {row}"),
                expected: 1,
                actual: entries.len(),
            }),
        })
        .collect()
}

/// An ordered set of equally long named [`Column`]s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: IndexMap<String, Column>,
    n_rows: usize,
}

impl Table {
    /// Create an empty [`Table`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Table::insert`].
    pub fn with_column<S: Into<String>>(mut self, name: S, column: Column) -> MonoBcResult<Self> {
        self.insert(name, column)?;
        Ok(self)
    }

    /// Add or replace a column. Every column must have the same number of rows as the first.
    pub fn insert<S: Into<String>>(&mut self, name: S, column: Column) -> MonoBcResult<()> {
        let name = name.into();
        let replacing_only_column = self.columns.len() == 1 && self.columns.contains_key(&name);
        if self.columns.is_empty() || replacing_only_column {
            self.n_rows = column.len();
        } else if column.len() != self.n_rows {
            return Err(MonoBcError::LengthMismatch {
                context: format!("Column '{name}'"),
                expected: self.n_rows,
                actual: column.len(),
            });
        }
        self.columns.insert(name, column);
        Ok(())
    }

    /// Number of rows.
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Number of columns.
    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    /// Look up a column which must exist.
    pub fn require(&self, name: &str) -> MonoBcResult<&Column> {
        self.column(name).ok_or_else(|| MonoBcError::MissingColumn {
            name: name.to_string(),
        })
    }

    /// Returns `true` if a column with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Column names in insertion order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.columns.keys().map(String::as_str)
    }

    /// Iterate over `(name, column)` pairs in insertion order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> + '_ {
        self.columns.iter().map(|(name, column)| (name.as_str(), column))
    }

    /// A new [`Table`] holding only the named columns that exist in this one.
    pub fn project(&self, names: &[&str]) -> Table {
        let mut projected = Table::new();
        for name in names {
            if let Some(column) = self.columns.get(*name) {
                projected.columns.insert((*name).to_string(), column.clone());
                projected.n_rows = column.len();
            }
        }
        if projected.columns.is_empty() {
            projected.n_rows = self.n_rows;
        }
        projected
    }
}

/// Read and write access to a collection of named [`Table`]s.
///
/// A store is the unit of input and output of every stage: a raw event file, a flattened file
/// with one table per category, or a histogram file with one table per histogram.
pub trait RecordStore {
    /// A human-readable identifier used in messages.
    fn name(&self) -> String;
    /// Names of all tables in the store.
    fn table_names(&self) -> MonoBcResult<Vec<String>>;
    /// Read a complete table.
    fn read_table(&self, table: &str) -> MonoBcResult<Table>;
    /// Create or overwrite a table.
    fn write_table(&mut self, table: &str, data: &Table) -> MonoBcResult<()>;

    /// Returns `true` if the store holds a table with this name.
    fn has_table(&self, table: &str) -> MonoBcResult<bool> {
        Ok(self.table_names()?.iter().any(|name| name == table))
    }

    /// Read only the requested columns of a table. Requested columns which do not exist are
    /// silently left out, so callers decide whether their absence is an error.
    fn read_columns(&self, table: &str, columns: &[&str]) -> MonoBcResult<Table> {
        Ok(self.read_table(table)?.project(columns))
    }

    /// Number of rows in a table, or zero if the table does not exist.
    fn n_rows(&self, table: &str) -> MonoBcResult<usize> {
        if self.has_table(table)? {
            Ok(self.read_columns(table, &[])?.n_rows())
        } else {
            Ok(0)
        }
    }
}

/// A [`RecordStore`] held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    name: String,
    tables: IndexMap<String, Table>,
}

impl MemoryStore {
    /// Create an empty store with the given display name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            tables: IndexMap::new(),
        }
    }

    /// Builder form of [`RecordStore::write_table`].
    pub fn with_table<S: Into<String>>(mut self, name: S, table: Table) -> Self {
        self.tables.insert(name.into(), table);
        self
    }

    /// Borrow a table without copying it.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }
}

impl RecordStore for MemoryStore {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn table_names(&self) -> MonoBcResult<Vec<String>> {
        Ok(self.tables.keys().cloned().collect())
    }

    fn read_table(&self, table: &str) -> MonoBcResult<Table> {
        self.tables
            .get(table)
            .cloned()
            .ok_or_else(|| MonoBcError::MissingTable {
                name: table.to_string(),
                store: self.name.clone(),
            })
    }

    fn write_table(&mut self, table: &str, data: &Table) -> MonoBcResult<()> {
        self.tables.insert(table.to_string(), data.clone());
        Ok(())
    }

    fn has_table(&self, table: &str) -> MonoBcResult<bool> {
        Ok(self.tables.contains_key(table))
    }

    fn n_rows(&self, table: &str) -> MonoBcResult<usize> {
        Ok(self.tables.get(table).map_or(0, Table::n_rows))
    }
}

/// The two disjoint event categories produced by flattening.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Events with at least one tagged jet.
    Tagged,
    /// Events without any tagged jet.
    Untagged,
}

impl Category {
    /// Both categories in output order.
    pub const ALL: [Category; 2] = [Category::Tagged, Category::Untagged];

    /// The category of an event with `n_tagged` tagged jets.
    pub fn of(n_tagged: i64) -> Self {
        if n_tagged > 0 {
            Category::Tagged
        } else {
            Category::Untagged
        }
    }

    /// The lowercase name used in histogram names.
    pub fn name(&self) -> &'static str {
        match self {
            Category::Tagged => "tagged",
            Category::Untagged => "untagged",
        }
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Category {
    type Err = MonoBcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tagged" | "tag" | "b_tagged" | "c_tagged" => Ok(Self::Tagged),
            "untagged" | "untag" => Ok(Self::Untagged),
            _ => Err(MonoBcError::ParseError {
                name: s.to_string(),
                object: "Category".to_string(),
            }),
        }
    }
}

/// Table names used for each [`Category`] inside flattened stores.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryTables {
    /// Table holding [`Category::Tagged`] events.
    pub tagged: String,
    /// Table holding [`Category::Untagged`] events.
    pub untagged: String,
}

impl Default for CategoryTables {
    fn default() -> Self {
        Self {
            tagged: "tagged".to_string(),
            untagged: "untagged".to_string(),
        }
    }
}

impl CategoryTables {
    /// The table name for `category`.
    pub fn table(&self, category: Category) -> &str {
        match category {
            Category::Tagged => &self.tagged,
            Category::Untagged => &self.untagged,
        }
    }
}

/// Precision for writing floating-point columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FloatPrecision {
    /// 32-bit floats.
    F32,
    /// 64-bit floats.
    #[default]
    F64,
}

/// On-disk layout of a written store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreFormat {
    /// A directory with one Parquet file per table.
    #[default]
    Parquet,
    /// A single ROOT file with one flat tree per table.
    Root,
}

impl Display for StoreFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreFormat::Parquet => write!(f, "parquet"),
            StoreFormat::Root => write!(f, "root"),
        }
    }
}

/// Options for writing a [`Table`] to disk.
#[derive(Clone, Debug)]
pub struct WriteOptions {
    /// Number of rows to include in each batch when writing.
    pub batch_size: usize,
    /// Floating-point precision to use for persisted columns.
    pub precision: FloatPrecision,
}

const DEFAULT_WRITE_BATCH_SIZE: usize = 10_000;

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_WRITE_BATCH_SIZE,
            precision: FloatPrecision::default(),
        }
    }
}

impl WriteOptions {
    /// Override the batch size used for writing; defaults to 10_000.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Select the floating-point precision for persisted columns.
    pub fn precision(mut self, precision: FloatPrecision) -> Self {
        self.precision = precision;
        self
    }
}

/// A reconstructed jet.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Jet {
    /// Transverse momentum.
    pub pt: f64,
    /// Pseudorapidity.
    pub eta: f64,
    /// Azimuthal angle.
    pub phi: f64,
    /// Tagging flag; a jet counts as tagged when this is positive.
    pub btag: i64,
}

impl Jet {
    /// Returns `true` if the jet carries a positive tag flag.
    pub fn is_tagged(&self) -> bool {
        self.btag > 0
    }
}

/// One raw collision event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawEvent {
    /// Jets in the order they were recorded.
    pub jets: Vec<Jet>,
    /// Missing transverse energy.
    pub met: f64,
    /// Azimuthal angle of the missing transverse energy.
    pub met_phi: f64,
    /// Scalar sum of jet transverse momenta.
    pub ht: f64,
    /// Cross section of the generated sample.
    pub cross_section: f64,
    /// Generator weight.
    pub event_weight: f64,
}

/// Physical column names for each field of a [`RawEvent`].
///
/// Defaults follow the Delphes tree layout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSchema {
    /// Table holding the raw events.
    pub tree: String,
    /// Jet transverse momenta (list column).
    pub jet_pt: String,
    /// Jet pseudorapidities (list column).
    pub jet_eta: String,
    /// Jet azimuthal angles (list column).
    pub jet_phi: String,
    /// Jet tag flags (optional list column).
    pub jet_btag: String,
    /// Missing transverse energy.
    pub met: String,
    /// Missing transverse energy azimuth.
    pub met_phi: String,
    /// Scalar sum of transverse momenta.
    pub ht: String,
    /// Sample cross section.
    pub cross_section: String,
    /// Event weight.
    pub event_weight: String,
}

impl Default for RawSchema {
    fn default() -> Self {
        Self {
            tree: "Delphes".to_string(),
            jet_pt: "Jet.PT".to_string(),
            jet_eta: "Jet.Eta".to_string(),
            jet_phi: "Jet.Phi".to_string(),
            jet_btag: "Jet.BTag".to_string(),
            met: "MissingET.MET".to_string(),
            met_phi: "MissingET.Phi".to_string(),
            ht: "ScalarHT.HT".to_string(),
            cross_section: "Event.CrossSection".to_string(),
            event_weight: "Event.Weight".to_string(),
        }
    }
}

impl RawSchema {
    /// Every column name the schema refers to, the optional tag column last.
    pub fn columns(&self) -> [&str; 9] {
        [
            &self.jet_pt,
            &self.jet_eta,
            &self.jet_phi,
            &self.met,
            &self.met_phi,
            &self.ht,
            &self.cross_section,
            &self.event_weight,
            &self.jet_btag,
        ]
    }
}

/// A columnar collection of [`RawEvent`]s.
///
/// Jet fields share a single offset layout; event-level fields hold one value per event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawEvents {
    jet_pt: Jagged<f64>,
    jet_eta: Jagged<f64>,
    jet_phi: Jagged<f64>,
    jet_btag: Option<Jagged<i64>>,
    met: Vec<f64>,
    met_phi: Vec<f64>,
    ht: Vec<f64>,
    cross_section: Vec<f64>,
    event_weight: Vec<f64>,
}

impl RawEvents {
    /// Read raw events from a [`Table`] using the column names in `schema`.
    ///
    /// A missing tag column is not an error: every jet is then treated as untagged. Every
    /// other column is required, and all columns must describe the same events and, for jet
    /// fields, the same number of jets per event.
    pub fn from_table(table: &Table, schema: &RawSchema) -> MonoBcResult<Self> {
        let jet_pt = table.require(&schema.jet_pt)?.to_float_lists(&schema.jet_pt)?;
        let jet_eta = table
            .require(&schema.jet_eta)?
            .to_float_lists(&schema.jet_eta)?;
        let jet_phi = table
            .require(&schema.jet_phi)?
            .to_float_lists(&schema.jet_phi)?;
        let jet_btag = match table.column(&schema.jet_btag) {
            Some(column) => Some(column.to_int_lists(&schema.jet_btag)?),
            None => None,
        };
        let met = table.require(&schema.met)?.to_scalars(&schema.met)?;
        let met_phi = table.require(&schema.met_phi)?.to_scalars(&schema.met_phi)?;
        let ht = table.require(&schema.ht)?.to_scalars(&schema.ht)?;
        let cross_section = table
            .require(&schema.cross_section)?
            .to_scalars(&schema.cross_section)?;
        let event_weight = table
            .require(&schema.event_weight)?
            .to_scalars(&schema.event_weight)?;

        let events = Self {
            jet_pt,
            jet_eta,
            jet_phi,
            jet_btag,
            met,
            met_phi,
            ht,
            cross_section,
            event_weight,
        };
        events.check_layout(schema)?;
        Ok(events)
    }

    fn check_layout(&self, schema: &RawSchema) -> MonoBcResult<()> {
        let n_events = self.jet_pt.n_rows();
        let scalar_lengths = [
            (&schema.met, self.met.len()),
            (&schema.met_phi, self.met_phi.len()),
            (&schema.ht, self.ht.len()),
            (&schema.cross_section, self.cross_section.len()),
            (&schema.event_weight, self.event_weight.len()),
            (&schema.jet_eta, self.jet_eta.n_rows()),
            (&schema.jet_phi, self.jet_phi.n_rows()),
        ];
        for (name, actual) in scalar_lengths {
            if actual != n_events {
                return Err(MonoBcError::LengthMismatch {
                    context: format!("Column '{name}'"),
                    expected: n_events,
                    actual,
                });
            }
        }
        let jet_fields = [
            (&schema.jet_eta, Some(self.jet_eta.offsets())),
            (&schema.jet_phi, Some(self.jet_phi.offsets())),
            (
                &schema.jet_btag,
                self.jet_btag.as_ref().map(Jagged::offsets),
            ),
        ];
        for (name, offsets) in jet_fields {
            let Some(offsets) = offsets else {
                continue;
            };
            if let Some(row) = (0..n_events).find(|&i| {
                offsets.get(i + 1).map(|end| end - offsets[i]) != Some(self.jet_pt.row_len(i))
            }) {
                return Err(MonoBcError::LengthMismatch {
                    context: format!("Jets in column '{name}' at event {row}"),
                    expected: self.jet_pt.row_len(row),
                    actual: offsets
                        .get(row + 1)
                        .map_or(0, |end| end.saturating_sub(offsets[row])),
                });
            }
        }
        Ok(())
    }

    /// Build a columnar collection from owned events. The tag column is always present.
    pub fn from_events(events: &[RawEvent]) -> Self {
        let jet_rows = |f: fn(&Jet) -> f64| {
            Jagged::from_rows(
                events
                    .iter()
                    .map(|e| e.jets.iter().map(f).collect::<Vec<f64>>()),
            )
        };
        Self {
            jet_pt: jet_rows(|j| j.pt),
            jet_eta: jet_rows(|j| j.eta),
            jet_phi: jet_rows(|j| j.phi),
            jet_btag: Some(Jagged::from_rows(
                events
                    .iter()
                    .map(|e| e.jets.iter().map(|j| j.btag).collect::<Vec<i64>>()),
            )),
            met: events.iter().map(|e| e.met).collect(),
            met_phi: events.iter().map(|e| e.met_phi).collect(),
            ht: events.iter().map(|e| e.ht).collect(),
            cross_section: events.iter().map(|e| e.cross_section).collect(),
            event_weight: events.iter().map(|e| e.event_weight).collect(),
        }
    }

    /// Drop the tag column, as if the source had never recorded it.
    pub fn without_btag(mut self) -> Self {
        self.jet_btag = None;
        self
    }

    /// Lay the events out as a [`Table`] using the column names in `schema`.
    pub fn to_table(&self, schema: &RawSchema) -> MonoBcResult<Table> {
        let mut table = Table::new()
            .with_column(&schema.jet_pt, Column::FloatList(self.jet_pt.clone()))?
            .with_column(&schema.jet_eta, Column::FloatList(self.jet_eta.clone()))?
            .with_column(&schema.jet_phi, Column::FloatList(self.jet_phi.clone()))?;
        if let Some(btag) = &self.jet_btag {
            table.insert(&schema.jet_btag, Column::IntList(btag.clone()))?;
        }
        table.insert(&schema.met, Column::Float(self.met.clone()))?;
        table.insert(&schema.met_phi, Column::Float(self.met_phi.clone()))?;
        table.insert(&schema.ht, Column::Float(self.ht.clone()))?;
        table.insert(
            &schema.cross_section,
            Column::Float(self.cross_section.clone()),
        )?;
        table.insert(
            &schema.event_weight,
            Column::Float(self.event_weight.clone()),
        )?;
        Ok(table)
    }

    /// Number of events.
    pub fn n_events(&self) -> usize {
        self.met.len()
    }

    /// Returns `true` if the source recorded jet tag flags.
    pub fn has_btag(&self) -> bool {
        self.jet_btag.is_some()
    }

    /// Number of jets in event `index`.
    pub fn n_jets(&self, index: usize) -> usize {
        self.jet_pt.row_len(index)
    }

    /// Number of tagged jets in event `index`, counted over every jet of the event.
    pub fn n_tagged(&self, index: usize) -> usize {
        self.jet_btag
            .as_ref()
            .map_or(0, |btag| btag.row(index).iter().filter(|&&b| b > 0).count())
    }

    /// The jets of event `index` in recorded order.
    pub fn jets(&self, index: usize) -> Vec<Jet> {
        let pt = self.jet_pt.row(index);
        let eta = self.jet_eta.row(index);
        let phi = self.jet_phi.row(index);
        let btag = self.jet_btag.as_ref().map(|b| b.row(index));
        (0..pt.len())
            .map(|j| Jet {
                pt: pt[j],
                eta: eta[j],
                phi: phi[j],
                btag: btag.map_or(0, |b| b[j]),
            })
            .collect()
    }

    /// Missing transverse energy of event `index`.
    pub fn met(&self, index: usize) -> f64 {
        self.met[index]
    }

    /// Missing transverse energy azimuth of event `index`.
    pub fn met_phi(&self, index: usize) -> f64 {
        self.met_phi[index]
    }

    /// Scalar transverse momentum sum of event `index`.
    pub fn ht(&self, index: usize) -> f64 {
        self.ht[index]
    }

    /// Sample cross section recorded for event `index`.
    pub fn cross_section(&self, index: usize) -> f64 {
        self.cross_section[index]
    }

    /// Generator weight of event `index`.
    pub fn event_weight(&self, index: usize) -> f64 {
        self.event_weight[index]
    }

    /// An owned copy of event `index`.
    pub fn event(&self, index: usize) -> RawEvent {
        RawEvent {
            jets: self.jets(index),
            met: self.met(index),
            met_phi: self.met_phi(index),
            ht: self.ht(index),
            cross_section: self.cross_section(index),
            event_weight: self.event_weight(index),
        }
    }
}

/// A flattened event which passed the selection.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FlatEvent {
    /// Transverse momentum of the leading jet.
    pub jet1_pt: f64,
    /// Transverse momentum of the subleading jet.
    pub jet2_pt: f64,
    /// Pseudorapidity of the leading jet.
    pub jet1_eta: f64,
    /// Pseudorapidity of the subleading jet.
    pub jet2_eta: f64,
    /// Azimuth of the leading jet.
    pub jet1_phi: f64,
    /// Azimuth of the subleading jet.
    pub jet2_phi: f64,
    /// Missing transverse energy.
    pub met_pt: f64,
    /// Azimuthal separation of the leading jet and the missing transverse energy, in `[0, π]`.
    pub jet1_met_dphi: f64,
    /// Missing transverse energy significance.
    pub met_sig: f64,
    /// Number of jets before selection.
    pub n_jets: i64,
    /// Number of tagged jets before selection.
    pub n_bjets: i64,
    /// Sample cross section.
    pub cross_section: f64,
    /// Generator weight.
    pub event_weight: f64,
}

/// Floating-point columns of a flattened table, in output order.
pub const FLAT_FLOAT_COLUMNS: [&str; 9] = [
    "jet1_pt",
    "jet2_pt",
    "jet1_eta",
    "jet2_eta",
    "jet1_phi",
    "jet2_phi",
    "met_pt",
    "jet1met_dphi",
    "met_sig",
];
/// Count columns of a flattened table.
pub const FLAT_COUNT_COLUMNS: [&str; 2] = ["nJets", "nBjets"];
/// Per-event sample columns of a flattened table.
pub const FLAT_SAMPLE_COLUMNS: [&str; 2] = ["event_xsec", "event_weight"];

impl FlatEvent {
    fn float_fields(&self) -> [f64; 9] {
        [
            self.jet1_pt,
            self.jet2_pt,
            self.jet1_eta,
            self.jet2_eta,
            self.jet1_phi,
            self.jet2_phi,
            self.met_pt,
            self.jet1_met_dphi,
            self.met_sig,
        ]
    }

    /// Lay out events as a [`Table`] with the fixed flattened schema.
    pub fn to_table(events: &[FlatEvent]) -> MonoBcResult<Table> {
        let mut table = Table::new();
        for (k, name) in FLAT_FLOAT_COLUMNS.iter().enumerate() {
            table.insert(
                *name,
                Column::Float(events.iter().map(|e| e.float_fields()[k]).collect()),
            )?;
        }
        table.insert(
            FLAT_COUNT_COLUMNS[0],
            Column::Int(events.iter().map(|e| e.n_jets).collect()),
        )?;
        table.insert(
            FLAT_COUNT_COLUMNS[1],
            Column::Int(events.iter().map(|e| e.n_bjets).collect()),
        )?;
        table.insert(
            FLAT_SAMPLE_COLUMNS[0],
            Column::Float(events.iter().map(|e| e.cross_section).collect()),
        )?;
        table.insert(
            FLAT_SAMPLE_COLUMNS[1],
            Column::Float(events.iter().map(|e| e.event_weight).collect()),
        )?;
        Ok(table)
    }

    /// Read events back from a [`Table`] with the fixed flattened schema.
    pub fn from_table(table: &Table) -> MonoBcResult<Vec<FlatEvent>> {
        let floats = FLAT_FLOAT_COLUMNS
            .iter()
            .map(|name| table.require(name)?.to_scalars(name))
            .collect::<MonoBcResult<Vec<_>>>()?;
        let counts = FLAT_COUNT_COLUMNS
            .iter()
            .map(|name| table.require(name)?.to_scalars(name))
            .collect::<MonoBcResult<Vec<_>>>()?;
        let sample = FLAT_SAMPLE_COLUMNS
            .iter()
            .map(|name| table.require(name)?.to_scalars(name))
            .collect::<MonoBcResult<Vec<_>>>()?;
        Ok((0..table.n_rows())
            .map(|i| FlatEvent {
                jet1_pt: floats[0][i],
                jet2_pt: floats[1][i],
                jet1_eta: floats[2][i],
                jet2_eta: floats[3][i],
                jet1_phi: floats[4][i],
                jet2_phi: floats[5][i],
                met_pt: floats[6][i],
                jet1_met_dphi: floats[7][i],
                met_sig: floats[8][i],
                n_jets: counts[0][i] as i64,
                n_bjets: counts[1][i] as i64,
                cross_section: sample[0][i],
                event_weight: sample[1][i],
            })
            .collect())
    }
}

/// A small set of raw events used throughout the tests.
///
/// Event 0 passes every selection with one tagged jet, event 1 has a single jet, event 2 has a
/// leading jet outside the pseudorapidity window, event 3 fails the missing transverse energy
/// requirement, and event 4 passes without any tagged jet.
pub fn test_events() -> Vec<RawEvent> {
    let jet = |pt: f64, eta: f64, phi: f64, btag: i64| Jet { pt, eta, phi, btag };
    let event = |jets: Vec<Jet>, met: f64, met_phi: f64, ht: f64| RawEvent {
        jets,
        met,
        met_phi,
        ht,
        cross_section: 1.5,
        event_weight: 1.0,
    };
    vec![
        event(
            vec![
                jet(200.0, 1.0, 0.1, 0),
                jet(100.0, -1.0, 0.2, 1),
                jet(50.0, 3.0, 0.3, 0),
            ],
            250.0,
            0.0,
            100.0,
        ),
        event(vec![jet(400.0, 0.0, 1.0, 1)], 500.0, 0.0, 400.0),
        event(
            vec![jet(300.0, 3.0, 0.0, 0), jet(100.0, 0.0, 1.0, 0)],
            300.0,
            0.0,
            400.0,
        ),
        event(
            vec![jet(300.0, 0.0, 0.0, 0), jet(100.0, 0.0, 1.0, 0)],
            150.0,
            0.0,
            400.0,
        ),
        event(
            vec![jet(40.0, 0.5, 3.0, 0), jet(180.0, -2.0, -3.0, 0)],
            210.0,
            3.0,
            0.0,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_jagged_rows() {
        let jagged = Jagged::from_rows(vec![vec![1.0, 2.0], vec![], vec![3.0]]);
        assert_eq!(jagged.n_rows(), 3);
        assert_eq!(jagged.row(0), &[1.0, 2.0]);
        assert!(jagged.row(1).is_empty());
        assert_eq!(jagged.row(2), &[3.0]);
        assert_eq!(jagged.offsets(), &[0, 2, 2, 3]);
    }

    #[test]
    fn test_jagged_rejects_bad_offsets() {
        assert!(Jagged::new(vec![1.0, 2.0], vec![0, 3]).is_err());
        assert!(Jagged::new(vec![1.0, 2.0], vec![1, 2]).is_err());
        assert!(Jagged::new(vec![1.0, 2.0], vec![0, 2, 1, 2]).is_err());
        assert!(Jagged::new(vec![1.0, 2.0], vec![0, 1, 2]).is_ok());
    }

    #[test]
    fn test_table_rejects_ragged_columns() {
        let table = Table::new()
            .with_column("a", Column::Float(vec![1.0, 2.0]))
            .unwrap();
        let err = table
            .clone()
            .with_column("b", Column::Int(vec![1, 2, 3]))
            .unwrap_err();
        assert!(matches!(err, MonoBcError::LengthMismatch { expected: 2, .. }));
        assert!(table.with_column("c", Column::Int(vec![4, 5])).is_ok());
    }

    #[test]
    fn test_scalars_from_single_entry_lists() {
        let column = Column::FloatList(Jagged::from_rows(vec![vec![250.0], vec![300.0]]));
        assert_eq!(column.to_scalars("met").unwrap(), vec![250.0, 300.0]);
        let broken = Column::FloatList(Jagged::from_rows(vec![vec![250.0], vec![]]));
        assert!(matches!(
            broken.to_scalars("met"),
            Err(MonoBcError::LengthMismatch { actual: 0, .. })
        ));
    }

    #[test]
    fn test_category_partition_and_parsing() {
        assert_eq!(Category::of(0), Category::Untagged);
        assert_eq!(Category::of(2), Category::Tagged);
        assert_eq!("c_tagged".parse::<Category>().unwrap(), Category::Tagged);
        assert_eq!("Untagged".parse::<Category>().unwrap(), Category::Untagged);
        assert!("maybe".parse::<Category>().is_err());
        let tables = CategoryTables {
            tagged: "c_tagged".to_string(),
            ..Default::default()
        };
        assert_eq!(tables.table(Category::Tagged), "c_tagged");
        assert_eq!(tables.table(Category::Untagged), "untagged");
    }

    #[test]
    fn test_raw_events_table_round_trip() {
        let schema = RawSchema::default();
        let events = RawEvents::from_events(&test_events());
        let table = events.to_table(&schema).unwrap();
        let read = RawEvents::from_table(&table, &schema).unwrap();
        assert_eq!(read, events);
        assert_eq!(read.n_events(), 5);
        assert_eq!(read.n_jets(0), 3);
        assert_eq!(read.n_tagged(0), 1);
        assert_eq!(read.event(1).jets[0].pt, 400.0);
    }

    #[test]
    fn test_raw_events_without_btag_column() {
        let schema = RawSchema::default();
        let table = RawEvents::from_events(&test_events())
            .without_btag()
            .to_table(&schema)
            .unwrap();
        assert!(!table.contains(&schema.jet_btag));
        let read = RawEvents::from_table(&table, &schema).unwrap();
        assert!(!read.has_btag());
        assert_eq!(read.n_tagged(0), 0);
        assert!(read.jets(0).iter().all(|jet| !jet.is_tagged()));
    }

    #[test]
    fn test_raw_events_missing_required_column() {
        let schema = RawSchema::default();
        let table = RawEvents::from_events(&test_events())
            .to_table(&schema)
            .unwrap()
            .project(&["Jet.PT", "Jet.Eta", "Jet.Phi", "MissingET.MET"]);
        assert!(matches!(
            RawEvents::from_table(&table, &schema),
            Err(MonoBcError::MissingColumn { name }) if name == "MissingET.Phi"
        ));
    }

    #[test]
    fn test_raw_events_rejects_misaligned_jets() {
        let schema = RawSchema::default();
        let mut table = RawEvents::from_events(&test_events())
            .to_table(&schema)
            .unwrap();
        let eta = Jagged::from_rows(vec![
            vec![1.0, -1.0],
            vec![0.0],
            vec![3.0, 0.0],
            vec![0.0, 0.0],
            vec![0.5, -2.0],
        ]);
        table.insert("Jet.Eta", Column::FloatList(eta)).unwrap();
        assert!(matches!(
            RawEvents::from_table(&table, &schema),
            Err(MonoBcError::LengthMismatch { expected: 3, actual: 2, .. })
        ));
    }

    #[test]
    fn test_flat_event_table_schema() {
        let event = FlatEvent {
            jet1_pt: 200.0,
            jet2_pt: 100.0,
            met_pt: 250.0,
            met_sig: 25.0,
            n_jets: 3,
            n_bjets: 1,
            cross_section: 1.5,
            event_weight: 1.0,
            ..Default::default()
        };
        let table = FlatEvent::to_table(&[event]).unwrap();
        let names: Vec<&str> = table.column_names().collect();
        assert_eq!(
            names,
            vec![
                "jet1_pt",
                "jet2_pt",
                "jet1_eta",
                "jet2_eta",
                "jet1_phi",
                "jet2_phi",
                "met_pt",
                "jet1met_dphi",
                "met_sig",
                "nJets",
                "nBjets",
                "event_xsec",
                "event_weight"
            ]
        );
        assert!(matches!(table.column("nJets"), Some(Column::Int(_))));
        assert!(matches!(table.column("event_xsec"), Some(Column::Float(_))));
        let back = FlatEvent::from_table(&table).unwrap();
        assert_relative_eq!(back[0].met_sig, 25.0);
        assert_eq!(back[0].n_bjets, 1);
    }

    #[test]
    fn test_memory_store_counts_rows() {
        let table = Table::new()
            .with_column("x", Column::Float(vec![1.0, 2.0, 3.0]))
            .unwrap();
        let mut store = MemoryStore::new("mem").with_table("a", table.clone());
        store.write_table("b", &table).unwrap();
        assert_eq!(store.n_rows("a").unwrap(), 3);
        assert_eq!(store.n_rows("missing").unwrap(), 0);
        assert!(store.has_table("b").unwrap());
        assert!(matches!(
            store.read_table("c"),
            Err(MonoBcError::MissingTable { .. })
        ));
    }
}
