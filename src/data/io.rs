//! Parquet-backed table storage, Arrow conversions, and store selection by format.

use super::*;
use arrow::{
    array::{
        Array, ArrayRef, AsArray, Float32Array, Float64Array, GenericListArray, Int32Array,
        Int64Array, ListArray, OffsetSizeTrait,
    },
    buffer::OffsetBuffer,
    compute::cast,
    datatypes::{DataType, Field, Float64Type, Int64Type, Schema},
    record_batch::RecordBatch,
};
use parquet::arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter, ProjectionMask};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
};

/// File extension of every table in a [`ParquetStore`].
pub const TABLE_EXTENSION: &str = "parquet";

pub(crate) fn canonicalize_store_path(path: &str) -> MonoBcResult<PathBuf> {
    Ok(Path::new(&*shellexpand::full(path)?).canonicalize()?)
}

fn expand_output_path(path: &str) -> MonoBcResult<PathBuf> {
    Ok(PathBuf::from(&*shellexpand::full(path)?))
}

/// A [`RecordStore`] kept on disk as a directory with one Parquet file per table.
///
/// Table `name` lives at `<root>/<name>.parquet`. Jagged columns are stored as Arrow list
/// columns, scalar columns as plain primitive columns.
#[derive(Debug, Clone)]
pub struct ParquetStore {
    root: PathBuf,
    options: WriteOptions,
}

impl ParquetStore {
    /// Open an existing store directory. The path is shell-expanded (`~`, `$VAR`).
    pub fn open(path: &str) -> MonoBcResult<Self> {
        let root = canonicalize_store_path(path)?;
        if !root.is_dir() {
            return Err(MonoBcError::Custom(format!(
                "'{}' is not a table store directory",
                root.display()
            )));
        }
        Ok(Self {
            root,
            options: WriteOptions::default(),
        })
    }

    /// Create (or reuse) a store directory for writing.
    pub fn create(path: &str) -> MonoBcResult<Self> {
        let root = expand_output_path(path)?;
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            options: WriteOptions::default(),
        })
    }

    /// Remove an existing store directory and create it empty.
    pub fn recreate(path: &str) -> MonoBcResult<Self> {
        let root = expand_output_path(path)?;
        if root.is_dir() {
            fs::remove_dir_all(&root)?;
        }
        Self::create(path)
    }

    /// Use these [`WriteOptions`] for subsequent writes.
    pub fn with_options(mut self, options: WriteOptions) -> Self {
        self.options = options;
        self
    }

    /// The store directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.root.join(format!("{table}.{TABLE_EXTENSION}"))
    }

    fn reader_builder(&self, table: &str) -> MonoBcResult<ParquetRecordBatchReaderBuilder<File>> {
        let path = self.table_path(table);
        if !path.is_file() {
            return Err(MonoBcError::MissingTable {
                name: table.to_string(),
                store: self.name(),
            });
        }
        Ok(ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?)
    }

    fn read_with_builder(
        builder: ParquetRecordBatchReaderBuilder<File>,
        wanted: Option<&[&str]>,
    ) -> MonoBcResult<Table> {
        let schema = builder.schema().clone();
        let indices: Vec<usize> = match wanted {
            Some(names) => schema
                .fields()
                .iter()
                .enumerate()
                .filter(|(_, field)| names.contains(&field.name().as_str()))
                .map(|(idx, _)| idx)
                .collect(),
            None => (0..schema.fields().len()).collect(),
        };
        let n_rows = builder.metadata().file_metadata().num_rows() as usize;
        if indices.is_empty() {
            let mut table = Table::new();
            table.n_rows = n_rows;
            return Ok(table);
        }
        let mask = ProjectionMask::roots(builder.parquet_schema(), indices.clone());
        let reader = builder.with_projection(mask).build()?;

        let mut table = Table::new();
        for idx in &indices {
            let field = schema.field(*idx);
            table.insert(field.name(), empty_column(field.name(), field.data_type())?)?;
        }
        for batch in reader {
            append_record_batch(&mut table, &batch?)?;
        }
        Ok(table)
    }
}

impl RecordStore for ParquetStore {
    fn name(&self) -> String {
        self.root.display().to_string()
    }

    fn table_names(&self) -> MonoBcResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(TABLE_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn has_table(&self, table: &str) -> MonoBcResult<bool> {
        Ok(self.table_path(table).is_file())
    }

    fn read_table(&self, table: &str) -> MonoBcResult<Table> {
        Self::read_with_builder(self.reader_builder(table)?, None)
    }

    fn read_columns(&self, table: &str, columns: &[&str]) -> MonoBcResult<Table> {
        Self::read_with_builder(self.reader_builder(table)?, Some(columns))
    }

    fn n_rows(&self, table: &str) -> MonoBcResult<usize> {
        if !self.has_table(table)? {
            return Ok(0);
        }
        let builder = self.reader_builder(table)?;
        Ok(builder.metadata().file_metadata().num_rows() as usize)
    }

    fn write_table(&mut self, table: &str, data: &Table) -> MonoBcResult<()> {
        fs::create_dir_all(&self.root)?;
        let path = self.table_path(table);
        let batch_size = self.options.batch_size.max(1);
        let precision = self.options.precision;
        let schema = Arc::new(build_parquet_schema(data, precision));
        let file = File::create(&path)?;
        let mut writer = ArrowWriter::try_new(file, schema.clone(), None).map_err(|err| {
            MonoBcError::Custom(format!("Failed to create Parquet writer: {err}"))
        })?;

        let n_rows = data.n_rows();
        let mut start = 0usize;
        while start < n_rows {
            let end = (start + batch_size).min(n_rows);
            let batch = table_range_to_record_batch(data, start, end, schema.clone(), precision)
                .map_err(|err| {
                    MonoBcError::Custom(format!("Failed to build Parquet batch: {err}"))
                })?;
            writer.write(&batch).map_err(|err| {
                MonoBcError::Custom(format!("Failed to write Parquet batch: {err}"))
            })?;
            start = end;
        }

        writer.close().map_err(|err| {
            MonoBcError::Custom(format!(
                "Failed to finalise Parquet file '{}': {err}",
                path.display()
            ))
        })?;
        log::debug!("Wrote {n_rows} rows to '{}'", path.display());
        Ok(())
    }
}

/// Open an existing store: a file with the `.root` extension is read as a
/// [`RootStore`](super::root::RootStore), anything else as a [`ParquetStore`] directory.
pub fn open_store(path: &str) -> MonoBcResult<Box<dyn RecordStore>> {
    let expanded = expand_output_path(path)?;
    if expanded.extension().and_then(|ext| ext.to_str()) == Some(super::root::ROOT_EXTENSION) {
        Ok(Box::new(super::root::RootStore::open(path)?))
    } else {
        Ok(Box::new(ParquetStore::open(path)?))
    }
}

/// Create an empty store of the given format at `path`, replacing whatever was there.
pub fn recreate_store(
    path: &str,
    format: StoreFormat,
    options: WriteOptions,
) -> MonoBcResult<Box<dyn RecordStore>> {
    match format {
        StoreFormat::Parquet => Ok(Box::new(ParquetStore::recreate(path)?.with_options(options))),
        StoreFormat::Root => {
            let expanded = expand_output_path(path)?;
            if expanded.is_dir() {
                fs::remove_dir_all(&expanded)?;
            } else if expanded.is_file() {
                fs::remove_file(&expanded)?;
            }
            Ok(Box::new(
                super::root::RootStore::create(path)?.with_options(options),
            ))
        }
    }
}

fn check_no_nulls(name: &str, array: &dyn Array) -> MonoBcResult<()> {
    if array.null_count() > 0 {
        return Err(MonoBcError::InvalidColumnType {
            name: name.to_string(),
            datatype: format!("{} with nulls", array.data_type()),
        });
    }
    Ok(())
}

fn is_float(datatype: &DataType) -> bool {
    matches!(
        datatype,
        DataType::Float16 | DataType::Float32 | DataType::Float64
    )
}

fn is_integer(datatype: &DataType) -> bool {
    matches!(
        datatype,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Boolean
    )
}

fn unsupported(name: &str, datatype: &DataType) -> MonoBcError {
    MonoBcError::InvalidColumnType {
        name: name.to_string(),
        datatype: datatype.to_string(),
    }
}

fn empty_column(name: &str, datatype: &DataType) -> MonoBcResult<Column> {
    match datatype {
        dt if is_float(dt) => Ok(Column::Float(Vec::new())),
        dt if is_integer(dt) => Ok(Column::Int(Vec::new())),
        DataType::List(item) | DataType::LargeList(item) => match item.data_type() {
            dt if is_float(dt) => Ok(Column::FloatList(Jagged::default())),
            dt if is_integer(dt) => Ok(Column::IntList(Jagged::default())),
            other => Err(unsupported(name, other)),
        },
        other => Err(unsupported(name, other)),
    }
}

fn float_values(name: &str, array: &dyn Array) -> MonoBcResult<Vec<f64>> {
    check_no_nulls(name, array)?;
    let converted = cast(array, &DataType::Float64)?;
    Ok(converted.as_primitive::<Float64Type>().values().to_vec())
}

fn int_values(name: &str, array: &dyn Array) -> MonoBcResult<Vec<i64>> {
    check_no_nulls(name, array)?;
    let converted = cast(array, &DataType::Int64)?;
    Ok(converted.as_primitive::<Int64Type>().values().to_vec())
}

fn list_layout<O: OffsetSizeTrait>(list: &GenericListArray<O>) -> (Vec<usize>, ArrayRef) {
    let offsets = list.value_offsets();
    let first = offsets[0].as_usize();
    let last = offsets[offsets.len() - 1].as_usize();
    let rebased = offsets.iter().map(|o| o.as_usize() - first).collect();
    (rebased, list.values().slice(first, last - first))
}

fn array_to_column(name: &str, array: &ArrayRef) -> MonoBcResult<Column> {
    let datatype = array.data_type();
    match datatype {
        dt if is_float(dt) => Ok(Column::Float(float_values(name, array.as_ref())?)),
        dt if is_integer(dt) => Ok(Column::Int(int_values(name, array.as_ref())?)),
        DataType::List(_) | DataType::LargeList(_) => {
            check_no_nulls(name, array.as_ref())?;
            let (offsets, values) = match datatype {
                DataType::List(_) => list_layout(array.as_list::<i32>()),
                _ => list_layout(array.as_list::<i64>()),
            };
            match values.data_type() {
                dt if is_float(dt) => Ok(Column::FloatList(Jagged::new(
                    float_values(name, values.as_ref())?,
                    offsets,
                )?)),
                dt if is_integer(dt) => Ok(Column::IntList(Jagged::new(
                    int_values(name, values.as_ref())?,
                    offsets,
                )?)),
                other => Err(unsupported(name, other)),
            }
        }
        other => Err(unsupported(name, other)),
    }
}

fn extend_jagged<T: Clone>(target: &mut Jagged<T>, other: &Jagged<T>) {
    let base = target.values.len();
    target.values.extend_from_slice(&other.values);
    target
        .offsets
        .extend(other.offsets.iter().skip(1).map(|o| o + base));
}

fn extend_column(name: &str, target: &mut Column, other: Column) -> MonoBcResult<()> {
    match (target, other) {
        (Column::Float(t), Column::Float(o)) => t.extend(o),
        (Column::Int(t), Column::Int(o)) => t.extend(o),
        (Column::FloatList(t), Column::FloatList(o)) => extend_jagged(t, &o),
        (Column::IntList(t), Column::IntList(o)) => extend_jagged(t, &o),
        (t, o) => {
            return Err(MonoBcError::InvalidColumnType {
                name: name.to_string(),
                datatype: format!("{} changed to {} between batches", t.type_name(), o.type_name()),
            })
        }
    }
    Ok(())
}

fn append_record_batch(table: &mut Table, batch: &RecordBatch) -> MonoBcResult<()> {
    let schema = batch.schema();
    for (field, array) in schema.fields().iter().zip(batch.columns()) {
        let column = array_to_column(field.name(), array)?;
        let target = table
            .columns
            .get_mut(field.name().as_str())
            .ok_or_else(|| MonoBcError::MissingColumn {
                name: field.name().to_string(),
            })?;
        extend_column(field.name(), target, column)?;
    }
    table.n_rows += batch.num_rows();
    Ok(())
}

fn float_type(precision: FloatPrecision) -> DataType {
    match precision {
        FloatPrecision::F64 => DataType::Float64,
        FloatPrecision::F32 => DataType::Float32,
    }
}

fn int_type(values: &[i64]) -> DataType {
    if values
        .iter()
        .all(|v| i32::try_from(*v).is_ok())
    {
        DataType::Int32
    } else {
        DataType::Int64
    }
}

fn list_item_field(datatype: DataType) -> Arc<Field> {
    Arc::new(Field::new("item", datatype, true))
}

fn build_parquet_schema(table: &Table, precision: FloatPrecision) -> Schema {
    let fields = table
        .columns()
        .map(|(name, column)| {
            let datatype = match column {
                Column::Float(_) => float_type(precision),
                Column::Int(values) => int_type(values),
                Column::FloatList(_) => DataType::List(list_item_field(float_type(precision))),
                Column::IntList(values) => DataType::List(list_item_field(int_type(values.values()))),
            };
            Field::new(name, datatype, false)
        })
        .collect::<Vec<_>>();
    Schema::new(fields)
}

fn float_array(values: &[f64], precision: FloatPrecision) -> ArrayRef {
    match precision {
        FloatPrecision::F64 => Arc::new(Float64Array::from(values.to_vec())),
        FloatPrecision::F32 => Arc::new(Float32Array::from(
            values.iter().map(|v| *v as f32).collect::<Vec<_>>(),
        )),
    }
}

fn int_array(values: &[i64], datatype: &DataType) -> ArrayRef {
    match datatype {
        DataType::Int32 => Arc::new(Int32Array::from(
            values.iter().map(|v| *v as i32).collect::<Vec<_>>(),
        )),
        _ => Arc::new(Int64Array::from(values.to_vec())),
    }
}

fn list_array<T>(
    jagged: &Jagged<T>,
    start: usize,
    end: usize,
    item: &DataType,
    values_to_array: impl Fn(&[T]) -> ArrayRef,
) -> arrow::error::Result<ArrayRef> {
    let offsets = OffsetBuffer::<i32>::from_lengths((start..end).map(|row| jagged.row_len(row)));
    let values = values_to_array(&jagged.values[jagged.offsets[start]..jagged.offsets[end]]);
    Ok(Arc::new(ListArray::try_new(
        list_item_field(item.clone()),
        offsets,
        values,
        None,
    )?))
}

fn table_range_to_record_batch(
    table: &Table,
    start: usize,
    end: usize,
    schema: Arc<Schema>,
    precision: FloatPrecision,
) -> arrow::error::Result<RecordBatch> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(table.n_columns());
    for ((_, column), field) in table.columns().zip(schema.fields().iter()) {
        let array = match (column, field.data_type()) {
            (Column::Float(values), _) => float_array(&values[start..end], precision),
            (Column::Int(values), datatype) => int_array(&values[start..end], datatype),
            (Column::FloatList(values), DataType::List(item)) => {
                list_array(values, start, end, item.data_type(), |v| {
                    float_array(v, precision)
                })?
            }
            (Column::IntList(values), DataType::List(item)) => {
                let item_type = item.data_type().clone();
                list_array(values, start, end, item.data_type(), move |v| {
                    int_array(v, &item_type)
                })?
            }
            (_, other) => {
                return Err(arrow::error::ArrowError::SchemaError(format!(
                    "Column '{}' does not match schema type {other}",
                    field.name()
                )))
            }
        };
        columns.push(array);
    }
    RecordBatch::try_new(schema, columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::env;

    fn make_temp_dir() -> PathBuf {
        let dir = env::temp_dir().join(format!("monobc_test_{}", fastrand::u64(..)));
        fs::create_dir(&dir).expect("temp dir should be created");
        dir
    }

    fn sample_table() -> Table {
        Table::new()
            .with_column(
                "pt",
                Column::FloatList(Jagged::from_rows(vec![
                    vec![200.0, 100.0, 50.0],
                    vec![],
                    vec![30.5],
                ])),
            )
            .unwrap()
            .with_column(
                "btag",
                Column::IntList(Jagged::from_rows(vec![vec![0, 1, 0], vec![], vec![1]])),
            )
            .unwrap()
            .with_column("met", Column::Float(vec![250.0, 10.0, 300.25]))
            .unwrap()
            .with_column("n", Column::Int(vec![3, 0, 1]))
            .unwrap()
    }

    #[test]
    fn test_parquet_round_trip_f64() {
        let dir = make_temp_dir();
        let path = dir.join("store");
        let mut store = ParquetStore::create(path.to_str().unwrap()).unwrap();
        let table = sample_table();
        store.write_table("events", &table).unwrap();

        let reopened = ParquetStore::open(path.to_str().unwrap()).unwrap();
        assert_eq!(reopened.table_names().unwrap(), vec!["events".to_string()]);
        assert_eq!(reopened.n_rows("events").unwrap(), 3);
        let read = reopened.read_table("events").unwrap();
        assert_eq!(read, table);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_parquet_round_trip_f32_in_small_batches() {
        let dir = make_temp_dir();
        let path = dir.join("store");
        let mut store = ParquetStore::create(path.to_str().unwrap())
            .unwrap()
            .with_options(
                WriteOptions::default()
                    .batch_size(1)
                    .precision(FloatPrecision::F32),
            );
        store.write_table("events", &sample_table()).unwrap();
        let read = store.read_table("events").unwrap();
        assert_eq!(read.n_rows(), 3);
        let Some(Column::FloatList(pt)) = read.column("pt") else {
            panic!("pt should be a float list column");
        };
        assert_eq!(pt.offsets(), &[0, 3, 3, 4]);
        assert_relative_eq!(pt.row(2)[0], 30.5);
        let Some(Column::Float(met)) = read.column("met") else {
            panic!("met should be a float column");
        };
        assert_relative_eq!(met[2], 300.25);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_parquet_projection_and_missing_columns() {
        let dir = make_temp_dir();
        let mut store = ParquetStore::create(dir.to_str().unwrap()).unwrap();
        store.write_table("events", &sample_table()).unwrap();
        let projected = store.read_columns("events", &["met", "absent"]).unwrap();
        assert_eq!(projected.n_columns(), 1);
        assert!(projected.contains("met"));
        assert_eq!(projected.n_rows(), 3);
        let counted = store.read_columns("events", &[]).unwrap();
        assert_eq!(counted.n_rows(), 3);
        assert!(matches!(
            store.read_table("other"),
            Err(MonoBcError::MissingTable { .. })
        ));
        assert_eq!(store.n_rows("other").unwrap(), 0);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_parquet_empty_table_keeps_schema() {
        let dir = make_temp_dir();
        let mut store = ParquetStore::create(dir.to_str().unwrap()).unwrap();
        let empty = Table::new()
            .with_column("met_sig", Column::Float(Vec::new()))
            .unwrap()
            .with_column("nJets", Column::Int(Vec::new()))
            .unwrap();
        store.write_table("untagged", &empty).unwrap();
        let read = store.read_table("untagged").unwrap();
        assert_eq!(read.n_rows(), 0);
        assert!(matches!(read.column("met_sig"), Some(Column::Float(v)) if v.is_empty()));
        assert!(matches!(read.column("nJets"), Some(Column::Int(v)) if v.is_empty()));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_store_selection_by_format() {
        let dir = make_temp_dir();
        let table = sample_table().project(&["met", "n"]);
        for (name, format) in [
            ("flat_tuple_a", StoreFormat::Parquet),
            ("flat_tuple_a.root", StoreFormat::Root),
        ] {
            let path = dir.join(name);
            let path = path.to_str().unwrap();
            let mut store = recreate_store(path, format, WriteOptions::default()).unwrap();
            store.write_table("untagged", &table).unwrap();
            let reopened = open_store(path).unwrap();
            assert_eq!(reopened.read_table("untagged").unwrap(), table);
        }
        assert!(dir.join("flat_tuple_a").is_dir());
        assert!(dir.join("flat_tuple_a.root").is_file());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_open_missing_store_fails() {
        let dir = env::temp_dir().join(format!("monobc_absent_{}", fastrand::u64(..)));
        assert!(ParquetStore::open(dir.to_str().unwrap()).is_err());
    }
}
