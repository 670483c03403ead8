use super::*;
use oxyroot::{Branch, Named, RootFile, WriterTree};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// File extension of a [`RootStore`].
pub const ROOT_EXTENSION: &str = "root";

#[derive(Clone, Copy)]
enum RootBranchKind {
    F32,
    F64,
    I32,
    I64,
}

fn branch_kind(branch: &Branch) -> Option<RootBranchKind> {
    let lower = branch.item_type_name().to_ascii_lowercase();
    if lower.contains("vector") {
        return None;
    }
    match lower.as_str() {
        "float" | "float_t" | "float32_t" => Some(RootBranchKind::F32),
        "double" | "double_t" | "double32_t" => Some(RootBranchKind::F64),
        "int" | "int_t" | "int32_t" => Some(RootBranchKind::I32),
        "long" | "long64_t" | "long_t" | "int64_t" => Some(RootBranchKind::I64),
        _ => None,
    }
}

fn map_root_error<E: std::fmt::Display>(context: &str, err: E) -> MonoBcError {
    MonoBcError::Custom(format!("{context}: {err}"))
}

fn read_branch(branch: &Branch) -> MonoBcResult<Column> {
    let name = branch.name();
    let context = format!("Failed to read branch '{name}'");
    let kind = branch_kind(branch).ok_or_else(|| MonoBcError::InvalidColumnType {
        name: name.to_string(),
        datatype: branch.item_type_name().to_string(),
    })?;
    Ok(match kind {
        RootBranchKind::F32 => Column::Float(
            branch
                .as_iter::<f32>()
                .map_err(|err| map_root_error(&context, err))?
                .map(f64::from)
                .collect(),
        ),
        RootBranchKind::F64 => Column::Float(
            branch
                .as_iter::<f64>()
                .map_err(|err| map_root_error(&context, err))?
                .collect(),
        ),
        RootBranchKind::I32 => Column::Int(
            branch
                .as_iter::<i32>()
                .map_err(|err| map_root_error(&context, err))?
                .map(i64::from)
                .collect(),
        ),
        RootBranchKind::I64 => Column::Int(
            branch
                .as_iter::<i64>()
                .map_err(|err| map_root_error(&context, err))?
                .collect(),
        ),
    })
}

/// A [`RecordStore`] kept as one ROOT file with a flat tree per table.
///
/// Only scalar columns are supported: floats become `float` or `double` branches following
/// [`WriteOptions::precision`], integers become `int` branches when every value fits and
/// `Long64_t` branches otherwise. ROOT files cannot be amended in place, so every write rewrites
/// the file with all tables known to the store.
#[derive(Debug, Clone)]
pub struct RootStore {
    path: PathBuf,
    options: WriteOptions,
    tables: IndexMap<String, Table>,
    loaded: bool,
}

impl RootStore {
    /// Open an existing ROOT file. The path is shell-expanded (`~`, `$VAR`).
    pub fn open(path: &str) -> MonoBcResult<Self> {
        let path = Path::new(&*shellexpand::full(path)?).canonicalize()?;
        if !path.is_file() {
            return Err(MonoBcError::Custom(format!(
                "'{}' is not a ROOT file",
                path.display()
            )));
        }
        Ok(Self {
            path,
            options: WriteOptions::default(),
            tables: IndexMap::new(),
            loaded: false,
        })
    }

    /// Start a new ROOT file, replacing any existing one once the first table is written.
    pub fn create(path: &str) -> MonoBcResult<Self> {
        let path = PathBuf::from(&*shellexpand::full(path)?);
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            options: WriteOptions::default(),
            tables: IndexMap::new(),
            loaded: true,
        })
    }

    /// Use these [`WriteOptions`] for subsequent writes.
    pub fn with_options(mut self, options: WriteOptions) -> Self {
        self.options = options;
        self
    }

    /// The ROOT file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_file(&self) -> MonoBcResult<RootFile> {
        RootFile::open(&self.path).map_err(|err| {
            map_root_error(
                &format!("Failed to open ROOT file '{}'", self.path.display()),
                err,
            )
        })
    }

    fn tree_columns(&self, table: &str, wanted: Option<&[&str]>) -> MonoBcResult<Table> {
        if let Some(data) = self.tables.get(table) {
            return Ok(match wanted {
                Some(names) => data.project(names),
                None => data.clone(),
            });
        }
        if !self.has_table(table)? {
            return Err(MonoBcError::MissingTable {
                name: table.to_string(),
                store: self.name(),
            });
        }
        let mut file = self.open_file()?;
        let tree = file
            .get_tree(table)
            .map_err(|err| map_root_error(&format!("Failed to open ROOT tree '{table}'"), err))?;
        let mut data = Table::new();
        for branch in tree.branches() {
            if wanted.is_some_and(|names| !names.contains(&branch.name())) {
                continue;
            }
            data.insert(branch.name(), read_branch(branch)?)?;
        }
        if data.n_columns() == 0 {
            if let Some(branch) = tree.branches().next() {
                data.n_rows = read_branch(branch)?.len();
            }
        }
        Ok(data)
    }

    fn load_existing(&mut self) -> MonoBcResult<()> {
        if self.loaded {
            return Ok(());
        }
        for name in self.table_names()? {
            if !self.tables.contains_key(&name) {
                let data = self.tree_columns(&name, None)?;
                self.tables.insert(name, data);
            }
        }
        self.loaded = true;
        Ok(())
    }

    fn write_file(&self) -> MonoBcResult<()> {
        let mut file = RootFile::create(&self.path).map_err(|err| {
            map_root_error(
                &format!("Failed to create ROOT file '{}'", self.path.display()),
                err,
            )
        })?;
        for (name, data) in &self.tables {
            let mut tree = WriterTree::new(name.as_str());
            for (column_name, column) in data.columns() {
                add_branch(&mut tree, column_name, column, self.options.precision)?;
            }
            tree.write(&mut file).map_err(|err| {
                map_root_error(
                    &format!(
                        "Failed to write ROOT tree '{name}' to '{}'",
                        self.path.display()
                    ),
                    err,
                )
            })?;
        }
        file.close().map_err(|err| {
            map_root_error(
                &format!("Failed to close ROOT file '{}'", self.path.display()),
                err,
            )
        })
    }
}

fn add_branch(
    tree: &mut WriterTree,
    name: &str,
    column: &Column,
    precision: FloatPrecision,
) -> MonoBcResult<()> {
    match column {
        Column::Float(values) => match precision {
            FloatPrecision::F32 => tree.new_branch(
                name.to_string(),
                values
                    .iter()
                    .map(|value| *value as f32)
                    .collect::<Vec<_>>()
                    .into_iter(),
            ),
            FloatPrecision::F64 => tree.new_branch(name.to_string(), values.clone().into_iter()),
        },
        Column::Int(values) => {
            if values
                .iter()
                .all(|value| i32::try_from(*value).is_ok())
            {
                tree.new_branch(
                    name.to_string(),
                    values
                        .iter()
                        .map(|value| *value as i32)
                        .collect::<Vec<_>>()
                        .into_iter(),
                )
            } else {
                tree.new_branch(name.to_string(), values.clone().into_iter())
            }
        }
        jagged => {
            return Err(MonoBcError::InvalidColumnType {
                name: name.to_string(),
                datatype: format!("{} (ROOT stores hold flat trees only)", jagged.type_name()),
            })
        }
    };
    Ok(())
}

impl RecordStore for RootStore {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn table_names(&self) -> MonoBcResult<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        if self.path.is_file() && !self.loaded {
            let mut file = self.open_file()?;
            for key in file.keys() {
                let key_name = key.name().to_string();
                if key.class_name() == "TTree" && !names.contains(&key_name) {
                    names.push(key_name);
                }
            }
        }
        for name in self.tables.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        Ok(names)
    }

    fn read_table(&self, table: &str) -> MonoBcResult<Table> {
        self.tree_columns(table, None)
    }

    fn read_columns(&self, table: &str, columns: &[&str]) -> MonoBcResult<Table> {
        self.tree_columns(table, Some(columns))
    }

    fn write_table(&mut self, table: &str, data: &Table) -> MonoBcResult<()> {
        self.load_existing()?;
        self.tables.insert(table.to_string(), data.clone());
        self.write_file()?;
        log::debug!(
            "Wrote {} rows to tree '{table}' in '{}'",
            data.n_rows(),
            self.path.display()
        );
        Ok(())
    }
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

    fn flat_table() -> Table {
        Table::new()
            .with_column("met_sig", Column::Float(vec![25.0, 0.0, 12.5]))
            .unwrap()
            .with_column("nJets", Column::Int(vec![3, 2, 4]))
            .unwrap()
            .with_column("event_weight", Column::Float(vec![1.0, 0.5, 2.0]))
            .unwrap()
    }

    #[test]
    fn test_root_round_trip_two_trees() {
        let dir = make_temp_dir();
        let path = dir.join("flat_tuple_sample.root");
        let mut store = RootStore::create(path.to_str().unwrap()).unwrap();
        store.write_table("b_tagged", &flat_table()).unwrap();
        store
            .write_table("untagged", &flat_table().project(&["met_sig"]))
            .unwrap();

        let reopened = RootStore::open(path.to_str().unwrap()).unwrap();
        let mut names = reopened.table_names().unwrap();
        names.sort();
        assert_eq!(names, vec!["b_tagged".to_string(), "untagged".to_string()]);
        assert_eq!(reopened.read_table("b_tagged").unwrap(), flat_table());
        assert_eq!(reopened.n_rows("untagged").unwrap(), 3);
        let projected = reopened.read_columns("b_tagged", &["nJets"]).unwrap();
        assert_eq!(projected.n_columns(), 1);
        assert!(matches!(
            reopened.read_table("tagged"),
            Err(MonoBcError::MissingTable { .. })
        ));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_root_f32_and_amend() {
        let dir = make_temp_dir();
        let path = dir.join("flat.root");
        let mut store = RootStore::create(path.to_str().unwrap())
            .unwrap()
            .with_options(WriteOptions::default().precision(FloatPrecision::F32));
        store.write_table("untagged", &flat_table()).unwrap();

        let mut reopened = RootStore::open(path.to_str().unwrap())
            .unwrap()
            .with_options(WriteOptions::default().precision(FloatPrecision::F32));
        reopened.write_table("c_tagged", &flat_table()).unwrap();
        let check = RootStore::open(path.to_str().unwrap()).unwrap();
        assert!(check.has_table("untagged").unwrap());
        assert!(check.has_table("c_tagged").unwrap());
        let untagged = check.read_table("untagged").unwrap();
        let Some(Column::Float(met_sig)) = untagged.column("met_sig") else {
            panic!("met_sig should be a float column");
        };
        assert_relative_eq!(met_sig[2], 12.5);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_root_rejects_jagged_columns() {
        let dir = make_temp_dir();
        let mut store = RootStore::create(dir.join("raw.root").to_str().unwrap()).unwrap();
        let jagged = Table::new()
            .with_column(
                "Jet.PT",
                Column::FloatList(Jagged::from_rows(vec![vec![200.0, 100.0]])),
            )
            .unwrap();
        assert!(matches!(
            store.write_table("Delphes", &jagged),
            Err(MonoBcError::InvalidColumnType { .. })
        ));
        fs::remove_dir_all(dir).unwrap();
    }
}
