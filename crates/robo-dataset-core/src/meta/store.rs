//! Metadata store: typed access to the metadata tables.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use super::{
    DatabaseDriver, Episode, Instruction, MetaEntity, MetaError, Robot, Task,
    engine::{
        ColumnDef, ColumnKind, MetaConnection, OpenMode, SqlValue, create_table_sql, insert_sql,
        quote_ident, select_list,
    },
};

/// Upper bound on bound parameters per `IN (...)` lookup.
pub const MAX_LOOKUP_PARAMS: usize = 500;

/// `dataset_info` key holding the dataset format version.
pub const INFO_FORMAT_VERSION: &str = "format_version";
/// `dataset_info` key holding the engine name.
pub const INFO_DATABASE_DRIVER: &str = "database_driver";

const INFO_TABLE: &str = "dataset_info";
const INFO_COLUMNS: &[ColumnDef] = &[
    ColumnDef::new("key", ColumnKind::Text, false),
    ColumnDef::new("value", ColumnKind::Text, false),
];

/// Everything a packaging run writes to the metadata tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaBatch {
    /// Episodes, in index order.
    pub episodes: Vec<Episode>,
    /// Deduplicated robots.
    pub robots: Vec<Robot>,
    /// Deduplicated tasks.
    pub tasks: Vec<Task>,
    /// Deduplicated instructions.
    pub instructions: Vec<Instruction>,
}

/// Row counts of the entity tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetaCounts {
    /// Rows in `episode`.
    pub episodes: i64,
    /// Rows in `robot`.
    pub robots: i64,
    /// Rows in `task`.
    pub tasks: i64,
    /// Rows in `instruction`.
    pub instructions: i64,
}

/// Handle to a dataset's metadata database.
#[derive(Debug)]
pub struct MetaStore {
    path: PathBuf,
    driver: DatabaseDriver,
    conn: Mutex<MetaConnection>,
}

impl MetaStore {
    /// Create a new database at `path` with empty metadata tables and the
    /// given `dataset_info` entries.
    pub fn create(
        path: &Path,
        driver: DatabaseDriver,
        info: &[(&str, String)],
    ) -> Result<Self, MetaError> {
        let conn = MetaConnection::open(path, driver, OpenMode::Create)?;

        let ddl = [
            create_table_sql(Robot::TABLE, Robot::COLUMNS),
            create_table_sql(Task::TABLE, Task::COLUMNS),
            create_table_sql(Instruction::TABLE, Instruction::COLUMNS),
            create_table_sql(Episode::TABLE, Episode::COLUMNS),
            create_table_sql(INFO_TABLE, INFO_COLUMNS),
        ]
        .join(";\n");
        conn.execute_batch(&ddl)?;

        let rows: Vec<Vec<SqlValue>> = info
            .iter()
            .map(|(k, v)| vec![SqlValue::Text((*k).to_string()), SqlValue::Text(v.clone())])
            .collect();
        conn.in_transaction(|c| c.execute_many(&insert_sql(INFO_TABLE, INFO_COLUMNS), &rows))?;

        Ok(Self {
            path: path.to_path_buf(),
            driver,
            conn: Mutex::new(conn),
        })
    }

    /// Open an existing database read-only.
    pub fn open_read_only(path: &Path, driver: DatabaseDriver) -> Result<Self, MetaError> {
        let conn = MetaConnection::open(path, driver, OpenMode::ReadOnly)?;
        Ok(Self {
            path: path.to_path_buf(),
            driver,
            conn: Mutex::new(conn),
        })
    }

    /// Database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Engine behind this store.
    pub fn driver(&self) -> DatabaseDriver {
        self.driver
    }

    fn lock(&self) -> Result<MutexGuard<'_, MetaConnection>, MetaError> {
        self.conn.lock().map_err(|_| MetaError::Poisoned)
    }

    /// Insert a packaging run's metadata in one transaction, then flush it
    /// to the database file.
    pub fn insert_batch(&self, batch: &MetaBatch) -> Result<(), MetaError> {
        fn rows<E: MetaEntity>(items: &[E]) -> Result<Vec<Vec<SqlValue>>, MetaError> {
            items.iter().map(MetaEntity::to_sql_row).collect()
        }

        let robots = rows(&batch.robots)?;
        let tasks = rows(&batch.tasks)?;
        let instructions = rows(&batch.instructions)?;
        let episodes = rows(&batch.episodes)?;

        let conn = self.lock()?;
        conn.in_transaction(|c| {
            c.execute_many(&insert_sql(Robot::TABLE, Robot::COLUMNS), &robots)?;
            c.execute_many(&insert_sql(Task::TABLE, Task::COLUMNS), &tasks)?;
            c.execute_many(
                &insert_sql(Instruction::TABLE, Instruction::COLUMNS),
                &instructions,
            )?;
            c.execute_many(&insert_sql(Episode::TABLE, Episode::COLUMNS), &episodes)
        })?;
        conn.checkpoint()
    }

    /// All `dataset_info` entries.
    pub fn dataset_info(&self) -> Result<BTreeMap<String, String>, MetaError> {
        let sql = format!("SELECT {} FROM {INFO_TABLE}", select_list(INFO_COLUMNS));
        let rows = self
            .lock()?
            .query_rows(&sql, &[], &[ColumnKind::Text, ColumnKind::Text])?;

        let mut out = BTreeMap::new();
        for row in rows {
            if let [SqlValue::Text(k), SqlValue::Text(v)] = row.as_slice() {
                out.insert(k.clone(), v.clone());
            }
        }
        Ok(out)
    }

    /// Look up one entity by key.
    ///
    /// `None`, negative and absent keys all yield `Ok(None)`.
    pub fn get_meta<E: MetaEntity>(&self, key: Option<i64>) -> Result<Option<E>, MetaError> {
        Ok(self.get_meta_many::<E>(&[key])?.pop().flatten())
    }

    /// Look up many entities by key.
    ///
    /// The output has the same length and order as `keys`; duplicates are
    /// resolved independently and absent keys map to `None`. Distinct keys
    /// are fetched with `IN (...)` queries of at most
    /// [`MAX_LOOKUP_PARAMS`] parameters, without assuming any row order.
    pub fn get_meta_many<E: MetaEntity>(
        &self,
        keys: &[Option<i64>],
    ) -> Result<Vec<Option<E>>, MetaError> {
        let mut distinct: Vec<i64> = keys.iter().flatten().copied().filter(|k| *k >= 0).collect();
        distinct.sort_unstable();
        distinct.dedup();

        let mut found: HashMap<i64, E> = HashMap::with_capacity(distinct.len());
        if !distinct.is_empty() {
            let kinds: Vec<ColumnKind> = E::COLUMNS.iter().map(|c| c.kind).collect();
            let conn = self.lock()?;
            for chunk in distinct.chunks(MAX_LOOKUP_PARAMS) {
                let placeholders = vec!["?"; chunk.len()].join(", ");
                let sql = format!(
                    "SELECT {} FROM {} WHERE {} IN ({placeholders})",
                    select_list(E::COLUMNS),
                    E::TABLE,
                    quote_ident("index"),
                );
                let params: Vec<SqlValue> = chunk.iter().map(|k| SqlValue::Integer(*k)).collect();
                for row in conn.query_rows(&sql, &params, &kinds)? {
                    let entity = E::from_sql_row(row)?;
                    found.insert(entity.index(), entity);
                }
            }
        }

        Ok(keys
            .iter()
            .map(|k| k.and_then(|k| found.get(&k).cloned()))
            .collect())
    }

    /// Every row of `E`'s table, ordered by key.
    pub fn all<E: MetaEntity>(&self) -> Result<Vec<E>, MetaError> {
        let kinds: Vec<ColumnKind> = E::COLUMNS.iter().map(|c| c.kind).collect();
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {}",
            select_list(E::COLUMNS),
            E::TABLE,
            quote_ident("index"),
        );
        self.lock()?
            .query_rows(&sql, &[], &kinds)?
            .into_iter()
            .map(E::from_sql_row)
            .collect()
    }

    /// All episodes ordered by index.
    pub fn episodes(&self) -> Result<Vec<Episode>, MetaError> {
        self.all::<Episode>()
    }

    /// Row counts per entity table.
    pub fn counts(&self) -> Result<MetaCounts, MetaError> {
        let conn = self.lock()?;
        let count = |table: &str| -> Result<i64, MetaError> {
            let rows = conn.query_rows(
                &format!("SELECT COUNT(*) FROM {table}"),
                &[],
                &[ColumnKind::Integer],
            )?;
            match rows.first().map(Vec::as_slice) {
                Some([SqlValue::Integer(n)]) => Ok(*n),
                _ => Ok(0),
            }
        };
        Ok(MetaCounts {
            episodes: count(Episode::TABLE)?,
            robots: count(Robot::TABLE)?,
            tasks: count(Task::TABLE)?,
            instructions: count(Instruction::TABLE)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn sample_batch() -> MetaBatch {
        MetaBatch {
            episodes: vec![
                Episode {
                    index: 0,
                    dataset_begin_index: 0,
                    frame_num: 3,
                    robot_index: Some(0),
                    task_index: None,
                },
                Episode {
                    index: 1,
                    dataset_begin_index: 3,
                    frame_num: 2,
                    robot_index: Some(1),
                    task_index: Some(0),
                },
            ],
            robots: vec![
                Robot {
                    index: 0,
                    name: "arm".into(),
                    urdf_content: Some("<robot/>".into()),
                },
                Robot {
                    index: 1,
                    name: "gripper".into(),
                    urdf_content: None,
                },
            ],
            tasks: vec![Task {
                index: 0,
                name: "stack".into(),
                description: Some("stack the cubes".into()),
            }],
            instructions: vec![Instruction {
                index: 0,
                name: None,
                json_content: serde_json::json!({"text": "go"}),
            }],
        }
    }

    fn create_and_reopen(
        driver: DatabaseDriver,
    ) -> Result<(TempDir, MetaStore), Box<dyn std::error::Error>> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join(format!("meta.{}", driver.file_extension()));
        {
            let store = MetaStore::create(
                &path,
                driver,
                &[
                    (INFO_FORMAT_VERSION, "1".to_string()),
                    (INFO_DATABASE_DRIVER, driver.to_string()),
                ],
            )?;
            store.insert_batch(&sample_batch())?;
        }
        let store = MetaStore::open_read_only(&path, driver)?;
        Ok((tmp, store))
    }

    fn check_lookups(driver: DatabaseDriver) -> TestResult {
        let (_tmp, store) = create_and_reopen(driver)?;
        let batch = sample_batch();

        assert_eq!(store.driver(), driver);
        assert_eq!(
            store.dataset_info()?.get(INFO_DATABASE_DRIVER),
            Some(&driver.to_string())
        );
        assert_eq!(store.episodes()?, batch.episodes);
        assert_eq!(
            store.counts()?,
            MetaCounts {
                episodes: 2,
                robots: 2,
                tasks: 1,
                instructions: 1
            }
        );

        assert_eq!(store.get_meta::<Robot>(Some(1))?, Some(batch.robots[1].clone()));
        assert_eq!(store.get_meta::<Robot>(None)?, None);
        assert_eq!(store.get_meta::<Robot>(Some(-1))?, None);
        assert_eq!(store.get_meta::<Task>(Some(5))?, None);

        let many = store.get_meta_many::<Robot>(&[Some(1), None, Some(0), Some(1), Some(9)])?;
        assert_eq!(
            many,
            vec![
                Some(batch.robots[1].clone()),
                None,
                Some(batch.robots[0].clone()),
                Some(batch.robots[1].clone()),
                None,
            ]
        );

        let inst = store.get_meta::<Instruction>(Some(0))?;
        assert_eq!(inst, Some(batch.instructions[0].clone()));
        Ok(())
    }

    #[test]
    fn sqlite_lookups() -> TestResult {
        check_lookups(DatabaseDriver::Sqlite)
    }

    #[test]
    fn duckdb_lookups() -> TestResult {
        check_lookups(DatabaseDriver::DuckDb)
    }

    #[test]
    fn lookups_larger_than_one_chunk() -> TestResult {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("meta.sqlite3");
        let store = MetaStore::create(&path, DatabaseDriver::Sqlite, &[])?;
        let batch = MetaBatch {
            robots: (0..1200)
                .map(|i| Robot {
                    index: i,
                    name: format!("r{i}"),
                    urdf_content: None,
                })
                .collect(),
            ..MetaBatch::default()
        };
        store.insert_batch(&batch)?;

        let keys: Vec<Option<i64>> = (0..1300).rev().map(Some).collect();
        let got = store.get_meta_many::<Robot>(&keys)?;
        assert_eq!(got.len(), 1300);
        assert!(got[..100].iter().all(Option::is_none));
        assert_eq!(got[100].as_ref().map(|r| r.index), Some(1199));
        assert_eq!(got[1299].as_ref().map(|r| r.name.as_str()), Some("r0"));
        Ok(())
    }

    #[test]
    fn dataset_info_holds_only_created_entries() -> TestResult {
        let tmp = TempDir::new()?;
        let store = MetaStore::create(&tmp.path().join("m.sqlite3"), DatabaseDriver::Sqlite, &[])?;
        assert!(store.dataset_info()?.is_empty());
        assert!(!store.dataset_info()?.contains_key(INFO_FORMAT_VERSION));
        Ok(())
    }
}
