//! Relational metadata of a dataset.
//!
//! Episodes, robots, tasks and instructions live in an embedded SQL database
//! next to the frame shards. Frame rows reference them through the
//! `episode_index`, `robot_index`, `task_index` and `instruction_index`
//! columns; [`MetaStore`] resolves those keys back into typed entities.
//!
//! Two engines are supported ([`DatabaseDriver`]); the schema and queries are
//! identical for both.

pub mod engine;
pub mod store;

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use engine::{ColumnDef, ColumnKind, EngineError, SqlValue};

pub use store::{MetaBatch, MetaCounts, MetaStore};

/// Embedded SQL engine holding the metadata tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    /// SQLite via `rusqlite`.
    Sqlite,
    /// DuckDB via `duckdb`.
    DuckDb,
}

impl DatabaseDriver {
    /// Canonical lowercase name (`sqlite` / `duckdb`).
    pub fn as_str(self) -> &'static str {
        match self {
            DatabaseDriver::Sqlite => "sqlite",
            DatabaseDriver::DuckDb => "duckdb",
        }
    }

    /// Extension of the database file.
    pub fn file_extension(self) -> &'static str {
        match self {
            DatabaseDriver::Sqlite => "sqlite3",
            DatabaseDriver::DuckDb => "duckdb",
        }
    }
}

impl fmt::Display for DatabaseDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown database driver name.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(display("Unknown database driver '{name}' (expected 'sqlite' or 'duckdb')"))]
pub struct ParseDatabaseDriverError {
    name: String,
}

impl FromStr for DatabaseDriver {
    type Err = ParseDatabaseDriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(DatabaseDriver::Sqlite),
            "duckdb" => Ok(DatabaseDriver::DuckDb),
            _ => ParseDatabaseDriverSnafu {
                name: s.to_string(),
            }
            .fail(),
        }
    }
}

/// Errors raised by the metadata store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MetaError {
    /// The database could not be opened.
    #[snafu(display("Failed to open {driver} metadata database at {path}: {source}"))]
    Open {
        /// Database file.
        path: String,
        /// Engine that was used.
        driver: DatabaseDriver,
        /// Engine error.
        source: EngineError,
    },

    /// A statement failed.
    #[snafu(display("Metadata query failed: {source} (sql: {sql})"))]
    Query {
        /// Statement text.
        sql: String,
        /// Engine error.
        source: EngineError,
    },

    /// A row does not have the shape its table declares.
    #[snafu(display("Corrupt {table} row: {details}"))]
    CorruptRow {
        /// Table name.
        table: &'static str,
        /// What was wrong.
        details: String,
    },

    /// Instruction JSON could not be encoded or decoded.
    #[snafu(display("Invalid instruction JSON for instruction {index}: {source}"))]
    InstructionJson {
        /// Instruction key.
        index: i64,
        /// Parser error.
        source: serde_json::Error,
    },

    /// The connection lock was poisoned by a panicking thread.
    #[snafu(display("Metadata connection lock poisoned"))]
    Poisoned,
}

/// A row type of one metadata table, addressed by its `"index"` key.
pub trait MetaEntity: Sized + Clone {
    /// Table name.
    const TABLE: &'static str;
    /// Column definitions; the first one is the `"index"` primary key.
    const COLUMNS: &'static [ColumnDef];

    /// Primary key.
    fn index(&self) -> i64;

    /// Decode a row selected with [`Self::COLUMNS`].
    fn from_sql_row(row: Vec<SqlValue>) -> Result<Self, MetaError>;

    /// Encode for insertion, in [`Self::COLUMNS`] order.
    fn to_sql_row(&self) -> Result<Vec<SqlValue>, MetaError>;
}

struct RowReader {
    table: &'static str,
    values: std::vec::IntoIter<SqlValue>,
}

impl RowReader {
    fn new(table: &'static str, row: Vec<SqlValue>) -> Self {
        Self {
            table,
            values: row.into_iter(),
        }
    }

    fn next(&mut self, column: &str) -> Result<SqlValue, MetaError> {
        self.values.next().context(CorruptRowSnafu {
            table: self.table,
            details: format!("missing column {column}"),
        })
    }

    fn opt_int(&mut self, column: &str) -> Result<Option<i64>, MetaError> {
        match self.next(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Integer(v) => Ok(Some(v)),
            SqlValue::Text(_) => CorruptRowSnafu {
                table: self.table,
                details: format!("column {column} holds text, expected integer"),
            }
            .fail(),
        }
    }

    fn int(&mut self, column: &str) -> Result<i64, MetaError> {
        self.opt_int(column)?.context(CorruptRowSnafu {
            table: self.table,
            details: format!("column {column} is null"),
        })
    }

    fn opt_text(&mut self, column: &str) -> Result<Option<String>, MetaError> {
        match self.next(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(v) => Ok(Some(v)),
            SqlValue::Integer(_) => CorruptRowSnafu {
                table: self.table,
                details: format!("column {column} holds an integer, expected text"),
            }
            .fail(),
        }
    }

    fn text(&mut self, column: &str) -> Result<String, MetaError> {
        self.opt_text(column)?.context(CorruptRowSnafu {
            table: self.table,
            details: format!("column {column} is null"),
        })
    }
}

/// A contiguous run of frames produced by one episode source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    /// Dense key, assigned in packaging order starting at 0.
    pub index: i64,
    /// Global row index of the episode's first frame.
    pub dataset_begin_index: i64,
    /// Number of frames in the episode.
    pub frame_num: i64,
    /// Robot the episode was recorded with.
    pub robot_index: Option<i64>,
    /// Task the episode performs.
    pub task_index: Option<i64>,
}

impl Episode {
    /// Global row range covered by this episode.
    pub fn row_range(&self) -> std::ops::Range<i64> {
        self.dataset_begin_index..self.dataset_begin_index + self.frame_num
    }
}

impl MetaEntity for Episode {
    const TABLE: &'static str = "episode";
    const COLUMNS: &'static [ColumnDef] = &[
        ColumnDef::new("index", ColumnKind::Integer, false),
        ColumnDef::new("dataset_begin_index", ColumnKind::Integer, false),
        ColumnDef::new("frame_num", ColumnKind::Integer, false),
        ColumnDef::new("robot_index", ColumnKind::Integer, true),
        ColumnDef::new("task_index", ColumnKind::Integer, true),
    ];

    fn index(&self) -> i64 {
        self.index
    }

    fn from_sql_row(row: Vec<SqlValue>) -> Result<Self, MetaError> {
        let mut r = RowReader::new(Self::TABLE, row);
        Ok(Episode {
            index: r.int("index")?,
            dataset_begin_index: r.int("dataset_begin_index")?,
            frame_num: r.int("frame_num")?,
            robot_index: r.opt_int("robot_index")?,
            task_index: r.opt_int("task_index")?,
        })
    }

    fn to_sql_row(&self) -> Result<Vec<SqlValue>, MetaError> {
        Ok(vec![
            self.index.into(),
            self.dataset_begin_index.into(),
            self.frame_num.into(),
            self.robot_index.into(),
            self.task_index.into(),
        ])
    }
}

/// A robot description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Robot {
    /// Dense key in first-seen order.
    pub index: i64,
    /// Robot name.
    pub name: String,
    /// URDF document, when provided.
    pub urdf_content: Option<String>,
}

impl MetaEntity for Robot {
    const TABLE: &'static str = "robot";
    const COLUMNS: &'static [ColumnDef] = &[
        ColumnDef::new("index", ColumnKind::Integer, false),
        ColumnDef::new("name", ColumnKind::Text, false),
        ColumnDef::new("urdf_content", ColumnKind::Text, true),
    ];

    fn index(&self) -> i64 {
        self.index
    }

    fn from_sql_row(row: Vec<SqlValue>) -> Result<Self, MetaError> {
        let mut r = RowReader::new(Self::TABLE, row);
        Ok(Robot {
            index: r.int("index")?,
            name: r.text("name")?,
            urdf_content: r.opt_text("urdf_content")?,
        })
    }

    fn to_sql_row(&self) -> Result<Vec<SqlValue>, MetaError> {
        Ok(vec![
            self.index.into(),
            self.name.clone().into(),
            self.urdf_content.clone().into(),
        ])
    }
}

/// A task description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Dense key in first-seen order.
    pub index: i64,
    /// Task name.
    pub name: String,
    /// Free-form description.
    pub description: Option<String>,
}

impl MetaEntity for Task {
    const TABLE: &'static str = "task";
    const COLUMNS: &'static [ColumnDef] = &[
        ColumnDef::new("index", ColumnKind::Integer, false),
        ColumnDef::new("name", ColumnKind::Text, false),
        ColumnDef::new("description", ColumnKind::Text, true),
    ];

    fn index(&self) -> i64 {
        self.index
    }

    fn from_sql_row(row: Vec<SqlValue>) -> Result<Self, MetaError> {
        let mut r = RowReader::new(Self::TABLE, row);
        Ok(Task {
            index: r.int("index")?,
            name: r.text("name")?,
            description: r.opt_text("description")?,
        })
    }

    fn to_sql_row(&self) -> Result<Vec<SqlValue>, MetaError> {
        Ok(vec![
            self.index.into(),
            self.name.clone().into(),
            self.description.clone().into(),
        ])
    }
}

/// A natural-language or structured instruction attached to frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// Dense key in first-seen order.
    pub index: i64,
    /// Optional short name.
    pub name: Option<String>,
    /// Instruction payload.
    pub json_content: serde_json::Value,
}

impl MetaEntity for Instruction {
    const TABLE: &'static str = "instruction";
    const COLUMNS: &'static [ColumnDef] = &[
        ColumnDef::new("index", ColumnKind::Integer, false),
        ColumnDef::new("name", ColumnKind::Text, true),
        ColumnDef::new("json_content", ColumnKind::Text, false),
    ];

    fn index(&self) -> i64 {
        self.index
    }

    fn from_sql_row(row: Vec<SqlValue>) -> Result<Self, MetaError> {
        let mut r = RowReader::new(Self::TABLE, row);
        let index = r.int("index")?;
        let name = r.opt_text("name")?;
        let raw = r.text("json_content")?;
        let json_content = serde_json::from_str(&raw).context(InstructionJsonSnafu { index })?;
        Ok(Instruction {
            index,
            name,
            json_content,
        })
    }

    fn to_sql_row(&self) -> Result<Vec<SqlValue>, MetaError> {
        let json = serde_json::to_string(&self.json_content)
            .context(InstructionJsonSnafu { index: self.index })?;
        Ok(vec![
            self.index.into(),
            self.name.clone().into(),
            json.into(),
        ])
    }
}
