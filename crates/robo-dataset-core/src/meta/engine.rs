//! Pluggable SQL engine behind the metadata store.
//!
//! Two embedded engines are supported, SQLite through `rusqlite` and DuckDB
//! through `duckdb`. The store talks to them only through
//! [`MetaConnection`], which speaks a tiny value model ([`SqlValue`]) so the
//! statements and row decoding above it stay engine-agnostic.

use std::{error::Error, fmt, path::Path};

use snafu::prelude::*;

use super::{DatabaseDriver, MetaError, OpenSnafu, QuerySnafu};

/// Errors produced by the underlying SQL engine.
#[derive(Debug)]
pub enum EngineError {
    /// SQLite error.
    Sqlite(rusqlite::Error),
    /// DuckDB error.
    DuckDb(duckdb::Error),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            EngineError::DuckDb(e) => write!(f, "duckdb error: {e}"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EngineError::Sqlite(e) => Some(e),
            EngineError::DuckDb(e) => Some(e),
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Sqlite(e)
    }
}

impl From<duckdb::Error> for EngineError {
    fn from(e: duckdb::Error) -> Self {
        EngineError::DuckDb(e)
    }
}

/// A SQL scalar as stored by the metadata tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    Integer(i64),
    /// Text.
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<Option<i64>> for SqlValue {
    fn from(v: Option<i64>) -> Self {
        v.map_or(SqlValue::Null, SqlValue::Integer)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Option<String>> for SqlValue {
    fn from(v: Option<String>) -> Self {
        v.map_or(SqlValue::Null, SqlValue::Text)
    }
}

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, ValueRef};
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            SqlValue::Integer(v) => ToSqlOutput::Borrowed(ValueRef::Integer(*v)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl duckdb::ToSql for SqlValue {
    fn to_sql(&self) -> duckdb::Result<duckdb::types::ToSqlOutput<'_>> {
        use duckdb::types::{ToSqlOutput, Value};
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(v) => ToSqlOutput::Owned(Value::BigInt(*v)),
            SqlValue::Text(s) => ToSqlOutput::Owned(Value::Text(s.clone())),
        })
    }
}

/// Storage class of a metadata column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// `BIGINT`
    Integer,
    /// `TEXT`
    Text,
}

impl ColumnKind {
    fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Integer => "BIGINT",
            ColumnKind::Text => "TEXT",
        }
    }
}

/// Column definition of a metadata table.
#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    /// Column name (quoted when rendered).
    pub name: &'static str,
    /// Storage class.
    pub kind: ColumnKind,
    /// Whether NULL is allowed.
    pub nullable: bool,
}

impl ColumnDef {
    /// Shorthand constructor used by the entity tables.
    pub const fn new(name: &'static str, kind: ColumnKind, nullable: bool) -> Self {
        Self {
            name,
            kind,
            nullable,
        }
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `CREATE TABLE` statement; the first column is the primary key.
pub(crate) fn create_table_sql(table: &str, columns: &[ColumnDef]) -> String {
    let cols = columns
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let mut def = format!("{} {}", quote_ident(c.name), c.kind.sql_type());
            if i == 0 {
                def.push_str(" PRIMARY KEY");
            } else if !c.nullable {
                def.push_str(" NOT NULL");
            }
            def
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {table} ({cols})")
}

pub(crate) fn select_list(columns: &[ColumnDef]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn insert_sql(table: &str, columns: &[ColumnDef]) -> String {
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders})",
        select_list(columns)
    )
}

/// Open mode of a metadata connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create the database file if needed; read-write.
    Create,
    /// Existing database, read-only.
    ReadOnly,
}

/// A live connection to one of the supported engines.
pub(crate) enum MetaConnection {
    Sqlite(rusqlite::Connection),
    DuckDb(duckdb::Connection),
}

impl fmt::Debug for MetaConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaConnection::Sqlite(_) => f.write_str("MetaConnection::Sqlite"),
            MetaConnection::DuckDb(_) => f.write_str("MetaConnection::DuckDb"),
        }
    }
}

impl MetaConnection {
    pub(crate) fn open(
        path: &Path,
        driver: DatabaseDriver,
        mode: OpenMode,
    ) -> Result<Self, MetaError> {
        let opened: Result<Self, EngineError> = match (driver, mode) {
            (DatabaseDriver::Sqlite, OpenMode::Create) => rusqlite::Connection::open(path)
                .map(MetaConnection::Sqlite)
                .map_err(EngineError::from),
            (DatabaseDriver::Sqlite, OpenMode::ReadOnly) => {
                use rusqlite::OpenFlags;
                rusqlite::Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )
                .map(MetaConnection::Sqlite)
                .map_err(EngineError::from)
            }
            (DatabaseDriver::DuckDb, OpenMode::Create) => duckdb::Connection::open(path)
                .map(MetaConnection::DuckDb)
                .map_err(EngineError::from),
            (DatabaseDriver::DuckDb, OpenMode::ReadOnly) => duckdb::Config::default()
                .access_mode(duckdb::AccessMode::ReadOnly)
                .and_then(|config| duckdb::Connection::open_with_flags(path, config))
                .map(MetaConnection::DuckDb)
                .map_err(EngineError::from),
        };

        opened.context(OpenSnafu {
            path: path.display().to_string(),
            driver,
        })
    }

    pub(crate) fn driver(&self) -> DatabaseDriver {
        match self {
            MetaConnection::Sqlite(_) => DatabaseDriver::Sqlite,
            MetaConnection::DuckDb(_) => DatabaseDriver::DuckDb,
        }
    }

    /// Run one or more statements without parameters.
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<(), MetaError> {
        let res: Result<(), EngineError> = match self {
            MetaConnection::Sqlite(conn) => conn.execute_batch(sql).map_err(EngineError::from),
            MetaConnection::DuckDb(conn) => conn.execute_batch(sql).map_err(EngineError::from),
        };
        res.context(QuerySnafu { sql })
    }

    /// Prepare `sql` once and execute it for every parameter row.
    pub(crate) fn execute_many(&self, sql: &str, rows: &[Vec<SqlValue>]) -> Result<(), MetaError> {
        let res = match self {
            MetaConnection::Sqlite(conn) => sqlite_execute_many(conn, sql, rows),
            MetaConnection::DuckDb(conn) => duckdb_execute_many(conn, sql, rows),
        };
        res.context(QuerySnafu { sql })
    }

    /// Run a query and decode each row according to `kinds`.
    pub(crate) fn query_rows(
        &self,
        sql: &str,
        params: &[SqlValue],
        kinds: &[ColumnKind],
    ) -> Result<Vec<Vec<SqlValue>>, MetaError> {
        let res = match self {
            MetaConnection::Sqlite(conn) => sqlite_query_rows(conn, sql, params, kinds),
            MetaConnection::DuckDb(conn) => duckdb_query_rows(conn, sql, params, kinds),
        };
        res.context(QuerySnafu { sql })
    }

    /// Run `body` inside a single transaction, rolling back on error.
    pub(crate) fn in_transaction<T>(
        &self,
        body: impl FnOnce(&Self) -> Result<T, MetaError>,
    ) -> Result<T, MetaError> {
        self.execute_batch("BEGIN TRANSACTION")?;
        match body(self) {
            Ok(out) => {
                self.execute_batch("COMMIT")?;
                Ok(out)
            }
            Err(e) => {
                if let Err(rollback) = self.execute_batch("ROLLBACK") {
                    log::warn!("rollback after failed metadata write also failed: {rollback}");
                }
                Err(e)
            }
        }
    }

    /// Flush engine-side buffers to the database file.
    pub(crate) fn checkpoint(&self) -> Result<(), MetaError> {
        match self {
            MetaConnection::Sqlite(_) => Ok(()),
            MetaConnection::DuckDb(_) => self.execute_batch("CHECKPOINT"),
        }
    }
}

fn sqlite_execute_many(
    conn: &rusqlite::Connection,
    sql: &str,
    rows: &[Vec<SqlValue>],
) -> Result<(), EngineError> {
    let mut stmt = conn.prepare(sql)?;
    for row in rows {
        stmt.execute(rusqlite::params_from_iter(row.iter()))?;
    }
    Ok(())
}

fn duckdb_execute_many(
    conn: &duckdb::Connection,
    sql: &str,
    rows: &[Vec<SqlValue>],
) -> Result<(), EngineError> {
    let mut stmt = conn.prepare(sql)?;
    for row in rows {
        stmt.execute(duckdb::params_from_iter(row.iter()))?;
    }
    Ok(())
}

fn sqlite_query_rows(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[SqlValue],
    kinds: &[ColumnKind],
) -> Result<Vec<Vec<SqlValue>>, EngineError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
        let mut out = Vec::with_capacity(kinds.len());
        for (i, kind) in kinds.iter().enumerate() {
            out.push(match kind {
                ColumnKind::Integer => SqlValue::from(row.get::<_, Option<i64>>(i)?),
                ColumnKind::Text => SqlValue::from(row.get::<_, Option<String>>(i)?),
            });
        }
        Ok(out)
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn duckdb_query_rows(
    conn: &duckdb::Connection,
    sql: &str,
    params: &[SqlValue],
    kinds: &[ColumnKind],
) -> Result<Vec<Vec<SqlValue>>, EngineError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(duckdb::params_from_iter(params.iter()), |row| {
        let mut out = Vec::with_capacity(kinds.len());
        for (i, kind) in kinds.iter().enumerate() {
            out.push(match kind {
                ColumnKind::Integer => SqlValue::from(row.get::<_, Option<i64>>(i)?),
                ColumnKind::Text => SqlValue::from(row.get::<_, Option<String>>(i)?),
            });
        }
        Ok(out)
    })?;
    Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLS: &[ColumnDef] = &[
        ColumnDef::new("index", ColumnKind::Integer, false),
        ColumnDef::new("name", ColumnKind::Text, false),
        ColumnDef::new("note", ColumnKind::Text, true),
    ];

    #[test]
    fn renders_ddl_with_quoted_key() {
        assert_eq!(
            create_table_sql("robot", COLS),
            r#"CREATE TABLE IF NOT EXISTS robot ("index" BIGINT PRIMARY KEY, "name" TEXT NOT NULL, "note" TEXT)"#
        );
        assert_eq!(
            insert_sql("robot", COLS),
            r#"INSERT INTO robot ("index", "name", "note") VALUES (?, ?, ?)"#
        );
    }

    fn round_trip(driver: DatabaseDriver) -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::TempDir::new()?;
        let path = tmp.path().join(format!("t.{}", driver.file_extension()));
        {
            let conn = MetaConnection::open(&path, driver, OpenMode::Create)?;
            conn.execute_batch(&create_table_sql("robot", COLS))?;
            conn.in_transaction(|c| {
                c.execute_many(
                    &insert_sql("robot", COLS),
                    &[
                        vec![0_i64.into(), "a".to_string().into(), SqlValue::Null],
                        vec![1_i64.into(), "b".to_string().into(), "x".to_string().into()],
                    ],
                )
            })?;
            conn.checkpoint()?;
        }

        let conn = MetaConnection::open(&path, driver, OpenMode::ReadOnly)?;
        assert_eq!(conn.driver(), driver);
        let rows = conn.query_rows(
            &format!(
                "SELECT {} FROM robot WHERE \"index\" IN (?, ?) ORDER BY \"index\"",
                select_list(COLS)
            ),
            &[SqlValue::Integer(1), SqlValue::Integer(7)],
            &[ColumnKind::Integer, ColumnKind::Text, ColumnKind::Text],
        )?;
        assert_eq!(
            rows,
            vec![vec![
                SqlValue::Integer(1),
                SqlValue::Text("b".into()),
                SqlValue::Text("x".into())
            ]]
        );

        assert!(conn.execute_batch("DELETE FROM robot").is_err());
        Ok(())
    }

    #[test]
    fn sqlite_round_trip_and_read_only() -> Result<(), Box<dyn std::error::Error>> {
        round_trip(DatabaseDriver::Sqlite)
    }

    #[test]
    fn duckdb_round_trip_and_read_only() -> Result<(), Box<dyn std::error::Error>> {
        round_trip(DatabaseDriver::DuckDb)
    }

    #[test]
    fn failed_transaction_rolls_back() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::TempDir::new()?;
        let path = tmp.path().join("t.sqlite3");
        let conn = MetaConnection::open(&path, DatabaseDriver::Sqlite, OpenMode::Create)?;
        conn.execute_batch(&create_table_sql("robot", COLS))?;

        let dup = vec![0_i64.into(), "a".to_string().into(), SqlValue::Null];
        let res = conn.in_transaction(|c| {
            c.execute_many(&insert_sql("robot", COLS), &[dup.clone(), dup])
        });
        assert!(res.is_err());

        let rows = conn.query_rows("SELECT COUNT(*) FROM robot", &[], &[ColumnKind::Integer])?;
        assert_eq!(rows, vec![vec![SqlValue::Integer(0)]]);
        Ok(())
    }
}
