use super::{EngineHandle, Row, SqlValue, StorageEngine};
use crate::error::Result;
use rusqlite::{Batch, Connection, OpenFlags};
use std::path::{Path, PathBuf};

/// SQLite-backed engine. JSON1 functions come with the bundled build.
#[derive(Debug, Default)]
pub struct SqliteEngine;

impl SqliteEngine {
    pub fn new() -> Self {
        SqliteEngine
    }
}

impl StorageEngine for SqliteEngine {
    fn open(&mut self, path: &Path) -> Result<Box<dyn EngineHandle>> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        // Opening is lazy; touch the header so a damaged file fails here.
        conn.query_row("PRAGMA schema_version", [], |row| row.get::<_, i64>(0))?;
        Ok(Box::new(SqliteHandle { conn }))
    }

    fn remove_backing_file(&mut self, path: &Path) -> Result<()> {
        for file in backing_files(path) {
            if file.exists() {
                std::fs::remove_file(&file)?;
            }
        }
        Ok(())
    }
}

/// The backing file plus the sidecar files SQLite may leave next to it.
pub(crate) fn backing_files(path: &Path) -> Vec<PathBuf> {
    let base = path.as_os_str().to_string_lossy().to_string();
    vec![
        path.to_path_buf(),
        PathBuf::from(format!("{base}-journal")),
        PathBuf::from(format!("{base}-wal")),
        PathBuf::from(format!("{base}-shm")),
    ]
}

struct SqliteHandle {
    conn: Connection,
}

impl EngineHandle for SqliteHandle {
    fn run(&mut self, sql: &str, bindings: &[SqlValue]) -> Result<Vec<Row>> {
        let mut results = Vec::new();
        let mut batch = Batch::new(&self.conn, sql);

        while let Some(mut stmt) = batch.next()? {
            let column_names: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(|name| name.to_string())
                .collect();

            let mut rows = if stmt.parameter_count() == 0 {
                stmt.query([])?
            } else {
                stmt.query(rusqlite::params_from_iter(bindings.iter()))?
            };

            while let Some(row) = rows.next()? {
                let mut columns = Vec::with_capacity(column_names.len());
                for (i, name) in column_names.iter().enumerate() {
                    let value: SqlValue = row.get(i)?;
                    columns.push((name.clone(), value));
                }
                results.push(Row::new(columns));
            }
        }

        Ok(results)
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.conn.close().map_err(|(_, e)| e)?;
        Ok(())
    }
}
