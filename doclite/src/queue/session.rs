use crate::config::Config;
use crate::engine::{EngineHandle, Row, SqlValue, Statement, StorageEngine};
use crate::error::{DocError, Result};
use std::path::PathBuf;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS documents (
        collection_id TEXT NOT NULL,
        doc_id TEXT NOT NULL,
        data TEXT NOT NULL,
        PRIMARY KEY (collection_id, doc_id)
    );

    CREATE TABLE IF NOT EXISTS files (
        path TEXT PRIMARY KEY,
        data BLOB,
        contentType TEXT,
        size INTEGER,
        updatedAt TEXT
    );
";

enum HandleState {
    Closed,
    Open(Box<dyn EngineHandle>),
    /// The engine reported a runtime fault; the handle was abandoned and must
    /// not be used until the session is recovered.
    Crashed,
}

/// Everything the worker owns: the engine, the one live handle, and the
/// backing file it is bound to. Only the execution queue's worker thread
/// ever holds a `&mut EngineSession`.
pub struct EngineSession {
    engine: Box<dyn StorageEngine>,
    config: Config,
    state: HandleState,
    restarts: u64,
}

impl EngineSession {
    pub fn new(engine: Box<dyn StorageEngine>, config: Config) -> Self {
        EngineSession {
            engine,
            config,
            state: HandleState::Closed,
            restarts: 0,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.config.db_path()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, HandleState::Open(_))
    }

    /// Number of crash recoveries performed so far.
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Open the handle if it is not open yet. A crashed session is recovered.
    pub fn ensure_open(&mut self) -> Result<()> {
        match self.state {
            HandleState::Open(_) => Ok(()),
            HandleState::Closed => self.open_with_retry(),
            HandleState::Crashed => self.recover(),
        }
    }

    /// Tear down whatever is left of the handle, clear the engine's cached
    /// state, and open from scratch.
    pub fn recover(&mut self) -> Result<()> {
        log::warn!(
            "Reinitializing storage engine for {}",
            self.path().display()
        );
        self.state = HandleState::Closed;
        self.engine.reset();
        self.open_with_retry()?;
        self.restarts += 1;
        Ok(())
    }

    /// Close the handle, releasing the backing file.
    pub fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, HandleState::Closed) {
            HandleState::Open(handle) => handle.close(),
            HandleState::Closed | HandleState::Crashed => Ok(()),
        }
    }

    /// Drop the handle without a clean close.
    pub fn abandon(&mut self) {
        self.state = HandleState::Crashed;
    }

    /// Run SQL against the live handle. Runtime faults abandon the handle and
    /// surface as `EngineCrashed`; ordinary SQL errors pass through.
    pub fn run(&mut self, sql: &str, bindings: &[SqlValue]) -> Result<Vec<Row>> {
        let result = match &mut self.state {
            HandleState::Open(handle) => handle.run(sql, bindings),
            HandleState::Crashed => return Err(DocError::EngineCrashed),
            HandleState::Closed => return Err(DocError::NotInitialized),
        };

        match result {
            Err(e) if e.is_engine_fault() => {
                log::warn!("Storage engine fault detected: {e}");
                self.abandon();
                Err(DocError::EngineCrashed)
            }
            other => other,
        }
    }

    pub fn run_statement(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        self.run(&statement.sql, &statement.bindings)
    }

    /// Run all statements inside one transaction. Any failure rolls the whole
    /// set back before the original error is returned.
    pub fn run_transaction(&mut self, statements: &[Statement]) -> Result<()> {
        self.run("BEGIN TRANSACTION", &[])?;

        let result = statements
            .iter()
            .try_for_each(|statement| self.run_statement(statement).map(|_| ()))
            .and_then(|_| self.run("COMMIT", &[]).map(|_| ()));

        if let Err(e) = result {
            if self.is_open() {
                if let Err(rollback_err) = self.run("ROLLBACK", &[]) {
                    log::warn!("Rollback failed: {rollback_err}");
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn open_with_retry(&mut self) -> Result<()> {
        let path = self.path();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let attempts = self.config.open_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            match self.try_open() {
                Ok(handle) => {
                    self.state = HandleState::Open(handle);
                    log::info!("Opened store at {}", path.display());
                    return Ok(());
                }
                Err(e) => {
                    log::warn!(
                        "Open attempt {}/{} for {} failed: {e}",
                        attempt + 1,
                        attempts,
                        path.display()
                    );
                    if e.is_malformed_file() {
                        if let Err(remove_err) = self.engine.remove_backing_file(&path) {
                            log::warn!("Failed to remove malformed file: {remove_err}");
                        }
                    }
                    last_error = Some(e);
                    std::thread::sleep(self.config.backoff(attempt));
                }
            }
        }

        Err(DocError::Other(format!(
            "Failed to open database {} after {attempts} attempts: {}",
            path.display(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn try_open(&mut self) -> Result<Box<dyn EngineHandle>> {
        let mut handle = self.engine.open(&self.path())?;
        let pragmas = format!(
            "PRAGMA journal_mode={}; PRAGMA synchronous={};",
            self.config.journal_mode.as_sql(),
            self.config.synchronous.as_sql()
        );
        handle.run(&pragmas, &[])?;
        handle.run(SCHEMA, &[])?;
        Ok(handle)
    }
}
