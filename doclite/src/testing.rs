// Test-only engine wrapper that injects runtime faults on demand.

use crate::engine::{EngineHandle, Row, SqlValue, SqliteEngine, StorageEngine};
use crate::error::{DocError, Result};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared switchboard between a test and its `FaultyEngine`.
pub struct FaultPlan {
    /// Statements whose SQL starts with this prefix are eligible to fault.
    prefix: &'static str,
    armed: AtomicUsize,
    resets: AtomicUsize,
    opens: AtomicUsize,
}

impl FaultPlan {
    /// Make the next `count` eligible statements fail with a runtime fault.
    pub fn arm(&self, count: usize) {
        self.armed.store(count, Ordering::SeqCst);
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn should_fault(&self, sql: &str) -> bool {
        if !sql.trim_start().starts_with(self.prefix) {
            return false;
        }
        self.armed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct FaultyEngine {
    inner: SqliteEngine,
    plan: Arc<FaultPlan>,
}

impl FaultyEngine {
    pub fn new(prefix: &'static str) -> (Self, Arc<FaultPlan>) {
        let plan = Arc::new(FaultPlan {
            prefix,
            armed: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
        });
        let engine = FaultyEngine {
            inner: SqliteEngine::new(),
            plan: Arc::clone(&plan),
        };
        (engine, plan)
    }
}

impl StorageEngine for FaultyEngine {
    fn open(&mut self, path: &Path) -> Result<Box<dyn EngineHandle>> {
        self.plan.opens.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.open(path)?;
        Ok(Box::new(FaultyHandle {
            inner,
            plan: Arc::clone(&self.plan),
        }))
    }

    fn remove_backing_file(&mut self, path: &Path) -> Result<()> {
        self.inner.remove_backing_file(path)
    }

    fn reset(&mut self) {
        self.plan.resets.fetch_add(1, Ordering::SeqCst);
    }
}

struct FaultyHandle {
    inner: Box<dyn EngineHandle>,
    plan: Arc<FaultPlan>,
}

impl EngineHandle for FaultyHandle {
    fn run(&mut self, sql: &str, bindings: &[SqlValue]) -> Result<Vec<Row>> {
        if self.plan.should_fault(sql) {
            return Err(DocError::EngineFault("RuntimeError: unreachable".into()));
        }
        self.inner.run(sql, bindings)
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.inner.close()
    }
}
