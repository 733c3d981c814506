// Execution queue: the only path to the storage engine.
//
// A single worker thread owns the `EngineSession`. Every operation is a
// boxed job pushed onto one FIFO channel whose sender is the queue's tail,
// so at most one statement sequence is in flight and operations complete in
// submission order. Results come back on a oneshot channel.

mod session;

pub use session::EngineSession;

use crate::config::Config;
use crate::engine::{Statement, StorageEngine};
use crate::error::{DocError, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce(&mut EngineSession) + Send>;

pub struct ExecutionQueue {
    tail: mpsc::Sender<Job>,
    crash_retries: u32,
}

impl ExecutionQueue {
    /// Spawn the worker thread. The handle is not opened until `init` (or
    /// the first crash-safe submission) runs on the queue.
    pub fn start(engine: Box<dyn StorageEngine>, config: Config) -> Result<Self> {
        let (tail, jobs) = mpsc::channel::<Job>();
        let crash_retries = config.crash_retries;
        let thread_name = format!("doclite-{}", config.name);
        let mut session = EngineSession::new(engine, config);

        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                for job in jobs {
                    job(&mut session);
                }
                // Every sender is gone: release the backing file.
                if let Err(e) = session.close() {
                    log::warn!("Failed to close engine handle on shutdown: {e}");
                }
                log::debug!("Execution queue worker for {} stopped", session.path().display());
            })?;

        Ok(ExecutionQueue {
            tail,
            crash_retries,
        })
    }

    /// Append `op` to the queue and wait for its result. The operation runs
    /// exactly once, whatever happened to the operations before it.
    pub async fn submit<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut EngineSession) -> Result<T> + Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let job: Job = Box::new(move |session| {
            let _ = reply.send(guarded(session, op));
        });
        self.tail.send(job).map_err(|_| DocError::QueueClosed)?;
        result.await.map_err(|_| DocError::QueueClosed)?
    }

    /// Like `submit`, but opens the handle first and transparently recovers
    /// from engine crashes: the handle is torn down, reinitialized, and `op`
    /// is rerun up to `crash_retries` more times. Recovery happens in the same
    /// queue slot, so later operations still run after this one.
    pub async fn submit_safe<T, F>(&self, mut op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnMut(&mut EngineSession) -> Result<T> + Send + 'static,
    {
        let retries = self.crash_retries;
        self.submit(move |session| {
            let mut attempt = 0;
            loop {
                let result = session
                    .ensure_open()
                    .and_then(|_| guarded(session, |s| op(s)));
                match result {
                    Err(DocError::EngineCrashed) if attempt < retries => {
                        attempt += 1;
                        log::warn!("Engine crash detected; restarting and retrying ({attempt}/{retries})");
                        session.recover()?;
                    }
                    other => return other,
                }
            }
        })
        .await
    }

    /// Run the statements as one all-or-nothing transaction.
    pub async fn submit_transactional(&self, statements: Vec<Statement>) -> Result<()> {
        self.submit_safe(move |session| session.run_transaction(&statements))
            .await
    }

    /// Open the handle. Queued like everything else, so repeated or
    /// concurrent calls collapse onto the first initialization.
    pub async fn init(&self) -> Result<()> {
        self.submit(|session| session.ensure_open()).await
    }

    /// Close the handle. The next crash-safe submission reopens it.
    pub async fn close(&self) -> Result<()> {
        self.submit(|session| session.close()).await
    }

    pub async fn restarts(&self) -> Result<u64> {
        self.submit(|session| Ok(session.restarts())).await
    }
}

/// Run `op`, converting a panic into a crash of the engine handle.
fn guarded<T>(
    session: &mut EngineSession,
    op: impl FnOnce(&mut EngineSession) -> Result<T>,
) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(|| op(session))) {
        Ok(result) => result,
        Err(_) => {
            log::error!("Queued operation panicked; abandoning engine handle");
            session.abandon();
            Err(DocError::EngineCrashed)
        }
    }
}
