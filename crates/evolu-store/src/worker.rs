//! The storage worker.
//!
//! The SQL engine lives on one dedicated thread that owns the connection
//! exclusively; every other component posts closures through a mailbox and
//! awaits the reply. That serializes all SQL, keeps rusqlite off the async
//! executor, and gives the rest of the engine a cheap cloneable handle.

use std::sync::mpsc;
use std::thread;

use tokio::sync::oneshot;
use tracing::{debug, error};

use evolu_core::EvoluError;

use crate::store::SqliteStore;

type Job = Box<dyn FnOnce(&mut SqliteStore) + Send>;

/// Cloneable async handle to the storage worker.
#[derive(Clone)]
pub struct StorageHandle {
    jobs: mpsc::Sender<Job>,
}

impl StorageHandle {
    /// Move a store onto its worker thread and return the handle.
    ///
    /// The thread exits when the last handle is dropped.
    pub fn spawn(mut store: SqliteStore) -> Self {
        let (jobs, inbox) = mpsc::channel::<Job>();
        thread::Builder::new()
            .name("evolu-storage".to_string())
            .spawn(move || {
                debug!("storage worker started");
                while let Ok(job) = inbox.recv() {
                    job(&mut store);
                }
                debug!("storage worker stopped");
            })
            .unwrap_or_else(|err| {
                // Thread spawn only fails on resource exhaustion at process
                // startup; nothing sensible continues from here.
                error!(error = %err, "failed to spawn storage worker");
                panic!("failed to spawn storage worker: {err}");
            });
        Self { jobs }
    }

    /// Run a closure on the worker with exclusive store access.
    pub async fn call<T, F>(&self, job: F) -> Result<T, EvoluError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteStore) -> Result<T, EvoluError> + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        self.jobs
            .send(Box::new(move |store| {
                let _ = reply.send(job(store));
            }))
            .map_err(|_| EvoluError::storage("storage worker stopped"))?;
        response
            .await
            .map_err(|_| EvoluError::storage("storage worker dropped the request"))?
    }
}
