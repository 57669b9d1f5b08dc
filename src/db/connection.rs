//! One SQLite connection, owned by a dedicated thread.
//!
//! Async callers hand closures to the thread and await the reply, so
//! statements never block the runtime and always run in submission order.
//! Multi-row writes go through [`Database::transaction`], which commits all
//! rows or none of them.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};
use rusqlite::{Connection, Transaction};
use tokio::sync::oneshot;

use super::migrations::run_migrations;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

/// Sender side of the job channel plus the thread draining it. Dropping the
/// last handle closes the channel; the thread finishes queued jobs and exits.
struct Worker {
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn submit(&self, job: Job) -> Result<()> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|_| anyhow!("database job channel poisoned"))?;
        let sender = jobs
            .as_ref()
            .ok_or_else(|| anyhow!("database is closed"))?;
        sender
            .send(job)
            .map_err(|_| anyhow!("database thread is gone"))
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        match self.jobs.get_mut() {
            Ok(jobs) => drop(jobs.take()),
            Err(poisoned) => drop(poisoned.into_inner().take()),
        }
        let thread = match self.thread.get_mut() {
            Ok(thread) => thread.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("database thread panicked while closing");
            }
        }
    }
}

/// Cheap-to-clone handle to the session database.
#[derive(Clone)]
pub struct Database {
    worker: Arc<Worker>,
    path: Arc<PathBuf>,
}

/// Applies connection settings. Foreign keys are required for cascading
/// session deletes; WAL is best effort because some filesystems refuse it.
fn configure(conn: &Connection) -> Result<()> {
    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
        warn!("WAL journal unavailable, using the default journal: {err}");
    }
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous mode")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign keys")?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("failed to set busy timeout")?;
    Ok(())
}

fn serve(mut conn: Connection, jobs: mpsc::Receiver<Job>) {
    for job in jobs {
        // A panicking job drops its reply sender; the caller sees an error
        // and later jobs still run.
        if catch_unwind(AssertUnwindSafe(|| job(&mut conn))).is_err() {
            error!("database job panicked");
        }
    }
    info!("database thread drained and closed");
}

impl Database {
    /// Opens (or creates) the database file, migrates it to the current
    /// schema and hands the connection to its worker thread.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut conn = Connection::open(&path)
            .with_context(|| format!("failed to open SQLite database {}", path.display()))?;
        configure(&conn)?;
        run_migrations(&mut conn).context("failed to run database migrations")?;

        let (sender, receiver) = mpsc::channel::<Job>();
        let thread = thread::Builder::new()
            .name("vigil-db".into())
            .spawn(move || serve(conn, receiver))
            .context("failed to spawn database thread")?;

        info!("database ready at {}", path.display());
        Ok(Self {
            worker: Arc::new(Worker {
                jobs: Mutex::new(Some(sender)),
                thread: Mutex::new(Some(thread)),
            }),
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `task` on the database thread.
    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        self.worker.submit(Box::new(move |conn| {
            // The caller may have given up waiting; the work is done either way.
            let _ = reply.send(task(conn));
        }))?;
        response
            .await
            .map_err(|_| anyhow!("database job ended without a result"))?
    }

    /// Runs `task` inside one transaction. An error from `task` rolls every
    /// statement back.
    pub async fn transaction<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let value = task(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("nested").join("vigil.sqlite3")).unwrap();
        (dir, db)
    }

    async fn count(db: &Database) -> i64 {
        db.execute(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?)
        })
        .await
        .unwrap()
    }

    const INSERT: &str = "INSERT INTO sessions (id, started_at, sample_interval_secs, status, created_at, updated_at)
                          VALUES (?1, 'x', 60, 'Active', 'x', 'x')";

    #[tokio::test]
    async fn failed_transaction_leaves_no_rows() {
        let (_dir, db) = open();
        let result = db
            .transaction(|tx| {
                tx.execute(INSERT, ["first"])?;
                tx.execute(INSERT, ["first"])?;
                Ok(())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(count(&db).await, 0);

        db.transaction(|tx| {
            tx.execute(INSERT, ["first"])?;
            tx.execute(INSERT, ["second"])?;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(count(&db).await, 2);
    }

    #[tokio::test]
    async fn panicking_job_does_not_stop_the_thread() {
        let (_dir, db) = open();
        let failed: Result<i64> = db
            .execute(|_conn| {
                let rows: Vec<i64> = Vec::new();
                Ok(rows[1])
            })
            .await;
        assert!(failed.is_err());
        assert_eq!(count(&db).await, 0);
        assert!(db.path().ends_with("vigil.sqlite3"));
    }
}
