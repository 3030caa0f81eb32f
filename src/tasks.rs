//! Supervised background work.
//!
//! Per-turn side effects (extraction, curation, session-close summaries,
//! continuity ingest) run as tasks submitted here instead of detached spawns:
//! a semaphore bounds concurrency, every task runs under a deadline, and
//! failures are sent on a channel that the engine folds into session
//! diagnostics. Tasks are never cancelled mid-flight.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::config::TasksConfig;

/// A background task that errored, timed out or panicked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task: String,
    pub owner_id: String,
    pub persona_id: String,
    pub error: String,
    pub timed_out: bool,
    pub at: String,
}

pub struct TaskSupervisor {
    semaphore: Arc<Semaphore>,
    task_timeout: Duration,
    failures: mpsc::UnboundedSender<TaskFailure>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSupervisor {
    /// Returns the supervisor and the receiving end of its failure channel.
    pub fn new(config: &TasksConfig) -> (Self, mpsc::UnboundedReceiver<TaskFailure>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            task_timeout: Duration::from_secs(config.task_timeout_secs),
            failures: tx,
            handles: Mutex::new(Vec::new()),
        };
        (supervisor, rx)
    }

    /// Submit a task. Must be called from within a Tokio runtime.
    pub fn submit<F>(&self, task: &str, owner_id: &str, persona_id: &str, fut: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let limit = self.task_timeout;
        let failures = self.failures.clone();
        let task = task.to_string();
        let owner_id = owner_id.to_string();
        let persona_id = persona_id.to_string();

        let handle = tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            let started = Instant::now();
            let failure = match tokio::time::timeout(limit, fut).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some((format!("{e:#}"), false)),
                Err(_) => Some((format!("timed out after {limit:?}"), true)),
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match failure {
                None => tracing::debug!(task = %task, owner = %owner_id, elapsed_ms, "background task done"),
                Some((error, timed_out)) => {
                    tracing::error!(task = %task, owner = %owner_id, persona = %persona_id, elapsed_ms, error = %error, "background task failed");
                    let _ = failures.send(TaskFailure {
                        task,
                        owner_id,
                        persona_id,
                        error,
                        timed_out,
                        at: crate::clock::format_ts(crate::clock::now()),
                    });
                }
            }
        });

        if let Ok(mut handles) = self.handles.lock() {
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
        }
    }

    /// Tasks submitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.handles
            .lock()
            .map(|h| h.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    /// Wait until every submitted task, including ones submitted by tasks
    /// while waiting, has finished.
    pub async fn wait_idle(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = match self.handles.lock() {
                Ok(mut handles) => std::mem::take(&mut *handles),
                Err(_) => return,
            };
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "background task panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(max_concurrent: usize, task_timeout_secs: u64) -> TasksConfig {
        TasksConfig {
            max_concurrent,
            task_timeout_secs,
        }
    }

    #[tokio::test]
    async fn failures_are_reported_on_the_channel() {
        let (supervisor, mut rx) = TaskSupervisor::new(&config(2, 5));
        supervisor.submit("ok", "u1", "p1", async { Ok(()) });
        supervisor.submit("bad", "u1", "p1", async { Err(anyhow::anyhow!("boom")) });
        supervisor.wait_idle().await;

        let failure = rx.try_recv().unwrap();
        assert_eq!(failure.task, "bad");
        assert_eq!(failure.error, "boom");
        assert!(!failure.timed_out);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_tasks_time_out() {
        let (supervisor, mut rx) = TaskSupervisor::new(&config(1, 1));
        supervisor.submit("slow", "u1", "p1", async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        supervisor.wait_idle().await;
        assert!(rx.try_recv().unwrap().timed_out);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let (supervisor, _rx) = TaskSupervisor::new(&config(2, 5));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            supervisor.submit("work", "u1", "p1", async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        supervisor.wait_idle().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(supervisor.in_flight(), 0);
    }
}
