//! Two-lane serial queue: one job at a time, urgent jobs first.
//!
//! Every write against one task goes through its own `SerialLane`. A single
//! worker drains the lanes with concurrency 1. Urgent jobs are taken before
//! any queued normal job, but a job that is already running is never
//! preempted.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};

use crate::domain::BobbinError;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Urgent,
    #[default]
    Normal,
}

/// Receives the result of an enqueued job.
pub type Ticket<T> = oneshot::Receiver<T>;

pub struct SerialLane {
    urgent: mpsc::UnboundedSender<Job>,
    normal: mpsc::UnboundedSender<Job>,
    /// Taken by the first enqueue, which spawns the worker.
    idle: Mutex<Option<(mpsc::UnboundedReceiver<Job>, mpsc::UnboundedReceiver<Job>)>>,
}

impl SerialLane {
    pub fn new() -> Self {
        let (urgent, urgent_rx) = mpsc::unbounded_channel();
        let (normal, normal_rx) = mpsc::unbounded_channel();
        Self {
            urgent,
            normal,
            idle: Mutex::new(Some((urgent_rx, normal_rx))),
        }
    }

    /// Queue `work` and return a ticket for its result.
    ///
    /// The job is queued before this returns, so the order of `enqueue` calls
    /// within one lane is the order of execution. Must be called inside a
    /// tokio runtime.
    pub fn enqueue<F, T>(&self, priority: Priority, work: F) -> Result<Ticket<T>, BobbinError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_worker();
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            // the caller may have stopped waiting; the job still ran
            let _ = tx.send(work.await);
        });
        let lane = match priority {
            Priority::Urgent => &self.urgent,
            Priority::Normal => &self.normal,
        };
        lane.send(job)
            .map_err(|_| BobbinError::Other("serial lane is closed".to_string()))?;
        Ok(rx)
    }

    /// Queue `work` and wait for it to run.
    pub async fn run<F, T>(&self, priority: Priority, work: F) -> Result<T, BobbinError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(priority, work)?
            .await
            .map_err(|_| BobbinError::Other("serial lane worker stopped".to_string()))
    }

    fn ensure_worker(&self) {
        let taken = self.idle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((urgent, normal)) = taken {
            tokio::spawn(drain(urgent, normal));
        }
    }
}

impl Default for SerialLane {
    fn default() -> Self {
        Self::new()
    }
}

async fn drain(mut urgent: mpsc::UnboundedReceiver<Job>, mut normal: mpsc::UnboundedReceiver<Job>) {
    loop {
        let job = tokio::select! {
            biased;
            Some(job) = urgent.recv() => job,
            Some(job) = normal.recv() => job,
            else => break,
        };
        job.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_jobs_and_returns_results() {
        let lane = SerialLane::new();
        let value = lane.run(Priority::Normal, async { 21 * 2 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn urgent_jumps_queued_normal_work_but_not_the_running_job() {
        let lane = SerialLane::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (started_tx, started_rx) = oneshot::channel();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        let log = order.clone();
        let blocker = lane
            .enqueue(Priority::Normal, async move {
                let _ = started_tx.send(());
                let _ = gate_rx.await;
                log.lock().unwrap().push("running");
            })
            .unwrap();
        started_rx.await.unwrap();

        let mut tickets = Vec::new();
        for (name, priority) in [
            ("normal-1", Priority::Normal),
            ("normal-2", Priority::Normal),
            ("urgent", Priority::Urgent),
        ] {
            let log = order.clone();
            tickets.push(
                lane.enqueue(priority, async move {
                    log.lock().unwrap().push(name);
                })
                .unwrap(),
            );
        }

        gate_tx.send(()).unwrap();
        blocker.await.unwrap();
        for ticket in tickets {
            ticket.await.unwrap();
        }

        assert_eq!(
            *order.lock().unwrap(),
            vec!["running", "urgent", "normal-1", "normal-2"]
        );
    }

    #[tokio::test]
    async fn never_runs_two_jobs_at_once() {
        let lane = Arc::new(SerialLane::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..16 {
            let lane = lane.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            let priority = if i % 3 == 0 { Priority::Urgent } else { Priority::Normal };
            handles.push(tokio::spawn(async move {
                lane.run(priority, async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abandoned_ticket_does_not_stall_the_lane() {
        let lane = SerialLane::new();
        drop(lane.enqueue(Priority::Normal, async { 1 }).unwrap());
        assert_eq!(lane.run(Priority::Normal, async { 2 }).await.unwrap(), 2);
    }
}
