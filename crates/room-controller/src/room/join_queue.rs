//! Per-room FIFO queue for join side effects.
//!
//! All join side effects for a room are funneled through one queue so
//! router assignment, last-N insertion, and peer registration never race
//! across concurrently arriving peers. Tasks are async and run strictly
//! in submission order, one at a time; a failing task is logged and does
//! not block the tasks behind it. Closing the queue rejects later
//! submissions and stops the worker; its lifetime is tied to the room.

use crate::errors::RoomError;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type QueueTask = Pin<Box<dyn Future<Output = Result<(), RoomError>> + Send>>;

/// Error returned when submitting to a closed queue.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueClosed;

/// Handle to a room's join queue.
pub struct JoinQueue {
    name: String,
    sender: mpsc::UnboundedSender<QueueTask>,
    cancel_token: CancellationToken,
}

impl JoinQueue {
    /// Create a queue and spawn its worker.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<QueueTask>();
        let cancel_token = CancellationToken::new();

        let worker_name = name.clone();
        let worker_cancel = cancel_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = worker_cancel.cancelled() => break,
                    task = receiver.recv() => {
                        let Some(task) = task else { break };
                        if let Err(error) = task.await {
                            warn!(
                                target: "room.queue",
                                queue = %worker_name,
                                %error,
                                "queued task failed, continuing"
                            );
                        }
                    }
                }
            }
            debug!(target: "room.queue", queue = %worker_name, "queue worker stopped");
        });

        Self {
            name,
            sender,
            cancel_token,
        }
    }

    /// Submit a task. Tasks run in submission order, one at a time.
    pub fn submit(
        &self,
        task: impl Future<Output = Result<(), RoomError>> + Send + 'static,
    ) -> Result<(), QueueClosed> {
        if self.cancel_token.is_cancelled() {
            return Err(QueueClosed);
        }
        self.sender.send(Box::pin(task)).map_err(|_| QueueClosed)
    }

    /// Close the queue: stop the worker and reject later submissions.
    pub fn close(&self) {
        debug!(target: "room.queue", queue = %self.name, "closing queue");
        self.cancel_token.cancel();
    }

    /// Whether the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_tasks_run_in_submission_order() {
        let queue = JoinQueue::new("room-1");
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();
        let mut done_tx = Some(done_tx);

        for i in 0..5u64 {
            let order = Arc::clone(&order);
            let done_tx = Mutex::new(if i == 4 { done_tx.take() } else { None });
            queue
                .submit(async move {
                    // Earlier tasks suspend longer; order must still hold.
                    tokio::time::sleep(Duration::from_millis(5 * (5 - i))).await;
                    order.lock().unwrap().push(i);
                    if let Some(tx) = done_tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    Ok(())
                })
                .unwrap();
        }

        done_rx.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failing_task_does_not_block_later_tasks() {
        let queue = JoinQueue::new("room-1");
        let (done_tx, done_rx) = oneshot::channel();

        queue
            .submit(async { Err(RoomError::internal("boom")) })
            .unwrap();
        let done_tx = Mutex::new(Some(done_tx));
        queue
            .submit(async move {
                if let Some(tx) = done_tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
                Ok(())
            })
            .unwrap();

        done_rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_close_is_rejected() {
        let queue = JoinQueue::new("room-1");
        queue.close();

        assert!(queue.is_closed());
        assert_eq!(queue.submit(async { Ok(()) }), Err(QueueClosed));
    }

    #[tokio::test]
    async fn test_close_stops_worker() {
        let queue = JoinQueue::new("room-1");
        let ran = Arc::new(Mutex::new(false));

        queue.close();
        // Worker may already be gone; either way the task must not run.
        let _ = queue.submit({
            let ran = Arc::clone(&ran);
            async move {
                *ran.lock().unwrap() = true;
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!*ran.lock().unwrap());
    }
}
