//! In-process result queue and its worker pool

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::service::IngestService;
use crate::error::{SinkError, SinkResult};
use crate::types::NewResult;

#[derive(Debug, Clone)]
pub enum QueueMessage {
    ProcessResult(Uuid),
    CreateAndProcessActivity(NewResult),
    /// Sweep due DELAYED and abandoned PROCESSING results back onto the queue
    CheckDelayed,
}

/// Cloneable producer side of the queue
#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<QueueMessage>,
}

impl QueueSender {
    pub async fn send(&self, message: QueueMessage) -> SinkResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| SinkError::Internal("result queue is closed".to_string()))
    }
}

pub fn channel(capacity: usize) -> (QueueSender, mpsc::Receiver<QueueMessage>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (QueueSender { tx }, rx)
}

/// Consumes queue messages with at most `max_concurrent` in flight
pub struct QueueWorker {
    service: Arc<IngestService>,
    /// Weak so that the worker alone never keeps the queue open
    requeue: mpsc::WeakSender<QueueMessage>,
    sweep_batch: i64,
}

impl QueueWorker {
    pub fn new(service: Arc<IngestService>, sender: &QueueSender, sweep_batch: i64) -> Self {
        Self {
            service,
            requeue: sender.tx.downgrade(),
            sweep_batch,
        }
    }

    async fn handle(&self, message: QueueMessage) {
        match message {
            QueueMessage::ProcessResult(id) => {
                if let Err(e) = self.service.process_result(id).await {
                    tracing::error!(result_id = %id, error = %e, "Failed to process result");
                }
            }
            QueueMessage::CreateAndProcessActivity(result) => {
                if let Err(e) = self.service.create_and_process(&result).await {
                    tracing::error!(platform = %result.platform, error = %e, "Failed to store result");
                }
            }
            QueueMessage::CheckDelayed => {
                let mut ids = match self.service.sweep_delayed(self.sweep_batch).await {
                    Ok(ids) => ids,
                    Err(e) => {
                        tracing::error!(error = %e, "Delayed result sweep failed");
                        Vec::new()
                    }
                };
                match self.service.recover_stale_processing(self.sweep_batch).await {
                    Ok(stale) => ids.extend(stale),
                    Err(e) => tracing::error!(error = %e, "Stale processing sweep failed"),
                }
                self.requeue_all(ids);
            }
        }
    }

    fn requeue_all(&self, ids: Vec<Uuid>) {
        if ids.is_empty() {
            return;
        }
        let Some(tx) = self.requeue.upgrade() else {
            tracing::warn!(count = ids.len(), "Queue closed before swept results were requeued");
            return;
        };
        // Re-enqueue off the worker so a full queue cannot stall it
        tokio::spawn(async move {
            for id in ids {
                if tx.send(QueueMessage::ProcessResult(id)).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Run until every sender is dropped or `cancel` fires
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<QueueMessage>,
        max_concurrent: usize,
        cancel: CancellationToken,
    ) {
        tracing::info!(max_concurrent, "Result queue worker started");

        let messages = async_stream::stream! {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    message = rx.recv() => message,
                };
                match next {
                    Some(message) => yield message,
                    None => break,
                }
            }
        };

        let worker = &self;
        messages
            .for_each_concurrent(max_concurrent.max(1), |message| async move {
                worker.handle(message).await;
            })
            .await;

        tracing::info!("Result queue worker stopped");
    }
}

/// Periodically posts CheckDelayed onto the queue
pub fn spawn_delayed_sweeper(
    sender: QueueSender,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if sender.send(QueueMessage::CheckDelayed).await.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Delayed result sweeper stopped");
    })
}
