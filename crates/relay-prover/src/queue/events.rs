use serde::Serialize;
use std::fmt::{Display, Formatter, Result as FmtResult};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{error, info, warn};

/// Outcome of a job state transition observed by the monitor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Retrying { attempt: u32, delay_ms: u64 },
    Failed { attempts: u32 },
    Expired { attempt: u32 },
    /// The job keeps being deferred without making progress.
    Stalled { deferrals: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueueEvent {
    pub queue: String,
    pub job_key: u64,
    pub outcome: JobOutcome,
    pub detail: Option<String>,
}

impl QueueEvent {
    pub fn new(queue: &str, job_key: u64, outcome: JobOutcome, detail: Option<String>) -> Self {
        Self {
            queue: queue.to_string(),
            job_key,
            outcome,
            detail,
        }
    }
}

impl Display for QueueEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}[{}] {:?}", self.queue, self.job_key, self.outcome)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

/// EventMonitor fans queue events out to any number of subscribers.
///
/// Publishing never blocks. Subscribers that fall behind by more than the configured capacity lose the
/// oldest events. Each call to [`EventMonitor::subscribe`] starts a fresh stream at the current position.
#[derive(Clone, Debug)]
pub struct EventMonitor {
    tx: broadcast::Sender<QueueEvent>,
}

impl EventMonitor {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: QueueEvent) {
        // an error only means nobody is listening right now
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> impl Stream<Item = QueueEvent> + Send + Unpin + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "event subscriber lagged, oldest events dropped");
                None
            }
        })
    }
}

/// Spawns the default subscriber which reports every job outcome through tracing.
pub fn spawn_event_logger(monitor: &EventMonitor) -> JoinHandle<()> {
    let mut events = monitor.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let detail = event.detail.as_deref().unwrap_or("");
            match event.outcome {
                JobOutcome::Completed => info!(queue = %event.queue, key = event.job_key, "job completed"),
                JobOutcome::Retrying { attempt, delay_ms } => warn!(
                    queue = %event.queue,
                    key = event.job_key,
                    attempt,
                    delay_ms,
                    detail,
                    "job failed, retrying"
                ),
                JobOutcome::Expired { attempt } => warn!(
                    queue = %event.queue,
                    key = event.job_key,
                    attempt,
                    "job lease expired"
                ),
                JobOutcome::Stalled { deferrals } => warn!(
                    queue = %event.queue,
                    key = event.job_key,
                    deferrals,
                    detail,
                    "job stalled"
                ),
                JobOutcome::Failed { attempts } => error!(
                    queue = %event.queue,
                    key = event.job_key,
                    attempts,
                    detail,
                    "job failed permanently"
                ),
            }
        }
    })
}
