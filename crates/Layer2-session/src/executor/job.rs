//! Background job queue
//!
//! N workers share one receiver. Failed attempts are re-enqueued after an
//! exponential backoff unless the error is terminal (e.g. a validation
//! rejection), which is never retried.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labterm_foundation::{Error, ExecutionResult, ExecutorSettings, Result, RetrySettings};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ExecRequest;

// ============================================================================
// Ids and records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub uuid::Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::InvalidInput(format!("invalid job id {}: {}", s, e)))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Rejected,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Rejected)
    }
}

/// One out-of-band execution
#[derive(Debug, Clone)]
pub struct ExecutionJob {
    pub id: JobId,
    pub owner_id: String,
    pub request: ExecRequest,
}

/// Status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub owner_id: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub state: JobState,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
}

impl JobRecord {
    fn new(job: &ExecutionJob) -> Self {
        let now = Utc::now();
        Self {
            id: job.id,
            owner_id: job.owner_id.clone(),
            command: job.request.command.clone(),
            session_id: job.request.session_id.clone(),
            state: JobState::Queued,
            attempts: 0,
            created_at: now,
            updated_at: now,
            last_error: None,
            result: None,
        }
    }
}

/// Runs one attempt of a job
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &ExecutionJob, attempt: u32) -> Result<ExecutionResult>;
}

/// Delay before retry `attempt` (0-indexed): initial * multiplier^attempt,
/// capped, with +-20% jitter when enabled
pub fn delay_for_attempt(retry: &RetrySettings, attempt: u32) -> Duration {
    let base = retry.initial_delay_ms as f64 * retry.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(retry.max_delay_ms as f64);
    let delay = if retry.jitter {
        capped * rand::thread_rng().gen_range(0.8..1.2)
    } else {
        capped
    };
    Duration::from_millis(delay as u64)
}

// ============================================================================
// JobQueue
// ============================================================================

struct Envelope {
    job: Arc<ExecutionJob>,
    attempt: u32,
}

struct Shared {
    handler: Arc<dyn JobHandler>,
    sender: mpsc::Sender<Envelope>,
    records: RwLock<HashMap<JobId, JobRecord>>,
    finished: Mutex<VecDeque<JobId>>,
    history_size: usize,
    retry: RetrySettings,
    token: CancellationToken,
}

pub struct JobQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    /// Spawn `settings.workers` workers
    pub fn start(settings: &ExecutorSettings, handler: Arc<dyn JobHandler>) -> Self {
        let (sender, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let shared = Arc::new(Shared {
            handler,
            sender,
            records: RwLock::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            history_size: settings.history_size.max(1),
            retry: settings.retry.clone(),
            token: CancellationToken::new(),
        });

        let workers = (0..settings.workers.max(1))
            .map(|index| {
                let shared = Arc::clone(&shared);
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move { worker(index, shared, receiver).await })
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    pub async fn enqueue(&self, job: ExecutionJob) -> Result<JobId> {
        if self.shared.token.is_cancelled() {
            return Err(Error::QueueClosed);
        }

        let id = job.id;
        self.shared
            .records
            .write()
            .await
            .insert(id, JobRecord::new(&job));

        let envelope = Envelope {
            job: Arc::new(job),
            attempt: 0,
        };
        if let Err(e) = self.shared.sender.try_send(envelope) {
            self.shared.records.write().await.remove(&id);
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => Error::Job("job queue is full".to_string()),
                mpsc::error::TrySendError::Closed(_) => Error::QueueClosed,
            });
        }

        debug!(job_id = %id, "Job queued");
        Ok(id)
    }

    pub async fn status(&self, id: JobId) -> Option<JobRecord> {
        self.shared.records.read().await.get(&id).cloned()
    }

    /// Stop workers; queued jobs are dropped
    pub async fn shutdown(&self) {
        self.shared.token.cancel();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in workers {
            let _ = handle.await;
        }
        info!("Job workers stopped");
    }
}

async fn worker(index: usize, shared: Arc<Shared>, receiver: Arc<Mutex<mpsc::Receiver<Envelope>>>) {
    debug!(worker = index, "Job worker started");
    loop {
        let envelope = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                _ = shared.token.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            }
        };
        process(&shared, envelope).await;
    }
    debug!(worker = index, "Job worker stopped");
}

async fn process(shared: &Arc<Shared>, envelope: Envelope) {
    let Envelope { job, attempt } = envelope;
    update(shared, job.id, |r| {
        r.state = JobState::Running;
        r.attempts = attempt + 1;
    })
    .await;

    let outcome = shared.handler.run(&job, attempt).await;

    match outcome {
        Ok(result) => {
            update(shared, job.id, |r| {
                r.state = JobState::Completed;
                r.result = Some(result);
                r.last_error = None;
            })
            .await;
            finish(shared, job.id).await;
        }
        Err(e) if e.is_terminal() => {
            info!(job_id = %job.id, "Job rejected: {}", e);
            update(shared, job.id, |r| {
                r.state = JobState::Rejected;
                r.last_error = Some(e.to_string());
            })
            .await;
            finish(shared, job.id).await;
        }
        Err(e) if attempt < shared.retry.max_retries && !shared.token.is_cancelled() => {
            let delay = delay_for_attempt(&shared.retry, attempt);
            warn!(
                job_id = %job.id,
                attempt = attempt + 1,
                "Job attempt failed, retrying in {:?}: {}", delay, e
            );
            update(shared, job.id, |r| {
                r.state = JobState::Retrying;
                r.last_error = Some(e.to_string());
            })
            .await;

            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                tokio::select! {
                    _ = shared.token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        let id = job.id;
                        let next = Envelope { job, attempt: attempt + 1 };
                        if shared.sender.send(next).await.is_err() {
                            warn!(job_id = %id, "Queue closed before retry");
                        }
                    }
                }
            });
        }
        Err(e) => {
            warn!(job_id = %job.id, attempts = attempt + 1, "Job failed: {}", e);
            update(shared, job.id, |r| {
                r.state = JobState::Failed;
                r.last_error = Some(e.to_string());
            })
            .await;
            finish(shared, job.id).await;
        }
    }
}

async fn update<F>(shared: &Shared, id: JobId, apply: F)
where
    F: FnOnce(&mut JobRecord),
{
    if let Some(record) = shared.records.write().await.get_mut(&id) {
        apply(record);
        record.updated_at = Utc::now();
    }
}

/// Keep at most `history_size` finished records
async fn finish(shared: &Shared, id: JobId) {
    let mut finished = shared.finished.lock().await;
    finished.push_back(id);
    while finished.len() > shared.history_size {
        if let Some(old) = finished.pop_front() {
            shared.records.write().await.remove(&old);
        }
    }
}
