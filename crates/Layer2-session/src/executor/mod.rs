//! Out-of-Band Executor
//!
//! Runs single commands decoupled from the interactive stream:
//!
//! 1. validate (a rejection is reported right away and nothing is queued)
//! 2. enqueue on the job queue, acknowledge on `owner:<owner_id>`
//! 3. a worker reuses the live session's container or provisions a
//!    transient one, runs the command with a bounded timeout and publishes
//!    the result
//!
//! Environment probes share the same execution path but run inline.

mod job;
mod probe;

pub use job::{delay_for_attempt, ExecutionJob, JobHandler, JobId, JobQueue, JobRecord, JobState};
pub use probe::{Probe, ProbeResult};

use crate::container::{ProvisionRequest, Provisioner};
use crate::manager::SessionManager;
use crate::registry::{Reservation, SessionSlot};
use async_trait::async_trait;
use labterm_foundation::{
    streams, Error, EventBus, ExecutionResult, ExecutorSettings, Result, ServerEvent, SessionMode,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Mode for a transient context; ignored when a live session is reused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SessionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// `{command, session_id?, options}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub options: ExecOptions,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            session_id: None,
            options: ExecOptions::default(),
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.options.timeout_secs = Some(secs);
        self
    }

    pub fn with_mode(mut self, mode: SessionMode) -> Self {
        self.options.mode = Some(mode);
        self
    }
}

// ============================================================================
// Execution runner (job handler)
// ============================================================================

/// Where a command runs
enum Context {
    Session { container: String },
    Transient { slot: Arc<SessionSlot>, container: String },
}

impl Context {
    fn container(&self) -> &str {
        match self {
            Context::Session { container } | Context::Transient { container, .. } => container,
        }
    }
}

struct ExecutionRunner {
    manager: Arc<SessionManager>,
    settings: ExecutorSettings,
}

impl ExecutionRunner {
    fn provisioner(&self) -> &Arc<Provisioner> {
        self.manager.provisioner()
    }

    /// Mode the command is validated and run under
    async fn mode_for(&self, request: &ExecRequest) -> SessionMode {
        if let Some(session_id) = &request.session_id {
            if let Some(slot) = self.manager.registry().get(session_id).await {
                return slot.mode;
            }
        }
        request.options.mode.unwrap_or_default()
    }

    /// Live session container for `owner_id`, else a freshly reserved
    /// transient one under `exec-<uuid>`
    async fn acquire(&self, owner_id: &str, request: &ExecRequest, mode: SessionMode) -> Result<Context> {
        if let Some(session_id) = &request.session_id {
            if let Some(slot) = self.manager.registry().get(session_id).await {
                if slot.owner_id != owner_id {
                    return Err(Error::Unauthorized(format!(
                        "session {} belongs to another user",
                        session_id
                    )));
                }
                if let Some(container) = slot.container_name() {
                    return Ok(Context::Session { container });
                }
            }
        }

        let transient_id = format!("exec-{}", uuid::Uuid::new_v4().simple());
        let slot = match self
            .manager
            .registry()
            .reserve(SessionSlot::new(&transient_id, owner_id, mode).transient())
            .await
        {
            Reservation::Reserved(slot) => slot,
            Reservation::Existing(_) => {
                return Err(Error::SessionExists(transient_id));
            }
        };

        let provision = ProvisionRequest::new(&transient_id, owner_id, mode)
            .with_image(request.options.image.clone());
        match self.provisioner().provision(&provision).await {
            Ok(container) => {
                slot.set_container(container.clone());
                debug!(session_id = %transient_id, container = %container.name, "Transient context ready");
                Ok(Context::Transient {
                    slot,
                    container: container.name,
                })
            }
            Err(e) => {
                self.manager.registry().take_slot(&slot).await;
                Err(e)
            }
        }
    }

    async fn release(&self, context: Context) {
        if let Context::Transient { slot, container } = context {
            // registry entry first, then the container
            self.manager.registry().take_slot(&slot).await;
            self.provisioner().teardown(&container).await;
        }
    }

    /// Validate, acquire a context, run, release
    async fn execute(&self, owner_id: &str, request: &ExecRequest) -> Result<ExecutionResult> {
        let mode = self.mode_for(request).await;
        self.manager
            .validator()
            .validate(mode, &request.command)
            .into_result()?;

        let limit = self.settings.effective_timeout(request.options.timeout_secs);
        let context = self.acquire(owner_id, request, mode).await?;

        let started = Instant::now();
        let output = self
            .provisioner()
            .engine()
            .exec(context.container(), &request.command, limit)
            .await;
        let elapsed = started.elapsed();
        self.release(context).await;

        let output = output?;
        if output.timed_out {
            let timeout = Error::ExecutionTimeout {
                command: request.command.clone(),
                timeout_secs: limit.as_secs(),
            };
            warn!(owner_id, "{}", timeout);
        }

        Ok(ExecutionResult {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_status: if output.timed_out {
                ExecutionResult::TIMEOUT_EXIT_STATUS
            } else {
                output.exit_code
            },
            execution_time: elapsed.as_secs_f64(),
            timed_out: output.timed_out,
        })
    }
}

#[async_trait]
impl JobHandler for ExecutionRunner {
    async fn run(&self, job: &ExecutionJob, attempt: u32) -> Result<ExecutionResult> {
        let stream = streams::owner(&job.owner_id);
        let bus = self.manager.bus();

        match self.execute(&job.owner_id, &job.request).await {
            Ok(result) => {
                info!(
                    job_id = %job.id,
                    exit_status = result.exit_status,
                    timed_out = result.timed_out,
                    "Out-of-band command finished"
                );
                bus.emit(
                    &stream,
                    ServerEvent::ExecutionCompleted {
                        job_id: job.id.to_string(),
                        result: result.clone(),
                    },
                )
                .await;
                Ok(result)
            }
            Err(e) => {
                warn!(job_id = %job.id, attempt = attempt + 1, "Out-of-band command failed: {}", e);
                bus.emit(
                    &stream,
                    ServerEvent::ExecutionError {
                        job_id: job.id.to_string(),
                        error: e.to_string(),
                    },
                )
                .await;
                Err(e)
            }
        }
    }
}

// ============================================================================
// OutOfBandExecutor
// ============================================================================

pub struct OutOfBandExecutor {
    runner: Arc<ExecutionRunner>,
    queue: JobQueue,
}

impl OutOfBandExecutor {
    /// Starts the worker pool
    pub fn new(manager: Arc<SessionManager>, settings: &ExecutorSettings) -> Self {
        let runner = Arc::new(ExecutionRunner {
            manager,
            settings: settings.clone(),
        });
        let queue = JobQueue::start(settings, runner.clone());
        Self { runner, queue }
    }

    fn bus(&self) -> &Arc<EventBus> {
        self.runner.manager.bus()
    }

    /// Validate and enqueue. Every refusal (rejection, foreign session, full
    /// or closed queue) is published on the owner's stream and returned; no
    /// job is created.
    pub async fn execute(&self, owner_id: &str, request: ExecRequest) -> Result<JobId> {
        if owner_id.trim().is_empty() {
            return Err(Error::OwnerMissing);
        }
        let stream = streams::owner(owner_id);

        let mode = self.runner.mode_for(&request).await;
        if let Err(e) = self
            .runner
            .manager
            .validator()
            .validate(mode, &request.command)
            .into_result()
        {
            info!(owner_id, command = %request.command, "Out-of-band command rejected: {}", e);
            self.bus().emit(&stream, ServerEvent::from_error(&e)).await;
            return Err(e);
        }

        if let Some(session_id) = &request.session_id {
            if let Some(slot) = self.runner.manager.registry().get(session_id).await {
                if slot.owner_id != owner_id {
                    let e = Error::Unauthorized(format!("session {} belongs to another user", session_id));
                    self.bus().emit(&stream, ServerEvent::from_error(&e)).await;
                    return Err(e);
                }
            }
        }

        let job = ExecutionJob {
            id: JobId::new(),
            owner_id: owner_id.to_string(),
            request: request.clone(),
        };
        let id = match self.queue.enqueue(job).await {
            Ok(id) => id,
            Err(e) => {
                warn!(owner_id, command = %request.command, "Out-of-band command not queued: {}", e);
                self.bus().emit(&stream, ServerEvent::from_error(&e)).await;
                return Err(e);
            }
        };

        self.bus()
            .emit(
                &stream,
                ServerEvent::CommandAcknowledged {
                    command: request.command,
                    session_id: request.session_id,
                    job_id: id.to_string(),
                },
            )
            .await;
        Ok(id)
    }

    pub async fn status(&self, id: JobId) -> Option<JobRecord> {
        self.queue.status(id).await
    }

    /// Run `probe` against the owner's session and publish the result
    pub async fn probe(&self, owner_id: &str, session_id: &str, probe: Probe) -> Result<ProbeResult> {
        let limit = Duration::from_secs(self.runner.settings.default_timeout_secs.max(1));
        let result = probe::run(&self.runner.manager, owner_id, session_id, &probe, limit).await?;

        self.bus()
            .emit(
                streams::owner(owner_id),
                ServerEvent::ProbeResult {
                    probe: probe.name().to_string(),
                    passed: result.passed,
                    detail: result.detail.clone(),
                },
            )
            .await;
        Ok(result)
    }

    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}
