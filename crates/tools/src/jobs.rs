//! Background job tracking.
//!
//! A foreground tool call can be detached into a background job while it is
//! running: someone calls [`BackgroundTrigger::request`], the dispatcher
//! registers a job with the [`JobTable`] actor, hands the still-running
//! future to a task, and returns the job id to the model straight away.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustedloop_actors::{ActorContext, ActorRef, Behavior};
use rustedloop_core::tool::decode_params;
use rustedloop_core::{ActorError, Tool, ToolError, ToolResult};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Tool name the job was detached from
    pub name: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

pub enum JobMessage {
    Register {
        name: String,
        reply: oneshot::Sender<JobId>,
    },
    Complete {
        id: JobId,
        result: ToolResult,
    },
    Get {
        id: JobId,
        reply: oneshot::Sender<Option<Job>>,
    },
    List {
        reply: oneshot::Sender<Vec<Job>>,
    },
}

/// Owns the job table.
#[derive(Debug, Default)]
pub struct JobTable {
    next_id: JobId,
    jobs: BTreeMap<JobId, Job>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Behavior for JobTable {
    type Message = JobMessage;

    async fn handle(&mut self, msg: JobMessage, _ctx: &ActorContext) {
        match msg {
            JobMessage::Register { name, reply } => {
                self.next_id += 1;
                let id = self.next_id;
                info!(job_id = id, tool = %name, "Job registered");
                self.jobs.insert(
                    id,
                    Job {
                        id,
                        name,
                        status: JobStatus::Running,
                        result: None,
                        started_at: Utc::now(),
                        finished_at: None,
                    },
                );
                let _ = reply.send(id);
            }
            JobMessage::Complete { id, result } => match self.jobs.get_mut(&id) {
                Some(job) => {
                    job.status = if result.is_error() {
                        JobStatus::Failed
                    } else {
                        JobStatus::Completed
                    };
                    job.result = Some(result);
                    job.finished_at = Some(Utc::now());
                    info!(job_id = id, status = ?job.status, "Job finished");
                }
                None => warn!(job_id = id, "Completion for unknown job"),
            },
            JobMessage::Get { id, reply } => {
                let _ = reply.send(self.jobs.get(&id).cloned());
            }
            JobMessage::List { reply } => {
                let _ = reply.send(self.jobs.values().cloned().collect());
            }
        }
    }

    async fn on_stop(&mut self, _ctx: &ActorContext) {
        let running = self
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .count();
        if running > 0 {
            warn!(running, "Job table stopped with jobs still running");
        }
    }
}

/// Client handle for the [`JobTable`] actor.
#[derive(Debug, Clone)]
pub struct JobClient {
    actor: ActorRef<JobMessage>,
}

impl JobClient {
    pub fn new(actor: ActorRef<JobMessage>) -> Self {
        Self { actor }
    }

    pub async fn register(
        &self,
        cancel: &CancellationToken,
        name: impl Into<String>,
    ) -> Result<JobId, ActorError> {
        let name = name.into();
        self.actor
            .request(cancel, |reply| JobMessage::Register { name, reply })
            .await
    }

    pub async fn complete(
        &self,
        cancel: &CancellationToken,
        id: JobId,
        result: ToolResult,
    ) -> Result<(), ActorError> {
        self.actor
            .send(cancel, JobMessage::Complete { id, result })
            .await
    }

    pub async fn get(&self, cancel: &CancellationToken, id: JobId) -> Result<Option<Job>, ActorError> {
        self.actor
            .request(cancel, |reply| JobMessage::Get { id, reply })
            .await
    }

    pub async fn list(&self, cancel: &CancellationToken) -> Result<Vec<Job>, ActorError> {
        self.actor
            .request(cancel, |reply| JobMessage::List { reply })
            .await
    }
}

/// Sending half of the background signal.
#[derive(Debug, Clone)]
pub struct BackgroundTrigger {
    tx: mpsc::Sender<()>,
}

impl BackgroundTrigger {
    /// Ask the running foreground tool to move to the background.
    ///
    /// Never blocks. Returns `false` if a request is already pending.
    pub fn request(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

/// Receiving half of the background signal, held by the dispatcher.
#[derive(Debug, Clone)]
pub struct BackgroundListener {
    rx: Arc<Mutex<mpsc::Receiver<()>>>,
}

impl BackgroundListener {
    /// Discard a request left over from before the current call started.
    pub fn clear(&self) {
        if let Ok(mut rx) = self.rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
    }

    /// Resolves when a background request arrives.
    pub async fn requested(&self) {
        let mut rx = self.rx.lock().await;
        if rx.recv().await.is_none() {
            // Every trigger is gone; no request can ever arrive.
            drop(rx);
            std::future::pending::<()>().await;
        }
    }
}

/// A single-slot, non-blocking signal for detaching the foreground tool.
pub fn background_signal() -> (BackgroundTrigger, BackgroundListener) {
    let (tx, rx) = mpsc::channel(1);
    (
        BackgroundTrigger { tx },
        BackgroundListener {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// The pieces the dispatcher needs to detach a call.
#[derive(Debug, Clone)]
pub struct Background {
    pub jobs: JobClient,
    pub listener: BackgroundListener,
}

pub(crate) type ToolFuture = Pin<Box<dyn Future<Output = ToolResult> + Send>>;

/// Run `fut` in the foreground unless a background request arrives first,
/// in which case it continues as a registered job.
pub(crate) async fn run_detachable(
    cancel: &CancellationToken,
    tool_name: &str,
    mut fut: ToolFuture,
    background: &Background,
) -> ToolResult {
    background.listener.clear();

    tokio::select! {
        result = &mut fut => result,
        _ = background.listener.requested() => {
            match background.jobs.register(cancel, tool_name).await {
                Ok(id) => {
                    let jobs = background.jobs.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        let result = fut.await;
                        if let Err(e) = jobs.complete(&cancel, id, result).await {
                            debug!(job_id = id, error = %e, "Job result dropped");
                        }
                    });
                    ToolResult {
                        value: serde_json::json!({ "job_id": id, "status": "running" }),
                        reason: format!("Moved to background job {id}"),
                        ..ToolResult::default()
                    }
                }
                Err(e) => {
                    warn!(tool = tool_name, error = %e, "Could not register job, staying in foreground");
                    fut.await
                }
            }
        }
    }
}

/// Lets the model check on background jobs.
pub struct JobStatusTool {
    jobs: JobClient,
}

impl JobStatusTool {
    pub fn new(jobs: JobClient) -> Self {
        Self { jobs }
    }
}

#[derive(Deserialize)]
struct JobStatusParams {
    #[serde(default)]
    job_id: Option<JobId>,
}

#[async_trait]
impl Tool for JobStatusTool {
    fn name(&self) -> &str {
        "jobs"
    }

    fn description(&self) -> &str {
        "Show background jobs. Pass job_id to get one job's status and result."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "job_id": { "type": "integer", "description": "Job to inspect" }
            }
        })
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        parameters: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let params: JobStatusParams = decode_params(self.name(), parameters)?;
        let failed = |e: ActorError| ToolError::ExecutionFailed {
            tool_name: "jobs".into(),
            reason: e.to_string(),
        };

        let value = match params.job_id {
            Some(id) => match self.jobs.get(cancel, id).await.map_err(failed)? {
                Some(job) => serde_json::to_value(job).unwrap_or_default(),
                None => return Ok(ToolResult::err(format!("No job with id {id}"))),
            },
            None => {
                serde_json::to_value(self.jobs.list(cancel).await.map_err(failed)?)
                    .unwrap_or_default()
            }
        };
        Ok(ToolResult::ok(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustedloop_actors::ActorSystem;
    use std::time::Duration;

    fn spawn_jobs(system: &ActorSystem) -> JobClient {
        JobClient::new(system.spawn("jobs", JobTable::new(), 8).unwrap())
    }

    #[tokio::test]
    async fn register_complete_and_list() {
        let system = ActorSystem::new(CancellationToken::new());
        let jobs = spawn_jobs(&system);
        let cancel = CancellationToken::new();

        let id = jobs.register(&cancel, "shell").await.unwrap();
        assert_eq!(jobs.get(&cancel, id).await.unwrap().unwrap().status, JobStatus::Running);

        jobs.complete(&cancel, id, ToolResult::ok("done")).await.unwrap();
        let job = jobs.get(&cancel, id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.unwrap().output_text(), "done");

        let failed = jobs.register(&cancel, "build").await.unwrap();
        jobs.complete(&cancel, failed, ToolResult::err("exit 1")).await.unwrap();
        let all = jobs.list(&cancel).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].status, JobStatus::Failed);

        system.stop_all(Duration::from_secs(1)).await.unwrap();
    }

    #[test]
    fn trigger_never_blocks_and_holds_one_request() {
        let (trigger, _listener) = background_signal();
        assert!(trigger.request());
        assert!(!trigger.request());
    }

    #[tokio::test]
    async fn stale_request_is_cleared_before_a_call() {
        let system = ActorSystem::new(CancellationToken::new());
        let (trigger, listener) = background_signal();
        let background = Background {
            jobs: spawn_jobs(&system),
            listener,
        };
        assert!(trigger.request());

        let result = run_detachable(
            &CancellationToken::new(),
            "read",
            Box::pin(async { ToolResult::ok("contents") }),
            &background,
        )
        .await;
        assert_eq!(result.output_text(), "contents");

        system.stop_all(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn request_detaches_running_call_into_a_job() {
        let system = ActorSystem::new(CancellationToken::new());
        let jobs = spawn_jobs(&system);
        let (trigger, listener) = background_signal();
        let background = Background {
            jobs: jobs.clone(),
            listener,
        };
        let cancel = CancellationToken::new();

        let slow: ToolFuture = Box::pin(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            ToolResult::ok("built")
        });

        let call = tokio::spawn({
            let background = background.clone();
            let cancel = cancel.clone();
            async move { run_detachable(&cancel, "build", slow, &background).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(trigger.request());

        let result = call.await.unwrap();
        let job_id = result.value["job_id"].as_u64().unwrap();
        assert!(result.reason.contains("background"));
        assert_eq!(
            jobs.get(&cancel, job_id).await.unwrap().unwrap().status,
            JobStatus::Running
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        let job = jobs.get(&cancel, job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        system.stop_all(Duration::from_secs(1)).await.unwrap();
    }
}
