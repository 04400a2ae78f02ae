//! `ExecutionRunner`: wraps one task invocation with timing, error capture,
//! a bounded deadline and guaranteed process-slot cleanup.
//!
//! The runner never retries and never returns an error: whatever happens
//! (task error, timeout, panic, missing task) ends up in the returned
//! [`ExecutionRecord`].

use std::{
    any::Any, collections::HashMap, fmt, panic::AssertUnwindSafe, pin::pin, sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warden_core::{ScheduleId, SessionId};
use warden_reaper::ProcessRegistry;

use crate::{
    clock::Clock,
    types::{ExecutionRecord, TriggerType},
};

pub const TIMEOUT_MESSAGE: &str = "execution timed out";

/// How long a timed-out task gets to react to its cancelled token.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

type Finished = std::thread::Result<anyhow::Result<u64>>;

/// The collaborator-supplied task body.
///
/// Returns the number of items processed. A task that spawns an external
/// process must call [`TaskContext::register_pid`] as soon as the PID is known.
#[async_trait]
pub trait JobTask: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<u64>;
}

/// Everything a task gets to know about the execution it serves.
#[derive(Clone)]
pub struct TaskContext {
    pub schedule_id: ScheduleId,
    pub subject_id: String,
    pub job_type: String,
    pub session_id: SessionId,
    /// Fires on timeout or shutdown.
    pub cancel: CancellationToken,
    pub processes: Arc<ProcessRegistry>,
}

impl TaskContext {
    pub fn register_pid(&self, pid: u32) {
        self.processes.register(&self.session_id, pid);
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("schedule_id", &self.schedule_id)
            .field("subject_id", &self.subject_id)
            .field("job_type", &self.job_type)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// TaskRouter
// ---------------------------------------------------------------------------

/// Maps a schedule's `job_type` tag to the task that implements it.
#[derive(Clone, Default)]
pub struct TaskRouter {
    tasks: HashMap<String, Arc<dyn JobTask>>,
}

impl TaskRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: impl Into<String>, task: Arc<dyn JobTask>) {
        self.tasks.insert(job_type.into(), task);
    }

    pub fn with(mut self, job_type: impl Into<String>, task: Arc<dyn JobTask>) -> Self {
        self.register(job_type, task);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobTask>> {
        self.tasks.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

// ---------------------------------------------------------------------------
// ExecutionRunner
// ---------------------------------------------------------------------------

pub struct ExecutionRunner {
    router: TaskRouter,
    registry: Arc<ProcessRegistry>,
    clock: Arc<dyn Clock>,
    max_duration: Duration,
    terminate_grace: Duration,
    /// Parent of every execution's cancellation token.
    root: CancellationToken,
}

impl ExecutionRunner {
    pub fn new(
        router: TaskRouter,
        registry: Arc<ProcessRegistry>,
        clock: Arc<dyn Clock>,
        max_duration: Duration,
    ) -> Self {
        Self {
            router,
            registry,
            clock,
            max_duration,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            root: CancellationToken::new(),
        }
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Cancel every in-flight execution. Used when the shutdown grace runs out.
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    /// Run the task registered for `job_type`.
    pub async fn run(
        &self,
        schedule_id: &ScheduleId,
        subject_id: &str,
        job_type: &str,
        trigger_type: TriggerType,
    ) -> ExecutionRecord {
        match self.router.get(job_type) {
            Some(task) => {
                self.run_task(schedule_id, subject_id, job_type, trigger_type, task)
                    .await
            }
            None => {
                let now = self.clock.now();
                warn!(%schedule_id, %job_type, "no task registered for job type");
                ExecutionRecord {
                    id: None,
                    schedule_id: schedule_id.clone(),
                    started_at: now,
                    completed_at: Some(now),
                    success: false,
                    items_processed: 0,
                    error_message: Some(format!("no task registered for job type {job_type}")),
                    trigger_type,
                }
            }
        }
    }

    /// Run `task` for one execution.
    ///
    /// A process slot is reserved for the whole call and released on every
    /// exit path, including a panicking task. On timeout the token is
    /// cancelled and the task gets the terminate grace to stop its children
    /// before it is dropped; a process it still left behind is no longer
    /// registered and falls to the reaper.
    pub async fn run_task(
        &self,
        schedule_id: &ScheduleId,
        subject_id: &str,
        job_type: &str,
        trigger_type: TriggerType,
        task: Arc<dyn JobTask>,
    ) -> ExecutionRecord {
        let session_id = SessionId::new();
        let slot = self.registry.reserve(session_id.clone());
        let cancel = self.root.child_token();
        let ctx = TaskContext {
            schedule_id: schedule_id.clone(),
            subject_id: subject_id.to_string(),
            job_type: job_type.to_string(),
            session_id: session_id.clone(),
            cancel: cancel.clone(),
            processes: Arc::clone(&self.registry),
        };

        let started_at = self.clock.now();
        info!(
            %schedule_id,
            %subject_id,
            %job_type,
            %session_id,
            trigger = %trigger_type,
            "execution started"
        );

        let mut guarded = pin!(AssertUnwindSafe(task.run(ctx)).catch_unwind());
        let outcome = match tokio::time::timeout(self.max_duration, guarded.as_mut()).await {
            Ok(finished) => settle(finished),
            Err(_elapsed) => {
                cancel.cancel();
                if tokio::time::timeout(self.terminate_grace, guarded).await.is_err() {
                    warn!(%schedule_id, %session_id, "task ignored cancellation; dropping it");
                }
                Err(TIMEOUT_MESSAGE.to_string())
            }
        };
        drop(slot);

        let completed_at = self.clock.now();
        let record = ExecutionRecord {
            id: None,
            schedule_id: schedule_id.clone(),
            started_at,
            completed_at: Some(completed_at.max(started_at)),
            success: outcome.is_ok(),
            items_processed: outcome.as_ref().copied().unwrap_or(0),
            error_message: outcome.err(),
            trigger_type,
        };

        match &record.error_message {
            None => info!(
                %schedule_id,
                items = record.items_processed,
                "execution succeeded"
            ),
            Some(error) => warn!(%schedule_id, %error, "execution failed"),
        }
        record
    }
}

fn settle(finished: Finished) -> Result<u64, String> {
    match finished {
        Ok(Ok(items)) => Ok(items),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(panic) => Err(format!("task panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    struct Fixed(u64);

    #[async_trait]
    impl JobTask for Fixed {
        async fn run(&self, _ctx: TaskContext) -> anyhow::Result<u64> {
            Ok(self.0)
        }
    }

    struct Failing;

    #[async_trait]
    impl JobTask for Failing {
        async fn run(&self, _ctx: TaskContext) -> anyhow::Result<u64> {
            anyhow::bail!("login page changed")
        }
    }

    struct Panicking;

    #[async_trait]
    impl JobTask for Panicking {
        async fn run(&self, ctx: TaskContext) -> anyhow::Result<u64> {
            ctx.register_pid(4242);
            panic!("selector missing");
        }
    }

    struct Hanging;

    #[async_trait]
    impl JobTask for Hanging {
        async fn run(&self, ctx: TaskContext) -> anyhow::Result<u64> {
            ctx.register_pid(777);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(1)
        }
    }

    /// Waits for its token, then takes a while to clean up.
    struct CleansUp {
        cleaned: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl JobTask for CleansUp {
        async fn run(&self, ctx: TaskContext) -> anyhow::Result<u64> {
            ctx.cancel.cancelled().await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            self.cleaned.store(true, std::sync::atomic::Ordering::SeqCst);
            anyhow::bail!("cancelled")
        }
    }

    fn runner(router: TaskRouter, max: Duration) -> ExecutionRunner {
        ExecutionRunner::new(
            router,
            Arc::new(ProcessRegistry::new()),
            Arc::new(SystemClock),
            max,
        )
    }

    #[tokio::test]
    async fn success_records_items() {
        let r = runner(
            TaskRouter::new().with("scrape", Arc::new(Fixed(12))),
            Duration::from_secs(5),
        );
        let id = ScheduleId::new();
        let record = r.run(&id, "acct", "scrape", TriggerType::Scheduled).await;
        assert!(record.success);
        assert_eq!(record.items_processed, 12);
        assert!(record.completed_at.unwrap() >= record.started_at);
        assert!(r.registry().is_empty());
    }

    #[tokio::test]
    async fn task_error_becomes_error_message() {
        let r = runner(
            TaskRouter::new().with("scrape", Arc::new(Failing)),
            Duration::from_secs(5),
        );
        let record = r
            .run(&ScheduleId::new(), "acct", "scrape", TriggerType::Manual)
            .await;
        assert!(!record.success);
        assert_eq!(record.error_message.as_deref(), Some("login page changed"));
        assert_eq!(record.trigger_type, TriggerType::Manual);
    }

    #[tokio::test]
    async fn panic_is_captured_and_slot_released() {
        let r = runner(
            TaskRouter::new().with("scrape", Arc::new(Panicking)),
            Duration::from_secs(5),
        );
        let record = r
            .run(&ScheduleId::new(), "acct", "scrape", TriggerType::Scheduled)
            .await;
        assert!(!record.success);
        assert_eq!(
            record.error_message.as_deref(),
            Some("task panicked: selector missing")
        );
        assert!(r.registry().is_empty());
        assert!(!r.registry().contains_pid(4242));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_recorded_and_process_left_unregistered() {
        let r = runner(
            TaskRouter::new().with("scrape", Arc::new(Hanging)),
            Duration::from_secs(30),
        );
        let record = r
            .run(&ScheduleId::new(), "acct", "scrape", TriggerType::Scheduled)
            .await;
        assert!(!record.success);
        assert_eq!(record.error_message.as_deref(), Some(TIMEOUT_MESSAGE));
        // The reaper now sees pid 777 as an orphan.
        assert!(!r.registry().contains_pid(777));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_task_gets_the_grace_to_clean_up() {
        let cleaned = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let task = Arc::new(CleansUp {
            cleaned: cleaned.clone(),
        });
        let r = runner(TaskRouter::new().with("scrape", task), Duration::from_secs(30))
            .with_terminate_grace(Duration::from_secs(5));
        let record = r
            .run(&ScheduleId::new(), "acct", "scrape", TriggerType::Scheduled)
            .await;
        assert_eq!(record.error_message.as_deref(), Some(TIMEOUT_MESSAGE));
        assert!(cleaned.load(std::sync::atomic::Ordering::SeqCst));

        // cleanup slower than the grace is cut off
        cleaned.store(false, std::sync::atomic::Ordering::SeqCst);
        let r = r.with_terminate_grace(Duration::from_secs(1));
        let record = r
            .run(&ScheduleId::new(), "acct", "scrape", TriggerType::Scheduled)
            .await;
        assert_eq!(record.error_message.as_deref(), Some(TIMEOUT_MESSAGE));
        assert!(!cleaned.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unknown_job_type_is_a_failed_execution() {
        let r = runner(TaskRouter::new(), Duration::from_secs(5));
        let record = r
            .run(&ScheduleId::new(), "acct", "digest", TriggerType::Scheduled)
            .await;
        assert!(!record.success);
        assert_eq!(
            record.error_message.as_deref(),
            Some("no task registered for job type digest")
        );
    }

    #[test]
    fn router_lists_job_types_sorted() {
        let router = TaskRouter::new()
            .with("scrape", Arc::new(Fixed(0)))
            .with("digest", Arc::new(Fixed(0)));
        assert_eq!(router.job_types(), vec!["digest", "scrape"]);
        assert!(router.get("missing").is_none());
    }
}
