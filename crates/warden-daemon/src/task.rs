//! `CommandTask`: a job type backed by an external program.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context};
use async_trait::async_trait;
use tracing::debug;
use warden_core::config::TaskCommandConfig;
use warden_reaper::{CommandSpec, ProcessSpawner};
use warden_scheduler::{JobTask, TaskContext, TaskRouter};

/// Prefix of the stdout line reporting how many items a run handled.
const ITEMS_MARKER: &str = "items_processed=";
/// Characters of stderr quoted in a failure message.
const STDERR_EXCERPT: usize = 512;

pub struct CommandTask {
    config: TaskCommandConfig,
    terminate_grace: Duration,
}

impl CommandTask {
    pub fn new(config: TaskCommandConfig, terminate_grace: Duration) -> Self {
        Self {
            config,
            terminate_grace,
        }
    }

    fn spec(&self, ctx: &TaskContext) -> CommandSpec {
        let fill = |arg: &str| {
            arg.replace("{subject}", &ctx.subject_id)
                .replace("{session}", ctx.session_id.as_str())
                .replace("{job_type}", &ctx.job_type)
        };
        let mut env: Vec<(String, String)> = self
            .config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), fill(v)))
            .collect();
        env.push(("WARDEN_SESSION_ID".to_string(), ctx.session_id.to_string()));
        env.push(("WARDEN_SCHEDULE_ID".to_string(), ctx.schedule_id.to_string()));
        CommandSpec {
            program: self.config.program.clone(),
            args: self.config.args.iter().map(|a| fill(a)).collect(),
            working_dir: self.config.working_dir.clone(),
            env,
        }
    }
}

#[async_trait]
impl JobTask for CommandTask {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<u64> {
        let spec = self.spec(&ctx);
        let spawner = ProcessSpawner::new(Arc::clone(&ctx.processes), self.terminate_grace);
        let child = spawner
            .spawn(&ctx.session_id, &spec)
            .with_context(|| format!("failed to start {}", spec.program))?;
        debug!(schedule_id = %ctx.schedule_id, pid = child.pid(), "task command running");

        let exit = child.wait(&ctx.cancel).await?;
        if exit.cancelled {
            bail!("cancelled");
        }
        if !exit.success() {
            let code = exit
                .exit_code
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            let stderr = excerpt(exit.stderr.trim());
            if stderr.is_empty() {
                bail!("{} exited with {code}", spec.program);
            }
            bail!("{} exited with {code}: {stderr}", spec.program);
        }
        Ok(items_processed(&exit.stdout))
    }
}

/// Build a router with one [`CommandTask`] per configured job type.
pub fn router_from_config<'a>(
    tasks: impl IntoIterator<Item = (&'a String, &'a TaskCommandConfig)>,
    terminate_grace: Duration,
) -> TaskRouter {
    tasks
        .into_iter()
        .fold(TaskRouter::new(), |router, (job_type, config)| {
            router.with(
                job_type.clone(),
                Arc::new(CommandTask::new(config.clone(), terminate_grace)),
            )
        })
}

/// Last `items_processed=<n>` value printed on stdout, or 0.
fn items_processed(stdout: &str) -> u64 {
    stdout
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix(ITEMS_MARKER)?.trim().parse().ok())
        .unwrap_or(0)
}

fn excerpt(s: &str) -> &str {
    match s.char_indices().nth(STDERR_EXCERPT) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio_util::sync::CancellationToken;
    use warden_core::{ScheduleId, SessionId};
    use warden_reaper::ProcessRegistry;

    fn ctx(registry: &Arc<ProcessRegistry>) -> TaskContext {
        TaskContext {
            schedule_id: ScheduleId::from("sched-1"),
            subject_id: "acme".to_string(),
            job_type: "scrape".to_string(),
            session_id: SessionId::new(),
            cancel: CancellationToken::new(),
            processes: Arc::clone(registry),
        }
    }

    fn sh(script: &str) -> TaskCommandConfig {
        TaskCommandConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn items_marker_takes_last_line() {
        assert_eq!(items_processed("items_processed=3\nnoise\nitems_processed=7\n"), 7);
        assert_eq!(items_processed("  items_processed= 12 \n"), 12);
        assert_eq!(items_processed("done\n"), 0);
        assert_eq!(items_processed("items_processed=lots\n"), 0);
    }

    #[test]
    fn placeholders_are_filled() {
        let registry = Arc::new(ProcessRegistry::new());
        let ctx = ctx(&registry);
        let mut config = sh("run {subject} {job_type}");
        config.env.insert("TARGET".to_string(), "{subject}".to_string());
        let spec = CommandTask::new(config, Duration::from_secs(1)).spec(&ctx);
        assert_eq!(spec.args[1], "run acme scrape");
        assert!(spec.env.contains(&("TARGET".to_string(), "acme".to_string())));
        assert!(spec
            .env
            .contains(&("WARDEN_SESSION_ID".to_string(), ctx.session_id.to_string())));
    }

    #[test]
    fn router_covers_configured_job_types() {
        let mut tasks = BTreeMap::new();
        tasks.insert("scrape".to_string(), sh("true"));
        tasks.insert("enrich".to_string(), sh("true"));
        let router = router_from_config(&tasks, Duration::from_secs(1));
        assert_eq!(router.job_types(), vec!["enrich", "scrape"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_command_reports_items() {
        let registry = Arc::new(ProcessRegistry::new());
        let mut config = sh("echo working; echo items_processed=$WARDEN_N");
        config.env.insert("WARDEN_N".to_string(), "42".to_string());
        let task = CommandTask::new(config, Duration::from_secs(1));
        assert_eq!(task.run(ctx(&registry)).await.unwrap(), 42);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_quotes_stderr() {
        let registry = Arc::new(ProcessRegistry::new());
        let task = CommandTask::new(sh("echo boom >&2; exit 3"), Duration::from_secs(1));
        let err = task.run(ctx(&registry)).await.unwrap_err().to_string();
        assert!(err.contains("exited with 3"), "{err}");
        assert!(err.contains("boom"), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawned_pid_is_registered_under_the_session() {
        let registry = Arc::new(ProcessRegistry::new());
        let ctx = ctx(&registry);
        let session = ctx.session_id.clone();
        let task = CommandTask::new(sh("sleep 0.2"), Duration::from_secs(1));

        let watcher = Arc::clone(&registry);
        let running = tokio::spawn(async move { task.run(ctx).await });
        let mut seen = false;
        for _ in 0..50 {
            if watcher.get(&session).is_some_and(|p| p.pid.is_some()) {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen, "pid never registered");
        assert_eq!(running.await.unwrap().unwrap(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_terminates_the_command() {
        let registry = Arc::new(ProcessRegistry::new());
        let ctx = ctx(&registry);
        let cancel = ctx.cancel.clone();
        let task = CommandTask::new(sh("sleep 30"), Duration::from_secs(1));

        let running = tokio::spawn(async move { task.run(ctx).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err().to_string(), "cancelled");
    }
}
