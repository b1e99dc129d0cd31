//! Process supervisor: runs every agent, the Q&A orchestrator and the
//! watchdog as tokio tasks in one process and keeps them alive.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::agents::{
    build_agent, AgentWorker, NoQuestions, QuestionChannel, RedisQuestionChannel, WorkerConfig,
};
use crate::config::Settings;
use crate::llm::LlmProvider;
use crate::metrics::{init_metrics, MetricsCollector};
use crate::prp::{status, AgentState, AgentStatus};
use crate::qa::QaOrchestrator;
use crate::scheduler::{connect_manager, QueueError, RetryPolicy, Stage, StageQueue, Watchdog};

/// How long tasks get to finish after the shutdown signal.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Registry entries silent for this many stale periods are removed.
pub const ABANDON_AFTER_STALE_PERIODS: u32 = 10;

/// Optional parts of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorOptions {
    pub qa: bool,
    pub watchdog: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            qa: true,
            watchdog: true,
        }
    }
}

/// A supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Agent(Stage),
    Qa,
    Watchdog,
}

impl TaskKind {
    /// Tasks to run for `options`, agents first.
    pub fn planned(options: SupervisorOptions) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = Stage::ALL.into_iter().map(TaskKind::Agent).collect();
        if options.qa {
            kinds.push(TaskKind::Qa);
        }
        if options.watchdog {
            kinds.push(TaskKind::Watchdog);
        }
        kinds
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Agent(stage) => stage.role(),
            TaskKind::Qa => "qa",
            TaskKind::Watchdog => "watchdog",
        }
    }
}

struct Supervised {
    kind: TaskKind,
    handle: Option<JoinHandle<()>>,
}

/// Agents silent for longer than `stale_after`, stopped ones excluded.
pub fn stale_agents(agents: &[AgentStatus], now: i64, stale_after: Duration) -> Vec<&AgentStatus> {
    agents
        .iter()
        .filter(|a| a.is_stale(now, stale_after.as_secs()))
        .collect()
}

/// How long an agent entry may stay silent before the monitor drops it.
pub fn abandon_after(stale_after: Duration) -> Duration {
    stale_after
        .checked_mul(ABANDON_AFTER_STALE_PERIODS)
        .unwrap_or(Duration::MAX)
}

/// Owns the shutdown channel and the task handles.
pub struct Supervisor {
    settings: Settings,
    llm: Arc<dyn LlmProvider>,
    options: SupervisorOptions,
    instance: String,
    shutdown: broadcast::Sender<()>,
    metrics: MetricsCollector,
}

impl Supervisor {
    pub fn new(settings: Settings, llm: Arc<dyn LlmProvider>, options: SupervisorOptions) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let instance = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            settings,
            llm,
            options,
            instance,
            shutdown,
            metrics: MetricsCollector::new(),
        }
    }

    /// Agent id of `stage`. Stable across restarts of the same process.
    pub fn agent_id(&self, stage: Stage) -> String {
        format!("{}-{}", stage.role(), self.instance)
    }

    /// Runs until Ctrl-C.
    pub async fn run(self) -> Result<(), QueueError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Runs until `signal` resolves, then shuts every task down.
    pub async fn run_until(self, signal: impl Future<Output = ()>) -> Result<(), QueueError> {
        init_metrics();
        let monitor_conn = connect_manager(&self.settings.redis_url).await?;
        let policy = RetryPolicy::new(self.settings.max_retries);
        let queues: Vec<StageQueue> = Stage::ALL
            .into_iter()
            .map(|stage| StageQueue::from_connection(monitor_conn.clone(), stage, policy))
            .collect();

        let mut tasks = Vec::new();
        for kind in TaskKind::planned(self.options) {
            let handle = self.spawn(kind).await?;
            tasks.push(Supervised {
                kind,
                handle: Some(handle),
            });
        }
        info!(
            tasks = tasks.len(),
            qa = self.options.qa,
            watchdog = self.options.watchdog,
            "Supervisor started"
        );

        tokio::pin!(signal);
        let mut ticker = tokio::time::interval(self.settings.monitor_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    self.restart_finished(&mut tasks).await;
                    self.report(&queues).await;
                }
            }
        }

        self.shutdown_tasks(tasks).await;
        self.unregister_agents(monitor_conn).await;
        Ok(())
    }

    async fn spawn(&self, kind: TaskKind) -> Result<JoinHandle<()>, QueueError> {
        let redis = connect_manager(&self.settings.redis_url).await?;
        let shutdown = self.shutdown.subscribe();

        let handle = match kind {
            TaskKind::Agent(stage) => {
                let queue = StageQueue::from_connection(
                    redis.clone(),
                    stage,
                    RetryPolicy::new(self.settings.max_retries),
                );
                let questions: Arc<dyn QuestionChannel> = if self.options.qa {
                    Arc::new(RedisQuestionChannel::new(redis, self.settings.qa_wait_timeout))
                } else {
                    Arc::new(NoQuestions)
                };
                let worker = AgentWorker::new(
                    self.agent_id(stage),
                    build_agent(stage, &self.settings),
                    Arc::clone(&self.llm),
                    queue,
                    questions,
                    WorkerConfig::from_settings(&self.settings),
                );
                tokio::spawn(worker.run(shutdown))
            }
            TaskKind::Qa => {
                let qa = QaOrchestrator::new(redis, Arc::clone(&self.llm), &self.settings);
                tokio::spawn(qa.run(shutdown))
            }
            TaskKind::Watchdog => {
                let watchdog = Watchdog::new(redis, &self.settings);
                tokio::spawn(async move { watchdog.run(shutdown).await })
            }
        };
        Ok(handle)
    }

    /// Restarts tasks that ended on their own. A failed respawn is retried
    /// on the next tick.
    async fn restart_finished(&self, tasks: &mut [Supervised]) {
        for task in tasks.iter_mut() {
            let finished = match &task.handle {
                Some(handle) => handle.is_finished(),
                None => true,
            };
            if !finished {
                continue;
            }

            if let Some(handle) = task.handle.take() {
                match handle.await {
                    Ok(()) => warn!(task = task.kind.name(), "Task exited unexpectedly"),
                    Err(e) if e.is_panic() => error!(task = task.kind.name(), "Task panicked"),
                    Err(e) => error!(task = task.kind.name(), error = %e, "Task failed"),
                }
            }

            match self.spawn(task.kind).await {
                Ok(handle) => {
                    self.metrics.record_restart(task.kind.name());
                    info!(task = task.kind.name(), "Task restarted");
                    task.handle = Some(handle);
                }
                Err(e) => error!(task = task.kind.name(), error = %e, "Failed to restart task"),
            }
        }
    }

    /// Queue depths into metrics and logs, plus stale agent warnings.
    async fn report(&self, queues: &[StageQueue]) {
        for queue in queues {
            match queue.depths().await {
                Ok(stats) => {
                    self.metrics.set_queue_depth(queue.name(), &stats);
                    info!(
                        queue = queue.name(),
                        pending = stats.pending,
                        inflight = stats.inflight,
                        dead_letter = stats.dead_letter,
                        "Queue depth"
                    );
                }
                Err(e) => warn!(queue = queue.name(), error = %e, "Failed to read queue depth"),
            }
        }

        let Some(first) = queues.first() else {
            return;
        };
        let mut conn = first.connection();
        let now = chrono::Utc::now().timestamp();
        match status::prune(&mut conn, now, abandon_after(self.settings.agent_stale_after)).await {
            Ok(removed) if !removed.is_empty() => {
                info!(agents = ?removed, "Removed abandoned agent entries");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to prune agent registry"),
        }

        let agents = match status::read_all(&mut conn).await {
            Ok(agents) => agents,
            Err(e) => {
                warn!(error = %e, "Failed to read agent status");
                return;
            }
        };

        let stale = stale_agents(&agents, now, self.settings.agent_stale_after);
        for agent in &stale {
            warn!(
                agent_id = %agent.agent_id,
                role = %agent.role,
                state = %agent.state,
                idle_secs = agent.idle_for(now),
                "Agent looks stale"
            );
        }
        let active = agents
            .iter()
            .filter(|a| a.state != AgentState::Stopped)
            .count()
            - stale.len();
        self.metrics.set_active_agents(active);
    }

    async fn shutdown_tasks(&self, tasks: Vec<Supervised>) {
        // No receivers left is fine: every task is already gone.
        let _ = self.shutdown.send(());

        let deadline = tokio::time::Instant::now() + SHUTDOWN_TIMEOUT;
        for task in tasks {
            let Some(mut handle) = task.handle else {
                continue;
            };
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = task.kind.name(), error = %e, "Task ended with error"),
                Err(_) => {
                    warn!(task = task.kind.name(), "Task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        info!("Supervisor stopped");
    }

    /// Drops this process's agents from the registry.
    async fn unregister_agents(&self, mut conn: redis::aio::ConnectionManager) {
        for stage in Stage::ALL {
            let agent_id = self.agent_id(stage);
            if let Err(e) = status::remove(&mut conn, &agent_id).await {
                warn!(agent_id = %agent_id, error = %e, "Failed to unregister agent");
            }
        }
    }
}
