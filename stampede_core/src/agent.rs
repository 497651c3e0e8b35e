//! Agent process runtime.
//!
//! An agent supervises the workers on one host. Its router forwards
//! worker-scoped traffic in both directions; the runtime itself answers
//! pings, runs scripts, relays TERMINATE to its workers and watches their
//! liveness with periodic pings.

use crate::error::CoreError;
use crate::failure::{FailureCause, FailureReporter, FileSink, ForwardSink, ReporterConfig};
use crate::protocol::{MessageEnvelope, Operation, Reply, ReplyStatus};
use crate::router::{OperationHandler, Router, Upstream};
use async_trait::async_trait;
use stampede_env::{RuntimeContext, SimulatorAddress};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Configuration for an [`AgentRuntime`].
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Interval between worker pings (default: 5s)
    pub heartbeat_interval: Duration,
    /// How long a worker may take to answer a ping (default: 10s)
    pub ping_timeout: Duration,
    pub failure_dir: Option<PathBuf>,
    pub reporter: ReporterConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(10),
            failure_dir: None,
            reporter: ReporterConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn with_heartbeat(mut self, interval: Duration, ping_timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.ping_timeout = ping_timeout;
        self
    }

    pub fn with_failure_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.failure_dir = Some(dir.into());
        self
    }
}

/// Request handler of an agent process.
pub struct AgentRuntime<Ctx: RuntimeContext> {
    router: Arc<Router<Ctx>>,
    reporter: Arc<FailureReporter>,
    config: AgentConfig,
    /// Workers already reported as unresponsive
    unresponsive: Arc<Mutex<BTreeSet<SimulatorAddress>>>,
    terminated: watch::Sender<bool>,
}

impl<Ctx: RuntimeContext> AgentRuntime<Ctx> {
    /// Installs the runtime as the router's handler and starts the heartbeat.
    pub fn new(router: Arc<Router<Ctx>>, config: AgentConfig) -> Result<Arc<Self>, CoreError> {
        let local = router.local();
        let reporter = Arc::new(FailureReporter::new(local, config.reporter.clone()));
        let upstream = Upstream::spawn(&router, SimulatorAddress::COORDINATOR);
        reporter.add_sink(Arc::new(ForwardSink::new(upstream)));
        if let Some(dir) = &config.failure_dir {
            reporter.add_sink(Arc::new(FileSink::new(dir)?));
        }
        router.set_reporter(Arc::clone(&reporter));

        let (terminated, _) = watch::channel(false);
        let runtime = Arc::new(Self {
            router: Arc::clone(&router),
            reporter,
            config,
            unresponsive: Arc::new(Mutex::new(BTreeSet::new())),
            terminated,
        });
        router.set_handler(Arc::clone(&runtime) as Arc<dyn OperationHandler>);
        runtime.spawn_heartbeat();
        info!(agent = %local, "agent runtime ready");
        Ok(runtime)
    }

    pub fn address(&self) -> SimulatorAddress {
        self.router.local()
    }

    pub fn reporter(&self) -> &Arc<FailureReporter> {
        &self.reporter
    }

    pub fn terminated(&self) -> watch::Receiver<bool> {
        self.terminated.subscribe()
    }

    /// Workers that stopped answering pings.
    pub fn unresponsive(&self) -> Vec<SimulatorAddress> {
        self.unresponsive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    async fn execute_script(&self, script: String, fire_and_forget: bool) -> Reply {
        info!(agent = %self.address(), fire_and_forget, "executing script");
        if fire_and_forget {
            let agent = self.address();
            self.router.context().spawn("script", async move {
                match run_script(&script).await {
                    Ok(reply) if !reply.is_success() => {
                        warn!(%agent, payload = ?reply.payload, "background script failed")
                    }
                    Ok(_) => debug!(%agent, "background script finished"),
                    Err(e) => warn!(%agent, error = %e, "background script did not start"),
                }
            });
            return Reply::success();
        }

        match run_script(&script).await {
            Ok(reply) => reply,
            Err(e) => Reply::error(ReplyStatus::Exception, format!("script did not start: {}", e)),
        }
    }

    /// Relays TERMINATE to every worker, then signals shutdown.
    async fn terminate(&self, graceful: bool) -> Reply {
        let workers = self.router.children();
        info!(agent = %self.address(), graceful, workers = workers.len(), "terminating");

        let mut promises = Vec::with_capacity(workers.len());
        for worker in workers {
            match self.router.send(worker, Operation::Terminate { graceful }).await {
                Ok(promise) => promises.push((worker, promise)),
                Err(e) => warn!(%worker, error = %e, "terminate not delivered"),
            }
        }
        for (worker, promise) in promises {
            if let Err(e) = promise.wait().await {
                warn!(%worker, error = %e, "worker did not confirm terminate");
            }
        }

        self.terminated.send_replace(true);
        Reply::success()
    }

    fn spawn_heartbeat(&self) {
        let router = Arc::clone(&self.router);
        let reporter = Arc::clone(&self.reporter);
        let unresponsive = Arc::clone(&self.unresponsive);
        let interval = self.config.heartbeat_interval;
        let timeout = self.config.ping_timeout;
        let mut terminated = self.terminated.subscribe();

        self.router.context().spawn("heartbeat", async move {
            loop {
                tokio::select! {
                    _ = router.context().sleep(interval) => {}
                    _ = terminated.changed() => return,
                }
                if router.is_shut_down() {
                    return;
                }

                for worker in router.children() {
                    let known = unresponsive
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .contains(&worker);
                    if known {
                        continue;
                    }

                    let alive = match router.send_with_timeout(worker, Operation::Ping, timeout).await {
                        Ok(promise) => promise.wait().await.is_ok(),
                        Err(_) => false,
                    };
                    if !alive {
                        warn!(%worker, "worker unresponsive");
                        unresponsive
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(worker);
                        reporter.report_for(worker, FailureCause::Unresponsive(worker), None);
                    }
                }
            }
        });
    }
}

/// Runs `sh -c script` and turns its exit status into a reply.
async fn run_script(script: &str) -> Result<Reply, std::io::Error> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(script)
        .kill_on_drop(true)
        .output()
        .await?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
    if output.status.success() {
        Ok(Reply::success_with(stdout))
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        Ok(Reply::error(
            ReplyStatus::Exception,
            format!("exit status {:?}: {}", output.status.code(), stderr),
        ))
    }
}

#[async_trait]
impl<Ctx: RuntimeContext> OperationHandler for AgentRuntime<Ctx> {
    async fn handle(&self, envelope: MessageEnvelope) -> Reply {
        match envelope.payload {
            Operation::Ping => Reply::success(),
            Operation::ExecuteScript {
                script,
                fire_and_forget,
            } => self.execute_script(script, fire_and_forget).await,
            Operation::Terminate { graceful } => self.terminate(graceful).await,
            op @ (Operation::CreateTest { .. }
            | Operation::StartPhase { .. }
            | Operation::StopRun { .. }
            | Operation::PhaseCompleted { .. }
            | Operation::PerformanceStats { .. }
            | Operation::Failure(_)
            | Operation::Reply(_)) => Reply::error(
                ReplyStatus::UnsupportedOperation,
                format!("{} is not handled by agent {}", op.tag(), self.address()),
            ),
        }
    }
}
