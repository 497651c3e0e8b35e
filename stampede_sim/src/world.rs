//! SimWorld - a whole Stampede cluster inside one process.

use crate::error::SimError;
use crate::workloads::{self, PhaseLog};

use stampede_core::failure::{ReporterConfig, DEFAULT_FAILURE_CAP};
use stampede_core::{
    AgentConfig, AgentRuntime, Coordinator, CoordinatorConfig, Router, RouterConfig, WorkerConfig,
    WorkerRuntime,
};
use stampede_env::{ChannelLink, LinkController, SimulatorAddress, TcpLink, TokioContext};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// How routers of the simulated cluster talk to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkKind {
    /// In-memory channels, with fault injection
    #[default]
    Channel,
    /// Loopback TCP connections
    Tcp,
}

impl FromStr for LinkKind {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "channel" | "memory" => Ok(LinkKind::Channel),
            "tcp" => Ok(LinkKind::Tcp),
            _ => Err(SimError::config(format!("unknown link kind '{}'", s))),
        }
    }
}

/// Configuration for a simulated cluster.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for every worker's random streams
    pub seed: u64,

    pub num_agents: u32,

    pub workers_per_agent: u32,

    pub link: LinkKind,

    /// Default deadline of every router request
    pub request_timeout: Duration,

    /// Interval between streamed performance samples
    pub sample_interval: Duration,

    /// Agent heartbeat period and ping deadline
    pub heartbeat_interval: Duration,
    pub ping_timeout: Duration,

    /// Failure records emitted per process before counting only
    pub failure_cap: u64,

    /// Directory for persisted failure records, shared by all processes
    pub failure_dir: Option<PathBuf>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_agents: 1,
            workers_per_agent: 2,
            link: LinkKind::Channel,
            request_timeout: Duration::from_secs(2),
            sample_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(2),
            failure_cap: DEFAULT_FAILURE_CAP,
            failure_dir: None,
        }
    }
}

/// A running cluster: one coordinator, its agents and their workers.
///
/// Every worker hosts the built-in workloads; `recording` tests write to
/// the world's [`PhaseLog`].
pub struct SimWorld {
    config: SimConfig,
    coordinator: Arc<Coordinator<TokioContext>>,
    agents: Vec<Arc<AgentRuntime<TokioContext>>>,
    workers: Vec<Arc<WorkerRuntime<TokioContext>>>,
    routers: Vec<Arc<Router<TokioContext>>>,
    /// Agent-to-worker links, channel mode only
    worker_links: HashMap<SimulatorAddress, Arc<ChannelLink>>,
    phase_log: PhaseLog,
}

impl SimWorld {
    /// Wires up and starts the cluster. Must be called inside a tokio runtime.
    pub async fn build(config: SimConfig) -> Result<Self, SimError> {
        if config.num_agents == 0 || config.workers_per_agent == 0 {
            return Err(SimError::config("a cluster needs at least one agent and one worker"));
        }

        let context = Arc::new(TokioContext::seeded(config.seed));
        let router_config = RouterConfig::default().with_request_timeout(config.request_timeout);
        let reporter = ReporterConfig::default().with_cap(config.failure_cap);

        let root = Router::new(Arc::clone(&context), SimulatorAddress::COORDINATOR, router_config.clone());
        let mut coordinator_config = CoordinatorConfig {
            reporter: reporter.clone(),
            ..Default::default()
        };
        if let Some(dir) = &config.failure_dir {
            coordinator_config = coordinator_config.with_failure_dir(dir);
        }
        let coordinator = Coordinator::new(Arc::clone(&root), coordinator_config)?;

        let mut world = Self {
            config: config.clone(),
            coordinator,
            agents: Vec::new(),
            workers: Vec::new(),
            routers: vec![Arc::clone(&root)],
            worker_links: HashMap::new(),
            phase_log: PhaseLog::new(),
        };

        for a in 1..=config.num_agents {
            let agent = Router::new(Arc::clone(&context), SimulatorAddress::agent(a), router_config.clone());
            connect(config.link, &root, &agent).await?;

            let mut agent_config = AgentConfig {
                reporter: reporter.clone(),
                ..Default::default()
            }
            .with_heartbeat(config.heartbeat_interval, config.ping_timeout);
            if let Some(dir) = &config.failure_dir {
                agent_config = agent_config.with_failure_dir(dir);
            }
            world.agents.push(AgentRuntime::new(Arc::clone(&agent), agent_config)?);

            for w in 1..=config.workers_per_agent {
                let address = SimulatorAddress::worker(a, w);
                let worker = Router::new(Arc::clone(&context), address, router_config.clone());
                if let Some(link) = connect(config.link, &agent, &worker).await? {
                    world.worker_links.insert(address, link);
                }

                let mut worker_config = WorkerConfig::default()
                    .with_sample_interval(config.sample_interval)
                    .with_reporter(reporter.clone());
                if let Some(dir) = &config.failure_dir {
                    worker_config = worker_config.with_failure_dir(dir);
                }
                let registry = workloads::builtin(&world.phase_log);
                world
                    .workers
                    .push(WorkerRuntime::new(Arc::clone(&worker), registry, worker_config)?);

                worker.start();
                world.coordinator.register_worker(address)?;
                world.routers.push(worker);
            }

            agent.start();
            world.routers.push(agent);
        }
        root.start();

        info!(
            agents = config.num_agents,
            workers = world.workers.len(),
            link = ?config.link,
            seed = config.seed,
            "cluster up"
        );
        Ok(world)
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<Coordinator<TokioContext>> {
        &self.coordinator
    }

    pub fn agents(&self) -> &[Arc<AgentRuntime<TokioContext>>] {
        &self.agents
    }

    pub fn workers(&self) -> &[Arc<WorkerRuntime<TokioContext>>] {
        &self.workers
    }

    /// Workers currently known to the coordinator, in address order.
    pub fn worker_addresses(&self) -> Vec<SimulatorAddress> {
        self.coordinator.registry().workers()
    }

    pub fn phase_log(&self) -> &PhaseLog {
        &self.phase_log
    }

    /// Cuts the agent's link to a worker. False if the link is not a channel.
    pub fn sever_worker(&self, worker: SimulatorAddress) -> bool {
        match self.worker_links.get(&worker) {
            Some(link) => {
                link.sever();
                true
            }
            None => false,
        }
    }

    pub fn heal_worker(&self, worker: SimulatorAddress) -> bool {
        match self.worker_links.get(&worker) {
            Some(link) => {
                link.heal();
                true
            }
            None => false,
        }
    }

    /// Delays every frame from the agent to a worker.
    pub fn set_worker_latency(&self, worker: SimulatorAddress, latency: Duration) -> bool {
        match self.worker_links.get(&worker) {
            Some(link) => {
                link.set_latency(latency);
                true
            }
            None => false,
        }
    }

    /// Terminates the cluster through the coordinator, then stops every router.
    pub async fn shutdown(&self, graceful: bool) {
        for (agent, result) in self.coordinator.terminate(graceful).await {
            if let Err(e) = result.and_then(|reply| reply.into_result()) {
                warn!(%agent, error = %e, "agent did not confirm termination");
            }
        }
        for router in &self.routers {
            router.shutdown();
        }
        debug!("cluster down");
    }
}

/// Links `child` below `parent`. Returns the downward link in channel mode.
async fn connect(
    kind: LinkKind,
    parent: &Arc<Router<TokioContext>>,
    child: &Arc<Router<TokioContext>>,
) -> Result<Option<Arc<ChannelLink>>, SimError> {
    match kind {
        LinkKind::Channel => {
            let down = ChannelLink::new(child.local(), child.inbox_sender());
            parent.add_child(down.clone());
            child.set_parent(ChannelLink::new(parent.local(), parent.inbox_sender()));
            Ok(Some(down))
        }
        LinkKind::Tcp => {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let addr = listener.local_addr()?;
            let (down, up) = tokio::try_join!(
                TcpLink::accept(&listener, parent.local(), parent.inbox_sender()),
                TcpLink::connect(addr, child.local(), child.inbox_sender()),
            )?;
            parent.add_child(down);
            child.set_parent(up);
            Ok(None)
        }
    }
}
