use clap::Parser;

use crate::error::ConfigError;
use crate::wire::RouteSpec;

#[derive(Debug, Parser, Clone)]
#[clap(
    version,
    about = "Distributed network/HTTP benchmark orchestration - drives a fleet of agents through phased runs over a pub/sub broker and aggregates streamed results."
)]
pub struct FleetArgs {
    /// Broker address to connect to (host:port)
    #[arg(long, env = "FLEETMARK_BROKER")]
    pub broker: Option<String>,

    /// Run an embedded broker listening on this address
    #[arg(long = "broker-listen")]
    pub broker_listen: Option<String>,

    /// Join the fleet as an agent with this id
    #[arg(long = "agent-join")]
    pub agent_join: Option<String>,

    /// Client type tag advertised by an agent (http, udp)
    #[arg(long = "client-type")]
    pub client_type: Option<String>,

    /// Run identifier shared by the orchestrator and its agents
    #[arg(long = "run-id")]
    pub run_id: Option<String>,

    /// Benchmark tool to run (http, udp)
    #[arg(long)]
    pub tool: Option<String>,

    /// Expected number of agents
    #[arg(long)]
    pub agents: Option<usize>,

    /// Explicit agent name (repeatable); required for per-agent topics
    #[arg(long = "agent-name")]
    pub agent_names: Vec<String>,

    /// Use a dedicated control/report topic pair per agent
    #[arg(long = "per-agent-topics")]
    pub per_agent_topics: bool,

    /// Target URL for the HTTP benchmark and the pre-run service check
    #[arg(long, short)]
    pub url: Option<String>,

    /// Benchmark spec overrides as inline JSON
    #[arg(long = "bench-spec")]
    pub bench_spec: Option<String>,

    /// Static route to inject on agents first, as dest_cidr,gateway[,device]
    #[arg(long)]
    pub route: Option<String>,

    /// Skip the pre-benchmark HTTP service check
    #[arg(long = "no-service-check")]
    pub no_service_check: bool,

    /// Minimum agent build tag accepted by the version gate
    #[arg(long = "require-build")]
    pub require_build: Option<String>,

    /// Timeout for all agents to come up (seconds)
    #[arg(long = "agents-up-timeout")]
    pub agents_up_timeout_sec: Option<u64>,

    /// Per-phase timeout (seconds)
    #[arg(long = "phase-timeout")]
    pub phase_timeout_sec: Option<u64>,

    /// Scheduler polling interval (milliseconds)
    #[arg(long = "poll-interval")]
    pub poll_interval_ms: Option<u64>,

    /// Agent READY heartbeat interval (milliseconds)
    #[arg(long = "heartbeat-interval")]
    pub heartbeat_interval_ms: Option<u64>,

    /// Timeout for a single operation on an agent (seconds)
    #[arg(long = "op-timeout")]
    pub op_timeout_sec: Option<u64>,

    /// Config file path (.toml or .json)
    #[arg(long, short)]
    pub config: Option<String>,

    /// Verbose logging
    #[arg(long, short)]
    pub verbose: bool,
}

/// Parses a `dest_cidr,gateway[,device]` route flag.
///
/// # Errors
///
/// Returns `ConfigError::InvalidRoute` when the spec has the wrong shape.
pub fn parse_route(value: &str) -> Result<RouteSpec, ConfigError> {
    let mut parts = value.split(',').map(str::trim);
    let (Some(dest_cidr), Some(gateway)) = (parts.next(), parts.next()) else {
        return Err(ConfigError::InvalidRoute {
            value: value.to_owned(),
        });
    };
    let device = parts.next().map(str::to_owned);
    if dest_cidr.is_empty() || gateway.is_empty() || parts.next().is_some() {
        return Err(ConfigError::InvalidRoute {
            value: value.to_owned(),
        });
    }
    Ok(RouteSpec {
        dest_cidr: dest_cidr.to_owned(),
        gateway: gateway.to_owned(),
        device,
    })
}
