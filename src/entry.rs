//! CLI entry: turns parsed flags plus config into one of three run plans
//! (embedded broker, agent, orchestrator) and executes it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use serde_json::{Map, Value, json};
use tracing::warn;
use url::Url;

use crate::agent::{AgentConfig, run_agent};
use crate::args::{FleetArgs, parse_route};
use crate::broker::{TcpBroker, TopicMode, bind_broker, run_broker};
use crate::config::{ConfigFile, apply_config, load_config};
use crate::error::{AppError, AppResult, ConfigError, PhaseError};
use crate::orchestrator::{ExpectedAgents, FleetRunConfig, PhaseCounts, RunResult, run_fleet};
use crate::retry::RetryPolicy;
use crate::wire::BenchRequest;

const DEFAULT_AGENTS_UP_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2000);
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(300);
const AGENT_RECONNECT_WAIT: Duration = Duration::from_secs(2);
const BROKER_CONNECT_RETRIES: u32 = 30;
const BROKER_CONNECT_WAIT: Duration = Duration::from_millis(500);

enum RunPlan {
    Broker {
        listen: String,
    },
    Agent {
        broker: String,
        agent: AgentConfig,
    },
    Orchestrate {
        broker: Option<String>,
        listen: Option<String>,
        fleet: FleetRunConfig,
    },
}

/// Parses the CLI, initializes logging, and runs the selected role on a
/// fresh multi-threaded runtime.
///
/// # Errors
///
/// Surfaces config, broker, and run failures; a run that ends with a
/// failed phase exits non-zero.
pub fn run() -> AppResult<()> {
    let args = FleetArgs::parse();
    crate::logger::init_logging(args.verbose);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run_async(args))
}

async fn run_async(mut args: FleetArgs) -> AppResult<()> {
    let config = load_config(args.config.as_deref())?;
    if let Some(config) = &config {
        apply_config(&mut args, config);
    }
    let plan = build_plan(&args, config.as_ref())?;
    execute_plan(plan).await
}

fn build_plan(args: &FleetArgs, config: Option<&ConfigFile>) -> AppResult<RunPlan> {
    let topic_mode = if args.per_agent_topics {
        TopicMode::PerAgent
    } else {
        TopicMode::Fleet
    };
    let run_id = args
        .run_id
        .clone()
        .unwrap_or_else(|| format!("run-{}", Utc::now().format("%Y%m%d-%H%M%S")));

    if let Some(agent_id) = args.agent_join.clone() {
        let broker = args
            .broker
            .clone()
            .ok_or_else(|| AppError::config(ConfigError::MissingBroker))?;
        return Ok(RunPlan::Agent {
            broker,
            agent: AgentConfig {
                agent_id,
                client_type: args.client_type.clone(),
                build_tag: env!("CARGO_PKG_VERSION").to_owned(),
                run_id,
                topic_mode,
                heartbeat_interval: millis_or(
                    args.heartbeat_interval_ms,
                    DEFAULT_HEARTBEAT_INTERVAL,
                ),
                op_timeout: secs_or(args.op_timeout_sec, DEFAULT_OP_TIMEOUT),
                reconnect_wait: AGENT_RECONNECT_WAIT,
            },
        });
    }

    if let Some(listen) = args.broker_listen.clone() {
        if args.agents.is_none() && args.agent_names.is_empty() {
            return Ok(RunPlan::Broker { listen });
        }
    }

    let expected = if args.agent_names.is_empty() {
        ExpectedAgents::Count(
            args.agents
                .ok_or_else(|| AppError::config(ConfigError::NoAgentsExpected))?,
        )
    } else {
        ExpectedAgents::Names(args.agent_names.clone())
    };
    let tool = args.tool.clone().unwrap_or_else(|| "http".to_owned());
    let spec = build_bench_spec(&tool, args, config)?;
    let service_url = if args.no_service_check {
        None
    } else {
        spec.get("url").and_then(Value::as_str).map(str::to_owned)
    };
    let route = args
        .route
        .as_deref()
        .map(parse_route)
        .transpose()
        .map_err(AppError::config)?;

    Ok(RunPlan::Orchestrate {
        broker: args.broker.clone(),
        listen: args.broker_listen.clone(),
        fleet: FleetRunConfig {
            run_id,
            topic_mode,
            expected,
            sender_id: "orchestrator".to_owned(),
            required_build_tag: args.require_build.clone(),
            route,
            service_url,
            bench: BenchRequest { tool, spec },
            agents_up_timeout: secs_or(args.agents_up_timeout_sec, DEFAULT_AGENTS_UP_TIMEOUT),
            phase_timeout: secs_or(args.phase_timeout_sec, DEFAULT_PHASE_TIMEOUT),
            poll_interval: millis_or(args.poll_interval_ms, DEFAULT_POLL_INTERVAL),
        },
    })
}

fn build_bench_spec(
    tool: &str,
    args: &FleetArgs,
    config: Option<&ConfigFile>,
) -> AppResult<Value> {
    let mut spec = Map::new();
    match tool {
        "http" => {
            if let Some(http) = config.map(|config| &config.http) {
                put_u64(&mut spec, "connections", http.connections);
                put_u64(&mut spec, "rate_rps", http.rate_rps);
                put_u64(&mut spec, "duration_sec", http.duration_sec);
                put_u64(&mut spec, "threads", http.threads);
            }
            if let Some(url) = &args.url {
                spec.insert("url".to_owned(), json!(url));
            }
            overlay_inline(&mut spec, args.bench_spec.as_deref())?;
            let url = spec
                .get("url")
                .and_then(Value::as_str)
                .ok_or_else(|| AppError::config(ConfigError::MissingTargetUrl))?;
            Url::parse(url).map_err(|err| {
                AppError::config(ConfigError::InvalidTargetUrl {
                    url: url.to_owned(),
                    source: err,
                })
            })?;
        }
        "udp" => {
            if let Some(udp) = config.map(|config| &config.udp) {
                if let Some(target) = &udp.target {
                    spec.insert("target".to_owned(), json!(target));
                }
                put_u64(&mut spec, "port", udp.port);
                put_u64(&mut spec, "packet_size", udp.packet_size);
                put_u64(&mut spec, "duration_sec", udp.duration_sec);
                put_u64(&mut spec, "min_loss_x100", udp.min_loss_x100);
                put_u64(&mut spec, "max_loss_x100", udp.max_loss_x100);
            }
            overlay_inline(&mut spec, args.bench_spec.as_deref())?;
            if spec.get("target").and_then(Value::as_str).is_none() {
                return Err(AppError::config(ConfigError::BadBenchSpec {
                    tool: "udp",
                    message: "missing string field target".to_owned(),
                }));
            }
        }
        unknown => {
            return Err(AppError::config(ConfigError::UnknownTool {
                tool: unknown.to_owned(),
            }));
        }
    }
    Ok(Value::Object(spec))
}

fn overlay_inline(spec: &mut Map<String, Value>, inline: Option<&str>) -> AppResult<()> {
    let Some(inline) = inline else {
        return Ok(());
    };
    let parsed: Value = serde_json::from_str(inline)?;
    let Some(object) = parsed.as_object() else {
        return Err(AppError::config(ConfigError::BadBenchSpec {
            tool: "bench",
            message: "inline spec must be a JSON object".to_owned(),
        }));
    };
    for (key, value) in object {
        spec.insert(key.clone(), value.clone());
    }
    Ok(())
}

fn put_u64(spec: &mut Map<String, Value>, key: &str, value: Option<u64>) {
    if let Some(value) = value {
        spec.insert(key.to_owned(), json!(value));
    }
}

fn secs_or(value: Option<u64>, default: Duration) -> Duration {
    value.map_or(default, Duration::from_secs)
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map_or(default, Duration::from_millis)
}

async fn execute_plan(plan: RunPlan) -> AppResult<()> {
    match plan {
        RunPlan::Broker { listen } => {
            let listener = bind_broker(&listen).await?;
            run_broker(listener).await
        }
        RunPlan::Agent { broker, agent } => run_agent(&broker, agent).await,
        RunPlan::Orchestrate {
            broker,
            listen,
            fleet,
        } => {
            let mut addr = broker;
            if let Some(listen) = listen {
                let listener = bind_broker(&listen).await?;
                let local = listener.local_addr()?.to_string();
                tokio::spawn(async move {
                    if let Err(err) = run_broker(listener).await {
                        warn!("Embedded broker stopped: {}", err);
                    }
                });
                if addr.is_none() {
                    addr = Some(local);
                }
            }
            let addr = addr.ok_or_else(|| AppError::config(ConfigError::MissingBroker))?;
            let policy = RetryPolicy::bounded(BROKER_CONNECT_RETRIES, BROKER_CONNECT_WAIT);
            let client = TcpBroker::connect(&addr, policy).await?;
            let result = run_fleet(Arc::new(client), fleet).await?;
            print_result(&result)?;
            match result.failed_phase {
                None => Ok(()),
                Some(phase) => Err(AppError::phase(phase_failure(phase, result.last_counts))),
            }
        }
    }
}

fn print_result(result: &RunResult) -> AppResult<()> {
    let document = json!({
        "generated_at": Utc::now().to_rfc3339(),
        "result": result,
    });
    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}

fn phase_failure(phase: &str, counts: PhaseCounts) -> PhaseError {
    let PhaseCounts {
        succeeded,
        failed,
        pending,
    } = counts;
    match phase {
        "wait-up" => PhaseError::AgentsNotReady {
            succeeded,
            failed,
            pending,
        },
        "route-setup" => PhaseError::RouteSetup {
            succeeded,
            failed,
            pending,
        },
        "service-check" => PhaseError::ServiceNotUp {
            succeeded,
            failed,
            pending,
        },
        _ => PhaseError::BenchmarkIncomplete {
            succeeded,
            failed,
            pending,
        },
    }
}
