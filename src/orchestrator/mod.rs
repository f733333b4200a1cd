//! Master-side run driver.
//!
//! [`run_fleet`] walks one run through its phases: wait-up, version gate,
//! arm, optional route setup, optional service check, benchmark execute,
//! collect. A phase that does not reach full success stops the sequence
//! but still yields a [`RunResult`] describing how far the fleet got and
//! what was collected; teardown (ABORT broadcast) is unconditional.

mod consolidate;
mod scheduler;
mod state;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::broker::{Broker, TopicMode, Topics};
use crate::error::{AppError, AppResult, ConfigError, PhaseError};
use crate::tools::tool_for;
use crate::wire::{BenchRequest, Operation, RouteSpec};

pub use consolidate::{Consolidator, ToolConsolidator};
pub use scheduler::{ExpectedAgents, Scheduler};
pub use state::{AgentEntry, AgentState, PhaseCounts};

#[derive(Debug, Clone)]
pub struct FleetRunConfig {
    pub run_id: String,
    pub topic_mode: TopicMode,
    pub expected: ExpectedAgents,
    pub sender_id: String,
    /// Minimum agent build tag; `None` skips the version gate.
    pub required_build_tag: Option<String>,
    /// Static route injected on every agent before benchmarking.
    pub route: Option<RouteSpec>,
    /// URL each agent must see responding before benchmarking.
    pub service_url: Option<String>,
    pub bench: BenchRequest,
    pub agents_up_timeout: Duration,
    pub phase_timeout: Duration,
    pub poll_interval: Duration,
}

/// What a run produced, successful or not. Immutable once returned.
#[derive(Debug, Serialize)]
pub struct RunResult {
    pub agents: BTreeMap<String, AgentEntry>,
    pub samples: Vec<(String, Value)>,
    pub consolidated: Option<Value>,
    /// First phase that did not reach full success, if any.
    pub failed_phase: Option<&'static str>,
    /// Counts of the last phase that ran.
    pub last_counts: PhaseCounts,
}

struct PhaseOutcome {
    failed_phase: Option<&'static str>,
    consolidated: Option<Value>,
    last_counts: PhaseCounts,
}

/// Drives one full run.
///
/// # Errors
///
/// Infrastructure failures (broker gone, bad config, version mismatch,
/// dispatch to an unarmed agent) surface as errors; phase failures do not,
/// they are reported through [`RunResult::failed_phase`].
pub async fn run_fleet(broker: Arc<dyn Broker>, config: FleetRunConfig) -> AppResult<RunResult> {
    let topics = Topics::new(&config.run_id, config.topic_mode);
    let mut scheduler = Scheduler::new(
        broker,
        topics,
        config.expected.clone(),
        &config.sender_id,
        config.poll_interval,
    )
    .await?;

    let outcome = drive_phases(&mut scheduler, &config).await;
    scheduler.abort().await;
    let outcome = outcome?;

    let (agents, samples) = scheduler.into_parts();
    Ok(RunResult {
        agents,
        samples,
        consolidated: outcome.consolidated,
        failed_phase: outcome.failed_phase,
        last_counts: outcome.last_counts,
    })
}

async fn drive_phases(
    scheduler: &mut Scheduler,
    config: &FleetRunConfig,
) -> AppResult<PhaseOutcome> {
    let mut last_counts = scheduler.wait_for_agents_up(config.agents_up_timeout).await;
    if !last_counts.all_succeeded() {
        warn!(
            "{}",
            PhaseError::AgentsNotReady {
                succeeded: last_counts.succeeded,
                failed: last_counts.failed,
                pending: last_counts.pending,
            }
        );
        return Ok(PhaseOutcome {
            failed_phase: Some("wait-up"),
            consolidated: None,
            last_counts,
        });
    }

    if let Some(required) = &config.required_build_tag {
        scheduler.check_version(required).map_err(AppError::phase)?;
    }

    scheduler.arm().await?;

    if let Some(route) = &config.route {
        last_counts = scheduler
            .dispatch_and_await(
                Operation::SetupStaticRoute(route.clone()),
                config.phase_timeout,
                None,
            )
            .await?;
        if !last_counts.all_succeeded() {
            warn!(
                "{}",
                PhaseError::RouteSetup {
                    succeeded: last_counts.succeeded,
                    failed: last_counts.failed,
                    pending: last_counts.pending,
                }
            );
            return Ok(PhaseOutcome {
                failed_phase: Some("route-setup"),
                consolidated: None,
                last_counts,
            });
        }
        scheduler.rearm();
    }

    if let Some(url) = &config.service_url {
        last_counts = scheduler
            .dispatch_and_await(
                Operation::CheckHttpService {
                    url: url.clone(),
                    timeout_ms: duration_ms(config.phase_timeout),
                },
                config.phase_timeout,
                None,
            )
            .await?;
        if !last_counts.all_succeeded() {
            warn!(
                "{}",
                PhaseError::ServiceNotUp {
                    succeeded: last_counts.succeeded,
                    failed: last_counts.failed,
                    pending: last_counts.pending,
                }
            );
            return Ok(PhaseOutcome {
                failed_phase: Some("service-check"),
                consolidated: None,
                last_counts,
            });
        }
        scheduler.rearm();
    }

    let tool = tool_for(&config.bench.tool).ok_or_else(|| {
        AppError::config(ConfigError::BadBenchSpec {
            tool: "bench",
            message: format!("unknown tool {}", config.bench.tool),
        })
    })?;
    let mut consolidator = ToolConsolidator::new(tool);
    last_counts = scheduler
        .dispatch_and_await(
            Operation::RunBench(config.bench.clone()),
            config.phase_timeout,
            Some(&mut consolidator),
        )
        .await?;

    // Collect: the final consolidation runs over the full report history,
    // even when some agents failed or timed out.
    let consolidated = Some(consolidator.finalize(scheduler.samples()));
    if last_counts.all_succeeded() {
        info!("Run complete: {} agents succeeded", last_counts.succeeded);
        Ok(PhaseOutcome {
            failed_phase: None,
            consolidated,
            last_counts,
        })
    } else {
        warn!(
            "{}",
            PhaseError::BenchmarkIncomplete {
                succeeded: last_counts.succeeded,
                failed: last_counts.failed,
                pending: last_counts.pending,
            }
        );
        Ok(PhaseOutcome {
            failed_phase: Some("execute"),
            consolidated,
            last_counts,
        })
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::wire::{
        DoneMessage, DonePayload, ReadyMessage, ReadyPayload, ReportMessage, ReportPayload,
        WireMessage,
    };

    fn run_config(expected: usize) -> FleetRunConfig {
        FleetRunConfig {
            run_id: "run-1".to_owned(),
            topic_mode: TopicMode::Fleet,
            expected: ExpectedAgents::Count(expected),
            sender_id: "orchestrator".to_owned(),
            required_build_tag: Some("0.3.0".to_owned()),
            route: None,
            service_url: None,
            bench: BenchRequest {
                tool: "http".to_owned(),
                spec: json!({"url": "http://10.0.0.2/"}),
            },
            agents_up_timeout: Duration::from_secs(5),
            phase_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
        }
    }

    /// Minimal in-process agent: READY at start, REPORT + DONE on EXEC,
    /// stops on ABORT.
    async fn scripted_agent(broker: MemoryBroker, agent_id: &'static str, status: i64) {
        let Ok(mut ctl) = broker.subscribe("run-1:ctl").await else {
            return;
        };
        let ready = WireMessage::Ready(ReadyMessage {
            sender_id: agent_id.to_owned(),
            client_type: Some("http".to_owned()),
            data: ReadyPayload {
                build_tag: "0.3.2".to_owned(),
            },
        });
        if broker.publish("run-1:rpt", &ready).await.is_err() {
            return;
        }
        while let Some(message) = ctl.recv().await {
            match message {
                WireMessage::Exec(_exec) => {
                    let report = WireMessage::Report(ReportMessage {
                        sender_id: agent_id.to_owned(),
                        client_type: Some("http".to_owned()),
                        data: ReportPayload {
                            tool: "http".to_owned(),
                            record: json!({"http_rps": 100}),
                        },
                    });
                    if broker.publish("run-1:rpt", &report).await.is_err() {
                        return;
                    }
                    let done = WireMessage::Done(DoneMessage {
                        sender_id: agent_id.to_owned(),
                        client_type: Some("http".to_owned()),
                        data: DonePayload {
                            status,
                            stdout: String::new(),
                            stderr: String::new(),
                        },
                    });
                    if broker.publish("run-1:rpt", &done).await.is_err() {
                        return;
                    }
                }
                WireMessage::Abort(_) => return,
                _other => {}
            }
        }
    }

    #[tokio::test]
    async fn full_run_with_one_failing_agent_keeps_partial_results() -> AppResult<()> {
        let broker = MemoryBroker::new();
        tokio::spawn(scripted_agent(broker.clone(), "a", 0));
        tokio::spawn(scripted_agent(broker.clone(), "b", 0));
        tokio::spawn(scripted_agent(broker.clone(), "c", 1));

        let result = run_fleet(Arc::new(broker), run_config(3)).await?;
        if result.last_counts.succeeded != 2 || result.last_counts.failed != 1 {
            return Err(AppError::broker(format!(
                "Unexpected counts: {:?}",
                result.last_counts
            )));
        }
        if result.agents.len() != 3 || result.failed_phase != Some("execute") {
            return Err(AppError::broker(format!(
                "Unexpected result shape: {} agents, failed phase {:?}",
                result.agents.len(),
                result.failed_phase
            )));
        }
        let failed = result
            .agents
            .values()
            .filter(|entry| entry.state == AgentState::Failed)
            .count();
        if failed != 1 {
            return Err(AppError::broker(format!("Expected 1 failed, got {}", failed)));
        }
        // Samples from all three agents were still consolidated.
        match result.consolidated {
            Some(merged) if merged.get("http_rps").and_then(Value::as_u64) == Some(300) => Ok(()),
            other => Err(AppError::broker(format!("Unexpected consolidation: {:?}", other))),
        }
    }

    #[tokio::test]
    async fn missing_agents_fail_the_wait_up_phase() -> AppResult<()> {
        let broker = MemoryBroker::new();
        tokio::spawn(scripted_agent(broker.clone(), "a", 0));
        let mut config = run_config(2);
        config.agents_up_timeout = Duration::from_millis(200);
        let result = run_fleet(Arc::new(broker), config).await?;
        if result.failed_phase != Some("wait-up") || result.last_counts.pending != 1 {
            return Err(AppError::broker(format!(
                "Unexpected result: {:?} {:?}",
                result.failed_phase, result.last_counts
            )));
        }
        Ok(())
    }

    #[tokio::test]
    async fn old_agent_build_aborts_before_benchmarking() -> AppResult<()> {
        let broker = MemoryBroker::new();
        tokio::spawn(scripted_agent(broker.clone(), "a", 0));
        let mut config = run_config(1);
        config.required_build_tag = Some("9.9.9".to_owned());
        let result = run_fleet(Arc::new(broker), config).await;
        match result {
            Err(AppError::Phase(PhaseError::VersionMismatch { .. })) => Ok(()),
            _other => Err(AppError::broker("Expected a version mismatch".to_owned())),
        }
    }
}
