//! Remote-resident agent: announces readiness, waits for the arm
//! handshake, executes operations on command, and streams reports.
//!
//! The agent runs two concurrent activities until it is armed: the main
//! blocking listen loop on its control topic, and a timer-driven READY
//! heartbeat. The heartbeat task is cancelled outright when ACK arrives.
//! During an EXEC, the main loop keeps listening so an ABORT can cancel
//! the running operation; every EXEC produces exactly one DONE.

mod ops;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::broker::{Broker, TcpBroker, TopicMode, Topics};
use crate::error::AppResult;
use crate::retry::RetryPolicy;
use crate::session::{Endpoint, Session};
use crate::wire::{
    DebugMessage, DebugPayload, DoneMessage, DonePayload, ReadyMessage, ReadyPayload,
    ReportMessage, ReportPayload, WireMessage,
};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    pub client_type: Option<String>,
    pub build_tag: String,
    pub run_id: String,
    pub topic_mode: TopicMode,
    pub heartbeat_interval: Duration,
    pub op_timeout: Duration,
    pub reconnect_wait: Duration,
}

/// Runs the agent against a TCP broker forever, reconnecting with
/// unbounded retry whenever the control session ends. Broker outages are
/// a delay, never a failure.
///
/// # Errors
///
/// Only configuration-level failures surface; connection loss does not.
pub async fn run_agent(broker_addr: &str, config: AgentConfig) -> AppResult<()> {
    loop {
        let policy = RetryPolicy::unbounded(config.reconnect_wait);
        let broker = TcpBroker::connect(broker_addr, policy).await?;
        let broker: Arc<dyn Broker> = Arc::new(broker);
        match run_agent_session(broker, &config).await {
            Ok(()) => info!("Control session ended; reconnecting"),
            Err(err) => warn!("Control session error: {}; reconnecting", err),
        }
        tokio::time::sleep(config.reconnect_wait).await;
    }
}

/// One control session: heartbeat until armed, then serve EXECs until the
/// broker goes away or an ABORT resets the agent.
///
/// # Errors
///
/// Returns an error when the broker rejects a subscribe or publish.
pub async fn run_agent_session(broker: Arc<dyn Broker>, config: &AgentConfig) -> AppResult<()> {
    let topics = Topics::new(&config.run_id, config.topic_mode);
    let mut ctl = broker.subscribe(&topics.agent_control(&config.agent_id)).await?;
    let publisher = AgentPublisher {
        broker: Arc::clone(&broker),
        topic: topics.agent_report(&config.agent_id),
        agent_id: config.agent_id.clone(),
        client_type: config.client_type.clone(),
    };

    let mut heartbeat = Some(spawn_heartbeat(
        publisher.clone(),
        config.build_tag.clone(),
        config.heartbeat_interval,
    ));
    let mut armed = false;
    let mut session = Session::open(Endpoint::Local);

    let result = loop {
        let Some(message) = ctl.recv().await else {
            break Ok(());
        };
        match message {
            WireMessage::Ack(_) => {
                if let Some(handle) = heartbeat.take() {
                    handle.abort();
                }
                if !armed {
                    armed = true;
                    info!("Armed by orchestrator");
                }
            }
            WireMessage::Abort(_) => {
                info!("Abort received while idle; resetting");
                break Ok(());
            }
            WireMessage::Exec(exec) => {
                if !armed {
                    debug!("EXEC before ACK ignored");
                    publisher.debug("EXEC received before ACK, ignored").await?;
                    continue;
                }
                let operation_name = exec.data.name();
                info!("Executing {}", operation_name);

                let (abort_tx, abort_rx) = watch::channel(false);
                let (interim_tx, mut interim_rx) = mpsc::unbounded_channel::<ReportPayload>();
                let forwarder = tokio::spawn({
                    let publisher = publisher.clone();
                    async move {
                        while let Some(payload) = interim_rx.recv().await {
                            if publisher.report(payload).await.is_err() {
                                break;
                            }
                        }
                    }
                });

                let mut aborted = false;
                let mut ctl_open = true;
                let done = {
                    let operation = ops::execute_operation(
                        &mut session,
                        exec.data,
                        config.op_timeout,
                        abort_rx,
                        &interim_tx,
                    );
                    tokio::pin!(operation);
                    loop {
                        tokio::select! {
                            payload = &mut operation => break payload,
                            control = ctl.recv(), if ctl_open => match control {
                                Some(WireMessage::Abort(_)) => {
                                    info!("Abort received during {}", operation_name);
                                    aborted = true;
                                    if abort_tx.send(true).is_err() {
                                        // Operation already finished.
                                    }
                                }
                                Some(other) => debug!(
                                    "Ignoring {} during {}",
                                    other.verb(),
                                    operation_name
                                ),
                                None => {
                                    // No ABORT can arrive on a closed
                                    // channel; cancel and stop selecting
                                    // on it.
                                    ctl_open = false;
                                    aborted = true;
                                    if abort_tx.send(true).is_err() {}
                                }
                            }
                        }
                    }
                };
                drop(interim_tx);
                forwarder.await?;
                info!("{} finished with status {}", operation_name, done.status);
                publisher.done(done).await?;
                if aborted {
                    break Ok(());
                }
            }
            other => debug!("Ignoring {} on control topic", other.verb()),
        }
    };

    if let Some(handle) = heartbeat.take() {
        handle.abort();
    }
    result
}

fn spawn_heartbeat(
    publisher: AgentPublisher,
    build_tag: String,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if publisher.ready(&build_tag).await.is_err() {
                break;
            }
            tokio::time::sleep(interval).await;
        }
    })
}

#[derive(Clone)]
struct AgentPublisher {
    broker: Arc<dyn Broker>,
    topic: String,
    agent_id: String,
    client_type: Option<String>,
}

impl AgentPublisher {
    async fn ready(&self, build_tag: &str) -> AppResult<()> {
        let message = WireMessage::Ready(ReadyMessage {
            sender_id: self.agent_id.clone(),
            client_type: self.client_type.clone(),
            data: ReadyPayload {
                build_tag: build_tag.to_owned(),
            },
        });
        self.broker.publish(&self.topic, &message).await
    }

    async fn report(&self, payload: ReportPayload) -> AppResult<()> {
        let message = WireMessage::Report(ReportMessage {
            sender_id: self.agent_id.clone(),
            client_type: self.client_type.clone(),
            data: payload,
        });
        self.broker.publish(&self.topic, &message).await
    }

    async fn done(&self, payload: DonePayload) -> AppResult<()> {
        let message = WireMessage::Done(DoneMessage {
            sender_id: self.agent_id.clone(),
            client_type: self.client_type.clone(),
            data: payload,
        });
        self.broker.publish(&self.topic, &message).await
    }

    async fn debug(&self, text: &str) -> AppResult<()> {
        let message = WireMessage::Debug(DebugMessage {
            sender_id: self.agent_id.clone(),
            client_type: self.client_type.clone(),
            data: DebugPayload {
                message: text.to_owned(),
            },
        });
        self.broker.publish(&self.topic, &message).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::error::AppError;
    use crate::wire::{AbortMessage, AckMessage, BenchRequest, ExecMessage, Operation};

    fn test_config() -> AgentConfig {
        AgentConfig {
            agent_id: "agent-1".to_owned(),
            client_type: Some("http".to_owned()),
            build_tag: "0.3.2".to_owned(),
            run_id: "run-1".to_owned(),
            topic_mode: TopicMode::Fleet,
            heartbeat_interval: Duration::from_millis(50),
            op_timeout: Duration::from_secs(10),
            reconnect_wait: Duration::from_millis(50),
        }
    }

    fn ack() -> WireMessage {
        WireMessage::Ack(AckMessage {
            sender_id: "orchestrator".to_owned(),
            client_type: None,
            data: Value::Null,
        })
    }

    fn exec(operation: Operation) -> WireMessage {
        WireMessage::Exec(ExecMessage {
            sender_id: "orchestrator".to_owned(),
            client_type: None,
            data: operation,
        })
    }

    async fn next_verb(
        sub: &mut crate::broker::Subscription,
        wanted: &str,
    ) -> AppResult<WireMessage> {
        let deadline = tokio::time::Instant::now()
            .checked_add(Duration::from_secs(5))
            .unwrap_or_else(tokio::time::Instant::now);
        loop {
            let message = tokio::time::timeout_at(deadline, sub.recv())
                .await
                .map_err(|_elapsed| AppError::broker(format!("No {} in time", wanted)))?
                .ok_or_else(|| AppError::broker("Report topic closed".to_owned()))?;
            if message.verb() == wanted {
                return Ok(message);
            }
        }
    }

    #[tokio::test]
    async fn heartbeat_repeats_until_ack_then_stops() -> AppResult<()> {
        let broker = MemoryBroker::new();
        let mut rpt = broker.subscribe("run-1:rpt").await?;
        let session_broker: Arc<dyn Broker> = Arc::new(broker.clone());
        let agent = tokio::spawn(async move {
            run_agent_session(session_broker, &test_config()).await
        });

        next_verb(&mut rpt, "READY").await?;
        next_verb(&mut rpt, "READY").await?;
        broker.publish("run-1:ctl", &ack()).await?;
        // Let the heartbeat cancellation land, then drain the backlog.
        tokio::time::sleep(Duration::from_millis(200)).await;
        while rpt.poll().is_some() {}
        tokio::time::sleep(Duration::from_millis(200)).await;
        if rpt.poll().is_some() {
            return Err(AppError::broker("Heartbeat survived ACK".to_owned()));
        }
        agent.abort();
        Ok(())
    }

    #[tokio::test]
    async fn unknown_tool_yields_exactly_one_done_127() -> AppResult<()> {
        let broker = MemoryBroker::new();
        let mut rpt = broker.subscribe("run-1:rpt").await?;
        let session_broker: Arc<dyn Broker> = Arc::new(broker.clone());
        let agent = tokio::spawn(async move {
            run_agent_session(session_broker, &test_config()).await
        });

        next_verb(&mut rpt, "READY").await?;
        broker.publish("run-1:ctl", &ack()).await?;
        broker
            .publish(
                "run-1:ctl",
                &exec(Operation::RunBench(BenchRequest {
                    tool: "iperf".to_owned(),
                    spec: json!({}),
                })),
            )
            .await?;

        let done = next_verb(&mut rpt, "DONE").await?;
        match done {
            WireMessage::Done(done) if done.data.status == 127 => {}
            other => {
                return Err(AppError::broker(format!("Unexpected: {}", other.verb())));
            }
        }
        // No second DONE follows.
        tokio::time::sleep(Duration::from_millis(200)).await;
        while let Some(extra) = rpt.poll() {
            if extra.verb() == "DONE" {
                return Err(AppError::broker("Duplicate DONE".to_owned()));
            }
        }
        agent.abort();
        Ok(())
    }

    #[tokio::test]
    async fn exec_before_ack_is_ignored_with_a_debug() -> AppResult<()> {
        let broker = MemoryBroker::new();
        let mut rpt = broker.subscribe("run-1:rpt").await?;
        let session_broker: Arc<dyn Broker> = Arc::new(broker.clone());
        let agent = tokio::spawn(async move {
            run_agent_session(session_broker, &test_config()).await
        });

        next_verb(&mut rpt, "READY").await?;
        broker
            .publish(
                "run-1:ctl",
                &exec(Operation::RunBench(BenchRequest {
                    tool: "http".to_owned(),
                    spec: json!({"url": "http://example.invalid/"}),
                })),
            )
            .await?;
        next_verb(&mut rpt, "DEBUG").await?;
        agent.abort();
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn abort_during_exec_cancels_and_reports_done() -> AppResult<()> {
        let dir = tempfile::tempdir()?;
        let script = dir.path().join("slow-driver");
        tokio::fs::write(&script, "#!/bin/sh\nsleep 30\n").await?;
        make_executable(&script)?;

        let broker = MemoryBroker::new();
        let mut rpt = broker.subscribe("run-1:rpt").await?;
        let session_broker: Arc<dyn Broker> = Arc::new(broker.clone());
        let agent = tokio::spawn(async move {
            run_agent_session(session_broker, &test_config()).await
        });

        next_verb(&mut rpt, "READY").await?;
        broker.publish("run-1:ctl", &ack()).await?;
        broker
            .publish(
                "run-1:ctl",
                &exec(Operation::RunBench(BenchRequest {
                    tool: "http".to_owned(),
                    spec: json!({
                        "url": "http://example.invalid/",
                        "program": script.display().to_string(),
                    }),
                })),
            )
            .await?;
        tokio::time::sleep(Duration::from_millis(300)).await;
        broker
            .publish(
                "run-1:ctl",
                &WireMessage::Abort(AbortMessage {
                    sender_id: "orchestrator".to_owned(),
                    client_type: None,
                    data: Value::Null,
                }),
            )
            .await?;

        let done = next_verb(&mut rpt, "DONE").await?;
        match done {
            WireMessage::Done(done) if done.data.status == 130 => {}
            WireMessage::Done(done) => {
                return Err(AppError::broker(format!(
                    "Unexpected status {}",
                    done.data.status
                )));
            }
            other => {
                return Err(AppError::broker(format!("Unexpected: {}", other.verb())));
            }
        }
        // The session ends after an abort, back to reconnect-and-ready.
        let ended = tokio::time::timeout(Duration::from_secs(5), agent).await;
        match ended {
            Ok(Ok(Ok(()))) => Ok(()),
            other => Err(AppError::broker(format!("Session did not end: {:?}", other.is_ok()))),
        }
    }

    /// Hands the test the raw sender behind the agent's control
    /// subscription so the channel can be closed mid-run.
    #[cfg(unix)]
    struct DetachableCtl {
        inner: MemoryBroker,
        ctl_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<WireMessage>>>,
    }

    #[cfg(unix)]
    #[async_trait::async_trait]
    impl Broker for DetachableCtl {
        async fn publish(&self, topic: &str, message: &WireMessage) -> AppResult<()> {
            self.inner.publish(topic, message).await
        }

        async fn subscribe(&self, topic: &str) -> AppResult<crate::broker::Subscription> {
            if topic == "run-1:ctl" {
                let (tx, rx) = mpsc::unbounded_channel();
                let Ok(mut slot) = self.ctl_tx.lock() else {
                    return Err(AppError::broker("Control slot poisoned".to_owned()));
                };
                *slot = Some(tx);
                return Ok(crate::broker::Subscription::new(rx));
            }
            self.inner.subscribe(topic).await
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn closed_control_channel_cancels_a_running_exec() -> AppResult<()> {
        let dir = tempfile::tempdir()?;
        let script = dir.path().join("slow-driver");
        tokio::fs::write(&script, "#!/bin/sh\nsleep 30\n").await?;
        make_executable(&script)?;

        let inner = MemoryBroker::new();
        let mut rpt = inner.subscribe("run-1:rpt").await?;
        let broker = Arc::new(DetachableCtl {
            inner,
            ctl_tx: std::sync::Mutex::new(None),
        });
        let session_broker: Arc<dyn Broker> = Arc::clone(&broker) as Arc<dyn Broker>;
        let agent = tokio::spawn(async move {
            run_agent_session(session_broker, &test_config()).await
        });

        next_verb(&mut rpt, "READY").await?;
        let ctl_tx = {
            let Ok(mut slot) = broker.ctl_tx.lock() else {
                return Err(AppError::broker("Control slot poisoned".to_owned()));
            };
            slot.take()
        }
        .ok_or_else(|| AppError::broker("Agent never subscribed".to_owned()))?;

        ctl_tx
            .send(ack())
            .map_err(|_err| AppError::broker("Control send failed".to_owned()))?;
        ctl_tx
            .send(exec(Operation::RunBench(BenchRequest {
                tool: "http".to_owned(),
                spec: json!({
                    "url": "http://example.invalid/",
                    "program": script.display().to_string(),
                }),
            })))
            .map_err(|_err| AppError::broker("Control send failed".to_owned()))?;
        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(ctl_tx);

        let done = next_verb(&mut rpt, "DONE").await?;
        match done {
            WireMessage::Done(done) if done.data.status == 130 => {}
            WireMessage::Done(done) => {
                return Err(AppError::broker(format!(
                    "Unexpected status {}",
                    done.data.status
                )));
            }
            other => {
                return Err(AppError::broker(format!("Unexpected: {}", other.verb())));
            }
        }
        let ended = tokio::time::timeout(Duration::from_secs(5), agent).await;
        match ended {
            Ok(Ok(Ok(()))) => Ok(()),
            other => Err(AppError::broker(format!(
                "Session did not end: {:?}",
                other.is_ok()
            ))),
        }
    }

    #[cfg(unix)]
    fn make_executable(path: &std::path::Path) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
    }
}
