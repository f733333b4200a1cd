//! Master-side scheduler: dispatches commands, drains report topics with a
//! bounded polling loop, and tracks per-agent lifecycle state.
//!
//! The scheduler never blocks on a receive. Every polling tick drains all
//! report subscriptions to empty, processes what arrived, then sleeps.
//! Ticks run at least once even with a zero timeout, so messages already
//! queued are always observed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::{Broker, Subscription, TopicMode, Topics};
use crate::error::{AppError, AppResult, ConfigError, PhaseError};
use crate::wire::{
    AbortMessage, AckMessage, DonePayload, ExecMessage, Operation, ReadyMessage, WireMessage,
};

use super::consolidate::Consolidator;
use super::state::{AgentEntry, AgentState, PhaseCounts};

/// How the fleet's membership is known up front.
#[derive(Debug, Clone)]
pub enum ExpectedAgents {
    /// Discover agent ids from READY messages; stop at this many.
    Count(usize),
    /// Exact membership, required for per-agent topics.
    Names(Vec<String>),
}

impl ExpectedAgents {
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Count(count) => *count,
            Self::Names(names) => names.len(),
        }
    }
}

pub struct Scheduler {
    broker: Arc<dyn Broker>,
    topics: Topics,
    sender_id: String,
    expected: usize,
    known_names: Vec<String>,
    subs: Vec<Subscription>,
    agents: BTreeMap<String, AgentEntry>,
    samples: Vec<(String, Value)>,
    poll_interval: Duration,
    /// Build tag from the first READY; the whole fleet is assumed to run
    /// one image.
    observed_tag: Option<String>,
}

impl Scheduler {
    /// Subscribes to the run's report topics and prepares agent tracking.
    ///
    /// # Errors
    ///
    /// Rejects an empty fleet and per-agent topics without names.
    pub async fn new(
        broker: Arc<dyn Broker>,
        topics: Topics,
        expected: ExpectedAgents,
        sender_id: &str,
        poll_interval: Duration,
    ) -> AppResult<Self> {
        if expected.count() == 0 {
            return Err(AppError::config(ConfigError::NoAgentsExpected));
        }
        let known_names = match &expected {
            ExpectedAgents::Names(names) => names.clone(),
            ExpectedAgents::Count(_) => {
                if topics.mode() == TopicMode::PerAgent {
                    return Err(AppError::config(ConfigError::PerAgentTopicsNeedNames));
                }
                Vec::new()
            }
        };
        let mut subs = Vec::new();
        for topic in topics.report_topics(&known_names) {
            subs.push(broker.subscribe(&topic).await?);
        }
        let mut agents = BTreeMap::new();
        for name in &known_names {
            agents.insert(name.clone(), AgentEntry::pending());
        }
        Ok(Self {
            broker,
            topics,
            sender_id: sender_id.to_owned(),
            expected: expected.count(),
            known_names,
            subs,
            agents,
            samples: Vec::new(),
            poll_interval,
            observed_tag: None,
        })
    }

    /// Polls until all expected agents have published READY or the timeout
    /// elapses. Duplicate READYs are idempotent.
    pub async fn wait_for_agents_up(&mut self, timeout: Duration) -> PhaseCounts {
        let deadline = deadline_after(timeout);
        loop {
            for message in self.drain() {
                match message {
                    WireMessage::Ready(ready) => self.note_ready(&ready),
                    other => debug!(
                        "Ignoring {} from {} during wait-up",
                        other.verb(),
                        other.sender_id()
                    ),
                }
            }
            let up = self.count_in(AgentState::Ready);
            if up >= self.expected || Instant::now() >= deadline {
                let counts = PhaseCounts {
                    succeeded: up,
                    failed: 0,
                    pending: self.expected.saturating_sub(up),
                };
                info!(
                    "Wait-up finished: {}/{} agents ready",
                    counts.succeeded, self.expected
                );
                return counts;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Compares the fleet's observed build tag against a required minimum.
    /// Checked once, from the first READY seen.
    ///
    /// # Errors
    ///
    /// Returns `PhaseError::VersionMismatch` when the fleet image is older.
    pub fn check_version(&self, required: &str) -> Result<(), PhaseError> {
        let observed = self.observed_tag.as_deref().unwrap_or("none");
        if version_at_least(observed, required) {
            Ok(())
        } else {
            Err(PhaseError::VersionMismatch {
                required: required.to_owned(),
                observed: observed.to_owned(),
            })
        }
    }

    /// Broadcasts ACK and marks every Ready agent Armed.
    ///
    /// # Errors
    ///
    /// Propagates broker publish failures.
    pub async fn arm(&mut self) -> AppResult<()> {
        let message = WireMessage::Ack(AckMessage {
            sender_id: self.sender_id.clone(),
            client_type: None,
            data: Value::Null,
        });
        self.broadcast(&message).await?;
        for entry in self.agents.values_mut() {
            if entry.state == AgentState::Ready {
                entry.state = AgentState::Armed;
            }
        }
        Ok(())
    }

    /// Re-arms agents that completed the previous phase so the next EXEC
    /// can be dispatched.
    pub fn rearm(&mut self) {
        for entry in self.agents.values_mut() {
            if entry.state == AgentState::Done {
                entry.state = AgentState::Armed;
            }
        }
    }

    /// Dispatches one EXEC to all armed agents and polls until each of
    /// them reports DONE or the timeout elapses. Failed agents from
    /// earlier phases are skipped, not blocking.
    ///
    /// # Errors
    ///
    /// Returns `PhaseError::NotArmed` when an agent is in a state that
    /// must never receive EXEC; broker failures propagate.
    pub async fn dispatch_and_await(
        &mut self,
        operation: Operation,
        timeout: Duration,
        mut consolidator: Option<&mut dyn Consolidator>,
    ) -> AppResult<PhaseCounts> {
        let mut dispatched: Vec<String> = Vec::new();
        for (agent_id, entry) in &self.agents {
            match entry.state {
                AgentState::Armed => dispatched.push(agent_id.clone()),
                AgentState::Failed => {}
                other => {
                    return Err(AppError::phase(PhaseError::NotArmed {
                        agent_id: agent_id.clone(),
                        state: other.as_str().to_owned(),
                    }));
                }
            }
        }
        info!(
            "Dispatching {} to {} agents",
            operation.name(),
            dispatched.len()
        );
        let message = WireMessage::Exec(ExecMessage {
            sender_id: self.sender_id.clone(),
            client_type: None,
            data: operation,
        });
        self.broadcast(&message).await?;
        for agent_id in &dispatched {
            if let Some(entry) = self.agents.get_mut(agent_id) {
                entry.state = AgentState::Executing;
            }
        }

        let deadline = deadline_after(timeout);
        loop {
            let mut fresh_reports = false;
            for message in self.drain() {
                match message {
                    WireMessage::Report(report) => {
                        self.samples.push((report.sender_id, report.data.record));
                        fresh_reports = true;
                    }
                    WireMessage::Done(done) => {
                        // Flush buffered samples before the sender's DONE
                        // so its earlier reports are consolidated first.
                        if fresh_reports {
                            if let Some(consolidator) = consolidator.as_deref_mut() {
                                consolidator.incremental(&self.samples);
                            }
                            fresh_reports = false;
                        }
                        self.note_done(&done.sender_id, done.data);
                    }
                    WireMessage::Ready(ready) => self.note_ready(&ready),
                    WireMessage::Debug(debug_message) => {
                        debug!(
                            "Agent {} debug: {}",
                            debug_message.sender_id, debug_message.data.message
                        );
                    }
                    other => debug!(
                        "Ignoring {} from {} during dispatch",
                        other.verb(),
                        other.sender_id()
                    ),
                }
            }
            if fresh_reports {
                if let Some(consolidator) = consolidator.as_deref_mut() {
                    consolidator.incremental(&self.samples);
                }
            }

            let still_running = dispatched
                .iter()
                .filter(|agent_id| self.state_of(agent_id) == Some(AgentState::Executing))
                .count();
            if still_running == 0 || Instant::now() >= deadline {
                let mut counts = PhaseCounts::default();
                for agent_id in &dispatched {
                    match self.state_of(agent_id) {
                        Some(AgentState::Done) => {
                            counts.succeeded = counts.succeeded.saturating_add(1);
                        }
                        Some(AgentState::Failed) => {
                            counts.failed = counts.failed.saturating_add(1);
                        }
                        in_flight => {
                            counts.pending = counts.pending.saturating_add(1);
                            // No DONE within the run timeout.
                            if let Some(entry) = self.agents.get_mut(agent_id) {
                                warn!(
                                    "Agent {} timed out in state {:?} with no DONE",
                                    agent_id, in_flight
                                );
                                entry.state = AgentState::Failed;
                            }
                        }
                    }
                }
                return Ok(counts);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Broadcasts ABORT on the control topics. Teardown is unconditional;
    /// publish failures are logged, not propagated.
    pub async fn abort(&self) {
        let message = WireMessage::Abort(AbortMessage {
            sender_id: self.sender_id.clone(),
            client_type: None,
            data: Value::Null,
        });
        if let Err(err) = self.broadcast(&message).await {
            warn!("ABORT broadcast failed: {}", err);
        }
    }

    #[must_use]
    pub fn agents(&self) -> &BTreeMap<String, AgentEntry> {
        &self.agents
    }

    #[must_use]
    pub fn samples(&self) -> &[(String, Value)] {
        &self.samples
    }

    pub(super) fn into_parts(self) -> (BTreeMap<String, AgentEntry>, Vec<(String, Value)>) {
        (self.agents, self.samples)
    }

    async fn broadcast(&self, message: &WireMessage) -> AppResult<()> {
        for topic in self.topics.control_topics(&self.known_names) {
            self.broker.publish(&topic, message).await?;
        }
        Ok(())
    }

    /// Drains every report subscription to empty, preserving per-topic
    /// order.
    fn drain(&mut self) -> Vec<WireMessage> {
        let mut batch = Vec::new();
        for sub in &mut self.subs {
            while let Some(message) = sub.poll() {
                batch.push(message);
            }
        }
        batch
    }

    fn note_ready(&mut self, ready: &ReadyMessage) {
        let entry = self
            .agents
            .entry(ready.sender_id.clone())
            .or_insert_with(AgentEntry::pending);
        if entry.state == AgentState::Pending {
            entry.state = AgentState::Ready;
            info!("Agent {} is up ({})", ready.sender_id, ready.data.build_tag);
        } else {
            debug!("Duplicate READY from {}", ready.sender_id);
        }
        entry.build_tag = Some(ready.data.build_tag.clone());
        entry.client_type.clone_from(&ready.client_type);
        if self.observed_tag.is_none() {
            self.observed_tag = Some(ready.data.build_tag.clone());
        }
    }

    fn note_done(&mut self, agent_id: &str, payload: DonePayload) {
        let Some(entry) = self.agents.get_mut(agent_id) else {
            warn!("DONE from unknown agent {}", agent_id);
            return;
        };
        entry.state = if payload.status == 0 {
            AgentState::Done
        } else {
            AgentState::Failed
        };
        info!("Agent {} finished with status {}", agent_id, payload.status);
        entry.last_done = Some(payload);
    }

    fn state_of(&self, agent_id: &str) -> Option<AgentState> {
        self.agents.get(agent_id).map(|entry| entry.state)
    }

    fn count_in(&self, state: AgentState) -> usize {
        self.agents
            .values()
            .filter(|entry| entry.state == state)
            .count()
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    Instant::now()
        .checked_add(timeout)
        .unwrap_or_else(Instant::now)
}

/// Dotted numeric comparison; non-numeric components count as zero.
fn version_at_least(observed: &str, required: &str) -> bool {
    fn parts(tag: &str) -> Vec<u64> {
        tag.split('.')
            .map(|part| part.trim().parse().unwrap_or(0))
            .collect()
    }
    parts(observed) >= parts(required)
}
