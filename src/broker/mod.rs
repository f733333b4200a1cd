//! Publish/subscribe channel abstraction.
//!
//! The orchestrator and agents never talk to a broker implementation
//! directly; they publish and subscribe through the [`Broker`] trait and
//! drain subscriptions with the non-blocking [`Subscription::poll`]. The
//! scheduler path never issues a blocking receive; only the agent's main
//! loop uses [`Subscription::recv`].

mod memory;
mod server;
mod tcp;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::AppResult;
use crate::wire::WireMessage;

pub use memory::MemoryBroker;
pub use server::{bind_broker, run_broker};
pub use tcp::TcpBroker;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Publishes a message on a topic, fire-and-forget.
    ///
    /// # Errors
    ///
    /// Returns an error when the broker connection is gone; delivery is
    /// otherwise at-most-once and unacknowledged.
    async fn publish(&self, topic: &str, message: &WireMessage) -> AppResult<()>;

    /// Starts receiving on a topic. Messages published before the
    /// subscription completes are not replayed.
    ///
    /// # Errors
    ///
    /// Returns an error when the broker connection is gone.
    async fn subscribe(&self, topic: &str) -> AppResult<Subscription>;
}

pub struct Subscription {
    rx: mpsc::UnboundedReceiver<WireMessage>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<WireMessage>) -> Self {
        Self { rx }
    }

    /// Non-blocking single-message fetch.
    pub fn poll(&mut self) -> Option<WireMessage> {
        self.rx.try_recv().ok()
    }

    /// Blocking receive; returns `None` once the broker side is gone.
    /// Reserved for the agent's main loop.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.rx.recv().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicMode {
    /// One control and one report topic shared by the whole fleet.
    Fleet,
    /// A dedicated control/report pair per agent.
    PerAgent,
}

/// Topic naming for one run. Both naming variants are supported; the
/// orchestrator does not care which is in use.
#[derive(Debug, Clone)]
pub struct Topics {
    run_id: String,
    mode: TopicMode,
}

impl Topics {
    #[must_use]
    pub fn new(run_id: &str, mode: TopicMode) -> Self {
        Self {
            run_id: run_id.to_owned(),
            mode,
        }
    }

    #[must_use]
    pub fn mode(&self) -> TopicMode {
        self.mode
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Control topic the given agent subscribes to.
    #[must_use]
    pub fn agent_control(&self, agent_id: &str) -> String {
        match self.mode {
            TopicMode::Fleet => format!("{}:ctl", self.run_id),
            TopicMode::PerAgent => format!("{}:{}:ctl", self.run_id, agent_id),
        }
    }

    /// Report topic the given agent publishes to.
    #[must_use]
    pub fn agent_report(&self, agent_id: &str) -> String {
        match self.mode {
            TopicMode::Fleet => format!("{}:rpt", self.run_id),
            TopicMode::PerAgent => format!("{}:{}:rpt", self.run_id, agent_id),
        }
    }

    /// Control topics the orchestrator broadcasts on.
    #[must_use]
    pub fn control_topics(&self, agents: &[String]) -> Vec<String> {
        match self.mode {
            TopicMode::Fleet => vec![format!("{}:ctl", self.run_id)],
            TopicMode::PerAgent => agents
                .iter()
                .map(|agent_id| self.agent_control(agent_id))
                .collect(),
        }
    }

    /// Report topics the orchestrator subscribes to.
    #[must_use]
    pub fn report_topics(&self, agents: &[String]) -> Vec<String> {
        match self.mode {
            TopicMode::Fleet => vec![format!("{}:rpt", self.run_id)],
            TopicMode::PerAgent => agents
                .iter()
                .map(|agent_id| self.agent_report(agent_id))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fleet_mode_shares_one_pair() {
        let topics = Topics::new("run-1", TopicMode::Fleet);
        assert_eq!(topics.agent_control("a"), "run-1:ctl");
        assert_eq!(topics.agent_control("b"), "run-1:ctl");
        assert_eq!(topics.agent_report("a"), "run-1:rpt");
        assert_eq!(
            topics.control_topics(&["a".to_owned(), "b".to_owned()]),
            vec!["run-1:ctl".to_owned()]
        );
    }

    #[test]
    fn per_agent_mode_names_a_pair_per_agent() {
        let topics = Topics::new("run-1", TopicMode::PerAgent);
        assert_eq!(topics.agent_control("a"), "run-1:a:ctl");
        assert_eq!(topics.agent_report("b"), "run-1:b:rpt");
        assert_eq!(
            topics.report_topics(&["a".to_owned(), "b".to_owned()]),
            vec!["run-1:a:rpt".to_owned(), "run-1:b:rpt".to_owned()]
        );
    }
}
