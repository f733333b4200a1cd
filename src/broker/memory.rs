//! In-process broker used by tests and single-host dry runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{AppError, AppResult, BrokerError};
use crate::wire::WireMessage;

use super::{Broker, Subscription};

type TopicMap = HashMap<String, Vec<mpsc::UnboundedSender<WireMessage>>>;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    topics: Arc<Mutex<TopicMap>>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, message: &WireMessage) -> AppResult<()> {
        let Ok(mut topics) = self.topics.lock() else {
            return Err(AppError::broker(BrokerError::ConnectionClosed));
        };
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> AppResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let Ok(mut topics) = self.topics.lock() else {
            return Err(AppError::broker(BrokerError::ConnectionClosed));
        };
        topics.entry(topic.to_owned()).or_default().push(tx);
        Ok(Subscription::new(rx))
    }
}
