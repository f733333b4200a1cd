//! Broker client over a line-oriented TCP transport.
//!
//! Frames are JSON lines: `{"op":"subscribe","topic":..}` and
//! `{"op":"publish","topic":..,"message":{..}}` upstream, and
//! `{"topic":..,"message":{..}}` downstream. A background reader task fans
//! received messages into per-subscription queues; a writer task owns the
//! write half so publishes never block the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult, BrokerError};
use crate::retry::{RetryPolicy, retry};
use crate::wire::{WireMessage, read_line_message, write_line_message};

use super::{Broker, Subscription};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(super) enum ClientFrame {
    Subscribe { topic: String },
    Publish { topic: String, message: WireMessage },
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct ServerFrame {
    pub(super) topic: String,
    pub(super) message: WireMessage,
}

type TopicMap = HashMap<String, Vec<mpsc::UnboundedSender<WireMessage>>>;

pub struct TcpBroker {
    out_tx: mpsc::UnboundedSender<ClientFrame>,
    topics: Arc<Mutex<TopicMap>>,
}

impl TcpBroker {
    /// Connects to a broker, retrying per `policy`.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Connection` once the retry budget is spent.
    pub async fn connect(addr: &str, policy: RetryPolicy) -> AppResult<Self> {
        let stream = retry(policy, "broker connect", || TcpStream::connect(addr))
            .await
            .map_err(|err| {
                AppError::broker(BrokerError::Connection {
                    addr: addr.to_owned(),
                    source: err,
                })
            })?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", err);
        }
        let (read_half, mut write_half) = stream.into_split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientFrame>();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if write_line_message(&mut write_half, &frame).await.is_err() {
                    break;
                }
            }
        });

        let topics: Arc<Mutex<TopicMap>> = Arc::default();
        let reader_topics = Arc::clone(&topics);
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                let frame: ServerFrame = match read_line_message(&mut reader).await {
                    Ok(frame) => frame,
                    Err(BrokerError::ConnectionClosed) => break,
                    // The bad line is fully consumed; keep the connection
                    // and its subscriptions alive.
                    Err(
                        err @ (BrokerError::Deserialize { .. } | BrokerError::InvalidUtf8 { .. }),
                    ) => {
                        warn!("Skipping bad broker frame: {}", err);
                        continue;
                    }
                    Err(err) => {
                        warn!("Broker read error: {}", err);
                        break;
                    }
                };
                let Ok(mut map) = reader_topics.lock() else {
                    break;
                };
                if let Some(subscribers) = map.get_mut(&frame.topic) {
                    subscribers.retain(|tx| tx.send(frame.message.clone()).is_ok());
                }
            }
        });

        Ok(Self { out_tx, topics })
    }
}

#[async_trait]
impl Broker for TcpBroker {
    async fn publish(&self, topic: &str, message: &WireMessage) -> AppResult<()> {
        self.out_tx
            .send(ClientFrame::Publish {
                topic: topic.to_owned(),
                message: message.clone(),
            })
            .map_err(|_err| AppError::broker(BrokerError::WriterClosed))
    }

    async fn subscribe(&self, topic: &str) -> AppResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let Ok(mut map) = self.topics.lock() else {
                return Err(AppError::broker(BrokerError::ConnectionClosed));
            };
            map.entry(topic.to_owned()).or_default().push(tx);
        }
        self.out_tx
            .send(ClientFrame::Subscribe {
                topic: topic.to_owned(),
            })
            .map_err(|_err| AppError::broker(BrokerError::WriterClosed))?;
        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::wire::{DebugMessage, DebugPayload};

    #[tokio::test]
    async fn reader_skips_garbage_frames() -> AppResult<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        let server = tokio::spawn(async move {
            let (stream, _peer) = listener.accept().await.map_err(|err| err.to_string())?;
            let (read_half, mut write_half) = stream.into_split();
            // Wait for the subscribe frame so the client is listening.
            let mut reader = BufReader::new(read_half);
            let _subscribe: ClientFrame = read_line_message(&mut reader)
                .await
                .map_err(|err| err.to_string())?;
            write_half
                .write_all(b"not a frame\n")
                .await
                .map_err(|err| err.to_string())?;
            let frame = ServerFrame {
                topic: "run:ctl".to_owned(),
                message: WireMessage::Debug(DebugMessage {
                    sender_id: "test".to_owned(),
                    client_type: None,
                    data: DebugPayload {
                        message: "still here".to_owned(),
                    },
                }),
            };
            write_line_message(&mut write_half, &frame)
                .await
                .map_err(|err| err.to_string())?;
            Ok::<(), String>(())
        });

        let policy = RetryPolicy::bounded(10, Duration::from_millis(20));
        let broker = TcpBroker::connect(&addr, policy).await?;
        let mut sub = broker.subscribe("run:ctl").await?;

        let received = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .map_err(|_elapsed| {
                AppError::broker("No message after a garbage frame".to_owned())
            })?;
        server.await?.map_err(AppError::broker)?;
        match received {
            Some(message) if message.verb() == "DEBUG" => Ok(()),
            other => Err(AppError::broker(format!(
                "Unexpected message: {:?}",
                other.map(|message| message.verb())
            ))),
        }
    }
}
