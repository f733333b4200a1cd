//! Minimal fan-out broker for tests and single-box runs.
//!
//! Production deployments are expected to point agents and the orchestrator
//! at an already-running broker; this server exists so a run does not need
//! one. Delivery is at-most-once with no replay, matching what the Channel
//! contract promises.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult, BrokerError};
use crate::wire::{read_line_message, write_line_message};

use super::tcp::{ClientFrame, ServerFrame};

type FanoutMap = HashMap<String, Vec<(u64, mpsc::UnboundedSender<ServerFrame>)>>;

/// Binds the broker listener.
///
/// # Errors
///
/// Returns `BrokerError::Bind` when the address is unavailable.
pub async fn bind_broker(addr: &str) -> AppResult<TcpListener> {
    TcpListener::bind(addr).await.map_err(|err| {
        AppError::broker(BrokerError::Bind {
            addr: addr.to_owned(),
            source: err,
        })
    })
}

/// Runs the accept loop forever.
///
/// # Errors
///
/// Returns an error only when accepting fails fatally.
pub async fn run_broker(listener: TcpListener) -> AppResult<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Broker listening on {}", addr);
    }
    let topics: Arc<Mutex<FanoutMap>> = Arc::default();
    let mut next_conn_id: u64 = 0;
    loop {
        let (stream, peer) = listener.accept().await?;
        let conn_id = next_conn_id;
        next_conn_id = next_conn_id.wrapping_add(1);
        debug!("Broker connection {} from {}", conn_id, peer);
        let topics = Arc::clone(&topics);
        tokio::spawn(async move {
            handle_connection(conn_id, stream, topics).await;
        });
    }
}

async fn handle_connection(conn_id: u64, stream: TcpStream, topics: Arc<Mutex<FanoutMap>>) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!("set_nodelay failed: {}", err);
    }
    let (read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if write_line_message(&mut write_half, &frame).await.is_err() {
                break;
            }
        }
    });

    let mut reader = BufReader::new(read_half);
    loop {
        let frame: ClientFrame = match read_line_message(&mut reader).await {
            Ok(frame) => frame,
            // The bad line is fully consumed; later frames on this
            // connection are still usable.
            Err(err @ (BrokerError::Deserialize { .. } | BrokerError::InvalidUtf8 { .. })) => {
                warn!("Broker connection {}: skipping bad frame: {}", conn_id, err);
                continue;
            }
            Err(err) => {
                debug!("Broker connection {} closed: {}", conn_id, err);
                break;
            }
        };
        match frame {
            ClientFrame::Subscribe { topic } => {
                let Ok(mut map) = topics.lock() else { break };
                map.entry(topic)
                    .or_default()
                    .push((conn_id, out_tx.clone()));
            }
            ClientFrame::Publish { topic, message } => {
                let Ok(mut map) = topics.lock() else { break };
                if let Some(subscribers) = map.get_mut(&topic) {
                    subscribers.retain(|(_id, tx)| {
                        tx.send(ServerFrame {
                            topic: topic.clone(),
                            message: message.clone(),
                        })
                        .is_ok()
                    });
                }
            }
        }
    }

    // Drop this connection's fan-out entries so publishes stop targeting it.
    if let Ok(mut map) = topics.lock() {
        for subscribers in map.values_mut() {
            subscribers.retain(|(id, _tx)| *id != conn_id);
        }
    }
    drop(out_tx);
    if writer.await.is_err() {
        // Writer already gone.
    }
}
