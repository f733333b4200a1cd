//! Wire messages exchanged over the broker.
//!
//! Every message is one JSON object per line. The `cmd` field selects the
//! payload schema, so decoding is a tagged-union deserialize and malformed
//! payloads are rejected at the boundary instead of being interpreted
//! downstream.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::BrokerError;

/// Upper bound for a single wire message line.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "UPPERCASE")]
pub enum WireMessage {
    Exec(ExecMessage),
    Ack(AckMessage),
    Abort(AbortMessage),
    Ready(ReadyMessage),
    Report(ReportMessage),
    Done(DoneMessage),
    Debug(DebugMessage),
}

impl WireMessage {
    #[must_use]
    pub fn sender_id(&self) -> &str {
        match self {
            Self::Exec(message) => &message.sender_id,
            Self::Ack(message) => &message.sender_id,
            Self::Abort(message) => &message.sender_id,
            Self::Ready(message) => &message.sender_id,
            Self::Report(message) => &message.sender_id,
            Self::Done(message) => &message.sender_id,
            Self::Debug(message) => &message.sender_id,
        }
    }

    #[must_use]
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Exec(_) => "EXEC",
            Self::Ack(_) => "ACK",
            Self::Abort(_) => "ABORT",
            Self::Ready(_) => "READY",
            Self::Report(_) => "REPORT",
            Self::Done(_) => "DONE",
            Self::Debug(_) => "DEBUG",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecMessage {
    #[serde(rename = "sender-id")]
    pub sender_id: String,
    #[serde(rename = "client-type")]
    pub client_type: Option<String>,
    pub data: Operation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckMessage {
    #[serde(rename = "sender-id")]
    pub sender_id: String,
    #[serde(rename = "client-type", default)]
    pub client_type: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortMessage {
    #[serde(rename = "sender-id")]
    pub sender_id: String,
    #[serde(rename = "client-type", default)]
    pub client_type: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyMessage {
    #[serde(rename = "sender-id")]
    pub sender_id: String,
    #[serde(rename = "client-type", default)]
    pub client_type: Option<String>,
    pub data: ReadyPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub build_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMessage {
    #[serde(rename = "sender-id")]
    pub sender_id: String,
    #[serde(rename = "client-type", default)]
    pub client_type: Option<String>,
    pub data: ReportPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportPayload {
    pub tool: String,
    pub record: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoneMessage {
    #[serde(rename = "sender-id")]
    pub sender_id: String,
    #[serde(rename = "client-type", default)]
    pub client_type: Option<String>,
    pub data: DonePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonePayload {
    pub status: i64,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugMessage {
    #[serde(rename = "sender-id")]
    pub sender_id: String,
    #[serde(rename = "client-type", default)]
    pub client_type: Option<String>,
    pub data: DebugPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugPayload {
    pub message: String,
}

/// Operations an agent accepts via EXEC. The set is closed; anything else
/// fails decoding and the agent reports a non-zero DONE.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    SetupStaticRoute(RouteSpec),
    CheckHttpService { url: String, timeout_ms: u64 },
    RunBench(BenchRequest),
}

impl Operation {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetupStaticRoute(_) => "setup_static_route",
            Self::CheckHttpService { .. } => "check_http_service",
            Self::RunBench(_) => "run_bench",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSpec {
    pub dest_cidr: String,
    pub gateway: String,
    #[serde(default)]
    pub device: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchRequest {
    pub tool: String,
    pub spec: Value,
}

/// Reads one newline-delimited JSON message.
///
/// A decode failure consumes the whole line, so the caller may keep
/// reading; a too-large frame leaves unread bytes behind, so the caller
/// must drop the connection.
///
/// # Errors
///
/// Returns an error when the peer closes the connection, the line exceeds
/// [`MAX_MESSAGE_BYTES`], or the payload fails schema-checked decoding.
pub async fn read_line_message<TReader, TMessage>(
    reader: &mut TReader,
) -> Result<TMessage, BrokerError>
where
    TReader: AsyncBufRead + Unpin,
    TMessage: DeserializeOwned,
{
    // Bound the read itself so a peer that never sends a newline cannot
    // grow the buffer past the frame cap.
    let limit = u64::try_from(MAX_MESSAGE_BYTES)
        .unwrap_or(u64::MAX)
        .saturating_add(1);
    let mut bounded = AsyncReadExt::take(&mut *reader, limit);
    let mut buffer: Vec<u8> = Vec::with_capacity(1024);
    let bytes = bounded
        .read_until(b'\n', &mut buffer)
        .await
        .map_err(|_err| BrokerError::ConnectionClosed)?;
    if bytes == 0 {
        return Err(BrokerError::ConnectionClosed);
    }
    if buffer.len() > MAX_MESSAGE_BYTES {
        return Err(BrokerError::MessageTooLarge {
            max_bytes: MAX_MESSAGE_BYTES,
        });
    }
    if buffer.ends_with(b"\n") {
        buffer.pop();
        if buffer.ends_with(b"\r") {
            buffer.pop();
        }
    }
    let line =
        std::str::from_utf8(&buffer).map_err(|err| BrokerError::InvalidUtf8 { source: err })?;
    serde_json::from_str::<TMessage>(line).map_err(|err| BrokerError::Deserialize {
        context: "wire message",
        source: err,
    })
}

/// Writes one message as a JSON line.
///
/// # Errors
///
/// Returns an error when encoding fails or the peer is gone.
pub async fn write_line_message<TWriter, TMessage>(
    writer: &mut TWriter,
    message: &TMessage,
) -> Result<(), BrokerError>
where
    TWriter: AsyncWrite + Unpin,
    TMessage: Serialize,
{
    let mut payload = serde_json::to_string(message).map_err(|err| BrokerError::Serialize {
        context: "wire message",
        source: err,
    })?;
    payload.push('\n');
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|_err| BrokerError::ConnectionClosed)
}
