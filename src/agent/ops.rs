//! Operation execution on the agent's own host.
//!
//! Every operation resolves to exactly one DONE payload; failures are data
//! (non-zero status plus captured stderr), never panics or lost replies.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::SessionError;
use crate::session::Session;
use crate::tools::tool_for;
use crate::wire::{DonePayload, Operation, ReportPayload, RouteSpec};

const SERVICE_POLL_WAIT: Duration = Duration::from_millis(500);

const STATUS_FAILED: i64 = 1;
const STATUS_TIMEOUT: i64 = 124;
const STATUS_UNKNOWN_TOOL: i64 = 127;
const STATUS_ABORTED: i64 = 130;

pub(super) async fn execute_operation(
    session: &mut Session,
    operation: Operation,
    op_timeout: Duration,
    abort: watch::Receiver<bool>,
    interim: &mpsc::UnboundedSender<ReportPayload>,
) -> DonePayload {
    match operation {
        Operation::SetupStaticRoute(route) => {
            setup_static_route(session, &route, op_timeout, abort).await
        }
        Operation::CheckHttpService { url, timeout_ms } => {
            check_http_service(&url, timeout_ms, &abort).await
        }
        Operation::RunBench(request) => {
            run_bench(session, &request.tool, &request.spec, op_timeout, abort, interim).await
        }
    }
}

async fn setup_static_route(
    session: &mut Session,
    route: &RouteSpec,
    op_timeout: Duration,
    abort: watch::Receiver<bool>,
) -> DonePayload {
    let device = route
        .device
        .as_deref()
        .map(|device| format!(" dev {}", device))
        .unwrap_or_default();
    let cmd = format!(
        "ip route replace {} via {}{}",
        route.dest_cidr, route.gateway, device
    );
    debug!("Injecting route: {}", cmd);
    match session
        .execute_observed(&cmd, op_timeout, None, None, Some(abort))
        .await
    {
        Ok(outcome) => DonePayload {
            status: outcome.status,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
        },
        Err(err) => done_from_session_error(&err),
    }
}

/// Polls the URL until it answers with a success status or the deadline
/// passes. Connection refusals are expected while the service boots.
async fn check_http_service(
    url: &str,
    timeout_ms: u64,
    abort: &watch::Receiver<bool>,
) -> DonePayload {
    let per_request = Duration::from_millis(timeout_ms.clamp(100, 5000));
    let client = match reqwest::Client::builder().timeout(per_request).build() {
        Ok(client) => client,
        Err(err) => {
            return DonePayload {
                status: STATUS_FAILED,
                stdout: String::new(),
                stderr: format!("http client: {}", err),
            };
        }
    };
    let deadline = tokio::time::Instant::now()
        .checked_add(Duration::from_millis(timeout_ms))
        .unwrap_or_else(tokio::time::Instant::now);
    let mut last_error = String::new();
    loop {
        if *abort.borrow() {
            return DonePayload {
                status: STATUS_ABORTED,
                stdout: String::new(),
                stderr: "aborted".to_owned(),
            };
        }
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                return DonePayload {
                    status: 0,
                    stdout: response.status().to_string(),
                    stderr: String::new(),
                };
            }
            Ok(response) => last_error = format!("service answered {}", response.status()),
            Err(err) => last_error = err.to_string(),
        }
        if tokio::time::Instant::now() >= deadline {
            return DonePayload {
                status: STATUS_FAILED,
                stdout: String::new(),
                stderr: last_error,
            };
        }
        tokio::time::sleep(SERVICE_POLL_WAIT).await;
    }
}

async fn run_bench(
    session: &mut Session,
    tool_name: &str,
    spec: &Value,
    op_timeout: Duration,
    abort: watch::Receiver<bool>,
    interim: &mpsc::UnboundedSender<ReportPayload>,
) -> DonePayload {
    let Some(tool) = tool_for(tool_name) else {
        return DonePayload {
            status: STATUS_UNKNOWN_TOOL,
            stdout: String::new(),
            stderr: format!("unknown benchmark tool: {}", tool_name),
        };
    };
    let report_tool = tool.name().to_owned();
    let mut emit = |record: Value| {
        if interim
            .send(ReportPayload {
                tool: report_tool.clone(),
                record,
            })
            .is_err()
        {
            // Forwarder gone; records are dropped, the run continues.
        }
    };
    match tool
        .run(session, spec, op_timeout, Some(abort), &mut emit)
        .await
    {
        Ok(outcome) => {
            emit(outcome.record);
            DonePayload {
                status: outcome.exec.status,
                stdout: outcome.exec.stdout,
                stderr: outcome.exec.stderr,
            }
        }
        Err(err) => {
            if let crate::error::AppError::Session(session_err) = &err {
                done_from_session_error(session_err)
            } else {
                DonePayload {
                    status: STATUS_FAILED,
                    stdout: String::new(),
                    stderr: err.to_string(),
                }
            }
        }
    }
}

fn done_from_session_error(err: &SessionError) -> DonePayload {
    let status = match err {
        SessionError::Aborted => STATUS_ABORTED,
        SessionError::Timeout { .. } => STATUS_TIMEOUT,
        SessionError::Connect { .. }
        | SessionError::Spawn { .. }
        | SessionError::Transfer { .. }
        | SessionError::NonZeroExit { .. } => STATUS_FAILED,
    };
    DonePayload {
        status,
        stdout: String::new(),
        stderr: err.to_string(),
    }
}
