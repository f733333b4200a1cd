//! Benchmark tool drivers.
//!
//! Each tool knows how to build its command line from a JSON spec, parse
//! the tool's output into a structured record, and consolidate records
//! from many agents into one fleet-wide record. Dispatch is by stored
//! trait object, selected by tool name; there is no runtime type
//! inspection anywhere in the pipeline.

mod http;
mod udp;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::{AppError, AppResult, ConfigError};
use crate::session::{ExecOutcome, Session};

pub use http::HttpTool;
pub use udp::UdpTool;

/// Final outcome of one benchmark run on one agent: the raw exec result
/// plus the parsed result record.
#[derive(Debug, Clone)]
pub struct BenchOutcome {
    pub exec: ExecOutcome,
    pub record: Value,
}

#[async_trait]
pub trait BenchTool: Send + Sync {
    fn name(&self) -> &'static str;

    /// Client-type tag advertised on the wire.
    fn client_type(&self) -> &'static str;

    /// Builds the shell command for one run from the JSON spec.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the spec is missing required fields.
    fn build_command_line(&self, spec: &Value) -> Result<String, ConfigError>;

    /// Command that starts the server-side peer of this tool, when it has
    /// one.
    fn server_launch_command(&self, spec: &Value) -> Option<String>;

    /// Parses one stdout line into an interim progress record, if the line
    /// is one.
    fn parse_interim(&self, line: &str) -> Option<Value>;

    /// Parses the completed run's output into the final result record.
    fn parse_output(&self, outcome: &ExecOutcome) -> Value;

    /// Folds per-agent records into one fleet-wide record.
    fn consolidate(&self, records: &[Value]) -> Value;

    /// Runs the benchmark once over the given session, streaming interim
    /// records through `interim` as they appear on stdout.
    ///
    /// # Errors
    ///
    /// Spec errors surface as `ConfigError`; exec failures as
    /// `SessionError`.
    async fn run(
        &self,
        session: &mut Session,
        spec: &Value,
        timeout: Duration,
        abort: Option<watch::Receiver<bool>>,
        interim: &mut (dyn FnMut(Value) + Send),
    ) -> AppResult<BenchOutcome> {
        let cmd = self.build_command_line(spec).map_err(AppError::config)?;
        let mut observer = |line: &str| {
            if let Some(record) = self.parse_interim(line) {
                interim(record);
            }
        };
        let exec = session
            .execute_observed(&cmd, timeout, None, Some(&mut observer), abort)
            .await
            .map_err(AppError::session)?;
        let record = self.parse_output(&exec);
        Ok(BenchOutcome { exec, record })
    }
}

/// Looks a tool driver up by name.
#[must_use]
pub fn tool_for(name: &str) -> Option<Box<dyn BenchTool>> {
    match name {
        "http" => Some(Box::new(HttpTool)),
        "udp" => Some(Box::new(UdpTool)),
        _ => None,
    }
}

/// Parses a decimal string like `"90.1061"` into hundredths (`9010`),
/// truncating past two fractional digits. Tool output is text; keeping the
/// numbers scaled avoids float arithmetic in every consumer.
#[must_use]
pub fn parse_scaled_x100(text: &str) -> Option<u64> {
    let text = text.trim();
    let (whole, frac) = match text.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (text, ""),
    };
    let whole: u64 = if whole.is_empty() {
        0
    } else {
        whole.parse().ok()?
    };
    let mut frac_x100: u64 = 0;
    let mut scale: u64 = 10;
    for digit in frac.chars().take(2) {
        let value = u64::from(digit.to_digit(10)?);
        frac_x100 = frac_x100.saturating_add(value.saturating_mul(scale));
        scale /= 10;
    }
    Some(whole.saturating_mul(100).saturating_add(frac_x100))
}

/// Required string field accessor for tool specs.
pub(crate) fn spec_str<'spec>(
    spec: &'spec Value,
    tool: &'static str,
    field: &'static str,
) -> Result<&'spec str, ConfigError> {
    spec.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ConfigError::BadBenchSpec {
            tool,
            message: format!("missing string field {}", field),
        })
}

/// Optional numeric field accessor with a default.
pub(crate) fn spec_u64(spec: &Value, field: &str, default: u64) -> u64 {
    spec.get(field).and_then(Value::as_u64).unwrap_or(default)
}

/// Sums an integer field across records, treating absent fields as zero.
pub(crate) fn sum_field(records: &[Value], field: &str) -> u64 {
    records
        .iter()
        .filter_map(|record| record.get(field).and_then(Value::as_u64))
        .fold(0, u64::saturating_add)
}

/// Maximum of an integer field across records.
pub(crate) fn max_field(records: &[Value], field: &str) -> u64 {
    records
        .iter()
        .filter_map(|record| record.get(field).and_then(Value::as_u64))
        .max()
        .unwrap_or(0)
}
