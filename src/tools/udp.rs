//! UDP throughput driver (nuttcp-style).
//!
//! UDP runs are preceded by a rate search: the driver is run repeatedly at
//! candidate rates until the measured loss lands inside the configured
//! bracket, then the converged measurement is the result. The driver is
//! expected to support `-fparse` output, one `key=value` summary line.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::watch;

use crate::error::{AppError, AppResult, ConfigError};
use crate::rate::{LossBracket, RateConverger, RateMeasurer, RateSample};
use crate::session::{ExecOutcome, Session};

use super::{BenchOutcome, BenchTool, max_field, parse_scaled_x100, spec_str, spec_u64, sum_field};

const DEFAULT_PROGRAM: &str = "nuttcp";
const DEFAULT_PORT: u64 = 5001;
const DEFAULT_PACKET_SIZE: u64 = 1024;
const DEFAULT_DURATION_SEC: u64 = 10;
const DEFAULT_RATE_KBPS: u64 = 1_000_000;
const DEFAULT_MIN_LOSS_X100: u64 = 0;
const DEFAULT_MAX_LOSS_X100: u64 = 50;

pub struct UdpTool;

impl UdpTool {
    fn command_for_rate(spec: &Value, kbps: u64) -> Result<String, ConfigError> {
        let target = spec_str(spec, "udp", "target")?;
        let program = spec
            .get("program")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_PROGRAM);
        Ok(format!(
            "{} -u -fparse -T{} -l{} -R{}K -p{} {}",
            program,
            spec_u64(spec, "duration_sec", DEFAULT_DURATION_SEC),
            spec_u64(spec, "packet_size", DEFAULT_PACKET_SIZE),
            kbps,
            spec_u64(spec, "port", DEFAULT_PORT),
            target
        ))
    }

    fn bracket_from(spec: &Value) -> LossBracket {
        LossBracket {
            min_loss_x100: u32::try_from(spec_u64(spec, "min_loss_x100", DEFAULT_MIN_LOSS_X100))
                .unwrap_or(u32::MAX),
            max_loss_x100: u32::try_from(spec_u64(spec, "max_loss_x100", DEFAULT_MAX_LOSS_X100))
                .unwrap_or(u32::MAX),
        }
    }
}

/// Parses one `-fparse` summary line: `rate_Mbps=90.1061 ... data_loss=0.0000`.
fn parse_nuttcp(stdout: &str) -> Option<(u64, u32)> {
    let mut rate_mbps_x100 = None;
    let mut loss_x100 = None;
    for token in stdout.split_whitespace() {
        if let Some(value) = token.strip_prefix("rate_Mbps=") {
            rate_mbps_x100 = parse_scaled_x100(value);
        } else if let Some(value) = token.strip_prefix("data_loss=") {
            loss_x100 = parse_scaled_x100(value);
        }
    }
    // Mbps scaled by 100 becomes kbps scaled by 10.
    let measured_kbps = rate_mbps_x100?.saturating_mul(10);
    let loss_x100 = u32::try_from(loss_x100?).unwrap_or(u32::MAX);
    Some((measured_kbps, loss_x100))
}

struct NuttcpMeasurer<'run> {
    session: &'run mut Session,
    spec: &'run Value,
    timeout: Duration,
    abort: Option<watch::Receiver<bool>>,
    interim: &'run mut (dyn FnMut(Value) + Send),
    last_exec: Option<ExecOutcome>,
}

#[async_trait]
impl RateMeasurer for NuttcpMeasurer<'_> {
    async fn measure(&mut self, kbps: u64) -> AppResult<RateSample> {
        let cmd = UdpTool::command_for_rate(self.spec, kbps).map_err(AppError::config)?;
        let exec = self
            .session
            .execute_observed(&cmd, self.timeout, None, None, self.abort.clone())
            .await
            .map_err(AppError::session)?;
        let (measured_kbps, loss_x100) =
            parse_nuttcp(&exec.stdout).ok_or_else(|| ConfigError::BadBenchSpec {
                tool: "udp",
                message: format!("unparseable driver output (status {})", exec.status),
            })?;
        self.last_exec = Some(exec);
        let sample = RateSample {
            kbps,
            measured_kbps,
            loss_x100,
        };
        (self.interim)(json!({
            "tool": "udp",
            "seq": "search",
            "target_kbps": sample.kbps,
            "measured_kbps": sample.measured_kbps,
            "loss_x100": sample.loss_x100,
        }));
        Ok(sample)
    }
}

#[async_trait]
impl BenchTool for UdpTool {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn client_type(&self) -> &'static str {
        "udp"
    }

    fn build_command_line(&self, spec: &Value) -> Result<String, ConfigError> {
        Self::command_for_rate(spec, spec_u64(spec, "rate_kbps", DEFAULT_RATE_KBPS))
    }

    fn server_launch_command(&self, spec: &Value) -> Option<String> {
        let program = spec
            .get("program")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_PROGRAM);
        Some(format!(
            "{} -S -p{}",
            program,
            spec_u64(spec, "port", DEFAULT_PORT)
        ))
    }

    fn parse_interim(&self, _line: &str) -> Option<Value> {
        // The driver writes a single summary line at the end of each run;
        // interim records come from the rate search instead.
        None
    }

    fn parse_output(&self, outcome: &ExecOutcome) -> Value {
        match parse_nuttcp(&outcome.stdout) {
            Some((measured_kbps, loss_x100)) => json!({
                "tool": "udp",
                "measured_kbps": measured_kbps,
                "loss_x100": loss_x100,
            }),
            None => json!({
                "tool": "udp",
                "error": "no summary record in output",
                "status": outcome.status,
            }),
        }
    }

    fn consolidate(&self, records: &[Value]) -> Value {
        let target_kbps = sum_field(records, "target_kbps");
        let measured_kbps = sum_field(records, "measured_kbps");
        // Loss weighted by each agent's measured rate.
        let weighted: u64 = records
            .iter()
            .filter_map(|record| {
                let loss = record.get("loss_x100").and_then(Value::as_u64)?;
                let rate = record.get("measured_kbps").and_then(Value::as_u64)?;
                Some(loss.saturating_mul(rate))
            })
            .fold(0, u64::saturating_add);
        let loss_x100 = weighted.checked_div(measured_kbps).unwrap_or(0);
        json!({
            "tool": "udp",
            "agents": records.len(),
            "target_kbps": target_kbps,
            "measured_kbps": measured_kbps,
            "loss_x100": loss_x100,
            "packet_size": max_field(records, "packet_size"),
        })
    }

    async fn run(
        &self,
        session: &mut Session,
        spec: &Value,
        timeout: Duration,
        abort: Option<watch::Receiver<bool>>,
        interim: &mut (dyn FnMut(Value) + Send),
    ) -> AppResult<BenchOutcome> {
        let mut converger =
            RateConverger::new(Self::bracket_from(spec)).map_err(AppError::rate)?;
        let mut measurer = NuttcpMeasurer {
            session,
            spec,
            timeout,
            abort,
            interim,
            last_exec: None,
        };
        let sample = converger.converge(&mut measurer).await?;
        let exec = measurer.last_exec.unwrap_or_else(|| ExecOutcome {
            status: 0,
            stdout: String::new(),
            stderr: String::new(),
        });
        let record = json!({
            "tool": "udp",
            "target_kbps": sample.kbps,
            "measured_kbps": sample.measured_kbps,
            "loss_x100": sample.loss_x100,
            "packet_size": spec_u64(spec, "packet_size", DEFAULT_PACKET_SIZE),
        });
        Ok(BenchOutcome { exec, record })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_carries_rate_and_target() -> Result<(), ConfigError> {
        let spec = json!({
            "target": "10.0.0.9",
            "packet_size": 8192,
            "duration_sec": 5,
        });
        let cmd = UdpTool::command_for_rate(&spec, 250_000)?;
        assert!(cmd.starts_with("nuttcp "));
        assert!(cmd.contains("-R250000K"));
        assert!(cmd.contains("-l8192"));
        assert!(cmd.contains("-T5"));
        assert!(cmd.ends_with("10.0.0.9"));
        Ok(())
    }

    #[test]
    fn missing_target_is_a_spec_error() {
        assert!(matches!(
            UdpTool.build_command_line(&json!({})),
            Err(ConfigError::BadBenchSpec { tool: "udp", .. })
        ));
    }

    #[test]
    fn fparse_output_yields_scaled_rate_and_loss() {
        let line = "megabytes=107.4219 real_seconds=10.00 rate_Mbps=90.1061 \
                    tx_cpu=6 rx_cpu=6 drop=42 pkt=110000 data_loss=0.0381";
        let parsed = parse_nuttcp(line);
        assert_eq!(parsed, Some((90_100, 3)));
    }

    #[test]
    fn malformed_driver_output_is_rejected() {
        assert!(parse_nuttcp("nuttcp: connection refused").is_none());
        assert!(parse_nuttcp("rate_Mbps=abc data_loss=0.0").is_none());
    }

    #[test]
    fn server_launch_uses_the_configured_port() {
        let cmd = UdpTool.server_launch_command(&json!({"port": 5201}));
        assert_eq!(cmd, Some("nuttcp -S -p5201".to_owned()));
    }

    #[test]
    fn consolidation_weights_loss_by_measured_rate() {
        let records = vec![
            json!({"target_kbps": 100_000, "measured_kbps": 100_000, "loss_x100": 0, "packet_size": 1024}),
            json!({"target_kbps": 300_000, "measured_kbps": 300_000, "loss_x100": 40, "packet_size": 1024}),
        ];
        let fleet = UdpTool.consolidate(&records);
        assert_eq!(fleet.get("measured_kbps").and_then(Value::as_u64), Some(400_000));
        assert_eq!(fleet.get("loss_x100").and_then(Value::as_u64), Some(30));
        assert_eq!(fleet.get("packet_size").and_then(Value::as_u64), Some(1024));
    }
}
