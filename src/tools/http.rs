//! HTTP load driver (wrk2-style).
//!
//! The driver binary is expected to emit JSON: one object per interim
//! progress line (carrying a `seq` counter) and one final summary object.
//! The `program` spec field exists so runs can point at a patched wrk2
//! build or, in tests, at a stand-in script.

use serde_json::{Value, json};

use crate::error::ConfigError;
use crate::session::ExecOutcome;

use super::{BenchTool, max_field, spec_str, spec_u64, sum_field};

const DEFAULT_PROGRAM: &str = "wrk2";
const DEFAULT_THREADS: u64 = 1;
const DEFAULT_CONNECTIONS: u64 = 1000;
const DEFAULT_RATE_RPS: u64 = 1000;
const DEFAULT_DURATION_SEC: u64 = 30;

pub struct HttpTool;

impl BenchTool for HttpTool {
    fn name(&self) -> &'static str {
        "http"
    }

    fn client_type(&self) -> &'static str {
        "http"
    }

    fn build_command_line(&self, spec: &Value) -> Result<String, ConfigError> {
        let url = spec_str(spec, "http", "url")?;
        let program = spec
            .get("program")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_PROGRAM);
        Ok(format!(
            "{} -t{} -c{} -R{} -d{}s --json {}",
            program,
            spec_u64(spec, "threads", DEFAULT_THREADS),
            spec_u64(spec, "connections", DEFAULT_CONNECTIONS),
            spec_u64(spec, "rate_rps", DEFAULT_RATE_RPS),
            spec_u64(spec, "duration_sec", DEFAULT_DURATION_SEC),
            url
        ))
    }

    fn server_launch_command(&self, _spec: &Value) -> Option<String> {
        // The HTTP server side is a standing web server, not launched per run.
        None
    }

    fn parse_interim(&self, line: &str) -> Option<Value> {
        let record: Value = serde_json::from_str(line.trim()).ok()?;
        if record.get("seq").is_some() {
            Some(record)
        } else {
            None
        }
    }

    fn parse_output(&self, outcome: &ExecOutcome) -> Value {
        // The final summary is the last JSON object without a seq counter.
        for line in outcome.stdout.lines().rev() {
            let Ok(mut record) = serde_json::from_str::<Value>(line.trim()) else {
                continue;
            };
            if !record.is_object() || record.get("seq").is_some() {
                continue;
            }
            if let Some(map) = record.as_object_mut() {
                map.insert("tool".to_owned(), json!("http"));
            }
            return record;
        }
        json!({
            "tool": "http",
            "error": "no summary record in output",
            "status": outcome.status,
        })
    }

    fn consolidate(&self, records: &[Value]) -> Value {
        json!({
            "tool": "http",
            "agents": records.len(),
            "http_rps": sum_field(records, "http_rps"),
            "http_total_req": sum_field(records, "http_total_req"),
            "http_sock_err": sum_field(records, "http_sock_err"),
            "http_throughput_kbps": sum_field(records, "http_throughput_kbps"),
            "latency_ms_x100": max_field(records, "latency_ms_x100"),
        })
    }
}
