//! Incremental consolidation of streamed benchmark samples.
//!
//! The scheduler invokes [`Consolidator::incremental`] on every polling
//! tick that yielded at least one REPORT, over the currently buffered
//! cross-agent sample set. The final consolidation runs once at round end
//! over the full history and marks the record ready for persistence.

use serde_json::Value;
use tracing::info;

use crate::tools::BenchTool;

pub trait Consolidator: Send {
    /// Called with the full buffered sample set whenever a tick yielded new
    /// REPORTs; may emit a progress line.
    fn incremental(&mut self, samples: &[(String, Value)]);

    /// Called once at round end over the full report history.
    fn finalize(&mut self, samples: &[(String, Value)]) -> Value;
}

/// Consolidates through the benchmark tool that produced the samples,
/// keeping only each agent's latest record for the in-flight view.
pub struct ToolConsolidator {
    tool: Box<dyn BenchTool>,
}

impl ToolConsolidator {
    #[must_use]
    pub fn new(tool: Box<dyn BenchTool>) -> Self {
        Self { tool }
    }

    /// Latest record per agent, in first-seen agent order.
    fn latest_per_agent(samples: &[(String, Value)]) -> Vec<Value> {
        let mut order: Vec<&str> = Vec::new();
        for (agent_id, _record) in samples {
            if !order.iter().any(|seen| *seen == agent_id.as_str()) {
                order.push(agent_id);
            }
        }
        order
            .iter()
            .filter_map(|agent_id| {
                samples
                    .iter()
                    .rev()
                    .find(|(candidate, _record)| candidate == agent_id)
                    .map(|(_agent, record)| record.clone())
            })
            .collect()
    }
}

impl Consolidator for ToolConsolidator {
    fn incremental(&mut self, samples: &[(String, Value)]) {
        let records = Self::latest_per_agent(samples);
        let merged = self.tool.consolidate(&records);
        info!(
            "Progress ({} agents reporting): {}",
            records.len(),
            merged
        );
    }

    fn finalize(&mut self, samples: &[(String, Value)]) -> Value {
        let records = Self::latest_per_agent(samples);
        self.tool.consolidate(&records)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tools::HttpTool;

    #[test]
    fn finalize_merges_the_latest_record_per_agent() {
        let mut consolidator = ToolConsolidator::new(Box::new(HttpTool));
        let samples = vec![
            ("a".to_owned(), json!({"http_rps": 100})),
            ("b".to_owned(), json!({"http_rps": 200})),
            ("a".to_owned(), json!({"http_rps": 150})),
        ];
        let merged = consolidator.finalize(&samples);
        // a's stale first record must not be counted.
        assert_eq!(merged.get("http_rps").and_then(Value::as_u64), Some(350));
        assert_eq!(merged.get("agents").and_then(Value::as_u64), Some(2));
    }
}
