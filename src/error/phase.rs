use thiserror::Error;

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error(
        "Agents not ready: {succeeded} up, {failed} failed, {pending} still pending at timeout."
    )]
    AgentsNotReady {
        succeeded: usize,
        failed: usize,
        pending: usize,
    },
    #[error("Route setup incomplete: {succeeded} ok, {failed} failed, {pending} pending.")]
    RouteSetup {
        succeeded: usize,
        failed: usize,
        pending: usize,
    },
    #[error("Target service not up: {succeeded} ok, {failed} failed, {pending} pending.")]
    ServiceNotUp {
        succeeded: usize,
        failed: usize,
        pending: usize,
    },
    #[error("Benchmark incomplete: {succeeded} ok, {failed} failed, {pending} pending.")]
    BenchmarkIncomplete {
        succeeded: usize,
        failed: usize,
        pending: usize,
    },
    #[error("Agent build {observed} is older than required {required}.")]
    VersionMismatch { required: String, observed: String },
    #[error("Cannot dispatch to agent {agent_id} in state {state}.")]
    NotArmed { agent_id: String, state: String },
}
