use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to reach {endpoint} after {attempts} attempt(s): {message}")]
    Connect {
        endpoint: String,
        attempts: u32,
        message: String,
    },
    #[error("Failed to spawn remote command: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
    #[error("Command exceeded its {timeout_ms}ms deadline (elapsed {elapsed_ms}ms).")]
    Timeout { timeout_ms: u64, elapsed_ms: u64 },
    #[error("Transfer of {path} failed: {message}")]
    Transfer { path: String, message: String },
    #[error("Command exited with status {status}.")]
    NonZeroExit { status: i64 },
    #[error("Command was aborted before completion.")]
    Aborted,
}
