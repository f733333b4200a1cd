use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML config {path}: {source}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },
    #[error("Failed to parse JSON config {path}: {source}")]
    ParseJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Unsupported config extension: {ext}")]
    UnsupportedExtension { ext: String },
    #[error("Config file has no extension.")]
    MissingExtension,
    #[error("Missing target URL (set --url or [http].url in config).")]
    MissingTargetUrl,
    #[error("Invalid target URL {url}: {source}")]
    InvalidTargetUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("Expected agent count must be >= 1.")]
    NoAgentsExpected,
    #[error("Bad {tool} benchmark spec: {message}")]
    BadBenchSpec { tool: &'static str, message: String },
    #[error("Per-agent topics require agent names, not a bare count.")]
    PerAgentTopicsNeedNames,
    #[error("Invalid route spec {value} (expected dest_cidr,gateway[,device]).")]
    InvalidRoute { value: String },
    #[error("Unknown benchmark tool {tool} (expected http or udp).")]
    UnknownTool { tool: String },
    #[error("Missing broker address (set --broker or [fleet].broker in config).")]
    MissingBroker,
}
