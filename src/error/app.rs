use thiserror::Error;

use super::{BrokerError, ConfigError, PhaseError, RateError, SessionError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("CLI error: {source}")]
    Clap {
        #[from]
        source: clap::Error,
    },
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("HTTP client error: {source}")]
    Reqwest {
        #[from]
        source: reqwest::Error,
    },
    #[error("Join error: {source}")]
    Join {
        #[from]
        source: tokio::task::JoinError,
    },
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Phase error: {0}")]
    Phase(#[from] PhaseError),
    #[error("Rate search error: {0}")]
    Rate(#[from] RateError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn broker<E>(error: E) -> Self
    where
        E: Into<BrokerError>,
    {
        error.into().into()
    }

    pub fn config<E>(error: E) -> Self
    where
        E: Into<ConfigError>,
    {
        error.into().into()
    }

    pub fn phase<E>(error: E) -> Self
    where
        E: Into<PhaseError>,
    {
        error.into().into()
    }

    pub fn rate<E>(error: E) -> Self
    where
        E: Into<RateError>,
    {
        error.into().into()
    }

    pub fn session<E>(error: E) -> Self
    where
        E: Into<SessionError>,
    {
        error.into().into()
    }
}
