mod app;
mod broker;
mod config;
mod phase;
mod rate;
mod session;

pub use app::{AppError, AppResult};
pub use broker::BrokerError;
pub use config::ConfigError;
pub use phase::PhaseError;
pub use rate::RateError;
pub use session::SessionError;
