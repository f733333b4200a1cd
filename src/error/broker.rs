use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection error to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Bind error on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Connection closed.")]
    ConnectionClosed,
    #[error("Wire message exceeded max size ({max_bytes} bytes).")]
    MessageTooLarge { max_bytes: usize },
    #[error("Wire message was not valid UTF-8: {source}")]
    InvalidUtf8 {
        #[source]
        source: std::str::Utf8Error,
    },
    #[error("Serialization error during {context}: {source}")]
    Serialize {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Deserialization error during {context}: {source}")]
    Deserialize {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Subscription closed.")]
    SubscriptionClosed,
    #[error("Broker writer task stopped.")]
    WriterClosed,
    #[cfg(test)]
    #[error("Test expectation failed: {0}")]
    TestExpectation(String),
}

#[cfg(test)]
impl From<String> for BrokerError {
    fn from(message: String) -> Self {
        Self::TestExpectation(message)
    }
}

#[cfg(test)]
impl From<&str> for BrokerError {
    fn from(message: &str) -> Self {
        Self::TestExpectation(message.to_owned())
    }
}
