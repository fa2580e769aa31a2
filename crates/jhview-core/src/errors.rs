use thiserror::Error;

#[derive(Error, Debug)]
pub enum JhviewError {
    #[error("Configuration invalid: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Channel closed")]
    ChannelClosed,

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },
}
