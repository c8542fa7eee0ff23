use crate::event::PhoneEvent;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Raw key-event program could not be parsed; nothing was sent.
    #[error("malformed key sequence at segment {segment} ({text:?}): {reason}")]
    MalformedSequence {
        segment: usize,
        text: String,
        reason: String,
    },

    #[error("phone unreachable: {0}")]
    Unreachable(String),

    #[error("phone rejected credentials (HTTP {0})")]
    AuthenticationFailed(u16),

    #[error("no free port after {attempts} attempts starting at {start}")]
    NoPortAvailable { start: u16, attempts: u16 },

    #[error("provisioning action url for {event} failed: {reason}")]
    ProvisioningFailed { event: PhoneEvent, reason: String },

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn malformed(segment: usize, text: &str, reason: impl Into<String>) -> Self {
        Error::MalformedSequence {
            segment,
            text: text.to_string(),
            reason: reason.into(),
        }
    }
}
