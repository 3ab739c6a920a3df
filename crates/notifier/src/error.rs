use thiserror::Error;

/// Errors raised while constructing a sink. Send failures are not errors;
/// they are reported as a [`DeliveryOutcome`](relay_common::types::DeliveryOutcome).
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Unknown sink provider '{0}' (expected sendgrid, webhook or log)")]
    UnknownProvider(String),

    #[error("Sink provider '{provider}' requires {setting}")]
    MissingSetting {
        provider: &'static str,
        setting: &'static str,
    },

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}
