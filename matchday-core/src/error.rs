use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the conversation and notification core.
///
/// Authorization and validation variants are surfaced to callers;
/// `Delivery` never escapes a dispatch site as a failure of the write that
/// triggered it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not a participant of this conversation")]
    NotAParticipant,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("empty input")]
    EmptyInput,

    #[error("messages belong to more than one conversation")]
    CrossConversation,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("delivery error: {0}")]
    Delivery(String),
}

impl Error {
    /// True for caller mistakes (4xx-equivalent), false for infrastructure
    /// failures.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::NotAParticipant
                | Error::NotFound(_)
                | Error::EmptyInput
                | Error::CrossConversation
                | Error::InvalidInput(_)
        )
    }
}
