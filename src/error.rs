#[derive(thiserror::Error, Debug)]
pub enum DealError {
    #[error("Swipe direction must be 'left' or 'right', got '{0}'")]
    InvalidDirection(String),
    #[error("Action must be agree | complete | cancel, got '{0}'")]
    InvalidAction(String),
    #[error("Transition not allowed: {0}")]
    InvalidState(String),
    #[error("Not a participant: {0}")]
    Forbidden(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("Side effects for conversation {conversation_id} failed: {reason}")]
    SideEffectFailure {
        conversation_id: String,
        reason: String,
    },
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("Failed to encode record: {0}")]
    Encoding(String),
    #[error("Failed to decode record: {0}")]
    Decoding(#[from] minicbor::decode::Error),
    #[error("Failed to build identifier: {0}")]
    Identifier(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DealError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        DealError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Stable code a request handler can map to a response status.
    pub fn code(&self) -> &'static str {
        match self {
            DealError::InvalidDirection(_) => "INVALID_DIRECTION",
            DealError::InvalidAction(_) => "INVALID_ACTION",
            DealError::InvalidState(_) => "INVALID_STATE",
            DealError::Forbidden(_) => "FORBIDDEN",
            DealError::NotFound { .. } => "NOT_FOUND",
            DealError::PreconditionFailed(_) => "PRECONDITION_FAILED",
            DealError::SideEffectFailure { .. } => "SIDE_EFFECT_FAILURE",
            DealError::Validation(_) => "INVALID",
            DealError::Config(_) => "CONFIG",
            DealError::Storage(_)
            | DealError::Encoding(_)
            | DealError::Decoding(_)
            | DealError::Identifier(_) => "INTERNAL",
        }
    }

    /// User-facing errors are caused by the request, everything else is ours.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self.code(), "INTERNAL" | "CONFIG")
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for DealError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        DealError::Encoding(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DealError>;
