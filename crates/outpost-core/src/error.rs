use crate::outpost_ipc::FrameError;
use crate::state_store::StoreError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutpostError {
    #[error("caller {caller} may not view outpost {outpost_id}")]
    AuthorizationDenied { caller: String, outpost_id: String },
    #[error("outpost {0} does not exist")]
    OutpostNotFound(String),
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] FrameError),
    #[error("unknown instruction {0}")]
    UnknownInstruction(i64),
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

impl OutpostError {
    /// Whether the connection attempt must be refused outright.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            OutpostError::AuthorizationDenied { .. } | OutpostError::OutpostNotFound(_)
        )
    }

    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OutpostError::StoreUnavailable(_))
    }
}
