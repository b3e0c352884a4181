use thiserror::Error;

/// State-machine and uniqueness violations surfaced to callers as conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConflictKind {
    #[error("opportunity is already marked as won")]
    AlreadyWon,
    #[error("opportunity is already marked as lost")]
    AlreadyLost,
    #[error("a lost opportunity cannot be marked as won")]
    CannotWinLost,
    #[error("a won opportunity cannot be marked as lost")]
    CannotLoseWon,
    #[error("opportunity is closed; stage can no longer change")]
    OpportunityClosed,
    #[error("contract number already exists")]
    DuplicateContractNumber,
    #[error("opportunity has already been added to the pipeline")]
    AlreadyInPipeline,
    #[error("user is already assigned to this opportunity")]
    DuplicateTeamAssignment,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DomainError {
    #[error("{message}")]
    Validation {
        message: String,
        details: Vec<String>,
    },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error(transparent)]
    Conflict(#[from] ConflictKind),
    #[error("{0}")]
    Forbidden(String),
    #[error("upstream source failed: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl DomainError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_conflict(&self, kind: ConflictKind) -> bool {
        matches!(self, Self::Conflict(k) if *k == kind)
    }
}

pub type DomainResult<T> = Result<T, DomainError>;
