use crate::model::{GroupId, ResourceId};

#[derive(Debug, PartialEq, Eq)]
pub enum EngineError {
    NotFound(ResourceId),
    GroupNotFound(GroupId),
    AlreadyExists(ResourceId),
    GroupAlreadyExists(GroupId),
    CycleDetected(ResourceId),
    HasChildren(ResourceId),
    /// A datum or argument that can never be reconciled, e.g. a timestamp out of range.
    InvalidDatum(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "resource not found: {id}"),
            EngineError::GroupNotFound(id) => write!(f, "group not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "resource already exists: {id}"),
            EngineError::GroupAlreadyExists(id) => write!(f, "group already exists: {id}"),
            EngineError::CycleDetected(id) => write!(f, "cycle detected at resource: {id}"),
            EngineError::HasChildren(id) => {
                write!(f, "cannot delete resource {id}: has children")
            }
            EngineError::InvalidDatum(msg) => write!(f, "invalid datum: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
