use thiserror::Error;

/// Structural errors found while building a control flow graph.
///
/// All of these are fatal for the function being optimized.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CfgError {
    #[error("malformed input at {address:#x}: {reason}")]
    MalformedInput { address: u64, reason: String },
    #[error("function has no instructions")]
    EmptyFunction,
    #[error("entry address {0:#x} is not an instruction boundary")]
    EntryNotFound(u64),
    #[error("duplicate instruction address {0:#x}")]
    DuplicateAddress(u64),
    #[error("inconsistent control flow graph: {0}")]
    InvalidGraph(String),
}

pub type Result<T> = std::result::Result<T, CfgError>;
