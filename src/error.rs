//! Errors
//!
//! None of these are recovered locally: a worker hitting one aborts its peers and the coordinator reports it
//!

use super::util::{NodeIndex, Round};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NmfError {
    /// a message cannot be reconciled with what the receiver expects
    #[error("protocol violation in {op} at round {round}: worker {node} got {detail} from worker {peer}")]
    ProtocolViolation {
        op: &'static str,
        round: Round,
        node: NodeIndex,
        peer: NodeIndex,
        detail: String,
    },
    /// a block lacks the shape its role requires
    #[error("dimension mismatch in {op} at round {round}: block from worker {peer:?} is {found:?}, expected {expected:?}")]
    DimensionMismatch {
        op: &'static str,
        round: Round,
        peer: Option<NodeIndex>,
        expected: (usize, usize),
        found: (usize, usize),
    },
    /// a worker waited past the deadline for its peers
    #[error("timeout in {op} at round {round}: worker {node} still waiting for workers {missing:?}")]
    Timeout {
        op: &'static str,
        round: Round,
        node: NodeIndex,
        missing: Vec<NodeIndex>,
    },
    /// a peer gave up and told everyone else
    #[error("worker {node} stopped in {op} at round {round} because worker {peer} aborted")]
    PeerAborted {
        op: &'static str,
        round: Round,
        node: NodeIndex,
        peer: NodeIndex,
    },
    #[error("worker {node} panicked")]
    WorkerPanicked { node: NodeIndex },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl NmfError {
    /// errors caused by another worker's failure rather than by this worker
    pub fn is_secondary(&self) -> bool {
        matches!(self, Self::PeerAborted { .. })
    }
}
