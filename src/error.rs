//! Crate-wide error taxonomy.
//!
//! Per-module errors (`PoseGraphError`, `G2oError`, `AlignmentError`, …) are
//! defined next to the code that raises them and folded into [`AgentError`]
//! via `#[from]`, mirroring how `myzkp::domain::DomainError` and
//! `myzkp::air::AirError` stay local to their modules while the crate root
//! only re-exports the aliases callers need.
//!
//! Precondition violations (wrong agent state, dimension mismatches, an
//! unset lifting matrix) are programmer errors: they fail loudly through
//! this enum rather than being silently absorbed, per the error-handling
//! design in the spec. Recoverable runtime conditions (a degenerate local
//! solve, a neighbor pose that hasn't arrived yet) are communicated through
//! `bool`/`Option` return values at the call site instead of an `Err`, since
//! the agent must keep iterating rather than abort.

use thiserror::Error;

use crate::alignment::AlignmentError;
use crate::g2o::G2oError;
use crate::init::InitError;
use crate::pose_graph::PoseGraphError;
use crate::status::AgentState;

/// Errors returned by the public [`crate::agent::Agent`] API.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("operation requires state {expected:?}, agent is in {actual:?}")]
    WrongState {
        expected: AgentState,
        actual: AgentState,
    },

    #[error("lifting matrix not set for non-root robot {robot_id}")]
    LiftingMatrixUnset { robot_id: usize },

    #[error("lifting matrix already set; it is immutable until reset()")]
    LiftingMatrixAlreadySet,

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: String, got: String },

    #[error("global anchor has rank {got}, expected {expected}")]
    AnchorRankMismatch { expected: usize, got: usize },

    #[error(transparent)]
    PoseGraph(#[from] PoseGraphError),

    #[error(transparent)]
    G2o(#[from] G2oError),

    #[error(transparent)]
    Alignment(#[from] AlignmentError),

    #[error(transparent)]
    Init(#[from] InitError),
}
