//! Agent lifecycle state and wire message types (§5, §6).
//!
//! `PublicPoseMessage` is the one type that crosses a robot boundary;
//! everything else here is local bookkeeping. Both derive `serde`'s
//! `Serialize`/`Deserialize` the way the teacher's transcript messages do
//! for cross-process transport, even though this crate's own demo keeps
//! everything in-process (§4.10: the wire format is part of the contract
//! regardless of which transport ships it).

use serde::{Deserialize, Serialize};

use crate::pose::{LiftedPose, PoseId};

/// `WAIT_FOR_DATA → WAIT_FOR_INITIALIZATION → INITIALIZED`, with `reset()`
/// returning to `WAIT_FOR_DATA` (§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    WaitForData,
    WaitForInitialization,
    Initialized,
}

/// A snapshot of one agent's progress, exposed through the public API (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub robot_id: usize,
    pub state: AgentState,
    pub iteration: usize,
    pub instance_number: usize,
    pub ready_to_terminate: bool,
    pub optimization_running: bool,
    /// Mean per-pose translation displacement since the previous iterate
    /// (`mean‖t_i − t_i^{prev}‖`, §4.7 step 3), the same quantity
    /// `readyToTerminate` gates on.
    pub relative_change: f64,
}

impl AgentStatus {
    pub fn new(robot_id: usize) -> Self {
        Self {
            robot_id,
            state: AgentState::WaitForData,
            iteration: 0,
            instance_number: 0,
            ready_to_terminate: false,
            optimization_running: false,
            relative_change: 0.0,
        }
    }
}

/// One of this robot's public poses, serialized for transmission to a
/// neighbor robot (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicPoseMessage {
    pub pose_id: WirePoseId,
    pub instance_number: usize,
    pub iteration_number: usize,
    /// Row-major `r × d` Stiefel factor.
    pub y: Vec<f64>,
    pub rank: usize,
    pub dim: usize,
    /// Translation `p ∈ ℝʳ`.
    pub p: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePoseId {
    pub robot_id: usize,
    pub frame_id: usize,
}

impl From<PoseId> for WirePoseId {
    fn from(id: PoseId) -> Self {
        Self { robot_id: id.robot_id, frame_id: id.frame_id }
    }
}

impl From<WirePoseId> for PoseId {
    fn from(id: WirePoseId) -> Self {
        PoseId::new(id.robot_id, id.frame_id)
    }
}

impl PublicPoseMessage {
    pub fn new(pose_id: PoseId, instance_number: usize, iteration_number: usize, pose: &LiftedPose) -> Self {
        Self {
            pose_id: pose_id.into(),
            instance_number,
            iteration_number,
            y: pose.y().as_slice().to_vec(),
            rank: pose.rank(),
            dim: pose.dim(),
            p: pose.p().as_slice().to_vec(),
        }
    }

    pub fn to_lifted_pose(&self) -> LiftedPose {
        let y = nalgebra::DMatrix::from_column_slice(self.rank, self.dim, &self.y);
        let p = nalgebra::DVector::from_column_slice(&self.p);
        LiftedPose::from_parts(y, p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, DVector};

    #[test]
    fn public_pose_message_roundtrips_through_json() {
        let pose = LiftedPose::from_parts(DMatrix::identity(3, 3), DVector::from_vec(vec![1.0, 2.0, 3.0]));
        let msg = PublicPoseMessage::new(PoseId::new(2, 5), 1, 10, &pose);
        let json = serde_json::to_string(&msg).unwrap();
        let back: PublicPoseMessage = serde_json::from_str(&json).unwrap();
        let round_tripped = back.to_lifted_pose();
        assert_eq!(round_tripped.y(), pose.y());
        assert_eq!(round_tripped.p(), pose.p());
    }

    #[test]
    fn agent_status_starts_wait_for_data() {
        let status = AgentStatus::new(3);
        assert_eq!(status.state, AgentState::WaitForData);
        assert!(!status.ready_to_terminate);
    }
}
