//! Robust multi-robot frame alignment (§4.6).
//!
//! A shared loop closure between one of this robot's poses and a neighbor's
//! pose, together with both sides' current lifted estimates, yields a
//! candidate rigid transform `(C, s) ∈ O(r) × ℝʳ` carrying the neighbor's
//! lifted frame into this robot's lifted frame. Writing the measurement in
//! the normalized form `mine = neighbor ⊕ (r_use, t_use)` (inverting it when
//! the edge was stated the other way around),
//!
//! ```text
//! predicted_Y_i = C · (Y_j · r_use)
//! predicted_p_i = C · (p_j + Y_j · t_use) + s
//! ```
//!
//! so the per-edge candidate is the orthogonal Procrustes solution
//! `C = project_to_rotation_group(Y_i · (Y_j·R̂)ᵀ)` and
//! `s = p_i − C·(p_j + Y_j·t̂)`. Two-stage alignment averages the `C`
//! candidates and then the `s` candidates independently
//! (`crate::robust_averaging::robust_single_rotation_averaging` /
//! `robust_single_translation_averaging`); one-stage alignment averages them
//! jointly (`robust_single_pose_averaging`). Grounded on the same Procrustes
//! construction `manifold::project_to_rotation_group` already uses for the
//! rank-`d` case, generalized to rank `r`.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;
use tracing::debug;

use crate::manifold::project_to_rotation_group;
use crate::measurement::RelativeSeMeasurement;
use crate::pose::{LiftedPose, PoseId};
use crate::robust_averaging::{robust_single_pose_averaging, robust_single_rotation_averaging, robust_single_translation_averaging};

#[derive(Debug, Error)]
pub enum AlignmentError {
    #[error("no shared loop closures available to align against")]
    NoSharedEdges,
    #[error("alignment found {found} inlier candidates, fewer than the required {required}")]
    InsufficientInliers { found: usize, required: usize },
    #[error("pose {0:?} referenced by a shared edge has no known estimate")]
    MissingEstimate(PoseId),
}

/// A rigid transform `(C, s) ∈ O(r) × ℝʳ` carrying a neighbor's lifted frame
/// into this robot's lifted frame, plus which edges contributed.
#[derive(Debug, Clone)]
pub struct FrameAlignment {
    pub rotation: DMatrix<f64>,
    pub translation: DVector<f64>,
    pub inlier_edges: Vec<bool>,
}

struct Candidate {
    rotation: DMatrix<f64>,
    translation: DVector<f64>,
    kappa: f64,
    tau: f64,
}

fn build_candidates(
    my_robot_id: usize,
    shared_edges: &[RelativeSeMeasurement],
    pose_lookup: &dyn Fn(PoseId) -> Option<LiftedPose>,
) -> Result<Vec<Candidate>, AlignmentError> {
    if shared_edges.is_empty() {
        return Err(AlignmentError::NoSharedEdges);
    }
    let mut candidates = Vec::with_capacity(shared_edges.len());
    for m in shared_edges {
        let (my_id, nbr_id, r_hat, t_hat, flip) = if m.from.robot_id == my_robot_id {
            (m.from, m.to, m.r_hat.clone(), m.t_hat.clone(), false)
        } else {
            (m.to, m.from, m.r_hat.clone(), m.t_hat.clone(), true)
        };
        let my_pose = pose_lookup(my_id).ok_or(AlignmentError::MissingEstimate(my_id))?;
        let nbr_pose = pose_lookup(nbr_id).ok_or(AlignmentError::MissingEstimate(nbr_id))?;

        // A measurement always means `to = from ⊕ (R̂, t̂)`. When my pose is
        // the `from` endpoint, invert the relative transform so it reads
        // `mine = neighbor ⊕ (r_use, t_use)` either way.
        let (r_use, t_use) = if flip {
            (r_hat, t_hat)
        } else {
            let r_inv = r_hat.transpose();
            (r_inv.clone(), -(&r_inv * &t_hat))
        };

        let predicted_y = nbr_pose.y() * &r_use;
        let rotation = project_to_rotation_group(&(my_pose.y() * predicted_y.transpose()));
        let predicted_p = &nbr_pose.p() + nbr_pose.y() * &t_use;
        let translation = my_pose.p() - &rotation * predicted_p;

        candidates.push(Candidate { rotation, translation, kappa: m.weight * m.kappa, tau: m.weight * m.tau });
    }
    Ok(candidates)
}

/// Two-stage alignment: rotation averaging, then translation averaging
/// using the averaged rotation's residual (§4.6).
pub fn two_stage_frame_alignment(
    my_robot_id: usize,
    shared_edges: &[RelativeSeMeasurement],
    pose_lookup: &dyn Fn(PoseId) -> Option<LiftedPose>,
    rotation_gate: f64,
    translation_gate: f64,
    min_inliers: usize,
) -> Result<FrameAlignment, AlignmentError> {
    let candidates = build_candidates(my_robot_id, shared_edges, pose_lookup)?;
    let rotations: Vec<DMatrix<f64>> = candidates.iter().map(|c| c.rotation.clone()).collect();
    let kappas: Vec<f64> = candidates.iter().map(|c| c.kappa).collect();
    let rot_result = robust_single_rotation_averaging(&rotations, &kappas, rotation_gate);

    let translations: Vec<DVector<f64>> = candidates.iter().map(|c| c.translation.clone()).collect();
    let taus: Vec<f64> = candidates.iter().map(|c| c.tau).collect();
    let trans_result = robust_single_translation_averaging(&translations, &taus, translation_gate);

    let inlier_edges: Vec<bool> = rot_result.inliers.iter().zip(&trans_result.inliers).map(|(&a, &b)| a && b).collect();
    let found = inlier_edges.iter().filter(|&&b| b).count();
    if found < min_inliers {
        debug!(my_robot_id, found, required = min_inliers, "two-stage frame alignment insufficient inliers");
        return Err(AlignmentError::InsufficientInliers { found, required: min_inliers });
    }
    debug!(my_robot_id, found, "two-stage frame alignment succeeded");

    Ok(FrameAlignment { rotation: rot_result.mean, translation: trans_result.mean, inlier_edges })
}

/// One-stage alignment: joint robust pose averaging at fixed empirical
/// precisions `kappa, tau` gated by `cbar` (§4.6).
pub fn one_stage_frame_alignment(
    my_robot_id: usize,
    shared_edges: &[RelativeSeMeasurement],
    pose_lookup: &dyn Fn(PoseId) -> Option<LiftedPose>,
    kappa: f64,
    tau: f64,
    cbar: f64,
    min_inliers: usize,
) -> Result<FrameAlignment, AlignmentError> {
    let candidates = build_candidates(my_robot_id, shared_edges, pose_lookup)?;
    let rotations: Vec<DMatrix<f64>> = candidates.iter().map(|c| c.rotation.clone()).collect();
    let translations: Vec<DVector<f64>> = candidates.iter().map(|c| c.translation.clone()).collect();

    let result = robust_single_pose_averaging(&rotations, &translations, kappa, tau, cbar);
    let found = result.inliers.iter().filter(|&&b| b).count();
    if found < min_inliers {
        debug!(my_robot_id, found, required = min_inliers, "one-stage frame alignment insufficient inliers");
        return Err(AlignmentError::InsufficientInliers { found, required: min_inliers });
    }
    debug!(my_robot_id, found, "one-stage frame alignment succeeded");

    Ok(FrameAlignment { rotation: result.mean_rotation, translation: result.mean_translation, inlier_edges: result.inliers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn rot_z(theta: f64) -> DMatrix<f64> {
        DMatrix::from_row_slice(2, 2, &[theta.cos(), -theta.sin(), theta.sin(), theta.cos()])
    }

    fn identity_measurement(from: PoseId, to: PoseId) -> RelativeSeMeasurement {
        RelativeSeMeasurement::new(from, to, DMatrix::identity(2, 2), DVector::zeros(2), 1.0, 1.0)
    }

    #[test]
    fn two_stage_alignment_recovers_known_offset_transform() {
        // Neighbor frame is my frame rotated by `true_c` and shifted by `true_s`.
        let true_c = rot_z(0.3);
        let true_s = DVector::from_vec(vec![2.0, -1.0]);

        let mut poses = HashMap::new();
        for k in 0..4u64 {
            let nbr_id = PoseId::new(1, k as usize);
            let y_nbr = rot_z(0.1 * k as f64);
            let p_nbr = DVector::from_vec(vec![k as f64, 0.0]);
            poses.insert(nbr_id, LiftedPose::from_parts(y_nbr.clone(), p_nbr.clone()));

            let my_id = PoseId::new(0, k as usize);
            let y_mine = &true_c * &y_nbr;
            let p_mine = &true_c * &p_nbr + &true_s;
            poses.insert(my_id, LiftedPose::from_parts(y_mine, p_mine));
        }

        let edges: Vec<RelativeSeMeasurement> = (0..4u64)
            .map(|k| identity_measurement(PoseId::new(1, k as usize), PoseId::new(0, k as usize)))
            .collect();

        let lookup = |id: PoseId| poses.get(&id).cloned();
        let result = two_stage_frame_alignment(0, &edges, &lookup, 1.0, 1.0, 2).unwrap();
        assert!((&result.rotation - &true_c).norm() < 1e-6);
        assert!((&result.translation - &true_s).norm() < 1e-6);
    }

    #[test]
    fn alignment_fails_with_no_shared_edges() {
        let lookup = |_id: PoseId| None;
        let err = two_stage_frame_alignment(0, &[], &lookup, 1.0, 1.0, 1).unwrap_err();
        assert!(matches!(err, AlignmentError::NoSharedEdges));
    }
}
