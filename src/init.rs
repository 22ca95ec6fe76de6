//! Initialization strategies (§4.8): chordal (rotation synchronization +
//! translation recovery), pure odometry chaining, and lifting an ambient
//! `SE(d)` estimate into the rank-`r` relaxation.
//!
//! The chordal solve follows the teacher-adjacent pattern in
//! `examples/other_examples/.../blechdavier-xavier-robot/src/pose_graph.rs`:
//! assemble a dense block Hessian, Tikhonov-regularize the gauge-fixed block
//! to make it invertible, convert to `CscMatrix` with `(&h).into()`, and
//! solve with `CscCholesky`. Rotation synchronization and translation
//! recovery are two independent instances of the same pattern.

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{factorization::CscCholesky, CscMatrix};
use thiserror::Error;

use crate::manifold::{project_to_rotation_group, ProductManifold};
use crate::pose::{LiftedPoseArray, RigidPose};
use crate::pose_graph::{PoseGraph, PoseGraphError};

#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    PoseGraph(#[from] PoseGraphError),
    #[error("chordal solve failed to factor the regularized system (graph may be disconnected)")]
    FactorizationFailed,
}

/// Gauge-fixing regularization weight added to pose 0's diagonal block,
/// large enough to dominate any single edge's precision while leaving the
/// rest of the (typically sparse) system's conditioning unaffected.
const ANCHOR_WEIGHT: f64 = 1e8;

/// Chordal initialization: rotation synchronization via a regularized
/// least-squares Laplacian solve, then translation recovery from the
/// resulting rotations (§4.8, "Chordal (L2 mode)").
pub fn chordal_initialization(graph: &PoseGraph) -> Result<Vec<RigidPose>, InitError> {
    let n = graph.num_poses();
    if n == 0 {
        return Err(PoseGraphError::EmptyGraph.into());
    }
    let d = graph.dim();
    let own_edges: Vec<_> = graph.odometry().iter().chain(graph.private_loop_closures().iter()).collect();

    let rotations = synchronize_rotations(n, d, &own_edges)?;
    let translations = recover_translations(n, d, &own_edges, &rotations)?;

    Ok((0..n).map(|i| RigidPose::new(rotations[i].clone(), translations[i].clone())).collect())
}

fn synchronize_rotations(n: usize, d: usize, edges: &[&crate::measurement::RelativeSeMeasurement]) -> Result<Vec<DMatrix<f64>>, InitError> {
    let mut h = DMatrix::<f64>::zeros(n * d, n * d);
    for m in edges {
        let i = m.from.frame_id;
        let j = m.to.frame_id;
        let kappa = m.weight * m.kappa;
        let id = DMatrix::<f64>::identity(d, d);

        let h_ii = h.view((i * d, i * d), (d, d)).clone_owned();
        h.view_mut((i * d, i * d), (d, d)).copy_from(&(h_ii + &id * kappa));
        let h_jj = h.view((j * d, j * d), (d, d)).clone_owned();
        h.view_mut((j * d, j * d), (d, d)).copy_from(&(h_jj + &id * kappa));

        let h_ij = h.view((i * d, j * d), (d, d)).clone_owned();
        h.view_mut((i * d, j * d), (d, d)).copy_from(&(h_ij - &m.r_hat * kappa));
        let h_ji = h.view((j * d, i * d), (d, d)).clone_owned();
        h.view_mut((j * d, i * d), (d, d)).copy_from(&(h_ji - m.r_hat.transpose() * kappa));
    }

    let anchor_block = h.view((0, 0), (d, d)).clone_owned();
    h.view_mut((0, 0), (d, d)).copy_from(&(anchor_block + DMatrix::<f64>::identity(d, d) * ANCHOR_WEIGHT));

    let mut rhs = DMatrix::<f64>::zeros(n * d, d);
    rhs.view_mut((0, 0), (d, d)).copy_from(&(DMatrix::<f64>::identity(d, d) * ANCHOR_WEIGHT));

    let h_csc: CscMatrix<f64> = (&h).into();
    let cholesky = CscCholesky::factor(&h_csc).map_err(|_| InitError::FactorizationFailed)?;
    let solved = cholesky.solve(&rhs);

    Ok((0..n).map(|i| project_to_rotation_group(&solved.view((i * d, 0), (d, d)).clone_owned())).collect())
}

fn recover_translations(
    n: usize,
    d: usize,
    edges: &[&crate::measurement::RelativeSeMeasurement],
    rotations: &[DMatrix<f64>],
) -> Result<Vec<DVector<f64>>, InitError> {
    let mut h = DMatrix::<f64>::zeros(n * d, n * d);
    let mut rhs = DMatrix::<f64>::zeros(n * d, 1);
    let id = DMatrix::<f64>::identity(d, d);

    for m in edges {
        let i = m.from.frame_id;
        let j = m.to.frame_id;
        let tau = m.weight * m.tau;

        let h_ii = h.view((i * d, i * d), (d, d)).clone_owned();
        h.view_mut((i * d, i * d), (d, d)).copy_from(&(h_ii + &id * tau));
        let h_jj = h.view((j * d, j * d), (d, d)).clone_owned();
        h.view_mut((j * d, j * d), (d, d)).copy_from(&(h_jj + &id * tau));
        let h_ij = h.view((i * d, j * d), (d, d)).clone_owned();
        h.view_mut((i * d, j * d), (d, d)).copy_from(&(h_ij - &id * tau));
        let h_ji = h.view((j * d, i * d), (d, d)).clone_owned();
        h.view_mut((j * d, i * d), (d, d)).copy_from(&(h_ji - &id * tau));

        let predicted = &rotations[i] * &m.t_hat * tau;
        let rhs_i = rhs.view((i * d, 0), (d, 1)).clone_owned();
        rhs.view_mut((i * d, 0), (d, 1)).copy_from(&(rhs_i - &predicted));
        let rhs_j = rhs.view((j * d, 0), (d, 1)).clone_owned();
        rhs.view_mut((j * d, 0), (d, 1)).copy_from(&(rhs_j + &predicted));
    }

    let anchor_block = h.view((0, 0), (d, d)).clone_owned();
    h.view_mut((0, 0), (d, d)).copy_from(&(anchor_block + &id * ANCHOR_WEIGHT));

    let h_csc: CscMatrix<f64> = (&h).into();
    let cholesky = CscCholesky::factor(&h_csc).map_err(|_| InitError::FactorizationFailed)?;
    let solved = cholesky.solve(&rhs);

    Ok((0..n).map(|i| solved.view((i * d, 0), (d, 1)).column(0).clone_owned()).collect())
}

/// Initializes poses by chaining odometry alone, starting from the identity
/// at pose 0; used when a robot has no loop closures yet (§4.8).
pub fn odometry_initialization(graph: &PoseGraph) -> Vec<RigidPose> {
    let n = graph.num_poses();
    let d = graph.dim();
    let mut poses = vec![RigidPose::identity(d); n];
    let mut by_from = std::collections::HashMap::new();
    for m in graph.odometry() {
        by_from.insert(m.from.frame_id, m);
    }
    for i in 0..n.saturating_sub(1) {
        if let Some(m) = by_from.get(&i) {
            let increment = RigidPose::new(m.r_hat.clone(), m.t_hat.clone());
            poses[i + 1] = poses[i].compose(&increment);
        } else {
            poses[i + 1] = poses[i].clone();
        }
    }
    poses
}

/// Lifts an ambient `SE(d)` estimate into the rank-`r` relaxation:
/// `X_i = Y_lift · [R_i | t_i]` (§4.8, "Lifted initialization").
pub fn lift_estimate(ambient: &[RigidPose], manifold: &ProductManifold, y_lift: &DMatrix<f64>) -> LiftedPoseArray {
    assert_eq!(y_lift.nrows(), manifold.r);
    assert_eq!(y_lift.ncols(), manifold.d);
    let n = ambient.len();
    let mut out = LiftedPoseArray::zeros(manifold.r, manifold.d, n);
    for (i, pose) in ambient.iter().enumerate() {
        let lifted_block = y_lift * pose.as_block();
        out.matrix_mut().view_mut((0, i * (manifold.d + 1)), (manifold.r, manifold.d + 1)).copy_from(&lifted_block);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::RelativeSeMeasurement;
    use crate::pose::PoseId;

    fn rot_z(theta: f64) -> DMatrix<f64> {
        DMatrix::from_row_slice(2, 2, &[theta.cos(), -theta.sin(), theta.sin(), theta.cos()])
    }

    #[test]
    fn chordal_initialization_recovers_a_simple_square() {
        let mut graph = PoseGraph::new(0, 2, 2);
        let step = RelativeSeMeasurement::odometry(PoseId::new(0, 0), PoseId::new(0, 1), rot_z(std::f64::consts::FRAC_PI_2), DVector::from_vec(vec![1.0, 0.0]), 10.0, 10.0);
        for k in 0..4 {
            let mut m = step.clone();
            m.from = PoseId::new(0, k);
            m.to = PoseId::new(0, k + 1);
            graph.add_measurement(m).unwrap();
        }
        // Loop closure back to pose 0 confirms the square closes.
        graph
            .add_measurement(RelativeSeMeasurement::new(PoseId::new(0, 4), PoseId::new(0, 0), DMatrix::identity(2, 2), DVector::zeros(2), 10.0, 10.0))
            .unwrap();

        let poses = chordal_initialization(&graph).unwrap();
        assert_eq!(poses.len(), 5);
        assert!(poses[0].satisfies_so_d(1e-6));
    }

    #[test]
    fn odometry_initialization_chains_consecutive_steps() {
        let mut graph = PoseGraph::new(0, 2, 2);
        graph
            .add_measurement(RelativeSeMeasurement::odometry(PoseId::new(0, 0), PoseId::new(0, 1), DMatrix::identity(2, 2), DVector::from_vec(vec![1.0, 0.0]), 1.0, 1.0))
            .unwrap();
        let poses = odometry_initialization(&graph);
        assert_eq!(poses.len(), 2);
        assert!((poses[1].translation() - DVector::from_vec(vec![1.0, 0.0])).norm() < 1e-9);
    }

    #[test]
    fn lift_estimate_produces_stiefel_blocks() {
        let manifold = ProductManifold::new(3, 2, 1);
        let y_lift = manifold.random_in_manifold(Some(2)).get_pose(0).y();
        let ambient = vec![RigidPose::identity(2)];
        let lifted = lift_estimate(&ambient, &manifold, &y_lift);
        assert!(lifted.get_pose(0).satisfies_stiefel(1e-8));
    }
}
