//! Measurement store, neighbor bookkeeping, and data-matrix assembly.
//!
//! `Q`/`G` are assembled densely: each edge contributes a rank-`(d+1)` outer
//! product `C_e C_eᵀ` to the `n(d+1) × n(d+1)` column space, split between
//! `Q` (own-own columns) and `G` (own-neighbor columns), exactly reproducing
//! `f(X) = tr(X Q Xᵀ) + 2·tr(X G X_Nᵀ)` (§4.3) without ever materializing a
//! `vec(R)`-sized state. Cache invalidation on weight change mirrors the
//! discipline the teacher applies to its own derived artifacts
//! (`quotient.rs`'s never-materialize-twice rule). Rotation synchronization
//! and translation recovery (§4.8) are a separate linear system entirely,
//! assembled and solved in [`crate::init`].

use std::collections::BTreeSet;

use nalgebra::DMatrix;
use thiserror::Error;
use tracing::debug;

use crate::measurement::RelativeSeMeasurement;
use crate::pose::PoseId;

#[derive(Debug, Error)]
pub enum PoseGraphError {
    #[error("measurement endpoint {0:?} does not belong to robot {1}")]
    WrongRobot(PoseId, usize),
    #[error("pose graph has no own poses; cannot assemble data matrices")]
    EmptyGraph,
    #[error("neighbor pose {0:?} missing from X_N while assembling G")]
    MissingNeighborPose(PoseId),
}

#[derive(Debug, Clone)]
struct CachedMatrices {
    q: DMatrix<f64>,
    g: DMatrix<f64>,
    neighbor_ids: Vec<PoseId>,
}

/// One robot's slice of the team pose graph (§3).
#[derive(Debug, Clone)]
pub struct PoseGraph {
    robot_id: usize,
    r: usize,
    d: usize,
    num_poses: usize,
    odometry: Vec<RelativeSeMeasurement>,
    private_loop_closures: Vec<RelativeSeMeasurement>,
    shared_loop_closures: Vec<RelativeSeMeasurement>,
    cache: Option<CachedMatrices>,
}

impl PoseGraph {
    pub fn new(robot_id: usize, r: usize, d: usize) -> Self {
        Self {
            robot_id,
            r,
            d,
            num_poses: 0,
            odometry: Vec::new(),
            private_loop_closures: Vec::new(),
            shared_loop_closures: Vec::new(),
            cache: None,
        }
    }

    pub fn robot_id(&self) -> usize {
        self.robot_id
    }
    pub fn rank(&self) -> usize {
        self.r
    }
    pub fn dim(&self) -> usize {
        self.d
    }
    pub fn num_poses(&self) -> usize {
        self.num_poses
    }

    fn touch_num_poses(&mut self, m: &RelativeSeMeasurement) {
        if m.from.robot_id == self.robot_id {
            self.num_poses = self.num_poses.max(m.from.frame_id + 1);
        }
        if m.to.robot_id == self.robot_id {
            self.num_poses = self.num_poses.max(m.to.frame_id + 1);
        }
    }

    /// Adds one measurement, classifying it into odometry / private loop
    /// closure / shared loop closure based on its endpoints.
    pub fn add_measurement(&mut self, m: RelativeSeMeasurement) -> Result<(), PoseGraphError> {
        if m.from.robot_id != self.robot_id && m.to.robot_id != self.robot_id {
            return Err(PoseGraphError::WrongRobot(m.from, self.robot_id));
        }
        self.touch_num_poses(&m);
        self.cache = None;
        if m.is_inter_robot() {
            debug!(robot_id = self.robot_id, from = ?m.from, to = ?m.to, "shared loop closure added");
            self.shared_loop_closures.push(m);
        } else if m.to.frame_id == m.from.frame_id + 1 {
            self.odometry.push(m);
        } else {
            debug!(robot_id = self.robot_id, from = ?m.from, to = ?m.to, "private loop closure added");
            self.private_loop_closures.push(m);
        }
        Ok(())
    }

    /// Replaces the graph wholesale (§6 `setMeasurements`).
    pub fn set_measurements(
        &mut self,
        odometry: Vec<RelativeSeMeasurement>,
        private_loop_closures: Vec<RelativeSeMeasurement>,
        shared_loop_closures: Vec<RelativeSeMeasurement>,
    ) {
        self.odometry = Vec::new();
        self.private_loop_closures = Vec::new();
        self.shared_loop_closures = Vec::new();
        self.num_poses = 0;
        self.cache = None;
        for m in odometry.into_iter().chain(private_loop_closures).chain(shared_loop_closures) {
            // add_measurement reclassifies based on structure, which is
            // always consistent with the caller's partition.
            let _ = self.add_measurement(m);
        }
    }

    pub fn odometry(&self) -> &[RelativeSeMeasurement] {
        &self.odometry
    }
    pub fn private_loop_closures(&self) -> &[RelativeSeMeasurement] {
        &self.private_loop_closures
    }
    pub fn shared_loop_closures(&self) -> &[RelativeSeMeasurement] {
        &self.shared_loop_closures
    }
    pub fn shared_loop_closures_mut(&mut self) -> &mut Vec<RelativeSeMeasurement> {
        self.cache = None;
        &mut self.shared_loop_closures
    }
    pub fn private_loop_closures_mut(&mut self) -> &mut Vec<RelativeSeMeasurement> {
        self.cache = None;
        &mut self.private_loop_closures
    }

    fn all_edges(&self) -> impl Iterator<Item = &RelativeSeMeasurement> {
        self.odometry
            .iter()
            .chain(self.private_loop_closures.iter())
            .chain(self.shared_loop_closures.iter())
    }

    /// Own poses referenced by at least one inter-robot edge.
    pub fn my_public_pose_ids(&self) -> Vec<PoseId> {
        let mut set = BTreeSet::new();
        for m in &self.shared_loop_closures {
            if m.from.robot_id == self.robot_id {
                set.insert(m.from);
            }
            if m.to.robot_id == self.robot_id {
                set.insert(m.to);
            }
        }
        set.into_iter().collect()
    }

    /// Poses on other robots referenced by one of this robot's inter-robot
    /// edges, in a stable (sorted) order.
    pub fn neighbor_public_pose_ids(&self) -> Vec<PoseId> {
        let mut set = BTreeSet::new();
        for m in &self.shared_loop_closures {
            if m.from.robot_id != self.robot_id {
                set.insert(m.from);
            }
            if m.to.robot_id != self.robot_id {
                set.insert(m.to);
            }
        }
        set.into_iter().collect()
    }

    /// Invalidates `Q`, `G` (and their neighbor-ordering); called whenever a
    /// measurement weight or the graph's contents change.
    pub fn invalidate_cache(&mut self) {
        self.cache = None;
    }

    /// Column range `[start, start+d+1)` of the own block for pose index `i`.
    fn own_col(i: usize, d: usize) -> usize {
        i * (d + 1)
    }

    /// Resolves pose `p` to a column offset in the combined `[own | neighbor]`
    /// space. Returns `None` if `p` belongs to neither.
    fn column_offset(
        &self,
        p: PoseId,
        own_width: usize,
        neighbor_ids: &[PoseId],
    ) -> Option<usize> {
        if p.robot_id == self.robot_id {
            Some(Self::own_col(p.frame_id, self.d))
        } else {
            neighbor_ids
                .iter()
                .position(|&q| q == p)
                .map(|idx| own_width + idx * (self.d + 1))
        }
    }

    /// Builds `C_e` (size `total_width × (d+1)`) for one edge, given the
    /// resolved column offsets of its two endpoints.
    fn build_edge_columns(&self, m: &RelativeSeMeasurement, total_width: usize, off_from: usize, off_to: usize) -> DMatrix<f64> {
        let d = self.d;
        let mut c = DMatrix::<f64>::zeros(total_width, d + 1);
        let sqrt_kappa = (m.weight * m.kappa).max(0.0).sqrt();
        let sqrt_tau = (m.weight * m.tau).max(0.0).sqrt();

        // Rotation columns (width d): -R̂ at `from`, +I_d at `to`.
        c.view_mut((off_from, 0), (d, d)).copy_from(&(&m.r_hat * (-sqrt_kappa)));
        c.view_mut((off_to, 0), (d, d)).copy_from(&(DMatrix::<f64>::identity(d, d) * sqrt_kappa));

        // Translation column: -t̂(k) on `from`'s rotation rows, -1 on
        // `from`'s translation row, +1 on `to`'s translation row.
        for k in 0..d {
            c[(off_from + k, d)] = -sqrt_tau * m.t_hat[k];
        }
        c[(off_from + d, d)] = -sqrt_tau;
        c[(off_to + d, d)] = sqrt_tau;
        c
    }

    /// Assembles `Q` and `G` (§3, §4.2, §4.3). Returns the neighbor pose
    /// ordering used for `G`'s columns (matches `neighbor_public_pose_ids`).
    pub fn data_matrices(&mut self) -> Result<(&DMatrix<f64>, &DMatrix<f64>, &[PoseId]), PoseGraphError> {
        if self.num_poses == 0 {
            return Err(PoseGraphError::EmptyGraph);
        }
        if self.cache.is_none() {
            let computed = self.compute_data_matrices();
            debug!(robot_id = self.robot_id, n = self.num_poses, neighbors = computed.neighbor_ids.len(), "data matrices rebuilt");
            self.cache = Some(computed);
        }
        let cache = self.cache.as_ref().unwrap();
        Ok((&cache.q, &cache.g, &cache.neighbor_ids))
    }

    fn compute_data_matrices(&self) -> CachedMatrices {
        let d = self.d;
        let n = self.num_poses;
        let own_width = n * (d + 1);
        let neighbor_ids = self.neighbor_public_pose_ids();
        let k = neighbor_ids.len();
        let total_width = own_width + k * (d + 1);

        let mut full = DMatrix::<f64>::zeros(total_width, total_width);
        for m in self.all_edges() {
            let off_from = match self.column_offset(m.from, own_width, &neighbor_ids) {
                Some(o) => o,
                None => continue,
            };
            let off_to = match self.column_offset(m.to, own_width, &neighbor_ids) {
                Some(o) => o,
                None => continue,
            };
            let c = self.build_edge_columns(m, total_width, off_from, off_to);
            full += &c * c.transpose();
        }

        let q = full.view((0, 0), (own_width, own_width)).clone_owned();
        let g = if k > 0 {
            full.view((0, own_width), (own_width, k * (d + 1))).clone_owned()
        } else {
            DMatrix::zeros(own_width, 0)
        };
        CachedMatrices { q, g, neighbor_ids }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, DVector};

    fn identity_measurement(from: PoseId, to: PoseId, d: usize) -> RelativeSeMeasurement {
        RelativeSeMeasurement::new(from, to, DMatrix::identity(d, d), DVector::zeros(d), 1.0, 1.0)
    }

    #[test]
    fn classifies_odometry_private_and_shared() {
        let mut g = PoseGraph::new(0, 3, 3);
        g.add_measurement(identity_measurement(PoseId::new(0, 0), PoseId::new(0, 1), 3)).unwrap();
        g.add_measurement(identity_measurement(PoseId::new(0, 0), PoseId::new(0, 3), 3)).unwrap();
        g.add_measurement(identity_measurement(PoseId::new(0, 1), PoseId::new(1, 0), 3)).unwrap();
        assert_eq!(g.odometry().len(), 1);
        assert_eq!(g.private_loop_closures().len(), 1);
        assert_eq!(g.shared_loop_closures().len(), 1);
        assert_eq!(g.my_public_pose_ids(), vec![PoseId::new(0, 1)]);
        assert_eq!(g.neighbor_public_pose_ids(), vec![PoseId::new(1, 0)]);
    }

    #[test]
    fn data_matrices_are_symmetric_psd_shaped() {
        let mut g = PoseGraph::new(0, 3, 3);
        for i in 0..4 {
            g.add_measurement(identity_measurement(PoseId::new(0, i), PoseId::new(0, i + 1), 3)).unwrap();
        }
        let (q, gmat, nbrs) = g.data_matrices().unwrap();
        assert_eq!(q.nrows(), 5 * 4);
        assert_eq!(q.ncols(), 5 * 4);
        assert!(nbrs.is_empty());
        assert_eq!(gmat.ncols(), 0);
        assert!((q - q.transpose()).norm() < 1e-9);
    }

    #[test]
    fn empty_graph_is_a_construction_error() {
        let mut g = PoseGraph::new(0, 3, 3);
        assert!(matches!(g.data_matrices(), Err(PoseGraphError::EmptyGraph)));
    }
}
