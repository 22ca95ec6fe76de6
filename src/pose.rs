//! Rigid and lifted pose types, and the lifted-pose-array iterate container.
//!
//! Dimensions are carried at runtime (`d`, `r`) rather than as const generics,
//! the same choice the teacher makes for its register count `k` in
//! [`crate::problem`]'s AIR-flavored ancestor (`air::AirSpec`): a pose graph's
//! rank and ambient dimension are read from data, not known at compile time.

use nalgebra::{DMatrix, DVector};

/// Globally identifies a pose: `(robot_id, frame_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoseId {
    pub robot_id: usize,
    pub frame_id: usize,
}

impl PoseId {
    pub fn new(robot_id: usize, frame_id: usize) -> Self {
        Self { robot_id, frame_id }
    }
}

/// A rigid transform `[R | t]`, `R ∈ SO(d)`, `t ∈ ℝᵈ`, as a `d × (d+1)` block.
#[derive(Debug, Clone, PartialEq)]
pub struct RigidPose {
    d: usize,
    block: DMatrix<f64>,
}

impl RigidPose {
    /// Builds a pose from a rotation and a translation without checking
    /// `SO(d)` membership; use [`RigidPose::try_new`] at system boundaries.
    pub fn new(rotation: DMatrix<f64>, translation: DVector<f64>) -> Self {
        let d = translation.len();
        assert_eq!(rotation.nrows(), d, "rotation must be d x d");
        assert_eq!(rotation.ncols(), d, "rotation must be d x d");
        let mut block = DMatrix::zeros(d, d + 1);
        block.view_mut((0, 0), (d, d)).copy_from(&rotation);
        block.view_mut((0, d), (d, 1)).copy_from(&translation);
        Self { d, block }
    }

    /// Builds a pose, rejecting rotations that are not (to `tol`) in `SO(d)`.
    pub fn try_new(rotation: DMatrix<f64>, translation: DVector<f64>, tol: f64) -> Option<Self> {
        let pose = Self::new(rotation, translation);
        if pose.satisfies_so_d(tol) {
            Some(pose)
        } else {
            None
        }
    }

    pub fn identity(d: usize) -> Self {
        Self::new(DMatrix::identity(d, d), DVector::zeros(d))
    }

    pub fn dim(&self) -> usize {
        self.d
    }

    pub fn rotation(&self) -> DMatrix<f64> {
        self.block.view((0, 0), (self.d, self.d)).clone_owned()
    }

    pub fn translation(&self) -> DVector<f64> {
        self.block.view((0, self.d), (self.d, 1)).column(0).clone_owned()
    }

    pub fn as_block(&self) -> &DMatrix<f64> {
        &self.block
    }

    /// `‖RᵀR − I‖ ≤ tol` and `|det(R) − 1| ≤ tol`.
    pub fn satisfies_so_d(&self, tol: f64) -> bool {
        let r = self.rotation();
        let ortho_err = (r.transpose() * &r - DMatrix::identity(self.d, self.d)).norm();
        let det_err = (r.determinant() - 1.0).abs();
        ortho_err <= tol && det_err <= tol
    }

    /// Composition `self * other` (both as rigid transforms).
    pub fn compose(&self, other: &RigidPose) -> RigidPose {
        assert_eq!(self.d, other.d);
        let r = self.rotation() * other.rotation();
        let t = self.rotation() * other.translation() + self.translation();
        RigidPose::new(r, t)
    }

    pub fn inverse(&self) -> RigidPose {
        let rt = self.rotation().transpose();
        let t = -(&rt * self.translation());
        RigidPose::new(rt, t)
    }
}

/// A lifted pose `[Y | p]`, `Y ∈ St(d,r)`, `p ∈ ℝʳ`, as an `r × (d+1)` block.
#[derive(Debug, Clone, PartialEq)]
pub struct LiftedPose {
    r: usize,
    d: usize,
    block: DMatrix<f64>,
}

impl LiftedPose {
    pub fn from_parts(y: DMatrix<f64>, p: DVector<f64>) -> Self {
        let r = p.len();
        let d = y.ncols();
        assert_eq!(y.nrows(), r, "Y must be r x d");
        let mut block = DMatrix::zeros(r, d + 1);
        block.view_mut((0, 0), (r, d)).copy_from(&y);
        block.view_mut((0, d), (r, 1)).copy_from(&p);
        Self { r, d, block }
    }

    pub fn from_block(block: DMatrix<f64>) -> Self {
        let r = block.nrows();
        let d = block.ncols() - 1;
        Self { r, d, block }
    }

    pub fn rank(&self) -> usize {
        self.r
    }

    pub fn dim(&self) -> usize {
        self.d
    }

    pub fn y(&self) -> DMatrix<f64> {
        self.block.view((0, 0), (self.r, self.d)).clone_owned()
    }

    pub fn p(&self) -> DVector<f64> {
        self.block.view((0, self.d), (self.r, 1)).column(0).clone_owned()
    }

    pub fn as_block(&self) -> &DMatrix<f64> {
        &self.block
    }

    /// `‖YᵀY − I_d‖ ≤ tol`.
    pub fn satisfies_stiefel(&self, tol: f64) -> bool {
        let y = self.y();
        (y.transpose() * &y - DMatrix::identity(self.d, self.d)).norm() <= tol
    }
}

/// Column-concatenation of `n` lifted poses: an `r × n(d+1)` matrix. The
/// agent's iterate `X`, auxiliary `Y`, momentum `V` and `X_prev` are all
/// values of this type.
#[derive(Debug, Clone, PartialEq)]
pub struct LiftedPoseArray {
    r: usize,
    d: usize,
    n: usize,
    data: DMatrix<f64>,
}

impl LiftedPoseArray {
    pub fn zeros(r: usize, d: usize, n: usize) -> Self {
        Self { r, d, n, data: DMatrix::zeros(r, n * (d + 1)) }
    }

    pub fn from_matrix(r: usize, d: usize, n: usize, data: DMatrix<f64>) -> Self {
        assert_eq!(data.nrows(), r);
        assert_eq!(data.ncols(), n * (d + 1));
        Self { r, d, n, data }
    }

    pub fn rank(&self) -> usize {
        self.r
    }
    pub fn dim(&self) -> usize {
        self.d
    }
    pub fn num_poses(&self) -> usize {
        self.n
    }
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.data
    }
    pub fn matrix_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.data
    }

    pub fn get_pose(&self, i: usize) -> LiftedPose {
        let start = i * (self.d + 1);
        let block = self.data.view((0, start), (self.r, self.d + 1)).clone_owned();
        LiftedPose { r: self.r, d: self.d, block }
    }

    pub fn set_pose(&mut self, i: usize, pose: &LiftedPose) {
        assert_eq!(pose.rank(), self.r);
        assert_eq!(pose.dim(), self.d);
        let start = i * (self.d + 1);
        self.data.view_mut((0, start), (self.r, self.d + 1)).copy_from(pose.as_block());
    }

    /// `p_i`, the translation column of pose `i`.
    pub fn translation_at(&self, i: usize) -> DVector<f64> {
        self.get_pose(i).p()
    }

    pub fn iter_poses(&self) -> impl Iterator<Item = LiftedPose> + '_ {
        (0..self.n).map(move |i| self.get_pose(i))
    }

    /// Mean of `‖t_i − t_i^{other}‖` over all poses (§4.7 step 3).
    pub fn mean_translation_distance(&self, other: &LiftedPoseArray) -> f64 {
        assert_eq!(self.n, other.n);
        if self.n == 0 {
            return 0.0;
        }
        let total: f64 = (0..self.n)
            .map(|i| (self.translation_at(i) - other.translation_at(i)).norm())
            .sum();
        total / self.n as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_rigid_pose_satisfies_so_d() {
        let p = RigidPose::identity(3);
        assert!(p.satisfies_so_d(1e-12));
    }

    #[test]
    fn compose_then_inverse_is_identity() {
        let r = DMatrix::from_row_slice(2, 2, &[0.0, -1.0, 1.0, 0.0]);
        let t = DVector::from_vec(vec![1.0, 2.0]);
        let p = RigidPose::new(r, t);
        let round_trip = p.compose(&p.inverse());
        assert!(round_trip.satisfies_so_d(1e-9));
        assert!(round_trip.translation().norm() < 1e-9);
    }

    #[test]
    fn lifted_pose_array_roundtrips_poses() {
        let mut arr = LiftedPoseArray::zeros(3, 3, 4);
        let y = DMatrix::identity(3, 3);
        let p = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let pose = LiftedPose::from_parts(y, p.clone());
        arr.set_pose(2, &pose);
        assert_eq!(arr.translation_at(2), p);
    }
}
