//! Product manifold `M = (St(d,r) × ℝʳ)ⁿ`: projection, retraction, tangent
//! projection and random sampling.
//!
//! This is the only capability set the optimizer (`crate::optimizer`) and
//! the agent's update loop (`crate::agent`) depend on:
//! `{project, retract, tangent_project, random_in_manifold}`. No "variable"
//! or "element" type hierarchy sits behind it — every block of the product
//! is the same `r × (d+1)` shape, handled uniformly, the way the teacher
//! treats every AIR register as the same `F` regardless of what it encodes
//! (`air::AirSpec`).

use nalgebra::{DMatrix, DVector};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::pose::LiftedPoseArray;

/// Projects an arbitrary `r × d` matrix onto the Stiefel manifold `St(d,r)`
/// via thin SVD: `M = UΣVᵀ ↦ UVᵀ` (§4.1).
pub fn project_stiefel_block(m: &DMatrix<f64>) -> DMatrix<f64> {
    let svd = m.clone().svd(true, true);
    let u = svd.u.expect("svd: u requested");
    let v_t = svd.v_t.expect("svd: v_t requested");
    u * v_t
}

/// Projects a square `d × d` matrix onto `SO(d)`: thin SVD, then if
/// `det(U)·det(V) < 0`, negate the last column of `U` before recombining
/// (§4.1). The result is the closest `SO(d)` matrix in Frobenius norm.
pub fn project_to_rotation_group(m: &DMatrix<f64>) -> DMatrix<f64> {
    assert_eq!(m.nrows(), m.ncols(), "rotation-group projection requires a square block");
    let d = m.nrows();
    let svd = m.clone().svd(true, true);
    let mut u = svd.u.expect("svd: u requested");
    let v_t = svd.v_t.expect("svd: v_t requested");
    let det_u = u.determinant();
    let det_v = v_t.transpose().determinant();
    if det_u * det_v < 0.0 {
        let mut last_col = u.column_mut(d - 1);
        last_col *= -1.0;
    }
    u * v_t
}

/// Blockwise orthonormal-frame projection (translation columns untouched).
fn project_raw(raw: &DMatrix<f64>, r: usize, d: usize, n: usize) -> LiftedPoseArray {
    assert_eq!(raw.nrows(), r);
    assert_eq!(raw.ncols(), n * (d + 1));
    let mut out = DMatrix::zeros(r, n * (d + 1));
    for i in 0..n {
        let start = i * (d + 1);
        let y_block = raw.view((0, start), (r, d)).clone_owned();
        let y_proj = project_stiefel_block(&y_block);
        out.view_mut((0, start), (r, d)).copy_from(&y_proj);
        let p = raw.view((0, start + d), (r, 1)).clone_owned();
        out.view_mut((0, start + d), (r, 1)).copy_from(&p);
    }
    LiftedPoseArray::from_matrix(r, d, n, out)
}

/// `sym(A) = (A + Aᵀ)/2`.
fn sym(a: &DMatrix<f64>) -> DMatrix<f64> {
    (a + a.transpose()) * 0.5
}

/// Thin-QR retraction on a single Stiefel block: `Y_new = qf(Y + η_Y)`,
/// where `qf` takes the Q factor of the thin QR decomposition with the sign
/// convention that makes the retraction well-defined (positive diagonal of
/// the R factor).
fn qr_retract_block(y_plus_eta: &DMatrix<f64>) -> DMatrix<f64> {
    let d = y_plus_eta.ncols();
    let qr = y_plus_eta.clone().qr();
    let mut q = qr.q();
    let r = qr.r();
    for j in 0..d {
        if r[(j, j)] < 0.0 {
            let mut col = q.column_mut(j);
            col *= -1.0;
        }
    }
    q
}

/// The product manifold `(St(d,r) × ℝʳ)ⁿ`.
#[derive(Debug, Clone, Copy)]
pub struct ProductManifold {
    pub r: usize,
    pub d: usize,
    pub n: usize,
}

impl ProductManifold {
    pub fn new(r: usize, d: usize, n: usize) -> Self {
        assert!(r >= d, "rank r must be >= ambient dimension d");
        Self { r, d, n }
    }

    /// Projects an arbitrary `r × n(d+1)` matrix onto the manifold.
    pub fn project(&self, raw: &DMatrix<f64>) -> LiftedPoseArray {
        project_raw(raw, self.r, self.d, self.n)
    }

    /// Projects an already-typed iterate (idempotent if `x` is already on
    /// the manifold: `project(project(M)) = project(M)`, §8).
    pub fn project_iterate(&self, x: &LiftedPoseArray) -> LiftedPoseArray {
        self.project(x.matrix())
    }

    /// Retraction `R_X(η)`: blockwise QR retraction on the Stiefel factor,
    /// plain vector addition on the translation column.
    pub fn retract(&self, x: &LiftedPoseArray, eta: &DMatrix<f64>) -> LiftedPoseArray {
        assert_eq!(eta.nrows(), self.r);
        assert_eq!(eta.ncols(), self.n * (self.d + 1));
        let mut out = DMatrix::zeros(self.r, self.n * (self.d + 1));
        for i in 0..self.n {
            let start = i * (self.d + 1);
            let y = x.matrix().view((0, start), (self.r, self.d)).clone_owned();
            let eta_y = eta.view((0, start), (self.r, self.d)).clone_owned();
            let y_new = qr_retract_block(&(y + eta_y));
            out.view_mut((0, start), (self.r, self.d)).copy_from(&y_new);

            let p = x.matrix().view((0, start + self.d), (self.r, 1)).clone_owned();
            let eta_p = eta.view((0, start + self.d), (self.r, 1)).clone_owned();
            out.view_mut((0, start + self.d), (self.r, 1)).copy_from(&(p + eta_p));
        }
        LiftedPoseArray::from_matrix(self.r, self.d, self.n, out)
    }

    /// Tangent projection `P_X(Z)`: blockwise `Z_Y - Y·sym(Yᵀ Z_Y)` on the
    /// Stiefel factor, identity on the translation column (unconstrained
    /// Euclidean tangent space).
    pub fn tangent_project(&self, x: &LiftedPoseArray, z: &DMatrix<f64>) -> DMatrix<f64> {
        assert_eq!(z.nrows(), self.r);
        assert_eq!(z.ncols(), self.n * (self.d + 1));
        let mut out = DMatrix::zeros(self.r, self.n * (self.d + 1));
        for i in 0..self.n {
            let start = i * (self.d + 1);
            let y = x.matrix().view((0, start), (self.r, self.d)).clone_owned();
            let z_y = z.view((0, start), (self.r, self.d)).clone_owned();
            let proj = &z_y - &y * sym(&(y.transpose() * &z_y));
            out.view_mut((0, start), (self.r, self.d)).copy_from(&proj);

            let z_p = z.view((0, start + self.d), (self.r, 1)).clone_owned();
            out.view_mut((0, start + self.d), (self.r, 1)).copy_from(&z_p);
        }
        out
    }

    /// Samples a random point on the manifold. Deterministic when `seed` is
    /// `Some`, for test reproducibility (§4.1).
    pub fn random_in_manifold(&self, seed: Option<u64>) -> LiftedPoseArray {
        let mut rng: StdRng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let mut data = DMatrix::zeros(self.r, self.n * (self.d + 1));
        for i in 0..self.n {
            let start = i * (self.d + 1);
            let mut raw = DMatrix::zeros(self.r, self.d);
            for v in raw.iter_mut() {
                *v = rng.gen_range(-1.0..1.0);
            }
            let y = qr_retract_block(&raw);
            data.view_mut((0, start), (self.r, self.d)).copy_from(&y);

            let p: DVector<f64> = DVector::from_iterator(self.r, (0..self.r).map(|_| rng.gen_range(-1.0..1.0)));
            data.view_mut((0, start + self.d), (self.r, 1)).copy_from(&p);
        }
        LiftedPoseArray::from_matrix(self.r, self.d, self.n, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;

    #[test]
    fn stiefel_projection_is_idempotent() {
        let m = DMatrix::from_row_slice(3, 3, &[1.0, 0.2, 0.1, 0.0, 1.0, 0.3, 0.1, 0.2, 1.0]);
        let once = project_stiefel_block(&m);
        let twice = project_stiefel_block(&once);
        assert!((once - twice).norm() < 1e-9);
    }

    #[test]
    fn rotation_projection_has_determinant_one() {
        // A matrix with positive-determinant-product factors.
        let m = DMatrix::from_row_slice(3, 3, &[2.0, 0.3, -0.1, 0.1, 1.5, 0.2, -0.2, 0.1, 3.0]);
        let r = project_to_rotation_group(&m);
        assert!((r.determinant() - 1.0).abs() < 1e-9);
        let ortho_err = (r.transpose() * &r - DMatrix::identity(3, 3)).norm();
        assert!(ortho_err < 1e-9);
    }

    #[test]
    fn rotation_projection_fixes_reflections() {
        // A pure reflection: det = -1. Projection must still land in SO(3).
        let m = Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, -1.0);
        let r = project_to_rotation_group(&DMatrix::from(m));
        assert!((r.determinant() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn retraction_stays_on_stiefel() {
        let manifold = ProductManifold::new(3, 3, 2);
        let x = manifold.random_in_manifold(Some(7));
        let eta = DMatrix::<f64>::from_element(3, 2 * 4, 0.05);
        let x_new = manifold.retract(&x, &eta);
        for pose in x_new.iter_poses() {
            assert!(pose.satisfies_stiefel(1e-8));
        }
    }

    #[test]
    fn tangent_projection_is_orthogonal_to_normal_space() {
        let manifold = ProductManifold::new(3, 3, 1);
        let x = manifold.random_in_manifold(Some(11));
        let z = DMatrix::<f64>::from_element(3, 4, 1.0);
        let proj = manifold.tangent_project(&x, &z);
        // Y^T * proj_Y must be skew-symmetric (the defining property of the
        // Stiefel tangent space).
        let y = x.get_pose(0).y();
        let proj_y = proj.view((0, 0), (3, 3)).clone_owned();
        let sym_part = y.transpose() * proj_y;
        let skew_residual = &sym_part + &sym_part.transpose();
        assert!(skew_residual.norm() < 1e-8);
    }

    #[test]
    fn random_in_manifold_is_deterministic_with_seed() {
        let manifold = ProductManifold::new(3, 3, 4);
        let a = manifold.random_in_manifold(Some(42));
        let b = manifold.random_in_manifold(Some(42));
        assert_eq!(a.matrix(), b.matrix());
    }
}
