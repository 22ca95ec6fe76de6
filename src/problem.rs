//! The local quadratic optimization problem `f(X) = tr(XQXᵀ) + 2·tr(XGX_Nᵀ)`
//! (§3, §4.3) and its Euclidean/Riemannian derivatives.
//!
//! `Q` and `G` come from [`crate::pose_graph::PoseGraph::data_matrices`];
//! `X_N` (the neighbor poses `G` couples against) is supplied by the agent
//! from its `neighborPoses` region. This module only ever reads `Q`, `G`,
//! `X_N` — it owns no mutable state, the same narrow-surface shape the
//! teacher gives `quotient.rs`'s quotient-polynomial assembly.

use nalgebra::DMatrix;

use crate::manifold::ProductManifold;
use crate::pose::LiftedPoseArray;

/// One agent's local Riemannian optimization problem.
#[derive(Debug, Clone)]
pub struct QuadraticProblem {
    manifold: ProductManifold,
    /// `n(d+1) × n(d+1)` symmetric PSD data matrix.
    q: DMatrix<f64>,
    /// `n(d+1) × k(d+1)` neighbor-coupling matrix (`k` = number of distinct
    /// neighbor poses referenced).
    g: DMatrix<f64>,
    /// `r × k(d+1)` stacked neighbor pose estimates, in the same order `G`'s
    /// columns were built in.
    x_neighbors: DMatrix<f64>,
}

impl QuadraticProblem {
    pub fn new(manifold: ProductManifold, q: DMatrix<f64>, g: DMatrix<f64>, x_neighbors: DMatrix<f64>) -> Self {
        assert_eq!(q.nrows(), q.ncols());
        assert_eq!(q.nrows(), manifold.n * (manifold.d + 1));
        assert_eq!(g.nrows(), q.nrows());
        assert_eq!(g.ncols(), x_neighbors.ncols());
        assert_eq!(x_neighbors.nrows(), manifold.r);
        Self { manifold, q, g, x_neighbors }
    }

    pub fn manifold(&self) -> &ProductManifold {
        &self.manifold
    }

    pub fn q(&self) -> &DMatrix<f64> {
        &self.q
    }
    pub fn g(&self) -> &DMatrix<f64> {
        &self.g
    }
    pub fn x_neighbors(&self) -> &DMatrix<f64> {
        &self.x_neighbors
    }

    /// `f(X) = tr(XQXᵀ) + 2·tr(XGX_Nᵀ)`.
    pub fn cost(&self, x: &LiftedPoseArray) -> f64 {
        let xm = x.matrix();
        let own = (xm * &self.q * xm.transpose()).trace();
        let cross = if self.g.ncols() > 0 { 2.0 * (xm * &self.g * self.x_neighbors.transpose()).trace() } else { 0.0 };
        own + cross
    }

    /// Euclidean gradient `2XQ + 2X_N Gᵀ`.
    pub fn euclidean_gradient(&self, x: &LiftedPoseArray) -> DMatrix<f64> {
        let xm = x.matrix();
        let mut grad = xm * &self.q * 2.0;
        if self.g.ncols() > 0 {
            grad += &self.x_neighbors * self.g.transpose() * 2.0;
        }
        grad
    }

    /// Riemannian gradient `P_X(grad f(X))`.
    pub fn riemannian_gradient(&self, x: &LiftedPoseArray) -> DMatrix<f64> {
        self.manifold.tangent_project(x, &self.euclidean_gradient(x))
    }

    /// Euclidean Hessian-vector product `2·ηQ` (the `G` term is linear in
    /// `X`, so it vanishes from the Hessian).
    pub fn euclidean_hessian_vector_product(&self, eta: &DMatrix<f64>) -> DMatrix<f64> {
        eta * &self.q * 2.0
    }

    /// Riemannian Hessian-vector product on the Stiefel-factor blocks,
    /// using the standard embedded-submanifold correction (Absil, Mahony &
    /// Sepulchre, *Optimization Algorithms on Matrix Manifolds*, eq. 5.15):
    /// `Hess f(X)[η] = P_X(D(grad f)(X)[η]) − η·sym(Yᵀ grad f(X))`, applied
    /// blockwise per pose (translation columns carry no curvature term).
    pub fn riemannian_hessian_vector_product(&self, x: &LiftedPoseArray, eta: &DMatrix<f64>) -> DMatrix<f64> {
        let d = self.manifold.d;
        let n = self.manifold.n;
        let grad = self.euclidean_gradient(x);
        let raw_hess = self.euclidean_hessian_vector_product(eta);
        let mut projected = self.manifold.tangent_project(x, &raw_hess);

        for i in 0..n {
            let start = i * (d + 1);
            let y = x.matrix().view((0, start), (self.manifold.r, d)).clone_owned();
            let grad_y = grad.view((0, start), (self.manifold.r, d)).clone_owned();
            let eta_y = eta.view((0, start), (self.manifold.r, d)).clone_owned();
            let sym_term = sym(&(y.transpose() * &grad_y));
            let correction = &eta_y * sym_term;
            let current = projected.view((0, start), (self.manifold.r, d)).clone_owned();
            projected.view_mut((0, start), (self.manifold.r, d)).copy_from(&(current - correction));
        }
        projected
    }
}

fn sym(a: &DMatrix<f64>) -> DMatrix<f64> {
    (a + a.transpose()) * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::LiftedPoseArray;

    fn identity_problem(n: usize, d: usize, r: usize) -> QuadraticProblem {
        let manifold = ProductManifold::new(r, d, n);
        let width = n * (d + 1);
        let q = DMatrix::<f64>::identity(width, width);
        let g = DMatrix::<f64>::zeros(width, 0);
        let x_neighbors = DMatrix::<f64>::zeros(r, 0);
        QuadraticProblem::new(manifold, q, g, x_neighbors)
    }

    #[test]
    fn cost_matches_trace_formula_with_no_neighbors() {
        let problem = identity_problem(2, 2, 2);
        let x = LiftedPoseArray::zeros(2, 2, 2);
        assert_eq!(problem.cost(&x), 0.0);
    }

    #[test]
    fn riemannian_gradient_is_tangent() {
        let problem = identity_problem(2, 3, 3);
        let manifold = ProductManifold::new(3, 3, 2);
        let x = manifold.random_in_manifold(Some(3));
        let grad = problem.riemannian_gradient(&x);
        let y = x.get_pose(0).y();
        let grad_y = grad.view((0, 0), (3, 3)).clone_owned();
        let sym_part = y.transpose() * grad_y;
        assert!((&sym_part + &sym_part.transpose()).norm() < 1e-8);
    }

    #[test]
    fn euclidean_hessian_is_linear_in_eta() {
        let problem = identity_problem(2, 2, 2);
        let eta = DMatrix::<f64>::from_element(2, 2 * 3, 1.0);
        let hvp = problem.euclidean_hessian_vector_product(&eta);
        assert_eq!(hvp, &eta * 2.0);
    }
}
