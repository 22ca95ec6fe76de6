//! Riemannian optimizer drivers: trust-region (RTR) and gradient descent
//! (RGD), both operating through [`QuadraticProblem`] and
//! [`crate::manifold::ProductManifold`] only (§4.4).
//!
//! The RTR inner subproblem is exposed behind [`TrustRegionSubproblem`] so
//! the truncated-CG/Steihaug-Toint solver used here can be swapped for a
//! different Riemannian optimization backend without touching the outer
//! loop — the same seam the teacher puts around its PCS
//! (`pcs.rs`'s `PolynomialCommitmentScheme` trait) so the opening protocol
//! doesn't depend on a specific commitment construction.

use nalgebra::DMatrix;
use tracing::debug;

use crate::config::{RgdParams, RtrParams};
use crate::pose::LiftedPoseArray;
use crate::problem::QuadraticProblem;

fn frob_inner(a: &DMatrix<f64>, b: &DMatrix<f64>) -> f64 {
    a.component_mul(b).sum()
}

/// Solves the RTR trust-region subproblem `min_η m(η)` subject to
/// `‖η‖ ≤ radius`, given the current Riemannian gradient.
pub trait TrustRegionSubproblem {
    fn solve(&self, problem: &QuadraticProblem, x: &LiftedPoseArray, grad: &DMatrix<f64>, radius: f64, max_inner_iters: usize) -> DMatrix<f64>;
}

/// Truncated conjugate gradient (Steihaug-Toint), the standard RTR inner
/// solver: runs CG on the local quadratic model, stopping at the trust
/// region boundary or on negative curvature.
#[derive(Debug, Clone, Copy, Default)]
pub struct SteihaugToint;

impl SteihaugToint {
    /// Positive root `τ` of `‖η + τd‖ = radius`.
    fn tau_to_boundary(eta: &DMatrix<f64>, d: &DMatrix<f64>, radius: f64) -> f64 {
        let dd = frob_inner(d, d);
        if dd <= 1e-300 {
            return 0.0;
        }
        let ed = frob_inner(eta, d);
        let ee = frob_inner(eta, eta);
        let disc = (ed * ed - dd * (ee - radius * radius)).max(0.0).sqrt();
        (-ed + disc) / dd
    }
}

impl TrustRegionSubproblem for SteihaugToint {
    fn solve(&self, problem: &QuadraticProblem, x: &LiftedPoseArray, grad: &DMatrix<f64>, radius: f64, max_inner_iters: usize) -> DMatrix<f64> {
        let mut eta = DMatrix::<f64>::zeros(grad.nrows(), grad.ncols());
        let mut r = grad.clone();
        let mut d = -r.clone();
        let r0_norm = r.norm();
        if r0_norm < 1e-12 {
            return eta;
        }
        // Standard Steihaug-Toint relative stopping rule (Nocedal & Wright,
        // *Numerical Optimization*, §7.1): tighten as the gradient shrinks.
        let stop_tol = r0_norm * r0_norm.min(1.0).sqrt();

        for _ in 0..max_inner_iters {
            let hd = problem.riemannian_hessian_vector_product(x, &d);
            let dhd = frob_inner(&d, &hd);
            if dhd <= 0.0 {
                let tau = Self::tau_to_boundary(&eta, &d, radius);
                return eta + &d * tau;
            }
            let rr = frob_inner(&r, &r);
            let alpha = rr / dhd;
            let eta_candidate = &eta + &d * alpha;
            if eta_candidate.norm() >= radius {
                let tau = Self::tau_to_boundary(&eta, &d, radius);
                return eta + &d * tau;
            }
            eta = eta_candidate;
            let r_new = &r + &hd * alpha;
            if r_new.norm() <= stop_tol {
                return eta;
            }
            let beta = frob_inner(&r_new, &r_new) / rr;
            d = -&r_new + &d * beta;
            r = r_new;
        }
        eta
    }
}

const RTR_RHO_SHRINK: f64 = 0.25;
const RTR_RHO_GROW: f64 = 0.75;
const RTR_RHO_ACCEPT: f64 = 0.1;
const RTR_MAX_RADIUS_GROWTH: f64 = 1e6;

/// Runs the Riemannian trust-region method for `params.max_outer_iters`
/// outer iterations (§4.4). Returns the final iterate.
pub fn riemannian_trust_region(
    problem: &QuadraticProblem,
    x0: &LiftedPoseArray,
    params: &RtrParams,
    subproblem: &dyn TrustRegionSubproblem,
) -> LiftedPoseArray {
    let manifold = *problem.manifold();
    let mut x = x0.clone();
    let mut radius = params.initial_radius;

    for _ in 0..params.max_outer_iters {
        let grad = problem.riemannian_gradient(&x);
        if grad.norm() <= params.gradient_tol {
            break;
        }

        let eta = subproblem.solve(problem, &x, &grad, radius, params.max_inner_iters);
        let hvp = problem.riemannian_hessian_vector_product(&x, &eta);
        let predicted_reduction = -(frob_inner(&grad, &eta) + 0.5 * frob_inner(&eta, &hvp));

        let x_candidate = manifold.retract(&x, &eta);
        let actual_reduction = problem.cost(&x) - problem.cost(&x_candidate);

        let rho = if predicted_reduction.abs() < 1e-15 { 0.0 } else { actual_reduction / predicted_reduction };

        if rho < RTR_RHO_SHRINK {
            radius *= RTR_RHO_SHRINK;
        } else if rho > RTR_RHO_GROW && (eta.norm() - radius).abs() < 1e-9 {
            radius = (radius * 2.0).min(RTR_MAX_RADIUS_GROWTH);
        }

        let accepted = rho > RTR_RHO_ACCEPT;
        debug!(rho, radius, accepted, "rtr outer iteration");
        if accepted {
            x = x_candidate;
        }
    }
    x
}

/// Runs Riemannian gradient descent for up to `params.max_iters` steps, with
/// Armijo backtracking when `params.use_backtracking` is set (§4.4).
pub fn riemannian_gradient_descent(problem: &QuadraticProblem, x0: &LiftedPoseArray, params: &RgdParams) -> LiftedPoseArray {
    let manifold = *problem.manifold();
    let mut x = x0.clone();

    for _ in 0..params.max_iters {
        let grad = problem.riemannian_gradient(&x);
        let grad_norm = grad.norm();
        if grad_norm <= params.gradient_tol {
            break;
        }

        let mut step = params.step_size;
        let f_x = problem.cost(&x);
        let descent_direction_norm_sq = grad_norm * grad_norm;

        if params.use_backtracking {
            const ARMIJO_C: f64 = 1e-4;
            const BACKTRACK_FACTOR: f64 = 0.5;
            const MAX_BACKTRACKS: usize = 30;
            let mut accepted = false;
            for _ in 0..MAX_BACKTRACKS {
                let eta = -&grad * step;
                let x_candidate = manifold.retract(&x, &eta);
                let f_candidate = problem.cost(&x_candidate);
                if f_candidate <= f_x - ARMIJO_C * step * descent_direction_norm_sq {
                    x = x_candidate;
                    accepted = true;
                    break;
                }
                step *= BACKTRACK_FACTOR;
            }
            debug!(step, accepted, "rgd backtracking step");
        } else {
            let eta = -&grad * step;
            x = manifold.retract(&x, &eta);
        }
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::ProductManifold;

    fn descent_problem(n: usize, d: usize, r: usize) -> QuadraticProblem {
        let manifold = ProductManifold::new(r, d, n);
        let width = n * (d + 1);
        let q = DMatrix::<f64>::identity(width, width) * 2.0;
        let g = DMatrix::<f64>::zeros(width, 0);
        let x_neighbors = DMatrix::<f64>::zeros(r, 0);
        QuadraticProblem::new(manifold, q, g, x_neighbors)
    }

    #[test]
    fn rtr_does_not_increase_cost() {
        let problem = descent_problem(3, 3, 3);
        let manifold = ProductManifold::new(3, 3, 3);
        let x0 = manifold.random_in_manifold(Some(21));
        let params = crate::config::RtrParams::local_solve();
        let x_final = riemannian_trust_region(&problem, &x0, &params, &SteihaugToint);
        assert!(problem.cost(&x_final) <= problem.cost(&x0) + 1e-9);
    }

    #[test]
    fn rgd_does_not_increase_cost() {
        let problem = descent_problem(2, 2, 2);
        let manifold = ProductManifold::new(2, 2, 2);
        let x0 = manifold.random_in_manifold(Some(5));
        let params = RgdParams::default();
        let x_final = riemannian_gradient_descent(&problem, &x0, &params);
        assert!(problem.cost(&x_final) <= problem.cost(&x0) + 1e-9);
    }

    #[test]
    fn steihaug_toint_respects_trust_region_radius() {
        let problem = descent_problem(2, 2, 2);
        let manifold = ProductManifold::new(2, 2, 2);
        let x0 = manifold.random_in_manifold(Some(9));
        let grad = problem.riemannian_gradient(&x0);
        let eta = SteihaugToint.solve(&problem, &x0, &grad, 0.1, 10);
        assert!(eta.norm() <= 0.1 + 1e-8);
    }
}
