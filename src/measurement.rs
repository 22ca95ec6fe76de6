//! Relative pose measurements and their derived precisions.
//!
//! Plain data plus a small validating constructor, the same shape as
//! `myzkp::air::AirSpec`: the type itself carries no solver behavior, it is
//! the thing the solver (`crate::pose_graph`) consumes.

use nalgebra::{DMatrix, DVector};

use crate::pose::PoseId;

/// A relative `SE(d)` measurement between two poses, possibly on different
/// robots (§3).
#[derive(Debug, Clone)]
pub struct RelativeSeMeasurement {
    pub from: PoseId,
    pub to: PoseId,
    /// Measured rotation `R̂ ∈ SO(d)`.
    pub r_hat: DMatrix<f64>,
    /// Measured translation `t̂ ∈ ℝᵈ`.
    pub t_hat: DVector<f64>,
    /// Rotation precision `κ`.
    pub kappa: f64,
    /// Translation precision `τ`.
    pub tau: f64,
    /// Current reweighting factor `w ∈ [0,1]`.
    pub weight: f64,
    /// If true, `weight` is pinned (e.g. odometry edges) and reweighting
    /// skips this measurement.
    pub fixed_weight: bool,
    /// If true, this measurement is known-good and reweighting is disabled
    /// for it even though `fixed_weight` is false.
    pub known_inlier: bool,
}

/// Current classification of a (possibly reweighted) measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeClassification {
    Undecided,
    Accepted,
    Rejected,
}

impl RelativeSeMeasurement {
    /// Builds a measurement with an explicit precision pair, weight 1.0,
    /// not fixed, not a known inlier.
    pub fn new(from: PoseId, to: PoseId, r_hat: DMatrix<f64>, t_hat: DVector<f64>, kappa: f64, tau: f64) -> Self {
        let d = t_hat.len();
        assert_eq!(r_hat.nrows(), d);
        assert_eq!(r_hat.ncols(), d);
        Self { from, to, r_hat, t_hat, kappa, tau, weight: 1.0, fixed_weight: false, known_inlier: false }
    }

    /// Odometry edges are consecutive same-robot poses with a pinned weight.
    pub fn odometry(from: PoseId, to: PoseId, r_hat: DMatrix<f64>, t_hat: DVector<f64>, kappa: f64, tau: f64) -> Self {
        let mut m = Self::new(from, to, r_hat, t_hat, kappa, tau);
        m.fixed_weight = true;
        m
    }

    /// Derives `(κ, τ)` from a rotation covariance `Σ_R` and translation
    /// covariance `Σ_t`: `κ = d/(2·tr(Σ_R))`, `τ = d/tr(Σ_t)` (§3).
    pub fn precisions_from_covariance(d: usize, sigma_r: &DMatrix<f64>, sigma_t: &DMatrix<f64>) -> (f64, f64) {
        let trace_r: f64 = (0..d).map(|i| sigma_r[(i, i)]).sum();
        let trace_t: f64 = (0..d).map(|i| sigma_t[(i, i)]).sum();
        let kappa = d as f64 / (2.0 * trace_r);
        let tau = d as f64 / trace_t;
        (kappa, tau)
    }

    pub fn is_inter_robot(&self) -> bool {
        self.from.robot_id != self.to.robot_id
    }

    pub fn dim(&self) -> usize {
        self.t_hat.len()
    }

    /// Classifies the current weight against the accept/reject thresholds
    /// (§4.5): `w < ε_reject` → rejected, `w > 1 − ε_accept` → accepted.
    pub fn classify(&self, epsilon_reject: f64, epsilon_accept: f64) -> EdgeClassification {
        if self.known_inlier || self.fixed_weight {
            return EdgeClassification::Accepted;
        }
        if self.weight < epsilon_reject {
            EdgeClassification::Rejected
        } else if self.weight > 1.0 - epsilon_accept {
            EdgeClassification::Accepted
        } else {
            EdgeClassification::Undecided
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precisions_from_covariance_match_formula() {
        let d = 3;
        let sigma_r = DMatrix::<f64>::identity(d, d) * 0.1;
        let sigma_t = DMatrix::<f64>::identity(d, d) * 0.2;
        let (kappa, tau) = RelativeSeMeasurement::precisions_from_covariance(d, &sigma_r, &sigma_t);
        assert!((kappa - 3.0 / (2.0 * 0.3)).abs() < 1e-12);
        assert!((tau - 3.0 / 0.6).abs() < 1e-12);
    }

    #[test]
    fn classify_respects_fixed_and_known_inlier() {
        let from = PoseId::new(0, 0);
        let to = PoseId::new(0, 1);
        let mut m = RelativeSeMeasurement::odometry(from, to, DMatrix::identity(3, 3), DVector::zeros(3), 1.0, 1.0);
        m.weight = 0.0;
        assert_eq!(m.classify(0.1, 0.1), EdgeClassification::Accepted);
    }

    #[test]
    fn classify_thresholds() {
        let from = PoseId::new(0, 0);
        let to = PoseId::new(0, 2);
        let mut m = RelativeSeMeasurement::new(from, to, DMatrix::identity(3, 3), DVector::zeros(3), 1.0, 1.0);
        m.weight = 0.05;
        assert_eq!(m.classify(0.1, 0.1), EdgeClassification::Rejected);
        m.weight = 0.95;
        assert_eq!(m.classify(0.1, 0.1), EdgeClassification::Accepted);
        m.weight = 0.5;
        assert_eq!(m.classify(0.1, 0.1), EdgeClassification::Undecided);
    }
}
