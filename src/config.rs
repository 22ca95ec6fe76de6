//! Typed tunables.
//!
//! Every numeric knob named in the component design (trust-region radii,
//! iteration caps, GNC schedule, acceleration/restart interval, scheduler
//! rate, …) lives on [`AgentConfig`] with a documented default, the way the
//! teacher crate groups its own tunables on `ProveParams`/`VerifyParams`
//! (`src/lib.rs`) instead of scattering literals through the solver.

use crate::robust_cost::CostFunction;

/// Parameters for one run of the Riemannian trust-region optimizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtrParams {
    /// Initial trust-region radius ρ₀.
    pub initial_radius: f64,
    /// Maximum inner (truncated-CG) iterations.
    pub max_inner_iters: usize,
    /// Gradient-norm tolerance τ_g that ends the outer loop.
    pub gradient_tol: f64,
    /// Maximum outer iterations.
    pub max_outer_iters: usize,
}

impl RtrParams {
    /// Parameters used for the one-outer-iteration step inside the
    /// distributed main loop (§4.4): ρ₀=100, k_in=10, τ_g=1e-2.
    pub fn distributed() -> Self {
        Self { initial_radius: 100.0, max_inner_iters: 10, gradient_tol: 1e-2, max_outer_iters: 1 }
    }

    /// Parameters used for the chordal-bootstrap local solve (§4.4):
    /// ρ₀=10, k_in=50, τ_g=1e-1.
    pub fn local_solve() -> Self {
        Self { initial_radius: 10.0, max_inner_iters: 50, gradient_tol: 1e-1, max_outer_iters: 50 }
    }
}

/// Parameters for the Riemannian gradient-descent driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RgdParams {
    pub step_size: f64,
    pub use_backtracking: bool,
    pub max_iters: usize,
    pub gradient_tol: f64,
}

impl Default for RgdParams {
    fn default() -> Self {
        Self { step_size: 1e-3, use_backtracking: true, max_iters: 100, gradient_tol: 1e-2 }
    }
}

/// Selects which local solver `Agent::update_x` drives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizerChoice {
    Rtr(RtrParams),
    Rgd(RgdParams),
}

impl Default for OptimizerChoice {
    fn default() -> Self {
        OptimizerChoice::Rtr(RtrParams::distributed())
    }
}

/// All agent-level tunables (§4, §5).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentConfig {
    /// Relaxation rank r ≥ d.
    pub rank: usize,
    /// Ambient dimension d ∈ {2,3}.
    pub dim: usize,

    /// Optimizer used by the distributed main loop.
    pub optimizer: OptimizerChoice,

    /// Robust cost kernel (`L2` disables GNC reweighting entirely).
    pub cost_function: CostFunction,
    /// Number of agent iterations between reweighting rounds.
    pub robust_opt_inner_iters: usize,
    /// If false, reweighting resets `X` to `X_init`.
    pub robust_opt_warm_start: bool,
    /// Fraction of loop closures that must be "converged" (weight near an
    /// extreme) before `readyToTerminate` can be set.
    pub robust_opt_min_convergence_ratio: f64,
    /// Weight threshold below which an edge is reclassified rejected.
    pub epsilon_reject: f64,
    /// `1 - epsilon_accept` is the weight threshold above which an edge is
    /// reclassified accepted.
    pub epsilon_accept: f64,

    /// Minimum inlier count for a frame-alignment candidate to be accepted.
    pub robust_init_min_inliers: usize,
    /// Empirical rotation precision used by one-stage pose averaging (§9
    /// open question: not derived from measurement covariances).
    pub one_stage_kappa: f64,
    /// Empirical translation precision used by one-stage pose averaging.
    pub one_stage_tau: f64,
    /// χ²(3) 0.9-quantile, the one-stage inlier gate `cbar`.
    pub one_stage_cbar: f64,
    /// Chordal-distance inlier gate for two-stage rotation averaging,
    /// `angular2ChordalSO3(0.5 rad)`.
    pub two_stage_rotation_gate: f64,
    /// Translation inlier gate for two-stage alignment's second stage (§4.6
    /// open question: the spec names the rotation gate's formula but leaves
    /// the translation gate as an implementer's choice; 1.0 is an empirical
    /// scale in the same spirit as `one_stage_kappa`/`one_stage_tau`).
    pub two_stage_translation_gate: f64,

    /// Relative-change tolerance for `readyToTerminate`.
    pub rel_change_tol: f64,
    /// Iterations between Nesterov restarts.
    pub restart_interval: usize,
    /// Team termination iteration cap.
    pub max_num_iters: usize,

    /// Poisson tick rate (Hz) for the background executor.
    pub scheduler_rate_hz: f64,

    /// Team size `N` used by the Nesterov acceleration schedule
    /// (`γ_{k+1} = (1 + √(1 + 4N²γ_k²))/(2N)`). Must be ≥ 1.
    pub team_size: usize,
}

/// χ²(3) 0.9-quantile (standard tabulated value): the probability mass of a
/// chi-squared distribution with 3 degrees of freedom below 6.2514 is 0.9.
pub const CHI2_3_Q90: f64 = 6.2514;

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            rank: 3,
            dim: 3,
            optimizer: OptimizerChoice::default(),
            cost_function: CostFunction::L2,
            robust_opt_inner_iters: 10,
            robust_opt_warm_start: true,
            robust_opt_min_convergence_ratio: 0.8,
            epsilon_reject: 0.1,
            epsilon_accept: 0.1,
            robust_init_min_inliers: 2,
            one_stage_kappa: 1.82,
            one_stage_tau: 0.01,
            one_stage_cbar: CHI2_3_Q90,
            two_stage_rotation_gate: angular_to_chordal_so3(0.5),
            two_stage_translation_gate: 1.0,
            rel_change_tol: 1e-4,
            restart_interval: 30,
            max_num_iters: 1000,
            scheduler_rate_hz: 10.0,
            team_size: 1,
        }
    }
}

/// Maps an angular distance (radians) on SO(3) to the corresponding chordal
/// distance, `2*sqrt(2)*sin(theta/2)` (glossary: chordal distance).
pub fn angular_to_chordal_so3(theta_rad: f64) -> f64 {
    2.0 * std::f64::consts::SQRT_2 * (theta_rad / 2.0).sin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_d_le_r() {
        let cfg = AgentConfig::default();
        assert!(cfg.dim <= cfg.rank);
    }

    #[test]
    fn angular_to_chordal_matches_known_point() {
        // theta = pi -> chordal distance should be 2*sqrt(2).
        let c = angular_to_chordal_so3(std::f64::consts::PI);
        assert!((c - 2.0 * std::f64::consts::SQRT_2).abs() < 1e-12);
    }
}
