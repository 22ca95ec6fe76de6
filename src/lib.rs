//! Decentralized pose-graph optimization agent.
//!
//! Each [`agent::Agent`] owns one robot's slice of a multi-robot pose graph
//! (§2): its own poses, its own odometry and loop-closure measurements, and
//! the subset of neighbor poses it has been told about. Agents never share
//! memory; they exchange [`status::PublicPoseMessage`] values and drive a
//! local Riemannian update (§4) on a schedule of their own (§5).
//!
//! ## Module map
//!
//! - [`pose`] / [`measurement`] — typed poses, edges, and the lifted
//!   (rank-`r` Stiefel) representation the optimizer works in.
//! - [`manifold`] — the product Stiefel × Euclidean manifold: projection,
//!   retraction, tangent-space projection.
//! - [`pose_graph`] — per-robot measurement store, incidence/Laplacian
//!   assembly, and the cached `(Q, G)` data matrices behind the local cost.
//! - [`problem`] — the quadratic cost, its Euclidean/Riemannian gradient,
//!   and Hessian-vector products, built only from `(Q, G, X_neighbors)`.
//! - [`optimizer`] — Riemannian trust-region (Steihaug-Toint) and gradient
//!   descent drivers behind a common [`optimizer::TrustRegionSubproblem`].
//! - [`robust_cost`] — graduated non-convexity weight functions (L2, TLS,
//!   Huber, Tukey, Geman-McClure) used to down-weight outlier loop closures.
//! - [`robust_averaging`] / [`alignment`] — robust rotation/translation
//!   averaging and the one-stage/two-stage inter-robot frame alignment
//!   voting schemes built on top of it.
//! - [`init`] — chordal and odometry-chaining bootstraps, and lifting an
//!   ambient estimate into the rank-`r` relaxation.
//! - [`g2o`] — a strict g2o text-format loader for offline/demo graphs.
//! - [`config`] — the typed tunables gathering every knob the rest of the
//!   crate reads ([`config::AgentConfig`]).
//! - [`status`] — the wire types that cross a robot boundary.
//! - [`error`] — the crate-level [`error::AgentError`], folding every
//!   module's own error enum together.
//! - [`agent`] — the state machine and control loop tying all of the above
//!   into one robot's runnable agent.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

/// Agent state machine, local update loop, and background executor.
pub mod agent;
/// Inter-robot frame alignment (one-stage and two-stage voting).
pub mod alignment;
/// Typed tunables shared by every other module.
pub mod config;
/// Crate-level error type.
pub mod error;
/// g2o text-format loader.
pub mod g2o;
/// Chordal / odometry initialization and lifting into the relaxation.
pub mod init;
/// The product Stiefel x Euclidean manifold.
pub mod manifold;
/// Relative SE(d) measurements and edge classification.
pub mod measurement;
/// Local quadratic cost, gradient, and Hessian-vector products.
pub mod problem;
/// Riemannian trust-region and gradient-descent drivers.
pub mod optimizer;
/// Lifted poses and pose identifiers.
pub mod pose;
/// Per-robot measurement store and data-matrix assembly.
pub mod pose_graph;
/// Robust rotation/translation averaging with inlier gating.
pub mod robust_averaging;
/// Graduated non-convexity cost functions.
pub mod robust_cost;
/// Agent lifecycle state and wire message types.
pub mod status;

pub use agent::Agent;
pub use config::AgentConfig;
pub use error::AgentError;
pub use status::{AgentState, AgentStatus, PublicPoseMessage};
