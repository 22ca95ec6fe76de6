//! Per-robot agent: owns one robot's pose-graph slice, drives its local
//! Riemannian update, and exchanges public poses with neighbors (§5, §6).
//!
//! Three disjoint regions, each behind its own `Mutex`, are always acquired
//! in the order `poses → measurements → neighbor_poses` to avoid deadlock
//! when two agents' background executors call into each other's public API
//! concurrently — the same per-field-lock-under-one-`Arc` shape the
//! teacher's wider pack uses for a multi-writer daemon
//! (`dropbox-dKNOW`'s `sg-daemon/src/server.rs`). The background executor's
//! sleep is a `Condvar` wait rather than a bare `thread::sleep`, so
//! `end_optimization_loop` can cancel it immediately instead of waiting out
//! a stale tick (`deepcausality-rs`'s `BlockingWaitStrategy`).
//!
//! Acceleration and the background executor are mutually exclusive (§5):
//! running the executor forces every `iterate` call, manual or scheduled,
//! onto the vanilla (non-accelerated) branch. `accelerating` tracks which
//! mode is live and flips when the executor starts or stops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use nalgebra::DMatrix;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Exp};
use tracing::{debug, info, warn};

use crate::alignment::two_stage_frame_alignment;
use crate::config::AgentConfig;
use crate::config::OptimizerChoice;
use crate::error::AgentError;
use crate::init::{chordal_initialization, lift_estimate, odometry_initialization};
use crate::manifold::{project_to_rotation_group, ProductManifold};
use crate::measurement::RelativeSeMeasurement;
use crate::optimizer::{riemannian_gradient_descent, riemannian_trust_region, SteihaugToint};
use crate::pose::{LiftedPose, LiftedPoseArray, PoseId, RigidPose};
use crate::pose_graph::PoseGraph;
use crate::problem::QuadraticProblem;
use crate::robust_cost::CostFunction;
use crate::status::{AgentState, AgentStatus, PublicPoseMessage};

struct PosesRegion {
    x: LiftedPoseArray,
    x_prev: LiftedPoseArray,
    x_init: LiftedPoseArray,
    v: LiftedPoseArray,
    y_aux: LiftedPoseArray,
    gamma: f64,
    alpha: f64,
    since_restart: usize,
    lifting_matrix: Option<DMatrix<f64>>,
    /// The transform (lifted `r × (d+1)` block) carrying this robot's local
    /// frame into the team's global frame, set once by whichever process
    /// coordinates the team (§6 `setGlobalAnchor`). `None` until then.
    global_anchor: Option<LiftedPose>,
}

struct MeasurementsRegion {
    graph: PoseGraph,
    state: AgentState,
    iteration: usize,
    instance_number: usize,
    ready_to_terminate: bool,
    cost_function: CostFunction,
    since_last_reweight: usize,
    /// Mean per-pose translation displacement from the previous iterate,
    /// the same quantity `ready_to_terminate` gates on (§4.7 step 3, §6).
    relative_change: f64,
}

/// Neighbor pose bookkeeping (§5): `main` holds poses this robot actually
/// needs (referenced by a shared loop closure, `neighborPoseDict`); `aux`
/// holds whatever extra poses a neighbor has chosen to share beyond that
/// (`neighborAuxPoseDict`).
#[derive(Default)]
struct NeighborPosesRegion {
    main: HashMap<PoseId, LiftedPose>,
    aux: HashMap<PoseId, LiftedPose>,
}

struct Shared {
    robot_id: usize,
    config: AgentConfig,
    poses: Mutex<PosesRegion>,
    measurements: Mutex<MeasurementsRegion>,
    neighbor_poses: Mutex<NeighborPosesRegion>,
    /// Last status reported by each neighbor through `setNeighborStatus`,
    /// consulted by `shouldTerminate` (§6).
    neighbor_statuses: Mutex<HashMap<usize, AgentStatus>>,
    /// Serializes `iterate()` against the background executor's own calls
    /// into it, so the two never run a step concurrently.
    iterate_lock: Mutex<()>,
    /// `true` while no background executor is running: acceleration is only
    /// used in that mode (§5).
    accelerating: AtomicBool,
    cancel: Arc<(Mutex<bool>, Condvar)>,
}

/// A single robot's decentralized pose-graph optimization agent.
pub struct Agent {
    shared: Arc<Shared>,
    executor: Mutex<Option<JoinHandle<()>>>,
}

impl Agent {
    pub fn new(robot_id: usize, config: AgentConfig) -> Self {
        let r = config.rank;
        let d = config.dim;
        let shared = Shared {
            robot_id,
            config,
            poses: Mutex::new(PosesRegion {
                x: LiftedPoseArray::zeros(r, d, 0),
                x_prev: LiftedPoseArray::zeros(r, d, 0),
                x_init: LiftedPoseArray::zeros(r, d, 0),
                v: LiftedPoseArray::zeros(r, d, 0),
                y_aux: LiftedPoseArray::zeros(r, d, 0),
                gamma: 0.0,
                alpha: 0.0,
                since_restart: 0,
                lifting_matrix: None,
                global_anchor: None,
            }),
            measurements: Mutex::new(MeasurementsRegion {
                graph: PoseGraph::new(robot_id, r, d),
                state: AgentState::WaitForData,
                iteration: 0,
                instance_number: 0,
                ready_to_terminate: false,
                cost_function: config.cost_function,
                since_last_reweight: 0,
                relative_change: 0.0,
            }),
            neighbor_poses: Mutex::new(NeighborPosesRegion::default()),
            neighbor_statuses: Mutex::new(HashMap::new()),
            iterate_lock: Mutex::new(()),
            accelerating: AtomicBool::new(true),
            cancel: Arc::new((Mutex::new(false), Condvar::new())),
        };
        Self { shared: Arc::new(shared), executor: Mutex::new(None) }
    }

    pub fn robot_id(&self) -> usize {
        self.shared.robot_id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.shared.config
    }

    // ---- measurement ingestion (§6) -------------------------------------

    pub fn set_measurements(&self, odometry: Vec<RelativeSeMeasurement>, private_loop_closures: Vec<RelativeSeMeasurement>, shared_loop_closures: Vec<RelativeSeMeasurement>) {
        let mut m = self.shared.measurements.lock().unwrap();
        m.graph.set_measurements(odometry, private_loop_closures, shared_loop_closures);
        if m.state == AgentState::WaitForData {
            m.state = AgentState::WaitForInitialization;
        }
    }

    pub fn add_measurement(&self, measurement: RelativeSeMeasurement) -> Result<(), AgentError> {
        let mut m = self.shared.measurements.lock().unwrap();
        m.graph.add_measurement(measurement)?;
        if m.state == AgentState::WaitForData {
            m.state = AgentState::WaitForInitialization;
        }
        Ok(())
    }

    /// Sets the lifting matrix `Y_lift ∈ St(d,r)` used to embed the local
    /// chordal bootstrap into the rank-`r` relaxation. Immutable once set
    /// until `reset()` (§6).
    pub fn set_lifting_matrix(&self, y_lift: DMatrix<f64>) -> Result<(), AgentError> {
        let mut p = self.shared.poses.lock().unwrap();
        if p.lifting_matrix.is_some() {
            return Err(AgentError::LiftingMatrixAlreadySet);
        }
        if y_lift.nrows() != self.shared.config.rank || y_lift.ncols() != self.shared.config.dim {
            return Err(AgentError::DimensionMismatch {
                expected: format!("{}x{}", self.shared.config.rank, self.shared.config.dim),
                got: format!("{}x{}", y_lift.nrows(), y_lift.ncols()),
            });
        }
        p.lifting_matrix = Some(y_lift);
        Ok(())
    }

    /// Sets the transform that carries this robot's local frame into the
    /// team's global frame, as a lifted `rank × (dim+1)` block (§6).
    pub fn set_global_anchor(&self, anchor: DMatrix<f64>) -> Result<(), AgentError> {
        let expected = self.shared.config.rank;
        if anchor.nrows() != expected {
            return Err(AgentError::AnchorRankMismatch { expected, got: anchor.nrows() });
        }
        let mut p = self.shared.poses.lock().unwrap();
        p.global_anchor = Some(LiftedPose::from_block(anchor));
        Ok(())
    }

    // ---- initialization (§4.8, §6) --------------------------------------

    /// Bootstraps this robot's own trajectory (§4.7, §4.8, §6
    /// `initialize(T_init)`). With `t_init` supplied, that ambient
    /// trajectory is used directly; otherwise runs chordal initialization
    /// over this robot's own-own edges, falling back to odometry chaining
    /// if the chordal solve fails (disconnected own-own graph).
    ///
    /// Robot 0 and any single-robot team move straight to `INITIALIZED`;
    /// every other robot waits in `WAIT_FOR_INITIALIZATION` until a frame
    /// alignment against a neighbor succeeds (§4.7).
    pub fn initialize(&self, t_init: Option<Vec<RigidPose>>) -> Result<(), AgentError> {
        let mut m = self.shared.measurements.lock().unwrap();
        if m.state == AgentState::WaitForData {
            return Err(AgentError::WrongState { expected: AgentState::WaitForInitialization, actual: m.state });
        }
        let ambient = match t_init {
            Some(seed) => seed,
            None => match chordal_initialization(&m.graph) {
                Ok(poses) => poses,
                Err(e) => {
                    warn!(robot_id = self.shared.robot_id, error = %e, "chordal initialization failed, falling back to odometry chaining");
                    odometry_initialization(&m.graph)
                }
            },
        };

        let mut p = self.shared.poses.lock().unwrap();
        let y_lift = p
            .lifting_matrix
            .clone()
            .ok_or(AgentError::LiftingMatrixUnset { robot_id: self.shared.robot_id })?;
        let manifold = ProductManifold::new(self.shared.config.rank, self.shared.config.dim, ambient.len());
        let x = lift_estimate(&ambient, &manifold, &y_lift);
        p.x_init = x.clone();
        p.x_prev = x.clone();
        p.v = x.clone();
        p.y_aux = x.clone();
        p.x = x;
        p.gamma = 0.0;
        p.alpha = 0.0;
        p.since_restart = 0;

        let is_root_or_solo = self.shared.robot_id == 0 || self.shared.config.team_size <= 1;
        m.state = if is_root_or_solo { AgentState::Initialized } else { AgentState::WaitForInitialization };
        info!(robot_id = self.shared.robot_id, num_poses = ambient.len(), state = ?m.state, "agent initialized");
        Ok(())
    }

    // ---- neighbor communication (§6) -------------------------------------

    /// Own poses referenced by a shared loop closure, for transmission to
    /// the neighbors that need them (§6 `getSharedPoseDict`).
    pub fn get_shared_pose_dict(&self) -> Vec<PublicPoseMessage> {
        let p = self.shared.poses.lock().unwrap();
        let m = self.shared.measurements.lock().unwrap();
        m.graph
            .my_public_pose_ids()
            .into_iter()
            .map(|id| {
                let pose = p.x.get_pose(id.frame_id);
                PublicPoseMessage::new(id, m.instance_number, m.iteration, &pose)
            })
            .collect()
    }

    /// This robot's full trajectory, offered as auxiliary poses beyond the
    /// minimum a neighbor strictly needs (§6 `getAuxSharedPoseDict`).
    pub fn get_aux_shared_pose_dict(&self) -> Vec<PublicPoseMessage> {
        let p = self.shared.poses.lock().unwrap();
        let m = self.shared.measurements.lock().unwrap();
        (0..p.x.num_poses())
            .map(|i| {
                let id = PoseId::new(self.shared.robot_id, i);
                PublicPoseMessage::new(id, m.instance_number, m.iteration, &p.x.get_pose(i))
            })
            .collect()
    }

    /// Records poses received from neighbors (§6 `updateNeighborPoses`).
    /// While this agent is still `WAIT_FOR_INITIALIZATION`, every update
    /// also attempts the alignment that would move it to `INITIALIZED`
    /// (§4.7 component (f)).
    pub fn update_neighbor_poses(&self, messages: &[PublicPoseMessage]) {
        {
            let mut n = self.shared.neighbor_poses.lock().unwrap();
            for msg in messages {
                n.main.insert(msg.pose_id.into(), msg.to_lifted_pose());
            }
        }
        attempt_alignment(&self.shared);
    }

    /// Records auxiliary poses received from neighbors (§6
    /// `updateAuxNeighborPoses`).
    pub fn update_aux_neighbor_poses(&self, messages: &[PublicPoseMessage]) {
        let mut n = self.shared.neighbor_poses.lock().unwrap();
        for msg in messages {
            n.aux.insert(msg.pose_id.into(), msg.to_lifted_pose());
        }
    }

    /// Records the latest status a neighbor has reported (§6
    /// `setNeighborStatus`), consulted by `should_terminate`.
    pub fn set_neighbor_status(&self, status: AgentStatus) {
        let mut statuses = self.shared.neighbor_statuses.lock().unwrap();
        statuses.insert(status.robot_id, status);
    }

    /// True once this agent is ready to terminate and every neighbor it has
    /// heard from has reported the same (§6 `shouldTerminate`).
    pub fn should_terminate(&self) -> bool {
        let ready = self.shared.measurements.lock().unwrap().ready_to_terminate;
        if !ready {
            return false;
        }
        self.shared.neighbor_statuses.lock().unwrap().values().all(|s| s.ready_to_terminate)
    }

    // ---- trajectory retrieval (§6, §8 scenario 1) -------------------------

    /// This robot's trajectory unlifted into `SE(d)`, gauge-fixed so the
    /// first pose is the identity (§6 `getTrajectoryInLocalFrame`).
    pub fn get_trajectory_in_local_frame(&self) -> Result<Vec<RigidPose>, AgentError> {
        let p = self.shared.poses.lock().unwrap();
        let y_lift = p.lifting_matrix.as_ref().ok_or(AgentError::LiftingMatrixUnset { robot_id: self.shared.robot_id })?;
        let local = unlift_trajectory(&p.x, y_lift);
        Ok(gauge_fix_to_first_pose(&local))
    }

    /// This robot's trajectory carried into the team's global frame by the
    /// anchor set through `set_global_anchor` (§6
    /// `getTrajectoryInGlobalFrame`). With no anchor set, the global frame
    /// is taken to coincide with the local one (identity anchor).
    pub fn get_trajectory_in_global_frame(&self) -> Result<Vec<RigidPose>, AgentError> {
        let p = self.shared.poses.lock().unwrap();
        let y_lift = p.lifting_matrix.as_ref().ok_or(AgentError::LiftingMatrixUnset { robot_id: self.shared.robot_id })?;
        let local = unlift_trajectory(&p.x, y_lift);
        match &p.global_anchor {
            Some(anchor) => {
                let anchor_rigid = unlift_pose(anchor, y_lift);
                Ok(local.iter().map(|pose| anchor_rigid.compose(pose)).collect())
            }
            None => Ok(local),
        }
    }

    // ---- the local update step (§4.7) ------------------------------------

    /// Runs one full iteration: reweighting if due, then a Nesterov-
    /// accelerated (or vanilla, while the background executor is running)
    /// local Riemannian update, with periodic restart. Acquires
    /// `poses → measurements → neighbor_poses` in that order.
    pub fn iterate(&self) -> Result<(), AgentError> {
        iterate_shared(&self.shared, true)
    }

    /// A "dry" tick (§6 `iterate(doOpt)`): advances momentum and status
    /// bookkeeping without calling into the optimizer.
    pub fn iterate_dry(&self) -> Result<(), AgentError> {
        iterate_shared(&self.shared, false)
    }

    pub fn reset(&self) {
        {
            let mut p = self.shared.poses.lock().unwrap();
            let mut m = self.shared.measurements.lock().unwrap();
            let mut n = self.shared.neighbor_poses.lock().unwrap();
            let mut statuses = self.shared.neighbor_statuses.lock().unwrap();
            p.x = LiftedPoseArray::zeros(self.shared.config.rank, self.shared.config.dim, 0);
            p.x_prev = p.x.clone();
            p.x_init = p.x.clone();
            p.v = p.x.clone();
            p.y_aux = p.x.clone();
            p.gamma = 0.0;
            p.alpha = 0.0;
            p.lifting_matrix = None;
            p.global_anchor = None;
            p.since_restart = 0;
            m.state = AgentState::WaitForData;
            m.iteration = 0;
            m.instance_number += 1;
            m.ready_to_terminate = false;
            m.cost_function = self.shared.config.cost_function;
            m.since_last_reweight = 0;
            m.relative_change = 0.0;
            n.main.clear();
            n.aux.clear();
            statuses.clear();
        }
        self.end_optimization_loop();
    }

    pub fn status(&self) -> AgentStatus {
        let m = self.shared.measurements.lock().unwrap();
        AgentStatus {
            robot_id: self.shared.robot_id,
            state: m.state,
            iteration: m.iteration,
            instance_number: m.instance_number,
            ready_to_terminate: m.ready_to_terminate,
            optimization_running: self.executor.lock().unwrap().is_some(),
            relative_change: m.relative_change,
        }
    }

    // ---- background executor (§5) ----------------------------------------

    /// Spawns the background worker thread that calls `iterate()` at a
    /// Poisson-distributed rate (§5). Forces non-accelerated updates for as
    /// long as the executor is running.
    pub fn start_optimization_loop(&self) {
        let mut guard = self.executor.lock().unwrap();
        if guard.is_some() {
            return;
        }
        self.shared.accelerating.store(false, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        *self.shared.cancel.0.lock().unwrap() = false;
        let handle = std::thread::spawn(move || run_executor(shared));
        *guard = Some(handle);
    }

    /// Signals the background worker to stop, joins it, and re-enables
    /// acceleration for subsequent manual `iterate()` calls (§5).
    pub fn end_optimization_loop(&self) {
        {
            let (lock, cvar) = &*self.shared.cancel;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.executor.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.shared.accelerating.store(true, Ordering::SeqCst);
    }
}

/// Attempts the `WAIT_FOR_INITIALIZATION → INITIALIZED` transition using
/// whatever shared loop closures and neighbor poses are currently known
/// (§4.6, §4.7 component (f)). A failed attempt (too few inliers, or no
/// shared edges yet) is not an error: the agent stays in
/// `WAIT_FOR_INITIALIZATION` and retries on the next neighbor update (§7).
fn attempt_alignment(shared: &Arc<Shared>) {
    let mut p = shared.poses.lock().unwrap();
    let mut m = shared.measurements.lock().unwrap();
    if m.state != AgentState::WaitForInitialization {
        return;
    }
    let n = shared.neighbor_poses.lock().unwrap();
    let cfg = &shared.config;
    let lookup = |id: PoseId| {
        if id.robot_id == shared.robot_id {
            Some(p.x.get_pose(id.frame_id))
        } else {
            n.main.get(&id).cloned()
        }
    };
    let result = two_stage_frame_alignment(
        shared.robot_id,
        m.graph.shared_loop_closures(),
        &lookup,
        cfg.two_stage_rotation_gate,
        cfg.two_stage_translation_gate,
        cfg.robust_init_min_inliers,
    );
    drop(n);

    match result {
        Ok(alignment) => {
            let c_inv = alignment.rotation.transpose();
            let s_inv = -(&c_inv * &alignment.translation);
            let n_poses = p.x.num_poses();
            let (r, d) = (p.x.rank(), p.x.dim());
            let mut aligned = LiftedPoseArray::zeros(r, d, n_poses);
            for i in 0..n_poses {
                let pose = p.x.get_pose(i);
                let y_new = &c_inv * pose.y();
                let p_new = &c_inv * pose.p() + &s_inv;
                aligned.set_pose(i, &LiftedPose::from_parts(y_new, p_new));
            }
            p.x_init = aligned.clone();
            p.x_prev = aligned.clone();
            p.v = aligned.clone();
            p.y_aux = aligned.clone();
            p.x = aligned;
            p.gamma = 0.0;
            p.alpha = 0.0;
            p.since_restart = 0;
            m.state = AgentState::Initialized;
            info!(robot_id = shared.robot_id, "frame alignment succeeded, agent initialized");
        }
        Err(e) => {
            debug!(robot_id = shared.robot_id, error = %e, "frame alignment attempt incomplete, remaining in wait_for_initialization");
        }
    }
}

/// Unlifts a rank-`r` pose into `SE(d)` via `Y_lift^T`, rounding the
/// rotation block back onto `SO(d)` (§6: "rounded SE(d) output").
fn unlift_pose(pose: &LiftedPose, y_lift: &DMatrix<f64>) -> RigidPose {
    let d = y_lift.ncols();
    let block = y_lift.transpose() * pose.as_block();
    let rotation = project_to_rotation_group(&block.view((0, 0), (d, d)).clone_owned());
    let translation = block.view((0, d), (d, 1)).column(0).clone_owned();
    RigidPose::new(rotation, translation)
}

fn unlift_trajectory(x: &LiftedPoseArray, y_lift: &DMatrix<f64>) -> Vec<RigidPose> {
    x.iter_poses().map(|pose| unlift_pose(&pose, y_lift)).collect()
}

/// Gauge-fixes a trajectory to its own first pose: `result[0]` is the
/// identity, every other pose is expressed relative to it (§8 scenario 1).
fn gauge_fix_to_first_pose(trajectory: &[RigidPose]) -> Vec<RigidPose> {
    match trajectory.first() {
        None => Vec::new(),
        Some(origin) => {
            let origin_inv = origin.inverse();
            trajectory.iter().map(|pose| origin_inv.compose(pose)).collect()
        }
    }
}

fn run_optimizer(problem: &QuadraticProblem, x0: &LiftedPoseArray, cfg: &AgentConfig) -> LiftedPoseArray {
    match cfg.optimizer {
        OptimizerChoice::Rtr(params) => riemannian_trust_region(problem, x0, &params, &SteihaugToint),
        OptimizerChoice::Rgd(params) => riemannian_gradient_descent(problem, x0, &params),
    }
}

fn iterate_shared(shared: &Shared, do_optimization: bool) -> Result<(), AgentError> {
    let _serialize = shared.iterate_lock.lock().unwrap();

    let mut p = shared.poses.lock().unwrap();
    let mut m = shared.measurements.lock().unwrap();
    if m.state != AgentState::Initialized {
        return Err(AgentError::WrongState { expected: AgentState::Initialized, actual: m.state });
    }
    let n = shared.neighbor_poses.lock().unwrap();

    let cfg = shared.config;
    let n_team = (cfg.team_size.max(1)) as f64;

    // Step 1 (§4.7): reweighting, due every `robust_opt_inner_iters`
    // iterations for any non-L2 cost. Resetting momentum here keeps the
    // accelerated trajectory from chasing a cost surface that just changed
    // under it.
    m.since_last_reweight += 1;
    if !matches!(m.cost_function, CostFunction::L2) && m.since_last_reweight >= cfg.robust_opt_inner_iters {
        reweight_locked(&mut m, &p, &n.main, shared.robot_id);
        m.since_last_reweight = 0;
        if !cfg.robust_opt_warm_start {
            p.x = p.x_init.clone();
        }
        p.v = p.x.clone();
        p.y_aux = p.x.clone();
        p.gamma = 0.0;
        p.alpha = 0.0;
        p.since_restart = 0;
    }

    // Step 2: the local update itself.
    let manifold = ProductManifold::new(cfg.rank, cfg.dim, p.x.num_poses());
    p.x_prev = p.x.clone();

    let (q, g, neighbor_ids) = m.graph.data_matrices()?;
    let x_neighbors = stack_neighbor_poses(&n.main, neighbor_ids, cfg.rank);
    drop(n);
    let problem = QuadraticProblem::new(manifold, q.clone(), g.clone(), x_neighbors);

    if shared.accelerating.load(Ordering::SeqCst) {
        p.gamma = (1.0 + (1.0 + 4.0 * n_team * n_team * p.gamma * p.gamma).sqrt()) / (2.0 * n_team);
        p.alpha = 1.0 / (p.gamma * n_team);
        let combo = p.x.matrix() * (1.0 - p.alpha) + p.v.matrix() * p.alpha;
        p.y_aux = manifold.project(&combo);

        let x_new = if do_optimization { run_optimizer(&problem, &p.y_aux, &cfg) } else { p.y_aux.clone() };
        let delta = x_new.matrix() - p.y_aux.matrix();
        let v_raw = p.v.matrix() + delta * p.gamma;
        p.v = manifold.project(&v_raw);
        p.x = x_new;

        p.since_restart += 1;
        if p.since_restart >= cfg.restart_interval {
            p.x = p.x_prev.clone();
            let x_restarted = run_optimizer(&problem, &p.x, &cfg);
            p.x = x_restarted;
            p.v = p.x.clone();
            p.y_aux = p.x.clone();
            p.gamma = 0.0;
            p.alpha = 0.0;
            p.since_restart = 0;
        }
    } else if do_optimization {
        p.x = run_optimizer(&problem, &p.x, &cfg);
    }

    m.iteration += 1;
    update_termination_locked(&cfg, &mut m, &p);

    debug!(robot_id = shared.robot_id, iteration = m.iteration, relative_change = m.relative_change, "agent iterate");
    Ok(())
}

fn reweight_locked(m: &mut MeasurementsRegion, p: &PosesRegion, neighbor_poses: &HashMap<PoseId, LiftedPose>, my_robot_id: usize) {
    let cost_function = m.cost_function;
    for edge in m.graph.private_loop_closures_mut().iter_mut() {
        reweight_private_edge(edge, &p.x, &cost_function);
    }
    for edge in m.graph.shared_loop_closures_mut().iter_mut() {
        reweight_shared_edge(edge, &p.x, neighbor_poses, my_robot_id, &cost_function);
    }
    m.cost_function.update();
    m.graph.invalidate_cache();
    debug!(robot_id = my_robot_id, "reweighting round complete");
}

fn update_termination_locked(cfg: &AgentConfig, m: &mut MeasurementsRegion, p: &PosesRegion) {
    let all_edges: Vec<_> = m.graph.private_loop_closures().iter().chain(m.graph.shared_loop_closures().iter()).collect();
    let decided = all_edges
        .iter()
        .filter(|e| !matches!(e.classify(cfg.epsilon_reject, cfg.epsilon_accept), crate::measurement::EdgeClassification::Undecided))
        .count();
    let convergence_ratio = if all_edges.is_empty() { 1.0 } else { decided as f64 / all_edges.len() as f64 };
    let moved = p.x.mean_translation_distance(&p.x_prev);
    m.relative_change = moved;
    m.ready_to_terminate = convergence_ratio >= cfg.robust_opt_min_convergence_ratio && moved < cfg.rel_change_tol && m.iteration < cfg.max_num_iters;
}

fn run_executor(shared: Arc<Shared>) {
    let (lock, cvar) = &*shared.cancel;
    let rate = shared.config.scheduler_rate_hz.max(1e-6);
    let exp = Exp::new(rate).expect("scheduler rate must be positive");
    let mut rng = StdRng::from_entropy();

    loop {
        let interval = Duration::from_secs_f64(exp.sample(&mut rng));
        let guard = lock.lock().unwrap();
        let (guard, _timeout) = cvar.wait_timeout(guard, interval).unwrap();
        if *guard {
            break;
        }
        drop(guard);

        if let Err(e) = iterate_shared(&shared, true) {
            debug!(robot_id = shared.robot_id, error = %e, "executor tick skipped");
        }
    }
}

fn stack_neighbor_poses(neighbor_poses: &HashMap<PoseId, LiftedPose>, ids: &[PoseId], r: usize) -> DMatrix<f64> {
    if ids.is_empty() {
        return DMatrix::zeros(r, 0);
    }
    let dim = neighbor_poses.get(&ids[0]).map(|p| p.dim()).unwrap_or(0);
    let mut out = DMatrix::<f64>::zeros(r, ids.len() * (dim + 1));
    for (i, id) in ids.iter().enumerate() {
        if let Some(pose) = neighbor_poses.get(id) {
            out.view_mut((0, i * (dim + 1)), (r, dim + 1)).copy_from(pose.as_block());
        }
    }
    out
}

/// Resolves a pose id against this robot's own iterate or the neighbor pose
/// table, whichever it belongs to. Used by shared-edge reweighting, where a
/// missing neighbor entry must skip the edge rather than fabricate a
/// residual against stale or zeroed data (§7).
fn pose_lookup(x: &LiftedPoseArray, neighbor_poses: &HashMap<PoseId, LiftedPose>, my_robot_id: usize, id: PoseId) -> Option<LiftedPose> {
    if id.robot_id == my_robot_id {
        if id.frame_id < x.num_poses() {
            Some(x.get_pose(id.frame_id))
        } else {
            None
        }
    } else {
        neighbor_poses.get(&id).cloned()
    }
}

fn reweight_private_edge(edge: &mut RelativeSeMeasurement, x: &LiftedPoseArray, cost_function: &CostFunction) {
    if edge.fixed_weight || edge.known_inlier {
        return;
    }
    if edge.from.frame_id >= x.num_poses() || edge.to.frame_id >= x.num_poses() {
        return;
    }
    let from_pose = x.get_pose(edge.from.frame_id);
    let to_pose = x.get_pose(edge.to.frame_id);
    let predicted_y = from_pose.y() * &edge.r_hat;
    let rotation_residual = (to_pose.y() - predicted_y).norm_squared();
    let predicted_p = from_pose.p() + from_pose.y() * &edge.t_hat;
    let translation_residual = (to_pose.p() - predicted_p).norm_squared();
    let r2 = edge.kappa * rotation_residual + edge.tau * translation_residual;
    edge.weight = cost_function.weight(r2);
}

/// Reweights one shared (inter-robot) loop closure, looking up its
/// off-robot endpoint in `neighbor_poses`. Skips the edge's weight update
/// this round if that pose hasn't arrived yet (§7).
fn reweight_shared_edge(edge: &mut RelativeSeMeasurement, x: &LiftedPoseArray, neighbor_poses: &HashMap<PoseId, LiftedPose>, my_robot_id: usize, cost_function: &CostFunction) {
    if edge.fixed_weight || edge.known_inlier {
        return;
    }
    let from_pose = match pose_lookup(x, neighbor_poses, my_robot_id, edge.from) {
        Some(pose) => pose,
        None => {
            debug!(from = ?edge.from, to = ?edge.to, "skipping shared edge reweight: neighbor pose missing");
            return;
        }
    };
    let to_pose = match pose_lookup(x, neighbor_poses, my_robot_id, edge.to) {
        Some(pose) => pose,
        None => {
            debug!(from = ?edge.from, to = ?edge.to, "skipping shared edge reweight: neighbor pose missing");
            return;
        }
    };
    let predicted_y = from_pose.y() * &edge.r_hat;
    let rotation_residual = (to_pose.y() - predicted_y).norm_squared();
    let predicted_p = from_pose.p() + from_pose.y() * &edge.t_hat;
    let translation_residual = (to_pose.p() - predicted_p).norm_squared();
    let r2 = edge.kappa * rotation_residual + edge.tau * translation_residual;
    edge.weight = cost_function.weight(r2);
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    fn rot2(theta: f64) -> DMatrix<f64> {
        DMatrix::from_row_slice(2, 2, &[theta.cos(), -theta.sin(), theta.sin(), theta.cos()])
    }

    fn small_square_config() -> AgentConfig {
        let mut cfg = AgentConfig::default();
        cfg.rank = 2;
        cfg.dim = 2;
        cfg
    }

    #[test]
    fn fresh_agent_starts_in_wait_for_data() {
        let agent = Agent::new(0, small_square_config());
        assert_eq!(agent.status().state, AgentState::WaitForData);
    }

    #[test]
    fn initialize_requires_a_lifting_matrix() {
        let agent = Agent::new(0, small_square_config());
        agent
            .add_measurement(RelativeSeMeasurement::odometry(PoseId::new(0, 0), PoseId::new(0, 1), rot2(0.1), DVector::from_vec(vec![1.0, 0.0]), 1.0, 1.0))
            .unwrap();
        let err = agent.initialize(None).unwrap_err();
        assert!(matches!(err, AgentError::LiftingMatrixUnset { .. }));
    }

    #[test]
    fn initialize_transitions_to_initialized_and_iterate_runs() {
        let agent = Agent::new(0, small_square_config());
        agent
            .add_measurement(RelativeSeMeasurement::odometry(PoseId::new(0, 0), PoseId::new(0, 1), rot2(0.1), DVector::from_vec(vec![1.0, 0.0]), 1.0, 1.0))
            .unwrap();
        agent.set_lifting_matrix(DMatrix::identity(2, 2)).unwrap();
        agent.initialize(None).unwrap();
        assert_eq!(agent.status().state, AgentState::Initialized);
        agent.iterate().unwrap();
        assert_eq!(agent.status().iteration, 1);
    }

    #[test]
    fn non_root_multi_robot_agent_waits_for_initialization() {
        let mut cfg = small_square_config();
        cfg.team_size = 2;
        let agent = Agent::new(1, cfg);
        agent
            .add_measurement(RelativeSeMeasurement::odometry(PoseId::new(1, 0), PoseId::new(1, 1), rot2(0.1), DVector::from_vec(vec![1.0, 0.0]), 1.0, 1.0))
            .unwrap();
        agent.set_lifting_matrix(DMatrix::identity(2, 2)).unwrap();
        agent.initialize(None).unwrap();
        assert_eq!(agent.status().state, AgentState::WaitForInitialization);
        assert!(matches!(agent.iterate().unwrap_err(), AgentError::WrongState { .. }));
    }

    #[test]
    fn dry_iterate_advances_momentum_without_optimizing() {
        let agent = Agent::new(0, small_square_config());
        agent
            .add_measurement(RelativeSeMeasurement::odometry(PoseId::new(0, 0), PoseId::new(0, 1), rot2(0.1), DVector::from_vec(vec![1.0, 0.0]), 1.0, 1.0))
            .unwrap();
        agent.set_lifting_matrix(DMatrix::identity(2, 2)).unwrap();
        agent.initialize(None).unwrap();
        agent.iterate_dry().unwrap();
        assert_eq!(agent.status().iteration, 1);
    }

    #[test]
    fn executor_runs_non_accelerated_and_is_cancellable() {
        let agent = Agent::new(0, small_square_config());
        agent
            .add_measurement(RelativeSeMeasurement::odometry(PoseId::new(0, 0), PoseId::new(0, 1), rot2(0.1), DVector::from_vec(vec![1.0, 0.0]), 1.0, 1.0))
            .unwrap();
        agent.set_lifting_matrix(DMatrix::identity(2, 2)).unwrap();
        agent.initialize(None).unwrap();
        agent.start_optimization_loop();
        assert!(agent.status().optimization_running);
        std::thread::sleep(std::time::Duration::from_millis(50));
        agent.end_optimization_loop();
        assert!(!agent.status().optimization_running);
    }

    #[test]
    fn reset_returns_to_wait_for_data() {
        let agent = Agent::new(0, small_square_config());
        agent
            .add_measurement(RelativeSeMeasurement::odometry(PoseId::new(0, 0), PoseId::new(0, 1), rot2(0.1), DVector::from_vec(vec![1.0, 0.0]), 1.0, 1.0))
            .unwrap();
        agent.set_lifting_matrix(DMatrix::identity(2, 2)).unwrap();
        agent.initialize(None).unwrap();
        agent.reset();
        assert_eq!(agent.status().state, AgentState::WaitForData);
    }

    #[test]
    fn get_trajectory_in_local_frame_is_gauge_fixed_to_identity() {
        let agent = Agent::new(0, small_square_config());
        agent
            .add_measurement(RelativeSeMeasurement::odometry(PoseId::new(0, 0), PoseId::new(0, 1), rot2(0.1), DVector::from_vec(vec![1.0, 0.0]), 1.0, 1.0))
            .unwrap();
        agent.set_lifting_matrix(DMatrix::identity(2, 2)).unwrap();
        agent.initialize(None).unwrap();
        let trajectory = agent.get_trajectory_in_local_frame().unwrap();
        assert_eq!(trajectory.len(), 2);
        assert!(trajectory[0].satisfies_so_d(1e-9));
        assert!(trajectory[0].translation().norm() < 1e-9);
        assert!((trajectory[0].rotation() - DMatrix::identity(2, 2)).norm() < 1e-9);
    }

    #[test]
    fn should_terminate_requires_neighbor_consensus() {
        let agent = Agent::new(0, small_square_config());
        agent
            .add_measurement(RelativeSeMeasurement::odometry(PoseId::new(0, 0), PoseId::new(0, 1), rot2(0.1), DVector::from_vec(vec![1.0, 0.0]), 1.0, 1.0))
            .unwrap();
        agent.set_lifting_matrix(DMatrix::identity(2, 2)).unwrap();
        agent.initialize(None).unwrap();
        for _ in 0..5 {
            agent.iterate().unwrap();
        }
        let mut not_ready = AgentStatus::new(1);
        not_ready.ready_to_terminate = false;
        agent.set_neighbor_status(not_ready);
        assert!(!agent.should_terminate());

        let own_ready = agent.status().ready_to_terminate;
        let mut ready = AgentStatus::new(1);
        ready.ready_to_terminate = true;
        agent.set_neighbor_status(ready);
        assert_eq!(agent.should_terminate(), own_ready);
    }
}
