//! In-process multi-agent demo.
//!
//! Builds either a synthetic multi-robot pose graph (regular-polygon paths,
//! one per robot, chained together by inter-robot loop closures) or loads a
//! single g2o file and partitions it across `--robots` contiguous pose
//! ranges, then runs every agent's `iterate()` round-robin, exchanging
//! public poses between rounds, and reports each agent's status.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use nalgebra::{DMatrix, DVector};

use dpgo_agent::config::AgentConfig;
use dpgo_agent::g2o::parse_g2o;
use dpgo_agent::manifold::ProductManifold;
use dpgo_agent::measurement::RelativeSeMeasurement;
use dpgo_agent::pose::PoseId;
use dpgo_agent::{Agent, AgentState};

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn rot2(theta: f64) -> DMatrix<f64> {
    DMatrix::from_row_slice(2, 2, &[theta.cos(), -theta.sin(), theta.sin(), theta.cos()])
}

/// One robot's path: a closed regular polygon with `n` vertices, so the
/// last-to-first loop closure is close to the identity rather than fighting
/// the optimizer from the very first round.
fn polygon_path(robot_id: usize, n: usize) -> Vec<RelativeSeMeasurement> {
    let step_angle = 2.0 * std::f64::consts::PI / n as f64;
    let mut edges = Vec::with_capacity(n);
    for i in 0..n - 1 {
        edges.push(RelativeSeMeasurement::odometry(
            PoseId::new(robot_id, i),
            PoseId::new(robot_id, i + 1),
            rot2(step_angle),
            DVector::from_vec(vec![1.0, 0.0]),
            10.0,
            10.0,
        ));
    }
    edges.push(RelativeSeMeasurement::new(
        PoseId::new(robot_id, n - 1),
        PoseId::new(robot_id, 0),
        rot2(step_angle),
        DVector::from_vec(vec![1.0, 0.0]),
        5.0,
        5.0,
    ));
    edges
}

/// Builds a synthetic team: each robot walks its own closed polygon, and
/// consecutive robots are coupled by one inter-robot loop closure between
/// robot `i`'s last vertex and robot `i+1`'s first vertex.
fn synthetic_team(num_robots: usize, poses_per_robot: usize) -> (Vec<Vec<RelativeSeMeasurement>>, Vec<RelativeSeMeasurement>) {
    let own_edges: Vec<Vec<RelativeSeMeasurement>> = (0..num_robots).map(|r| polygon_path(r, poses_per_robot)).collect();
    let mut shared_edges = Vec::new();
    if num_robots > 1 {
        for r in 0..num_robots {
            let next = (r + 1) % num_robots;
            shared_edges.push(RelativeSeMeasurement::new(
                PoseId::new(r, poses_per_robot - 1),
                PoseId::new(next, 0),
                DMatrix::identity(2, 2),
                DVector::zeros(2),
                2.0,
                2.0,
            ));
        }
    }
    (own_edges, shared_edges)
}

/// Loads a single g2o file and partitions its poses into `num_robots`
/// contiguous ranges, splitting each edge into odometry/private/shared the
/// same way [`dpgo_agent::pose_graph::PoseGraph`] itself would.
fn load_and_partition(path: &Path, num_robots: usize) -> anyhow::Result<(Vec<Vec<RelativeSeMeasurement>>, Vec<RelativeSeMeasurement>)> {
    let contents = fs::read_to_string(path)?;
    let parsed = parse_g2o(&contents)?;
    if parsed.num_poses == 0 {
        anyhow::bail!("g2o file {} has no poses", path.display());
    }
    let chunk = (parsed.num_poses + num_robots - 1) / num_robots;
    let owner = |frame_id: usize| (frame_id / chunk.max(1)).min(num_robots - 1);

    let mut own_edges: Vec<Vec<RelativeSeMeasurement>> = vec![Vec::new(); num_robots];
    let mut shared_edges = Vec::new();
    for e in parsed.edges {
        let from_robot = owner(e.from.frame_id);
        let to_robot = owner(e.to.frame_id);
        let from_local = e.from.frame_id - from_robot * chunk;
        let to_local = e.to.frame_id - to_robot * chunk;
        let mut e = e;
        e.from = PoseId::new(from_robot, from_local);
        e.to = PoseId::new(to_robot, to_local);
        if from_robot == to_robot {
            own_edges[from_robot].push(e);
        } else {
            shared_edges.push(e);
        }
    }
    Ok((own_edges, shared_edges))
}

fn build_agents(own_edges: Vec<Vec<RelativeSeMeasurement>>, shared_edges: Vec<RelativeSeMeasurement>, config: AgentConfig) -> anyhow::Result<Vec<Agent>> {
    let num_robots = own_edges.len();
    let agents: Vec<Agent> = (0..num_robots).map(|r| Agent::new(r, config)).collect();

    for (r, edges) in own_edges.into_iter().enumerate() {
        for e in edges {
            agents[r].add_measurement(e)?;
        }
    }
    for e in shared_edges {
        agents[e.from.robot_id].add_measurement(e.clone())?;
        agents[e.to.robot_id].add_measurement(e)?;
    }

    let y_lift = ProductManifold::new(config.rank, config.dim, 1).random_in_manifold(Some(1)).get_pose(0).y();
    for agent in &agents {
        agent.set_lifting_matrix(y_lift.clone())?;
        agent.initialize(None)?;
    }
    Ok(agents)
}

/// Broadcasts every agent's public poses to every other agent. Agents only
/// look up the neighbor ids their own graph actually references, so
/// delivering unrelated poses is harmless (they just sit unused in the
/// neighbor map). Also drives the `WAIT_FOR_INITIALIZATION → INITIALIZED`
/// transition for every non-root robot, since that alignment only fires on
/// a neighbor pose update.
fn exchange_public_poses(agents: &[Agent]) {
    let mut by_agent = HashMap::new();
    for (i, agent) in agents.iter().enumerate() {
        by_agent.insert(i, agent.get_shared_pose_dict());
    }
    for agent in agents {
        for messages in by_agent.values() {
            agent.update_neighbor_poses(messages);
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "dpgo_demo=info,dpgo_agent=info".into()))
        .with_target(false)
        .compact()
        .init();

    let args: Vec<String> = std::env::args().collect();
    let num_robots: usize = parse_flag(&args, "--robots").and_then(|s| s.parse().ok()).unwrap_or(3);
    let poses_per_robot: usize = parse_flag(&args, "--poses-per-robot").and_then(|s| s.parse().ok()).unwrap_or(6);
    let rounds: usize = parse_flag(&args, "--rounds").and_then(|s| s.parse().ok()).unwrap_or(40);
    let rank: usize = parse_flag(&args, "--rank").and_then(|s| s.parse().ok()).unwrap_or(4);
    let executor_secs: Option<f64> = parse_flag(&args, "--executor-secs").and_then(|s| s.parse().ok());

    let mut config = AgentConfig::default();
    config.rank = rank;
    config.dim = 2;
    config.team_size = num_robots.max(1);

    let (own_edges, shared_edges) = if let Some(path) = parse_flag(&args, "--g2o") {
        load_and_partition(Path::new(&path), num_robots)?
    } else {
        synthetic_team(num_robots, poses_per_robot)
    };

    let agents = build_agents(own_edges, shared_edges, config)?;
    tracing::info!(num_robots, poses_per_robot, rank, "agents initialized");

    if let Some(secs) = executor_secs {
        for agent in &agents {
            agent.start_optimization_loop();
        }
        let deadline = Duration::from_secs_f64(secs);
        let step = Duration::from_millis(200).min(deadline);
        let mut elapsed = Duration::ZERO;
        while elapsed < deadline {
            std::thread::sleep(step);
            elapsed += step;
            exchange_public_poses(&agents);
        }
        for agent in &agents {
            agent.end_optimization_loop();
        }
    } else {
        for round in 0..rounds {
            exchange_public_poses(&agents);
            for agent in &agents {
                if agent.status().state == AgentState::Initialized {
                    agent.iterate()?;
                }
            }
            if round % 10 == 0 || round == rounds - 1 {
                for agent in &agents {
                    let status = agent.status();
                    tracing::info!(
                        robot_id = status.robot_id,
                        round,
                        iteration = status.iteration,
                        ready_to_terminate = status.ready_to_terminate,
                        "status"
                    );
                }
            }
        }
    }

    for agent in &agents {
        let status = agent.status();
        println!(
            "robot {}: state={:?} iteration={} ready_to_terminate={}",
            status.robot_id, status.state, status.iteration, status.ready_to_terminate
        );
    }
    Ok(())
}
