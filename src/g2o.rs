//! g2o text-format loader (§4.9).
//!
//! Supports `VERTEX_SE2` / `VERTEX_SE3:QUAT` (used only to seed the
//! reindexing map; their pose values are not trusted as data) and
//! `EDGE_SE2` / `EDGE_SE3:QUAT`. `FIX` is rejected outright: a fixed vertex
//! encodes an absolute-pose prior this crate's relative-measurement model
//! has no slot for. Any other token is a fatal parse error rather than a
//! silently skipped line, the same strict-input posture the teacher's
//! `transcript.rs` takes toward malformed transcript bytes.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector, UnitQuaternion};
use thiserror::Error;

use crate::measurement::RelativeSeMeasurement;
use crate::pose::PoseId;

#[derive(Debug, Error)]
pub enum G2oError {
    #[error("line {line}: unrecognized token {token:?}")]
    UnknownToken { line: usize, token: String },
    #[error("line {line}: FIX is not supported; relative measurements carry no absolute prior")]
    FixUnsupported { line: usize },
    #[error("line {line}: malformed {kind} record: {detail}")]
    Malformed { line: usize, kind: &'static str, detail: String },
}

/// The parsed contents of a g2o file, reindexed to contiguous frame ids in
/// first-appearance order.
#[derive(Debug, Clone, Default)]
pub struct ParsedG2o {
    pub num_poses: usize,
    pub edges: Vec<RelativeSeMeasurement>,
}

struct Reindexer {
    map: HashMap<i64, usize>,
}

impl Reindexer {
    fn new() -> Self {
        Self { map: HashMap::new() }
    }
    fn resolve(&mut self, raw_id: i64) -> usize {
        let next = self.map.len();
        *self.map.entry(raw_id).or_insert(next)
    }
}

fn parse_floats(line_no: usize, kind: &'static str, tokens: &[&str]) -> Result<Vec<f64>, G2oError> {
    tokens
        .iter()
        .map(|t| t.parse::<f64>().map_err(|e| G2oError::Malformed { line: line_no, kind, detail: e.to_string() }))
        .collect()
}

fn rot2(theta: f64) -> DMatrix<f64> {
    DMatrix::from_row_slice(2, 2, &[theta.cos(), -theta.sin(), theta.sin(), theta.cos()])
}

fn info_matrix_2d_precisions(info: &[f64]) -> (f64, f64) {
    // Upper-triangular [I11,I12,I13,I22,I23,I33] over (x,y,theta).
    let tau = (info[0] + info[3]) / 2.0;
    let kappa = info[5];
    (kappa, tau)
}

fn info_matrix_3d_precisions(info: &[f64]) -> (f64, f64) {
    // Upper-triangular flattening of a 6x6 matrix over (x,y,z,qx,qy,qz);
    // diagonal entries sit at cumulative row offsets 0,6,11,15,18,20.
    let tau = (info[0] + info[6] + info[11]) / 3.0;
    let kappa = (info[15] + info[18] + info[20]) / 3.0;
    (kappa, tau)
}

/// Parses g2o text contents into a reindexed pose-graph fragment suitable
/// for a single robot's [`crate::pose_graph::PoseGraph`].
pub fn parse_g2o(contents: &str) -> Result<ParsedG2o, G2oError> {
    let mut reindexer = Reindexer::new();
    let mut edges = Vec::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens[0] {
            "VERTEX_SE2" | "VERTEX_SE3:QUAT" => {
                let raw_id: i64 = tokens
                    .get(1)
                    .ok_or_else(|| G2oError::Malformed { line: line_no, kind: "VERTEX", detail: "missing id".into() })?
                    .parse()
                    .map_err(|e: std::num::ParseIntError| G2oError::Malformed { line: line_no, kind: "VERTEX", detail: e.to_string() })?;
                reindexer.resolve(raw_id);
            }
            "EDGE_SE2" => {
                if tokens.len() < 9 {
                    return Err(G2oError::Malformed { line: line_no, kind: "EDGE_SE2", detail: "expected 8 fields after the tag".into() });
                }
                let id1: i64 = tokens[1].parse().map_err(|e: std::num::ParseIntError| G2oError::Malformed { line: line_no, kind: "EDGE_SE2", detail: e.to_string() })?;
                let id2: i64 = tokens[2].parse().map_err(|e: std::num::ParseIntError| G2oError::Malformed { line: line_no, kind: "EDGE_SE2", detail: e.to_string() })?;
                let nums = parse_floats(line_no, "EDGE_SE2", &tokens[3..9])?;
                let info = parse_floats(line_no, "EDGE_SE2", &tokens[9..])?;
                if info.len() != 6 {
                    return Err(G2oError::Malformed { line: line_no, kind: "EDGE_SE2", detail: format!("expected 6 information entries, got {}", info.len()) });
                }
                let (dx, dy, dtheta) = (nums[0], nums[1], nums[2]);
                let (kappa, tau) = info_matrix_2d_precisions(&info);

                let from = reindexer.resolve(id1);
                let to = reindexer.resolve(id2);
                edges.push(RelativeSeMeasurement::new(PoseId::new(0, from), PoseId::new(0, to), rot2(dtheta), DVector::from_vec(vec![dx, dy]), kappa, tau));
            }
            "EDGE_SE3:QUAT" => {
                if tokens.len() < 10 {
                    return Err(G2oError::Malformed { line: line_no, kind: "EDGE_SE3:QUAT", detail: "expected 9 fields after the tag".into() });
                }
                let id1: i64 = tokens[1].parse().map_err(|e: std::num::ParseIntError| G2oError::Malformed { line: line_no, kind: "EDGE_SE3:QUAT", detail: e.to_string() })?;
                let id2: i64 = tokens[2].parse().map_err(|e: std::num::ParseIntError| G2oError::Malformed { line: line_no, kind: "EDGE_SE3:QUAT", detail: e.to_string() })?;
                let nums = parse_floats(line_no, "EDGE_SE3:QUAT", &tokens[3..10])?;
                let info = parse_floats(line_no, "EDGE_SE3:QUAT", &tokens[10..])?;
                if info.len() != 21 {
                    return Err(G2oError::Malformed { line: line_no, kind: "EDGE_SE3:QUAT", detail: format!("expected 21 information entries, got {}", info.len()) });
                }
                let (dx, dy, dz) = (nums[0], nums[1], nums[2]);
                let (qx, qy, qz, qw) = (nums[3], nums[4], nums[5], nums[6]);
                let quat = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(qw, qx, qy, qz));
                let rotation = DMatrix::from_row_slice(3, 3, quat.to_rotation_matrix().matrix().as_slice());
                let (kappa, tau) = info_matrix_3d_precisions(&info);

                let from = reindexer.resolve(id1);
                let to = reindexer.resolve(id2);
                edges.push(RelativeSeMeasurement::new(PoseId::new(0, from), PoseId::new(0, to), rotation, DVector::from_vec(vec![dx, dy, dz]), kappa, tau));
            }
            "FIX" => return Err(G2oError::FixUnsupported { line: line_no }),
            other => return Err(G2oError::UnknownToken { line: line_no, token: other.to_string() }),
        }
    }

    Ok(ParsedG2o { num_poses: reindexer.map.len(), edges })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_small_se2_file() {
        let contents = "\
VERTEX_SE2 0 0.0 0.0 0.0
VERTEX_SE2 1 1.0 0.0 0.0
EDGE_SE2 0 1 1.0 0.0 0.0 10.0 0.0 0.0 10.0 0.0 5.0
";
        let parsed = parse_g2o(contents).unwrap();
        assert_eq!(parsed.num_poses, 2);
        assert_eq!(parsed.edges.len(), 1);
        assert!((parsed.edges[0].t_hat[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_fix() {
        let err = parse_g2o("FIX 0\n").unwrap_err();
        assert!(matches!(err, G2oError::FixUnsupported { .. }));
    }

    #[test]
    fn rejects_unknown_token() {
        let err = parse_g2o("BOGUS_RECORD 1 2 3\n").unwrap_err();
        assert!(matches!(err, G2oError::UnknownToken { .. }));
    }

    #[test]
    fn reindexes_sparse_vertex_ids() {
        let contents = "EDGE_SE2 7 42 1.0 0.0 0.0 1.0 0.0 0.0 1.0 0.0 1.0\n";
        let parsed = parse_g2o(contents).unwrap();
        assert_eq!(parsed.num_poses, 2);
        assert_eq!(parsed.edges[0].from, PoseId::new(0, 0));
        assert_eq!(parsed.edges[0].to, PoseId::new(0, 1));
    }
}
