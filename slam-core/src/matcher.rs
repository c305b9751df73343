//! Feature matching between a query frame and a reference frame's
//! descriptor forest, producing floating landmarks for candidate
//! correspondences.

use std::collections::BTreeSet;

use nalgebra::UnitQuaternion;
use rand::rngs::SmallRng;
use rand::Rng;

use slam_geom::{pixel_gap, PinholeModel};
use slam_types::{IndexNode, SlamConfig, INFINITE_DISTANCE};

use crate::distance::fp_distance;
use crate::store::{FpKey, FrameId, GraphStore, LandmarkId, LandmarkTable};
use crate::Result;

/// Rotation-compensated pixel gate.
struct Gate {
    camera: PinholeModel,
    rot_diff: UnitQuaternion<f64>,
    min_gap: f64,
    max_gap: f64,
}

impl Gate {
    /// Whether a reference-frame point at `(match_x, match_y)` lands within
    /// the accepted gap of the query point, and the gap itself.
    fn check(&self, query_x: f64, query_y: f64, match_x: f64, match_y: f64) -> (bool, f64) {
        let expected = self
            .camera
            .rotation_compensated(&self.rot_diff, match_x, match_y);
        let gap = pixel_gap(query_x, query_y, expected.x, expected.y);
        (gap <= self.max_gap && gap >= self.min_gap, gap)
    }
}

/// Track best and second-best descriptor distances.
fn set_distances(distance: f64, best: &mut f64, second: &mut f64) {
    if distance < *best {
        *second = *best;
        *best = distance;
    } else if distance < *second {
        *second = distance;
    }
}

/// Lowe ratio criterion plus the absolute distance threshold.
fn valid_distance(cfg: &SlamConfig, best: f64, second: f64) -> bool {
    if best >= cfg.distance_threshold {
        false
    } else {
        !(second < INFINITE_DISTANCE && best > cfg.ratio * second)
    }
}

/// Walk one tree: descend into the minimum-distance child, accepting it when
/// it passes the gate and the distance threshold, backtracking into its
/// children otherwise.
#[allow(clippy::too_many_arguments)]
fn search_nodes(
    store: &GraphStore,
    gate: &Gate,
    cfg: &SlamConfig,
    nodes: &[IndexNode],
    tree_frame: FrameId,
    query: FpKey,
    query_x: f64,
    query_y: f64,
    descriptor_frames: &BTreeSet<FrameId>,
) -> (Option<FpKey>, f64, f64) {
    let mut min_distance = INFINITE_DISTANCE;
    let mut min_node: Option<&IndexNode> = None;
    for node in nodes {
        let key = FpKey {
            frame: tree_frame,
            index: node.index as u32,
        };
        let distance = fp_distance(store, key, query, descriptor_frames);
        if min_node.is_none() || distance < min_distance {
            min_distance = distance;
            min_node = Some(node);
        }
    }
    let node = match min_node {
        Some(node) => node,
        None => return (None, INFINITE_DISTANCE, 0.0),
    };
    let key = FpKey {
        frame: tree_frame,
        index: node.index as u32,
    };
    let (x, y) = match store.fp(key) {
        Some(fp) => (fp.x, fp.y),
        None => return (None, INFINITE_DISTANCE, 0.0),
    };
    let (valid, gap) = gate.check(query_x, query_y, x, y);
    if valid && min_distance <= cfg.distance_threshold {
        (Some(key), min_distance, gap)
    } else if !node.children.is_empty() {
        search_nodes(
            store,
            gate,
            cfg,
            &node.children,
            tree_frame,
            query,
            query_x,
            query_y,
            descriptor_frames,
        )
    } else {
        (None, min_distance, gap)
    }
}

/// Match the query feature points against `tree_frame`'s forest. Accepted
/// correspondences become floating landmarks in `scratch`; the whole batch
/// is discarded when its average gap stays below `min_avg_gap` (insufficient
/// parallax for triangulation).
#[allow(clippy::too_many_arguments)]
pub(crate) fn match_features(
    store: &mut GraphStore,
    cfg: &SlamConfig,
    tree_frame: FrameId,
    query_fps: &[FpKey],
    descriptor_frames: &BTreeSet<FrameId>,
    max_matches: usize,
    min_avg_gap: f64,
    scratch: &mut LandmarkTable,
    rng: &mut SmallRng,
) -> Result<Vec<LandmarkId>> {
    let mut accepted: Vec<LandmarkId> = Vec::new();
    if query_fps.is_empty() {
        return Ok(accepted);
    }
    let query_frame = query_fps[0].frame;
    let (tree_rot, query_rot) = {
        let tf = match store.frame(tree_frame) {
            Some(f) => f,
            None => return Ok(accepted),
        };
        let qf = match store.frame(query_frame) {
            Some(f) => f,
            None => return Ok(accepted),
        };
        (tf.pose.rot, qf.pose.rot)
    };
    let gate = Gate {
        camera: PinholeModel::centered(cfg.fx),
        // Maps reference-frame directions into the query frame.
        rot_diff: query_rot.inverse() * tree_rot,
        min_gap: cfg.min_gap,
        max_gap: cfg.max_gap,
    };

    let mut pending: Vec<FpKey> = query_fps.to_vec();
    let mut total_gap = 0.0;
    let mut total_pts = 0usize;

    while !pending.is_empty() && accepted.len() < max_matches {
        let query = pending.swap_remove(rng.gen_range(0..pending.len()));
        let (qx, qy) = match store.fp(query) {
            Some(fp) => (fp.x, fp.y),
            None => continue,
        };

        let mut best = INFINITE_DISTANCE;
        let mut second = INFINITE_DISTANCE;
        let mut match_fp: Option<FpKey> = None;
        let mut match_gap = 0.0;

        if cfg.match_hierarchy {
            let forest = &store
                .frame(tree_frame)
                .expect("tree frame present")
                .forest;
            for tree in forest {
                let (fp, distance, gap) = search_nodes(
                    store,
                    &gate,
                    cfg,
                    tree,
                    tree_frame,
                    query,
                    qx,
                    qy,
                    descriptor_frames,
                );
                set_distances(distance, &mut best, &mut second);
                if best == distance {
                    match_fp = fp;
                    match_gap = gap;
                }
            }
        } else {
            let keys: Vec<FpKey> = store
                .frame(tree_frame)
                .expect("tree frame present")
                .fp_keys()
                .collect();
            for key in keys {
                let fp = store.fp(key).expect("own key");
                let (valid, gap) = gate.check(qx, qy, fp.x, fp.y);
                if !valid {
                    continue;
                }
                let distance = fp_distance(store, key, query, descriptor_frames);
                set_distances(distance, &mut best, &mut second);
                if best == distance {
                    match_fp = Some(key);
                    match_gap = gap;
                }
            }
        }

        if let Some(matched) = match_fp {
            if valid_distance(cfg, best, second) {
                let landmark = store.create_floating_landmark(query, matched, cfg)?;
                let id = landmark.id;
                scratch.insert(id, landmark);
                accepted.push(id);
                total_gap += match_gap;
                total_pts += 1;
            }
        }
    }

    let avg_gap = total_gap / total_pts as f64;
    if avg_gap >= min_avg_gap {
        Ok(accepted)
    } else {
        tracing::debug!(
            ?tree_frame,
            avg_gap,
            min_avg_gap,
            "batch rejected for insufficient parallax"
        );
        for id in &accepted {
            scratch.remove(id);
        }
        Ok(Vec::new())
    }
}
