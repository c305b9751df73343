//! Orchestration of one bundle-adjustment instance: graph population from a
//! landmark set, rank-weighted edges, optimization, estimate extraction
//! merged with warm-start hints, validation, and write-back of winning
//! estimates into the graph store.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::Vector3;

use slam_ba::{BundleAdjustment, PoseDof};
use slam_geom::{pixel_gap, Pose};
use slam_types::{BaOption, SlamConfig};

use crate::store::{FpKey, FrameId, GraphStore, LandmarkId, LandmarkView};
use crate::validator::{
    self, working_coords, ValidateParams, ValidateResult, ValidatorOutput,
};
use crate::{CoreError, Result};

/// Result of one estimate run, with everything validation needs to be
/// re-evaluated or replayed.
#[derive(Debug, Clone)]
pub struct BaRunOutput {
    pub landmark_set: BTreeSet<LandmarkId>,
    pub frame_set: BTreeSet<FrameId>,
    pub fixed_landmarks: BTreeSet<LandmarkId>,
    pub fixed_frames: BTreeSet<FrameId>,
    pub frame_rank: BTreeMap<FrameId, usize>,
    pub max_rank: usize,
    pub validator: ValidatorOutput,
}

/// Tunables of one estimate run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EstimateParams {
    pub iterations: usize,
    pub inlier_range: f64,
    pub good_landmark_ratio: f64,
    pub good_frame_ratio: f64,
    pub good_avg_inlier_ratio: f64,
    pub validate: bool,
}

pub struct BaRunner {
    cfg: SlamConfig,
    ba: Option<BundleAdjustment>,
    output: Option<BaRunOutput>,
}

/// Shortest-coverage rank of every frame: fixed frames are rank 0, fixed
/// landmarks count as covered, and each later rank admits the frames sharing
/// at least `threshold` covered landmarks. Returns the rank map and the
/// first empty rank.
pub(crate) fn generate_frame_rank(
    view: LandmarkView<'_>,
    landmark_set: &BTreeSet<LandmarkId>,
    frame_set: &BTreeSet<FrameId>,
    fixed_landmarks: &BTreeSet<LandmarkId>,
    fixed_frames: &BTreeSet<FrameId>,
    threshold: usize,
) -> Result<(BTreeMap<FrameId, usize>, usize)> {
    let mut frame_landmarks: BTreeMap<FrameId, BTreeSet<LandmarkId>> = BTreeMap::new();
    for id in landmark_set {
        let rec = view.get(*id).ok_or(CoreError::UnknownLandmark(*id))?;
        for fp in &rec.fps {
            if frame_set.contains(&fp.frame) {
                frame_landmarks.entry(fp.frame).or_default().insert(*id);
            }
        }
    }

    let mut rank_map: BTreeMap<FrameId, usize> = BTreeMap::new();
    let mut covered: BTreeSet<LandmarkId> = BTreeSet::new();
    for frame in fixed_frames {
        if frame_set.contains(frame) {
            rank_map.insert(*frame, 0);
            if let Some(ls) = frame_landmarks.get(frame) {
                covered.extend(ls.iter().copied());
            }
        }
    }
    for id in fixed_landmarks {
        if landmark_set.contains(id) {
            covered.insert(*id);
        }
    }

    let mut rank = 0usize;
    loop {
        rank += 1;
        let mut new_frames = Vec::new();
        for frame in frame_set {
            if rank_map.contains_key(frame) {
                continue;
            }
            let count = frame_landmarks
                .get(frame)
                .map(|ls| {
                    ls.iter()
                        .filter(|l| covered.contains(*l))
                        .take(threshold)
                        .count()
                })
                .unwrap_or(0);
            if count >= threshold {
                rank_map.insert(*frame, rank);
                new_frames.push(*frame);
            }
        }
        if new_frames.is_empty() {
            break;
        }
        for frame in new_frames {
            if let Some(ls) = frame_landmarks.get(&frame) {
                covered.extend(ls.iter().copied());
            }
        }
    }

    if rank_map.len() != frame_set.len() {
        return Err(CoreError::InvariantViolation(format!(
            "{} of {} frames unreachable from the fixed anchors",
            frame_set.len() - rank_map.len(),
            frame_set.len()
        )));
    }
    Ok((rank_map, rank))
}

/// Ordering between two validated runs: higher valid-frame ratio wins, ties
/// break on average inlier ratio, then on the number of valid landmarks.
pub(crate) fn is_better(challenger: &BaRunOutput, incumbent: &BaRunOutput) -> bool {
    let a = &incumbent.validator;
    let b = &challenger.validator;
    if a.valid_frame_ratio < b.valid_frame_ratio {
        return true;
    }
    if a.valid_frame_ratio > b.valid_frame_ratio {
        return false;
    }
    if a.avg_inlier_ratio < b.avg_inlier_ratio {
        return true;
    }
    if a.avg_inlier_ratio > b.avg_inlier_ratio {
        return false;
    }
    a.landmark_result.count(ValidateResult::Valid)
        < b.landmark_result.count(ValidateResult::Valid)
}

/// Rewrite a landmark id through an output's sets and validator structures.
pub(crate) fn replace_in_output(
    output: &mut BaRunOutput,
    store: &GraphStore,
    orig: LandmarkId,
    repl: LandmarkId,
) {
    if orig == repl {
        return;
    }
    if output.fixed_landmarks.remove(&orig) {
        output.fixed_landmarks.insert(repl);
    }
    if output.landmark_set.remove(&orig) {
        output.landmark_set.insert(repl);
        validator::replace_landmark(&mut output.validator, store, orig, repl);
    }
}

impl BaRunner {
    pub fn new(cfg: &SlamConfig) -> Self {
        BaRunner {
            cfg: cfg.clone(),
            ba: None,
            output: None,
        }
    }

    /// A runner keyed to a specific focal length (focal-length search).
    pub fn with_focal(cfg: &SlamConfig, focal: f64) -> Self {
        let mut cfg = cfg.clone();
        cfg.fx = focal;
        cfg.fy = focal;
        BaRunner::new(&cfg)
    }

    pub fn output(&self) -> Option<&BaRunOutput> {
        self.output.as_ref()
    }

    fn make_ba(&self, iterations: usize) -> BundleAdjustment {
        let dof = match self.cfg.ba_option {
            BaOption::ThreeDof => PoseDof::Three,
            BaOption::SixDof => PoseDof::Six,
        };
        BundleAdjustment::new(self.cfg.ba_focal(), iterations, self.cfg.max_depth, dof)
    }

    /// Estimate the unfixed frames and landmarks of `landmark_set`, then
    /// validate. Hints (previous estimates) take precedence over stored
    /// state as initial values and pass through for entities outside the
    /// current subgraph.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn estimate(
        &mut self,
        store: &GraphStore,
        view: LandmarkView<'_>,
        landmark_set: &BTreeSet<LandmarkId>,
        frame_set_arg: &BTreeSet<FrameId>,
        fixed_landmarks: Option<&BTreeSet<LandmarkId>>,
        fixed_frames: Option<&BTreeSet<FrameId>>,
        params: EstimateParams,
        landmark_hints: Option<&BTreeMap<LandmarkId, Vector3<f64>>>,
        pose_hints: Option<&BTreeMap<FrameId, Pose>>,
    ) -> Result<BaRunOutput> {
        let empty_landmarks = BTreeSet::new();
        let empty_frames = BTreeSet::new();
        let fixed_landmarks = fixed_landmarks.unwrap_or(&empty_landmarks);
        let fixed_frames = fixed_frames.unwrap_or(&empty_frames);

        // Restrict the frame set to frames actually observing the landmarks.
        let mut frame_set: BTreeSet<FrameId> = BTreeSet::new();
        for id in landmark_set {
            let rec = view.get(*id).ok_or(CoreError::UnknownLandmark(*id))?;
            for fp in &rec.fps {
                if frame_set_arg.contains(&fp.frame) {
                    frame_set.insert(fp.frame);
                }
            }
        }

        let prev = self.output.as_ref().map(|o| &o.validator);
        let landmark_hints = landmark_hints.or(prev.map(|v| &v.landmark_trans));
        let pose_hints = pose_hints.or(prev.map(|v| &v.frame_poses));

        let mut ba = self.make_ba(params.iterations);
        let threshold = landmark_set.len().min(10);
        let (frame_rank, max_rank) = generate_frame_rank(
            view,
            landmark_set,
            &frame_set,
            fixed_landmarks,
            fixed_frames,
            threshold,
        )?;

        self.configure_graph(
            &mut ba,
            store,
            view,
            landmark_set,
            &frame_set,
            fixed_landmarks,
            fixed_frames,
            &frame_rank,
            max_rank,
            landmark_hints,
            pose_hints,
        )?;

        ba.optimize(Some(params.iterations));

        let (pose_raw, point_raw) = ba.estimates();
        let mut frame_poses: BTreeMap<FrameId, Pose> = pose_raw
            .into_iter()
            .map(|(id, pose)| (FrameId(id), pose))
            .collect();
        let mut landmark_trans: BTreeMap<LandmarkId, Vector3<f64>> = point_raw
            .into_iter()
            .map(|(id, trans)| (LandmarkId(id), trans))
            .collect();
        if let Some(hints) = landmark_hints {
            for (id, trans) in hints {
                landmark_trans.entry(*id).or_insert(*trans);
            }
        }
        if let Some(hints) = pose_hints {
            for (id, pose) in hints {
                frame_poses.entry(*id).or_insert_with(|| pose.clone());
            }
        }

        let validator_output = validator::validate_estimates(
            &ba,
            store,
            view,
            &self.cfg,
            landmark_set,
            &frame_set,
            fixed_landmarks,
            fixed_frames,
            &frame_rank,
            max_rank,
            &ValidateParams {
                inlier_range: params.inlier_range,
                good_landmark_ratio: params.good_landmark_ratio,
                good_frame_ratio: params.good_frame_ratio,
                good_avg_inlier_ratio: params.good_avg_inlier_ratio,
                validate: params.validate,
            },
            landmark_trans,
            frame_poses,
        );

        let output = BaRunOutput {
            landmark_set: landmark_set.clone(),
            frame_set,
            fixed_landmarks: fixed_landmarks.clone(),
            fixed_frames: fixed_frames.clone(),
            frame_rank,
            max_rank,
            validator: validator_output,
        };
        self.ba = Some(ba);
        self.output = Some(output.clone());
        Ok(output)
    }

    #[allow(clippy::too_many_arguments)]
    fn configure_graph(
        &self,
        ba: &mut BundleAdjustment,
        store: &GraphStore,
        view: LandmarkView<'_>,
        landmark_set: &BTreeSet<LandmarkId>,
        frame_set: &BTreeSet<FrameId>,
        fixed_landmarks: &BTreeSet<LandmarkId>,
        fixed_frames: &BTreeSet<FrameId>,
        frame_rank: &BTreeMap<FrameId, usize>,
        max_rank: usize,
        landmark_hints: Option<&BTreeMap<LandmarkId, Vector3<f64>>>,
        pose_hints: Option<&BTreeMap<FrameId, Pose>>,
    ) -> Result<()> {
        let mut landmarks_to_add: BTreeSet<LandmarkId> = BTreeSet::new();
        let mut frames_to_add: BTreeSet<FrameId> = BTreeSet::new();
        let mut edges_to_add: BTreeSet<(FpKey, LandmarkId)> = BTreeSet::new();

        for id in landmark_set {
            let rec = view.get(*id).ok_or(CoreError::UnknownLandmark(*id))?;
            let fp_count = rec
                .fps
                .iter()
                .filter(|fp| frame_set.contains(&fp.frame))
                .count();
            if fp_count < 2 {
                return Err(CoreError::InvariantViolation(format!(
                    "landmark {id:?} observed by {fp_count} frames of the subgraph"
                )));
            }
            if !fixed_landmarks.contains(id) {
                landmarks_to_add.insert(*id);
                for fp in &rec.fps {
                    if !frame_set.contains(&fp.frame) {
                        continue;
                    }
                    frames_to_add.insert(fp.frame);
                    edges_to_add.insert((*fp, *id));
                }
            } else {
                // A fixed landmark matters only through its unfixed frames;
                // fixed-to-fixed edges constrain nothing.
                for fp in &rec.fps {
                    if !frame_set.contains(&fp.frame) || fixed_frames.contains(&fp.frame) {
                        continue;
                    }
                    landmarks_to_add.insert(*id);
                    frames_to_add.insert(fp.frame);
                    edges_to_add.insert((*fp, *id));
                }
            }
        }

        for frame in &frames_to_add {
            let stored = store.frame(*frame).ok_or(CoreError::UnknownFrame(*frame))?;
            let pose = pose_hints
                .and_then(|h| h.get(frame))
                .unwrap_or(&stored.pose);
            ba.add_pose(frame.0, pose, fixed_frames.contains(frame))?;
        }
        for id in &landmarks_to_add {
            let rec = view.get(*id).ok_or(CoreError::UnknownLandmark(*id))?;
            let trans = landmark_hints
                .and_then(|h| h.get(id))
                .copied()
                .unwrap_or(rec.trans);
            ba.add_point(id.0, trans, fixed_landmarks.contains(id))?;
        }
        for (fp, id) in &edges_to_add {
            let point = store.fp(*fp).ok_or(CoreError::UnknownFeaturePoint(*fp))?;
            let (u, v) = working_coords(point, &self.cfg);
            let rank = frame_rank.get(&fp.frame).copied().unwrap_or(0);
            let weight = ((max_rank - rank) * 100) as f64;
            ba.add_edge(id.0, fp.frame.0, u, v, weight)?;
        }
        Ok(())
    }

    /// Write winning estimates back into the store: valid landmarks and
    /// frames take their estimated positions (optionally scaled), and with
    /// `delete_bad_fps` the outlier feature points of valid landmarks are
    /// detached.
    pub(crate) fn copy_estimates(
        &self,
        store: &mut GraphStore,
        delete_bad_fps: bool,
        scale: f64,
    ) {
        let output = match &self.output {
            Some(o) => o,
            None => return,
        };
        let vo = &output.validator;

        for (id, trans) in &vo.landmark_trans {
            if !output.landmark_set.contains(id) {
                continue;
            }
            let result = match vo.landmark_result.get(*id) {
                Some(r) => r,
                None => continue,
            };
            if result != ValidateResult::Valid {
                continue;
            }
            if delete_bad_fps {
                let mut to_detach: Vec<FpKey> = Vec::new();
                if let Some(rec) = store.landmark(*id) {
                    for fp in &rec.fps {
                        if !output.frame_set.contains(&fp.frame) {
                            continue;
                        }
                        let fp_verdict = vo
                            .fp_result
                            .get(fp)
                            .and_then(|inner| inner.get(id))
                            .map(|r| r.result);
                        match fp_verdict {
                            None | Some(ValidateResult::Fixed) => {}
                            Some(ValidateResult::Valid) => {}
                            _ => to_detach.push(*fp),
                        }
                    }
                }
                for fp in to_detach {
                    store.unlink(*id, fp);
                }
            }
            if let Some(rec) = store.landmark_mut(*id) {
                rec.trans = trans * scale;
                rec.valid = true;
            }
        }

        for (frame, pose) in &vo.frame_poses {
            if !output.frame_set.contains(frame) {
                continue;
            }
            if vo.frame_result.get(*frame) != Some(ValidateResult::Valid) {
                continue;
            }
            if let Some(rec) = store.frame_mut(*frame) {
                rec.pose.trans = pose.trans * scale;
                if self.cfg.copy_rotation {
                    rec.pose.rot = pose.rot;
                }
            }
        }
    }

    /// Total reprojection error of the last run, the focal-search metric.
    pub(crate) fn total_error(&self, store: &GraphStore, view: LandmarkView<'_>) -> f64 {
        let (output, ba) = match (&self.output, &self.ba) {
            (Some(o), Some(b)) => (o, b),
            _ => return -1.0,
        };
        let vo = &output.validator;
        let mut error = 0.0;
        for id in &output.landmark_set {
            let trans = match vo.landmark_trans.get(id) {
                Some(t) => t,
                None => continue,
            };
            let rec = match view.get(*id) {
                Some(r) => r,
                None => continue,
            };
            for fp in &rec.fps {
                if !output.frame_set.contains(&fp.frame) {
                    continue;
                }
                let pose = match vo
                    .frame_poses
                    .get(&fp.frame)
                    .or_else(|| store.frame(fp.frame).map(|f| &f.pose))
                {
                    Some(p) => p,
                    None => continue,
                };
                let (px, py) = ba.projection(pose, trans);
                let point = match store.fp(*fp) {
                    Some(p) => p,
                    None => continue,
                };
                let (x, y) = working_coords(point, &self.cfg);
                error += pixel_gap(x, y, px, py);
            }
        }
        error
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::test::test_frame;
    use approx::assert_relative_eq;
    use slam_geom::PinholeModel;

    fn key(frame: i64, index: u32) -> FpKey {
        FpKey {
            frame: FrameId(frame),
            index,
        }
    }

    /// Two fixed frames observing a grid of points, plus one free frame. All
    /// feature-point coordinates are exact projections of the true geometry.
    fn build_scene() -> (GraphStore, SlamConfig, Vec<LandmarkId>, Vec<Vector3<f64>>) {
        let mut cfg = SlamConfig::default();
        cfg.fx = 275.0;
        cfg.fy = 275.0;
        let cam = PinholeModel::centered(cfg.fx);
        let poses = [
            Pose::identity(),
            Pose::new(Vector3::new(1.0, 0.0, 0.0), nalgebra::UnitQuaternion::identity()),
            Pose::new(Vector3::new(2.0, 0.0, 0.0), nalgebra::UnitQuaternion::identity()),
        ];
        let points: Vec<Vector3<f64>> = (0..12)
            .map(|i| {
                Vector3::new(
                    (i % 4) as f64 * 0.8 - 0.4,
                    (i / 4) as f64 * 0.6 - 0.6,
                    3.0 + (i % 3) as f64,
                )
            })
            .collect();

        let mut store = GraphStore::new();
        for (fi, pose) in poses.iter().enumerate() {
            let mut frame = test_frame(fi as i64, points.len());
            frame.pose = pose.clone();
            for (pi, p) in points.iter().enumerate() {
                let px = cam.project(pose, p).expect("in front");
                frame.fps[pi].x = px.x;
                frame.fps[pi].y = px.y;
                frame.fps[pi].desc.0[0] = pi as u8;
            }
            store.insert_frame(frame);
        }

        let mut ids = Vec::new();
        for (pi, p) in points.iter().enumerate() {
            let id = store.create_landmark(key(0, pi as u32), 0.0, &cfg).unwrap();
            store.link(id, key(1, pi as u32), 0.0).unwrap();
            store.link(id, key(2, pi as u32), 0.0).unwrap();
            // Perturbed initial position; the true one is returned for
            // assertions.
            store.landmark_mut(id).unwrap().trans = p + Vector3::new(0.05, -0.04, 0.3);
            ids.push(id);
        }
        (store, cfg, ids, points)
    }

    #[test]
    fn test_frame_rank_generation() {
        let (store, _cfg, ids, _) = build_scene();
        let view = LandmarkView::new(&store, None);
        let landmark_set: BTreeSet<LandmarkId> = ids.iter().copied().collect();
        let frame_set: BTreeSet<FrameId> =
            [FrameId(0), FrameId(1), FrameId(2)].into_iter().collect();
        let fixed_frames: BTreeSet<FrameId> = [FrameId(0)].into_iter().collect();
        let (ranks, max_rank) = generate_frame_rank(
            view,
            &landmark_set,
            &frame_set,
            &BTreeSet::new(),
            &fixed_frames,
            10,
        )
        .unwrap();
        assert_eq!(ranks[&FrameId(0)], 0);
        assert_eq!(ranks[&FrameId(1)], 1);
        assert_eq!(ranks[&FrameId(2)], 1);
        assert_eq!(max_rank, 2);
    }

    #[test]
    fn test_estimate_recovers_free_frame() {
        let (mut store, cfg, ids, points) = build_scene();
        // Perturb the free frame's stored pose; the estimate must pull it
        // back to the true position.
        let truth = store.frame(FrameId(2)).unwrap().pose.clone();
        store.frame_mut(FrameId(2)).unwrap().pose.trans += Vector3::new(0.15, -0.1, 0.1);

        let landmark_set: BTreeSet<LandmarkId> = ids.iter().copied().collect();
        let frame_set: BTreeSet<FrameId> =
            [FrameId(0), FrameId(1), FrameId(2)].into_iter().collect();
        let fixed_frames: BTreeSet<FrameId> = [FrameId(0), FrameId(1)].into_iter().collect();

        let mut runner = BaRunner::new(&cfg);
        let view = LandmarkView::new(&store, None);
        let output = runner
            .estimate(
                &store,
                view,
                &landmark_set,
                &frame_set,
                None,
                Some(&fixed_frames),
                EstimateParams {
                    iterations: 30,
                    inlier_range: 5.0,
                    good_landmark_ratio: 0.5,
                    good_frame_ratio: 0.5,
                    good_avg_inlier_ratio: 0.5,
                    validate: true,
                },
                None,
                None,
            )
            .unwrap();

        assert!(output.validator.valid);
        assert_eq!(
            output.validator.frame_result.get(FrameId(2)),
            Some(ValidateResult::Valid)
        );
        let est = &output.validator.frame_poses[&FrameId(2)];
        assert_relative_eq!(est.trans, truth.trans, epsilon = 1e-3);

        // Committing writes the estimates back into the store.
        runner.copy_estimates(&mut store, true, 1.0);
        let frame = store.frame(FrameId(2)).unwrap();
        assert_relative_eq!(frame.pose.trans, truth.trans, epsilon = 1e-3);
        for (id, truth_point) in ids.iter().zip(points.iter()) {
            let rec = store.landmark(*id).unwrap();
            assert!(rec.valid);
            assert_relative_eq!(rec.trans, *truth_point, epsilon = 1e-2);
        }
        store.check_invariants().unwrap();
    }

    #[test]
    fn test_is_better_ordering() {
        let (store, cfg, ids, _) = build_scene();
        let landmark_set: BTreeSet<LandmarkId> = ids.iter().copied().collect();
        let frame_set: BTreeSet<FrameId> =
            [FrameId(0), FrameId(1), FrameId(2)].into_iter().collect();
        let fixed_frames: BTreeSet<FrameId> = [FrameId(0), FrameId(1)].into_iter().collect();
        let mut runner = BaRunner::new(&cfg);
        let view = LandmarkView::new(&store, None);
        let params = EstimateParams {
            iterations: 10,
            inlier_range: 5.0,
            good_landmark_ratio: 0.5,
            good_frame_ratio: 0.5,
            good_avg_inlier_ratio: 0.5,
            validate: true,
        };
        let good = runner
            .estimate(
                &store,
                view,
                &landmark_set,
                &frame_set,
                None,
                Some(&fixed_frames),
                params,
                None,
                None,
            )
            .unwrap();
        let mut worse = good.clone();
        worse.validator.valid_frame_ratio = 0.0;
        assert!(is_better(&good, &worse));
        assert!(!is_better(&worse, &good));
        // Equal ratios fall through to the valid landmark count.
        let mut tied = good.clone();
        let mut stripped = crate::validator::ResultTable::new();
        for id in &tied.landmark_set {
            stripped.put(*id, ValidateResult::Invalid);
        }
        tied.validator.landmark_result = stripped;
        assert!(!is_better(&tied, &good));
    }
}
