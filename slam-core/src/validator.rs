//! Validation of bundle-adjustment estimates.
//!
//! Starting from the fixed frames and fixed landmarks, per-edge inlier tests
//! classify each (feature point, landmark) connection; frames are then
//! classified in ascending rank order, each newly valid frame upgrading the
//! landmarks its inlier edges touch. The overall verdict combines the valid
//! frame ratio with the average per-frame inlier ratio.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::Vector3;

use slam_ba::BundleAdjustment;
use slam_geom::{behind_camera, pixel_gap, Pose};
use slam_types::SlamConfig;

use crate::store::{FeaturePoint, FpKey, FrameId, GraphStore, LandmarkId, LandmarkView};

/// Classification of a landmark, frame or edge after a validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidateResult {
    Unset,
    Invalid,
    Valid,
    Fixed,
}

/// Key-to-classification table with per-class reverse sets.
#[derive(Debug, Clone, Default)]
pub struct ResultTable<K: Ord + Copy> {
    results: BTreeMap<K, ValidateResult>,
    sets: BTreeMap<ValidateResult, BTreeSet<K>>,
}

impl<K: Ord + Copy> ResultTable<K> {
    pub fn new() -> Self {
        ResultTable {
            results: BTreeMap::new(),
            sets: BTreeMap::new(),
        }
    }

    pub fn put(&mut self, key: K, result: ValidateResult) {
        if let Some(prev) = self.results.insert(key, result) {
            if let Some(set) = self.sets.get_mut(&prev) {
                set.remove(&key);
            }
        }
        self.sets.entry(result).or_default().insert(key);
    }

    pub fn get(&self, key: K) -> Option<ValidateResult> {
        self.results.get(&key).copied()
    }

    pub fn contains(&self, key: K) -> bool {
        self.results.contains_key(&key)
    }

    pub fn keys_of(&self, result: ValidateResult) -> impl Iterator<Item = K> + '_ {
        self.sets
            .get(&result)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    pub fn count(&self, result: ValidateResult) -> usize {
        self.sets.get(&result).map(|s| s.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Rekey an entry, keeping its classification.
    pub fn replace(&mut self, orig: K, repl: K) {
        let result = match self.results.remove(&orig) {
            Some(r) => r,
            None => return,
        };
        if let Some(set) = self.sets.get_mut(&result) {
            set.remove(&orig);
        }
        self.put(repl, result);
    }
}

/// Outcome of one per-edge inlier test.
#[derive(Debug, Clone)]
pub struct FpValidResult {
    pub result: ValidateResult,
    pub too_far: bool,
    pub too_close: bool,
    pub behind: bool,
    pub within_range: bool,
    pub px: f64,
    pub py: f64,
}

impl Default for FpValidResult {
    fn default() -> Self {
        FpValidResult {
            result: ValidateResult::Unset,
            too_far: false,
            too_close: false,
            behind: false,
            within_range: true,
            px: 0.0,
            py: 0.0,
        }
    }
}

pub type FpLandmarkResult = BTreeMap<FpKey, BTreeMap<LandmarkId, FpValidResult>>;

#[derive(Debug, Clone)]
pub struct ValidatorOutput {
    pub landmark_trans: BTreeMap<LandmarkId, Vector3<f64>>,
    pub frame_poses: BTreeMap<FrameId, Pose>,
    pub landmark_result: ResultTable<LandmarkId>,
    pub frame_result: ResultTable<FrameId>,
    pub fp_result: FpLandmarkResult,
    pub avg_inlier_ratio: f64,
    pub valid_frame_ratio: f64,
    pub valid: bool,
}

/// Coordinates the reprojection tests work in: normalized when configured,
/// centered pixels otherwise.
pub(crate) fn working_coords(fp: &FeaturePoint, cfg: &SlamConfig) -> (f64, f64) {
    if cfg.normalize_kp {
        (fp.x / cfg.fx, fp.y / cfg.fy)
    } else {
        (fp.x, fp.y)
    }
}

/// Pixel ranges shrink by the focal length in normalized mode.
pub(crate) fn working_range(range: f64, cfg: &SlamConfig) -> f64 {
    if cfg.normalize_kp {
        range / cfg.fx
    } else {
        range
    }
}

pub(crate) struct ValidateParams {
    pub inlier_range: f64,
    pub good_landmark_ratio: f64,
    pub good_frame_ratio: f64,
    pub good_avg_inlier_ratio: f64,
    pub validate: bool,
}

fn frame_pose<'a>(
    frame_poses: &'a BTreeMap<FrameId, Pose>,
    store: &'a GraphStore,
    frame: FrameId,
) -> Option<&'a Pose> {
    frame_poses
        .get(&frame)
        .or_else(|| store.frame(frame).map(|f| &f.pose))
}

/// Per-edge inlier test: parallax gate, behind-camera test, reprojection
/// range.
#[allow(clippy::too_many_arguments)]
fn validate_fp_inlier(
    ba: &BundleAdjustment,
    store: &GraphStore,
    cfg: &SlamConfig,
    fp_key: FpKey,
    landmark_trans: &Vector3<f64>,
    inlier_range: f64,
    frame_set: &BTreeSet<FrameId>,
    frame_fixed: bool,
    landmark_fixed: bool,
    frame_poses: &BTreeMap<FrameId, Pose>,
) -> FpValidResult {
    let mut output = FpValidResult::default();

    // An edge between two fixed endpoints is not under evaluation.
    if frame_fixed && landmark_fixed {
        output.result = ValidateResult::Fixed;
        return output;
    }

    let pose = match frame_pose(frame_poses, store, fp_key.frame) {
        Some(p) => p.clone(),
        None => {
            output.result = ValidateResult::Invalid;
            return output;
        }
    };

    // Parallax gate: the landmark helps the estimate only when, relative to
    // its distance d, some evaluation frame lies within d/3 of this frame
    // and some frame lies farther than d/99.
    {
        let distance = (pose.trans - landmark_trans).norm();
        let close_bound = distance / 3.0;
        let far_bound = distance / 99.0;
        let mut too_close = true;
        let mut too_far = true;
        for other in frame_set {
            let other_pose = match frame_pose(frame_poses, store, *other) {
                Some(p) => p,
                None => continue,
            };
            let pose_distance = (other_pose.trans - pose.trans).norm();
            if too_close && pose_distance < close_bound {
                too_close = false;
            }
            if too_far && pose_distance > far_bound {
                too_far = false;
            }
            if !too_far && !too_close {
                break;
            }
        }
        if too_close {
            output.result = ValidateResult::Invalid;
            output.too_close = true;
            return output;
        }
        if too_far {
            output.result = ValidateResult::Invalid;
            output.too_far = true;
            return output;
        }
    }

    // The landmark must sit in front of the camera.
    {
        let (behind, _) = behind_camera(&pose, landmark_trans);
        if behind {
            output.result = ValidateResult::Invalid;
            output.behind = true;
            return output;
        }
    }

    // Reprojection within range of the observed feature point.
    {
        let (px, py) = ba.projection(&pose, landmark_trans);
        output.px = px;
        output.py = py;
        let fp = match store.fp(fp_key) {
            Some(fp) => fp,
            None => {
                output.result = ValidateResult::Invalid;
                return output;
            }
        };
        let (fx, fy) = working_coords(fp, cfg);
        let range = working_range(inlier_range, cfg);
        if pixel_gap(fx, fy, px, py) >= range {
            output.result = ValidateResult::Invalid;
            output.within_range = false;
            return output;
        }
    }

    output.result = ValidateResult::Valid;
    output
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn validate_estimates(
    ba: &BundleAdjustment,
    store: &GraphStore,
    view: LandmarkView<'_>,
    cfg: &SlamConfig,
    landmark_set: &BTreeSet<LandmarkId>,
    frame_set: &BTreeSet<FrameId>,
    fixed_landmarks: &BTreeSet<LandmarkId>,
    fixed_frames: &BTreeSet<FrameId>,
    frame_rank: &BTreeMap<FrameId, usize>,
    max_rank: usize,
    params: &ValidateParams,
    landmark_trans: BTreeMap<LandmarkId, Vector3<f64>>,
    frame_poses: BTreeMap<FrameId, Pose>,
) -> ValidatorOutput {
    let mut landmark_result = ResultTable::new();
    let mut frame_result = ResultTable::new();
    let mut fp_result: FpLandmarkResult = BTreeMap::new();
    let mut frame_pairs: BTreeMap<FrameId, Vec<(FpKey, LandmarkId)>> = BTreeMap::new();

    for id in landmark_set {
        let initial = if fixed_landmarks.contains(id) {
            ValidateResult::Fixed
        } else {
            ValidateResult::Unset
        };
        landmark_result.put(*id, initial);
        if let Some(landmark) = view.get(*id) {
            for fp in &landmark.fps {
                if !frame_set.contains(&fp.frame) {
                    continue;
                }
                fp_result
                    .entry(*fp)
                    .or_default()
                    .insert(*id, FpValidResult::default());
                frame_pairs.entry(fp.frame).or_default().push((*fp, *id));
            }
        }
    }
    for frame in frame_pairs.keys() {
        let initial = if fixed_frames.contains(frame) {
            ValidateResult::Fixed
        } else {
            ValidateResult::Unset
        };
        frame_result.put(*frame, initial);
    }

    let mut total_frame_inlier_ratios = 0.0f64;

    if params.validate {
        // Assess every edge under evaluation.
        let pairs: Vec<(FpKey, LandmarkId)> = fp_result
            .iter()
            .flat_map(|(fp, inner)| inner.keys().map(|l| (*fp, *l)))
            .collect();
        for (fp, landmark_id) in pairs {
            let frame_fixed = fixed_frames.contains(&fp.frame);
            let landmark_fixed = fixed_landmarks.contains(&landmark_id);
            let trans = match landmark_trans.get(&landmark_id) {
                Some(t) => *t,
                None => continue,
            };
            let assessment = validate_fp_inlier(
                ba,
                store,
                cfg,
                fp,
                &trans,
                params.inlier_range,
                frame_set,
                frame_fixed,
                landmark_fixed,
                &frame_poses,
            );
            // An edge judged valid against any fixed frame promotes its
            // landmark, overriding earlier invalid verdicts.
            if frame_fixed
                && matches!(
                    landmark_result.get(landmark_id),
                    Some(ValidateResult::Unset) | Some(ValidateResult::Invalid)
                )
                && assessment.result == ValidateResult::Valid
            {
                landmark_result.put(landmark_id, ValidateResult::Valid);
            }
            fp_result
                .get_mut(&fp)
                .expect("pair key")
                .insert(landmark_id, assessment);
        }

        // Fixed frames contribute their inlier ratio directly.
        let fixed_frame_ids: Vec<FrameId> =
            frame_result.keys_of(ValidateResult::Fixed).collect();
        for frame in fixed_frame_ids {
            let (mut inlier, mut outlier) = (0usize, 0usize);
            if let Some(pairs) = frame_pairs.get(&frame) {
                for (fp, landmark_id) in pairs {
                    if landmark_result.get(*landmark_id) == Some(ValidateResult::Fixed) {
                        continue;
                    }
                    match fp_result[fp][landmark_id].result {
                        ValidateResult::Valid => inlier += 1,
                        ValidateResult::Invalid => outlier += 1,
                        _ => {}
                    }
                }
            }
            let total = inlier + outlier;
            let ratio = if total > 0 {
                inlier as f64 / total as f64
            } else {
                0.0
            };
            tracing::trace!(?frame, inlier, outlier, "fixed frame inliers");
            total_frame_inlier_ratios += ratio;
        }

        // Classify remaining frames rank by rank, letting each newly valid
        // frame upgrade the landmarks of its inlier edges.
        for rank in 0..max_rank {
            let mut new_valid_frames = Vec::new();
            for (frame, frame_rank_val) in frame_rank {
                if *frame_rank_val != rank {
                    continue;
                }
                if frame_result.get(*frame) != Some(ValidateResult::Unset) {
                    continue;
                }
                let (mut inlier, mut outlier) = (0usize, 0usize);
                if let Some(pairs) = frame_pairs.get(frame) {
                    for (fp, landmark_id) in pairs {
                        match landmark_result.get(*landmark_id) {
                            Some(ValidateResult::Valid) | Some(ValidateResult::Fixed) => {}
                            _ => continue,
                        }
                        match fp_result[fp][landmark_id].result {
                            ValidateResult::Valid => inlier += 1,
                            ValidateResult::Invalid => outlier += 1,
                            _ => {}
                        }
                    }
                }
                let total = inlier + outlier;
                let ratio = if total > 0 {
                    inlier as f64 / total as f64
                } else {
                    0.0
                };
                tracing::trace!(?frame, inlier, outlier, rank, "frame inliers");
                if ratio >= params.good_landmark_ratio {
                    total_frame_inlier_ratios += ratio;
                    frame_result.put(*frame, ValidateResult::Valid);
                    new_valid_frames.push(*frame);
                } else {
                    frame_result.put(*frame, ValidateResult::Invalid);
                }
            }
            for frame in new_valid_frames {
                if let Some(pairs) = frame_pairs.get(&frame) {
                    for (fp, landmark_id) in pairs {
                        match fp_result[fp][landmark_id].result {
                            ValidateResult::Valid | ValidateResult::Fixed => {
                                landmark_result.put(*landmark_id, ValidateResult::Valid);
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
    }

    let unset: Vec<LandmarkId> = landmark_result.keys_of(ValidateResult::Unset).collect();
    for id in unset {
        landmark_result.put(id, ValidateResult::Invalid);
    }

    let valid_frames = frame_result.count(ValidateResult::Valid);
    let fixed_frame_count = frame_result.count(ValidateResult::Fixed);
    let avg_inlier_ratio =
        total_frame_inlier_ratios / (valid_frames + fixed_frame_count) as f64;
    let valid_frame_ratio = if frame_result.len() == fixed_frame_count {
        1.0
    } else {
        valid_frames as f64 / (frame_result.len() - fixed_frame_count) as f64
    };

    let valid = valid_frame_ratio >= params.good_frame_ratio
        && avg_inlier_ratio >= params.good_avg_inlier_ratio;
    tracing::debug!(
        avg_inlier_ratio,
        valid_frame_ratio,
        valid,
        "validation verdict"
    );

    ValidatorOutput {
        landmark_trans,
        frame_poses,
        landmark_result,
        frame_result,
        fp_result,
        avg_inlier_ratio,
        valid_frame_ratio,
        valid,
    }
}

/// Rewrite `orig` to `repl` throughout a validator output. Feature points of
/// the replacement landmark that carried no verdict yet get a fresh unset
/// entry.
pub(crate) fn replace_landmark(
    vo: &mut ValidatorOutput,
    store: &GraphStore,
    orig: LandmarkId,
    repl: LandmarkId,
) {
    if orig == repl {
        return;
    }
    vo.landmark_result.replace(orig, repl);

    for inner in vo.fp_result.values_mut() {
        if let Some(result) = inner.remove(&orig) {
            inner.insert(repl, result);
        }
    }

    if let Some(trans) = vo.landmark_trans.remove(&orig) {
        vo.landmark_trans.insert(repl, trans);
    }

    if let Some(landmark) = store.landmark(repl) {
        for fp in &landmark.fps {
            vo.fp_result
                .entry(*fp)
                .or_default()
                .entry(repl)
                .or_default();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_result_table_put_get_replace() {
        let mut table: ResultTable<u32> = ResultTable::new();
        table.put(1, ValidateResult::Unset);
        table.put(2, ValidateResult::Fixed);
        table.put(1, ValidateResult::Valid);
        assert_eq!(table.get(1), Some(ValidateResult::Valid));
        assert_eq!(table.count(ValidateResult::Unset), 0);
        assert_eq!(table.count(ValidateResult::Valid), 1);
        assert_eq!(table.len(), 2);

        table.replace(1, 7);
        assert_eq!(table.get(1), None);
        assert_eq!(table.get(7), Some(ValidateResult::Valid));
        let valid: Vec<u32> = table.keys_of(ValidateResult::Valid).collect();
        assert_eq!(valid, vec![7]);

        // Replacing an absent key is a no-op.
        table.replace(99, 100);
        assert_eq!(table.len(), 2);
    }
}
