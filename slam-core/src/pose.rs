//! Per-frame pose pipeline: reference-frame selection, feature association,
//! RANSAC over partial bundle adjustments, winner selection, full refinement
//! and commit into the persistent map.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use rand::Rng;

use slam_geom::angular_difference_deg;
use slam_types::ProcessStatus;

use crate::ba_runner::{is_better, replace_in_output, BaRunOutput, BaRunner, EstimateParams};
use crate::matcher;
use crate::slam::Slam;
use crate::store::{FrameId, LandmarkId, LandmarkTable, LandmarkView};
use crate::validator::ValidateResult;
use crate::Result;

/// Ranking entry for reference-frame selection.
struct FrameSort {
    frame: FrameId,
    deg_diff: f64,
    dist_ratio: f64,
    dist: f64,
}

impl Slam {
    fn compute_diff(&self, curr: FrameId, other: FrameId) -> Option<(f64, f64, f64)> {
        let a = self.store.frame(curr)?;
        let b = self.store.frame(other)?;
        let dist = (a.pose.trans - b.pose.trans).norm();
        let dist_ratio = dist / b.landmark_dist_threshold;
        let deg_diff = angular_difference_deg(&a.pose.rot, &b.pose.rot);
        Some((deg_diff, dist_ratio, dist))
    }

    /// Rank candidate reference frames by angular difference, distance ratio
    /// and distance against the current pose prior.
    fn generate_frame_ranks(
        &self,
        curr: FrameId,
        candidates: &BTreeSet<FrameId>,
        mult: f64,
    ) -> Vec<FrameSort> {
        let mut ranks: Vec<FrameSort> = Vec::new();
        for frame in candidates {
            let valid = self.store.frame(*frame).map(|f| f.valid).unwrap_or(false);
            if !valid {
                continue;
            }
            let (deg_diff, dist_ratio, dist) = match self.compute_diff(curr, *frame) {
                Some(d) => d,
                None => continue,
            };
            if deg_diff < self.cfg.max_angle * mult && dist_ratio < self.cfg.max_dist_ratio * mult
            {
                ranks.push(FrameSort {
                    frame: *frame,
                    deg_diff,
                    dist_ratio,
                    dist,
                });
            }
        }
        ranks.sort_by(|a, b| {
            use std::cmp::Ordering;
            if (a.deg_diff - b.deg_diff).abs() < 15.0 {
                // Pointing the same way: prefer the more distant frame for
                // better triangulation.
                b.dist.partial_cmp(&a.dist).unwrap_or(Ordering::Equal)
            } else if a.dist_ratio > 0.1 && b.dist_ratio <= 0.1 {
                Ordering::Greater
            } else if a.dist_ratio <= 0.1 && b.dist_ratio > 0.1 {
                Ordering::Less
            } else {
                // Large angular difference: prefer closer frames for more
                // viewport overlap.
                a.dist.partial_cmp(&b.dist).unwrap_or(Ordering::Equal)
            }
        });
        ranks
    }

    /// Stage B: assemble reference frames from the keyframe set, diversified
    /// by median draws, topped up from recent frames, relaxing the bounds if
    /// necessary.
    fn get_match_frames(&self, curr: FrameId) -> BTreeSet<FrameId> {
        let mut match_frames = BTreeSet::new();
        if !self.initialized {
            if let Some(origin) = self.origin {
                match_frames.insert(origin);
            }
            return match_frames;
        }
        let num = self.cfg.num_key_frame_matches;
        let prev_set: BTreeSet<FrameId> = self
            .frame_order
            .iter()
            .filter(|id| **id != curr && !self.keyframes.contains(*id))
            .copied()
            .collect();

        let mut kf_ranks = self.generate_frame_ranks(curr, &self.keyframes, 1.0);
        if !kf_ranks.is_empty() {
            match_frames.insert(kf_ranks.remove(0).frame);
        }
        let mut i = 0;
        while match_frames.len() < num && i < kf_ranks.len() {
            let median = kf_ranks.len() / 2;
            match_frames.insert(kf_ranks.remove(median).frame);
            i += 1;
        }

        if match_frames.len() < num {
            let prev_ranks = self.generate_frame_ranks(curr, &prev_set, 1.0);
            for rank in &prev_ranks {
                if match_frames.len() >= num {
                    break;
                }
                match_frames.insert(rank.frame);
            }
            if match_frames.len() < num {
                let relaxed = self.generate_frame_ranks(curr, &self.keyframes, 2.0);
                for rank in &relaxed {
                    if match_frames.len() >= num {
                        break;
                    }
                    match_frames.insert(rank.frame);
                }
                if match_frames.len() < num {
                    let relaxed = self.generate_frame_ranks(curr, &prev_set, 2.0);
                    for rank in &relaxed {
                        if match_frames.len() >= num {
                            break;
                        }
                        match_frames.insert(rank.frame);
                    }
                }
            }
        }
        match_frames
    }

    /// Stage G helper: merge validated floating landmarks into the
    /// persistent store, recording every landmark substitution so earlier
    /// results can be rewritten.
    fn add_to_landmarks(
        &mut self,
        good_landmarks: &[LandmarkId],
        scratch: &LandmarkTable,
        replacements: &mut Vec<(LandmarkId, LandmarkId)>,
    ) -> Result<()> {
        for good_id in good_landmarks {
            let record = match scratch
                .get(good_id)
                .cloned()
                .or_else(|| self.store.landmark(*good_id).cloned())
            {
                Some(r) => r,
                None => continue,
            };
            let mut target: Option<LandmarkId> = None;
            for fp in &record.fps {
                let existing = self.store.fp(*fp).and_then(|p| p.landmark);
                match target {
                    None => {
                        target = Some(match existing {
                            Some(id) => id,
                            None => self.store.create_landmark(*fp, 0.0, &self.cfg)?,
                        });
                    }
                    Some(t) => match existing {
                        None => self.store.link(t, *fp, 0.0)?,
                        Some(e) if e != t => {
                            tracing::debug!(?e, ?t, "merging landmarks");
                            self.store.merge(t, e)?;
                            replacements.push((e, t));
                        }
                        Some(_) => {}
                    },
                }
            }
            if let Some(t) = target {
                self.store.dedupe(t)?;
                if *good_id != t {
                    replacements.push((*good_id, t));
                }
                if let Some(rec) = self.store.landmark_mut(t) {
                    if !rec.valid {
                        rec.trans = record.trans;
                    }
                }
            }
        }
        Ok(())
    }

    /// Stage A through G for one new frame. The returned status is the
    /// surface contract: everything below an invariant violation is
    /// recoverable and the caller may keep feeding frames.
    pub(crate) fn add_frame_pipeline(&mut self, curr: FrameId) -> Result<ProcessStatus> {
        // Stage A: the very first frame anchors the map.
        if self.frame_order.len() == 1 {
            self.add_keyframe(curr);
            if let Some(frame) = self.store.frame_mut(curr) {
                frame.level = Some(0);
                frame.valid = true;
            }
            let origin_trans = self.set_origin_frame(curr);
            self.store.shift_landmarks(&origin_trans);
            return Ok(ProcessStatus::Default);
        }

        // Stage B: reference selection.
        let mut match_frames = self.get_match_frames(curr);
        if match_frames.is_empty() {
            tracing::info!(?curr, "not enough reference frames");
            return Ok(ProcessStatus::NotEnoughMatchFrames);
        }

        let ransac_match_size = match_frames.len().max(6);
        let ransac_iters = if self.initialized { 12 } else { 18 };
        let total_matches = ransac_match_size * ransac_iters;
        let max_matches_per_frame = total_matches / match_frames.len();
        let per_iter = max_matches_per_frame / ransac_iters;

        let mut descriptor_frames: BTreeSet<FrameId> = BTreeSet::new();
        descriptor_frames.insert(curr);
        descriptor_frames.extend(match_frames.iter().copied());
        descriptor_frames.extend(self.keyframes.iter().copied());

        // Stage C: association per reference frame.
        let min_avg_gap = if self.initialized {
            self.cfg.min_avg_gap
        } else {
            self.cfg.min_avg_gap_init
        };
        let query: Vec<_> = self
            .store
            .frame(curr)
            .map(|f| f.fp_keys().collect())
            .unwrap_or_default();
        let mut scratch = LandmarkTable::new();
        let mut frame_matches: BTreeMap<FrameId, Vec<LandmarkId>> = BTreeMap::new();
        let mut bad_frames = Vec::new();
        for frame in match_frames.clone() {
            let ids = matcher::match_features(
                &mut self.store,
                &self.cfg,
                frame,
                &query,
                &descriptor_frames,
                max_matches_per_frame,
                min_avg_gap,
                &mut scratch,
                &mut self.rng,
            )?;
            if ids.len() > 3 {
                let mut padded = ids.clone();
                while padded.len() < max_matches_per_frame {
                    padded.push(ids[self.rng.gen_range(0..ids.len())]);
                }
                frame_matches.insert(frame, padded);
            } else {
                tracing::debug!(?curr, ?frame, "not enough matches from reference frame");
                bad_frames.push(frame);
            }
        }
        for frame in bad_frames {
            match_frames.remove(&frame);
        }
        // Once the map exists, scale requires at least two reference frames.
        if self.initialized && match_frames.len() < 2 {
            return Ok(ProcessStatus::NotEnoughMatchFrames);
        }
        if frame_matches.is_empty() {
            return Ok(ProcessStatus::MatchInvalid);
        }

        let mut frame_set: BTreeSet<FrameId> = match_frames.clone();
        frame_set.insert(curr);
        for frame in match_frames.clone() {
            self.add_keyframe(frame);
        }

        // Stage D: partial bundle adjustments over disjoint random subsets.
        let mut ransac_results: Vec<BaRunOutput> = Vec::new();
        for i in 0..ransac_iters / 2 {
            let mut subset: BTreeSet<LandmarkId> = BTreeSet::new();
            for frame in &match_frames {
                let matches = &frame_matches[frame];
                for j in 0..per_iter {
                    subset.insert(matches[i * per_iter + j]);
                }
            }
            let mut runner = BaRunner::new(&self.cfg);
            let output = runner.estimate(
                &self.store,
                LandmarkView::new(&self.store, Some(&scratch)),
                &subset,
                &frame_set,
                None,
                Some(&match_frames),
                EstimateParams {
                    iterations: 9,
                    inlier_range: 3.0 * self.cfg.img_width_ratio,
                    good_landmark_ratio: 0.5,
                    good_frame_ratio: 1.0,
                    good_avg_inlier_ratio: 0.7,
                    validate: false,
                },
                None,
                None,
            )?;
            ransac_results.push(output);
        }

        // Stage E: winner selection on a small evaluation set.
        let mut eval_set: BTreeSet<LandmarkId> = BTreeSet::new();
        for matches in frame_matches.values() {
            let mut pool: Vec<LandmarkId> = matches.iter().copied().unique().collect();
            for _ in 0..pool.len().min(3) {
                let pick = pool.swap_remove(self.rng.gen_range(0..pool.len()));
                eval_set.insert(pick);
            }
        }
        tracing::debug!(size = eval_set.len(), "evaluation set prepared");

        let mut best: Option<BaRunOutput> = None;
        for ransac_output in &ransac_results {
            let mut runner = BaRunner::new(&self.cfg);
            let output = runner.estimate(
                &self.store,
                LandmarkView::new(&self.store, Some(&scratch)),
                &eval_set,
                &frame_set,
                Some(&ransac_output.landmark_set),
                Some(&frame_set),
                EstimateParams {
                    iterations: 3,
                    inlier_range: 3.0 * self.cfg.img_width_ratio,
                    good_landmark_ratio: 0.5,
                    good_frame_ratio: 0.0,
                    good_avg_inlier_ratio: 0.7,
                    validate: true,
                },
                Some(&ransac_output.validator.landmark_trans),
                Some(&ransac_output.validator.frame_poses),
            )?;
            match &best {
                Some(incumbent) if !is_better(&output, incumbent) => {}
                _ => best = Some(output),
            }
        }
        let best = match best {
            Some(b) => b,
            None => return Ok(ProcessStatus::MatchInvalid),
        };

        // Stage F: full refinement over every accumulated correspondence.
        let all_set: BTreeSet<LandmarkId> =
            frame_matches.values().flatten().copied().collect();
        let mut full_runner = BaRunner::new(&self.cfg);
        let mut full = full_runner.estimate(
            &self.store,
            LandmarkView::new(&self.store, Some(&scratch)),
            &all_set,
            &frame_set,
            None,
            Some(&frame_set),
            EstimateParams {
                iterations: 9,
                inlier_range: 10.0 * self.cfg.img_width_ratio,
                good_landmark_ratio: 0.6,
                good_frame_ratio: 0.0,
                good_avg_inlier_ratio: 0.5,
                validate: true,
            },
            Some(&best.validator.landmark_trans),
            Some(&best.validator.frame_poses),
        )?;

        if !full.validator.valid {
            tracing::info!(?curr, "refinement failed validation");
            return Ok(ProcessStatus::MatchInvalid);
        }

        // Stage G: commit inliers and run the final estimate against the
        // keyframe map.
        let mut replacements: Vec<(LandmarkId, LandmarkId)> = Vec::new();
        let valid_ids: Vec<LandmarkId> = full
            .validator
            .landmark_result
            .keys_of(ValidateResult::Valid)
            .collect();
        let fixed_ids: Vec<LandmarkId> = full
            .validator
            .landmark_result
            .keys_of(ValidateResult::Fixed)
            .collect();
        self.add_to_landmarks(&valid_ids, &scratch, &mut replacements)?;
        self.add_to_landmarks(&fixed_ids, &scratch, &mut replacements)?;
        for (orig, repl) in &replacements {
            replace_in_output(&mut full, &self.store, *orig, *repl);
        }

        let mut landmark_set: BTreeSet<LandmarkId> = BTreeSet::new();
        if let Some(frame) = self.store.frame(curr) {
            for key in frame.fp_keys() {
                let landmark = match self.store.fp(key).and_then(|fp| fp.landmark) {
                    Some(l) => l,
                    None => continue,
                };
                if let Some(rec) = self.store.landmark(landmark) {
                    let count = rec
                        .fps
                        .iter()
                        .filter(|fp| frame_set.contains(&fp.frame))
                        .count();
                    if count >= 2 {
                        landmark_set.insert(landmark);
                    }
                }
            }
        }
        let mut new_frame_set = frame_set.clone();
        new_frame_set.extend(self.keyframes.iter().copied());
        let keyframes_now = self.keyframes.clone();

        let mut final_runner = BaRunner::new(&self.cfg);
        let final_output = final_runner.estimate(
            &self.store,
            LandmarkView::new(&self.store, None),
            &landmark_set,
            &new_frame_set,
            None,
            Some(&keyframes_now),
            EstimateParams {
                iterations: 18,
                inlier_range: 10.0 * self.cfg.img_width_ratio,
                good_landmark_ratio: 0.6,
                good_frame_ratio: 1.0,
                good_avg_inlier_ratio: 0.7,
                validate: true,
            },
            Some(&full.validator.landmark_trans),
            Some(&full.validator.frame_poses),
        )?;

        if !final_output.validator.valid {
            tracing::info!(?curr, "final estimation failed validation");
            return Ok(ProcessStatus::MatchInvalid);
        }

        final_runner.copy_estimates(&mut self.store, true, 1.0);
        self.populate_landmark_dist_threshold(&new_frame_set);
        if let Some(frame) = self.store.frame_mut(curr) {
            frame.valid = true;
        }
        if !self.initialized {
            self.add_keyframe(curr);
            if let Some(frame) = self.store.frame_mut(curr) {
                frame.level = Some(0);
            }
            self.initialized = true;
            self.right_scale(self.cfg.scale);
            self.populate_landmark_dist_threshold(&new_frame_set);
            if self.cfg.find_focus {
                if let Some(focus) = self.find_focus(200.0, 500.0, 5) {
                    tracing::info!(focus, "selected focal length");
                    self.cfg.fx = focus;
                    self.cfg.fy = focus;
                }
            }
        }
        self.set_trans_smoothed(curr);
        Ok(ProcessStatus::ValidMatch)
    }

    /// Sweep the focal length over `[start, end]` in `divisions` steps; for
    /// each candidate, re-estimate all valid landmarks over the keyframe set
    /// with the origin fixed and score by total reprojection error times
    /// focal length.
    pub fn find_focus(&self, start: f64, end: f64, divisions: usize) -> Option<f64> {
        let origin = self.origin?;
        let mut good: BTreeSet<LandmarkId> = BTreeSet::new();
        for id in &self.keyframes {
            let frame = match self.store.frame(*id) {
                Some(f) => f,
                None => continue,
            };
            for key in frame.fp_keys() {
                let landmark = match self.store.fp(key).and_then(|fp| fp.landmark) {
                    Some(l) => l,
                    None => continue,
                };
                let rec = match self.store.landmark(landmark) {
                    Some(r) => r,
                    None => continue,
                };
                let keyframe_obs = rec
                    .fps
                    .iter()
                    .filter(|fp| self.keyframes.contains(&fp.frame))
                    .count();
                if rec.valid && keyframe_obs >= 2 {
                    good.insert(landmark);
                }
            }
        }
        if good.is_empty() {
            return None;
        }
        let fixed_frames: BTreeSet<FrameId> = [origin].into_iter().collect();

        let step = (end - start) / divisions as f64;
        if step <= 0.0 {
            return None;
        }
        let mut selected: Option<(f64, f64)> = None;
        let mut focus = start;
        while focus <= end + 1e-9 {
            let mut runner = BaRunner::with_focal(&self.cfg, focus);
            let result = runner.estimate(
                &self.store,
                LandmarkView::new(&self.store, None),
                &good,
                &self.keyframes,
                None,
                Some(&fixed_frames),
                EstimateParams {
                    iterations: 30,
                    inlier_range: 1.0,
                    good_landmark_ratio: 0.5,
                    good_frame_ratio: 1.0,
                    good_avg_inlier_ratio: 0.7,
                    validate: true,
                },
                None,
                None,
            );
            match result {
                Ok(output) if output.validator.valid => {
                    let error = runner.total_error(&self.store, LandmarkView::new(&self.store, None));
                    let metric = error * focus;
                    tracing::debug!(focus, error, metric, "focal candidate");
                    if selected.map_or(true, |(best_metric, _)| metric < best_metric) {
                        selected = Some((metric, focus));
                    }
                }
                Ok(_) => {
                    tracing::debug!(focus, "no valid result for focal candidate");
                }
                Err(err) => {
                    tracing::debug!(focus, %err, "focal candidate failed");
                }
            }
            focus += step;
        }
        selected.map(|(_, focus)| focus)
    }
}
