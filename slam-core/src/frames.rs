//! Frame lifecycle: creation with pose priors, keyframe promotion, origin
//! normalization, landmark-distance thresholds, smoothed motion and
//! sliding-window eviction.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{UnitQuaternion, Vector3};

use slam_geom::{orientation_to_rotation, Pose};
use slam_types::{IndexNode, Keypoint, INFINITE_DISTANCE};

use crate::slam::Slam;
use crate::store::{FeaturePoint, Frame, FrameId};

impl Slam {
    /// Create a frame from extracted keypoints. The translation prior is the
    /// previous frame's translation unless the last three frames were all
    /// invalid; the rotation prior comes from the orientation triple,
    /// expressed relative to the origin frame.
    pub(crate) fn create_frame(
        &mut self,
        id: FrameId,
        img_width: f32,
        img_height: f32,
        orientation: [f64; 3],
        timestamp: i64,
        keypoints: &[Keypoint],
        forest: Vec<Vec<IndexNode>>,
    ) -> FrameId {
        let mut invalid_count = 0;
        for i in 0..self.frame_order.len().min(3) {
            let idx = self.frame_order.len() - 1 - i;
            let frame = self.store.frame(self.frame_order[idx]).expect("ordered frame");
            if !frame.valid {
                invalid_count += 1;
            } else {
                break;
            }
        }
        let trans = match self.frame_order.last() {
            Some(last) if invalid_count < 3 => {
                self.store.frame(*last).expect("ordered frame").pose.trans
            }
            _ => Vector3::zeros(),
        };
        let rot = if self.cfg.disable_rotation_input {
            UnitQuaternion::identity()
        } else {
            self.origin_rot_inverse * orientation_to_rotation(&orientation)
        };

        let fps: Vec<FeaturePoint> = keypoints
            .iter()
            .map(|kp| FeaturePoint {
                px: kp.x,
                py: kp.y,
                x: f64::from(kp.x) - self.cfg.cx,
                y: f64::from(kp.y) - self.cfg.cy,
                desc: kp.desc,
                landmark: None,
                match_distance: INFINITE_DISTANCE,
            })
            .collect();

        if self.frame_order.is_empty() {
            self.img_width = img_width;
            self.img_height = img_height;
        }

        self.store.insert_frame(Frame {
            id,
            timestamp,
            pose: Pose::new(trans, rot),
            orientation,
            level: None,
            valid: false,
            is_keyframe: false,
            landmark_dist_threshold: 0.0,
            fps,
            forest,
        });
        self.frame_order.push(id);
        id
    }

    /// Detach the oldest frame from the sliding window. A frame that is
    /// neither the origin nor a keyframe is removed outright, with its
    /// feature points unlinked from their landmarks.
    pub(crate) fn evict_oldest(&mut self) {
        if self.frame_order.is_empty() {
            return;
        }
        let id = self.frame_order.remove(0);
        if self.origin == Some(id) || self.keyframes.contains(&id) {
            return;
        }
        let keys: Vec<_> = match self.store.frame(id) {
            Some(frame) => frame.fp_keys().collect(),
            None => return,
        };
        for key in keys {
            if let Some(landmark) = self.store.fp(key).and_then(|fp| fp.landmark) {
                self.store.unlink(landmark, key);
            }
        }
        self.store.remove_frame(id);
        tracing::debug!(?id, "evicted frame");
    }

    /// Promote a frame to the keyframe set. Its level is one more than the
    /// lowest level among keyframes sharing at least four landmarks with it.
    pub(crate) fn add_keyframe(&mut self, id: FrameId) {
        if self.keyframes.contains(&id) {
            return;
        }
        self.keyframes.insert(id);
        let level = if self.keyframes.len() == 1 {
            0
        } else {
            let mut level_counts: BTreeMap<u32, usize> = BTreeMap::new();
            if let Some(frame) = self.store.frame(id) {
                for key in frame.fp_keys() {
                    let landmark = match self.store.fp(key).and_then(|fp| fp.landmark) {
                        Some(l) => l,
                        None => continue,
                    };
                    let rec = match self.store.landmark(landmark) {
                        Some(r) => r,
                        None => continue,
                    };
                    for other in &rec.fps {
                        if *other == key || !self.keyframes.contains(&other.frame) {
                            continue;
                        }
                        if let Some(level) =
                            self.store.frame(other.frame).and_then(|f| f.level)
                        {
                            *level_counts.entry(level).or_insert(0) += 1;
                        }
                    }
                }
            }
            let min_level = level_counts
                .iter()
                .filter(|(_, count)| **count >= 4)
                .map(|(level, _)| *level)
                .min();
            match min_level {
                Some(level) => level + 1,
                None => 0,
            }
        };
        if let Some(frame) = self.store.frame_mut(id) {
            frame.level = Some(level);
            frame.is_keyframe = true;
        }
    }

    /// Re-anchor the world at this frame: every translation becomes relative
    /// to it and the origin frame takes the identity rotation (later frames
    /// are created relative to it through the stored conjugate).
    pub(crate) fn set_origin_frame(&mut self, id: FrameId) -> Vector3<f64> {
        self.origin = Some(id);
        let (origin_trans, origin_rot) = {
            let frame = self.store.frame(id).expect("origin frame present");
            (frame.pose.trans, frame.pose.rot)
        };
        for frame in self.store.frames_mut() {
            frame.pose.trans -= origin_trans;
        }
        self.origin_rot_inverse = origin_rot.inverse();
        if let Some(frame) = self.store.frame_mut(id) {
            frame.pose.rot = UnitQuaternion::identity();
        }
        origin_trans
    }

    /// Per-frame length scale: the median distance from the frame to the
    /// valid landmarks it observes.
    pub(crate) fn populate_landmark_dist_threshold(&mut self, frames: &BTreeSet<FrameId>) {
        for id in frames {
            let mut distances: Vec<f64> = Vec::new();
            if let Some(frame) = self.store.frame(*id) {
                for key in frame.fp_keys() {
                    let landmark = match self.store.fp(key).and_then(|fp| fp.landmark) {
                        Some(l) => l,
                        None => continue,
                    };
                    if let Some(rec) = self.store.landmark(landmark) {
                        if rec.valid {
                            distances.push((frame.pose.trans - rec.trans).norm());
                        }
                    }
                }
            }
            if distances.is_empty() {
                continue;
            }
            distances.sort_by(|a, b| a.partial_cmp(b).expect("finite distances"));
            let median = distances[distances.len() / 2];
            if let Some(frame) = self.store.frame_mut(*id) {
                frame.landmark_dist_threshold = median;
            }
        }
    }

    /// Update the smoothed translation and velocity from the current frame.
    /// Raw deltas beyond the smoothening tolerance (relative to the frame's
    /// landmark-distance threshold) are rejected and the previous value is
    /// kept.
    pub(crate) fn set_trans_smoothed(&mut self, curr: FrameId) {
        let (curr_trans, curr_ts, threshold) = match self.store.frame(curr) {
            Some(f) => (f.pose.trans, f.timestamp, f.landmark_dist_threshold),
            None => return,
        };
        let mut prev_ts = 0i64;
        for i in 2..=self.frame_order.len() {
            let idx = self.frame_order.len() - i;
            if let Some(frame) = self.store.frame(self.frame_order[idx]) {
                if frame.valid {
                    prev_ts = frame.timestamp;
                    break;
                }
            }
        }
        let prev = self.trans_smooth;
        let delta = (curr_trans - self.trans_smooth).norm();
        tracing::debug!(delta, threshold, "movement comparison");
        if delta > self.cfg.smoothening_tolerance * threshold {
            self.trans_smooth = prev;
        } else {
            self.trans_smooth = (curr_trans + prev) / 2.0;
        }
        let dt = curr_ts - prev_ts;
        if dt != 0 {
            self.vel_smooth = (self.trans_smooth - prev) / dt as f64;
        }
    }

    /// Rescale the whole map so the keyframe translation span along the
    /// principal axis equals `scale`.
    pub(crate) fn right_scale(&mut self, scale: f64) {
        let mut total = 0.0;
        let mut last: Option<f64> = None;
        for id in &self.keyframes {
            if let Some(frame) = self.store.frame(*id) {
                let x = frame.pose.trans.x;
                if let Some(prev) = last {
                    total += (x - prev).abs();
                }
                last = Some(x);
            }
        }
        if total <= 0.0 {
            tracing::warn!("keyframes span no distance along the principal axis");
            return;
        }
        let factor = scale / total;
        tracing::debug!(total, factor, "rescaling map");
        for frame in self.store.frames_mut() {
            frame.pose.trans *= factor;
        }
        for rec in self.store.landmarks_mut() {
            rec.trans *= factor;
        }
    }
}
