//! Cross-frame descriptor distances.
//!
//! When either feature point already belongs to a landmark, the comparison
//! uses the landmark's member descriptor from the nearest viewpoint (among a
//! supplied descriptor-frames set), which biases matching toward nearby
//! viewpoints and suppresses wide-baseline false positives. Raw Hamming
//! distances beyond [MAX_USABLE_DISTANCE] are treated as infinity.

use std::collections::BTreeSet;

use slam_types::{Descriptor, INFINITE_DISTANCE};

use crate::store::{FpKey, FrameId, GraphStore, Landmark};

const MAX_USABLE_DISTANCE: f64 = 100.0;

fn clamp(distance: f64) -> f64 {
    if distance > MAX_USABLE_DISTANCE {
        INFINITE_DISTANCE
    } else {
        distance
    }
}

fn landmark_desc_distance(
    store: &GraphStore,
    landmark: &Landmark,
    desc: &Descriptor,
    desc_frame: FrameId,
    descriptor_frames: &BTreeSet<FrameId>,
) -> f64 {
    match store.nearest_member_desc(landmark, desc_frame, descriptor_frames) {
        Some(member) => clamp(f64::from(member.hamming(desc))),
        None => INFINITE_DISTANCE,
    }
}

fn landmark_landmark_distance(
    store: &GraphStore,
    l1: &Landmark,
    l2: &Landmark,
    descriptor_frames: &BTreeSet<FrameId>,
) -> f64 {
    // Pick the member pair whose owning frames are closest to each other.
    let mut best: Option<(f64, FpKey, FpKey)> = None;
    for fp1 in &l1.fps {
        if !descriptor_frames.contains(&fp1.frame) {
            continue;
        }
        let t1 = match store.frame(fp1.frame) {
            Some(f) => f.pose.trans,
            None => continue,
        };
        for fp2 in &l2.fps {
            if !descriptor_frames.contains(&fp2.frame) {
                continue;
            }
            let t2 = match store.frame(fp2.frame) {
                Some(f) => f.pose.trans,
                None => continue,
            };
            let frame_dist = (t1 - t2).norm();
            if best.is_none() || frame_dist < best.as_ref().expect("set").0 {
                best = Some((frame_dist, *fp1, *fp2));
            }
        }
    }
    let (_, fp1, fp2) = match best {
        Some(b) => b,
        None => return INFINITE_DISTANCE,
    };
    match (store.fp(fp1), store.fp(fp2)) {
        (Some(a), Some(b)) => clamp(f64::from(a.desc.hamming(&b.desc))),
        _ => INFINITE_DISTANCE,
    }
}

/// Descriptor distance between two feature points under the landmark-aware
/// rule. A stale landmark backlink (id no longer in the store) degrades to
/// the plain descriptor comparison.
pub(crate) fn fp_distance(
    store: &GraphStore,
    a: FpKey,
    b: FpKey,
    descriptor_frames: &BTreeSet<FrameId>,
) -> f64 {
    let (fa, fb) = match (store.fp(a), store.fp(b)) {
        (Some(fa), Some(fb)) => (fa, fb),
        _ => return INFINITE_DISTANCE,
    };
    let la = fa.landmark.and_then(|id| store.landmark(id));
    let lb = fb.landmark.and_then(|id| store.landmark(id));
    match (la, lb) {
        (None, None) => f64::from(fa.desc.hamming(&fb.desc)),
        (Some(la), None) => landmark_desc_distance(store, la, &fb.desc, b.frame, descriptor_frames),
        (None, Some(lb)) => landmark_desc_distance(store, lb, &fa.desc, a.frame, descriptor_frames),
        (Some(la), Some(lb)) => landmark_landmark_distance(store, la, lb, descriptor_frames),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::test::test_frame;
    use nalgebra::Vector3;
    use slam_types::SlamConfig;

    fn key(frame: i64, index: u32) -> FpKey {
        FpKey {
            frame: FrameId(frame),
            index,
        }
    }

    #[test]
    fn test_plain_distance_without_landmarks() {
        let mut store = GraphStore::new();
        store.insert_frame(test_frame(0, 3));
        store.insert_frame(test_frame(1, 3));
        let frames: BTreeSet<FrameId> = [FrameId(0), FrameId(1)].into_iter().collect();
        // Descriptors differ in their first byte (i vs i).
        let d = fp_distance(&store, key(0, 1), key(1, 2), &frames);
        assert_eq!(d, 2.0); // 1 ^ 2 = 0b11
    }

    #[test]
    fn test_landmark_uses_nearest_viewpoint_descriptor() {
        let mut store = GraphStore::new();
        store.insert_frame(test_frame(0, 3));
        store.insert_frame(test_frame(1, 3));
        store.insert_frame(test_frame(2, 3));
        // Frame 1 sits far away, frame 0 close to the query frame 2.
        store.frame_mut(FrameId(1)).unwrap().pose.trans = Vector3::new(50.0, 0.0, 0.0);
        let cfg = SlamConfig::default();
        let id = store.create_landmark(key(0, 1), 0.0, &cfg).unwrap();
        store.link(id, key(1, 2), 0.0).unwrap();

        let frames: BTreeSet<FrameId> = [FrameId(0), FrameId(1), FrameId(2)].into_iter().collect();
        // Query: frame 2 fp 2 (desc byte 2). The landmark answers with the
        // frame-0 member (desc byte 1), not the frame-1 member (byte 2).
        let d = fp_distance(&store, key(0, 1), key(2, 2), &frames);
        assert_eq!(d, 2.0); // hamming(0b01, 0b10)

        // Restricting the descriptor set to the far frame switches members.
        let only_far: BTreeSet<FrameId> = [FrameId(1)].into_iter().collect();
        let d = fp_distance(&store, key(0, 1), key(2, 2), &only_far);
        assert_eq!(d, 0.0); // hamming(2, 2)
    }

    #[test]
    fn test_no_member_in_descriptor_frames_is_infinite() {
        let mut store = GraphStore::new();
        store.insert_frame(test_frame(0, 3));
        store.insert_frame(test_frame(1, 3));
        store.insert_frame(test_frame(2, 3));
        let cfg = SlamConfig::default();
        let id = store.create_landmark(key(0, 1), 0.0, &cfg).unwrap();
        store.link(id, key(1, 1), 0.0).unwrap();
        let empty_view: BTreeSet<FrameId> = [FrameId(2)].into_iter().collect();
        let d = fp_distance(&store, key(0, 1), key(2, 0), &empty_view);
        assert_eq!(d, INFINITE_DISTANCE);
    }
}
