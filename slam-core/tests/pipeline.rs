//! End-to-end scenarios over synthetic geometry: frames are fed through the
//! keypoint exchange format exactly as an embedder would.

use nalgebra::{UnitQuaternion, Vector3};
use rand::{rngs::SmallRng, Rng, SeedableRng};

use slam_core::{ProcessStatus, Slam, SlamConfig};
use slam_geom::{PinholeModel, Pose};
use slam_types::{Descriptor, Keypoint};

const FOCAL: f64 = 275.0;

fn test_config() -> SlamConfig {
    let mut cfg = SlamConfig::default();
    cfg.cx = 0.0;
    cfg.cy = 0.0;
    cfg.fx = FOCAL;
    cfg.fy = FOCAL;
    cfg.max_depth = 4.0;
    cfg.img_width_ratio = 5.0;
    cfg.scale = 1.0;
    cfg.find_focus = false;
    cfg.normalize_kp = false;
    cfg.leaf_size = 5;
    cfg.branch_size = 5;
    cfg.tree_size = 3;
    cfg.match_hierarchy = true;
    cfg.max_gap = 300.0;
    cfg.min_gap = 0.5;
    cfg.min_avg_gap_init = 2.0;
    cfg.min_avg_gap = 2.0;
    cfg.distance_threshold = 50.0;
    cfg.ratio = 0.8;
    cfg.max_frames = 10;
    cfg.num_key_frame_matches = 2;
    cfg.max_dist_ratio = 100.0;
    cfg.max_angle = 30.0;
    cfg.smoothening_tolerance = 0.05;
    cfg.seed = 17;
    cfg
}

fn random_descriptors(n: usize, seed: u64) -> Vec<Descriptor> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let mut d = [0u8; 32];
            rng.fill(&mut d[..]);
            Descriptor(d)
        })
        .collect()
}

fn world_points(n: usize, seed: u64) -> Vec<Vector3<f64>> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            Vector3::new(
                rng.gen_range(0.0..2.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(2.0..6.0),
            )
        })
        .collect()
}

fn observe(pose: &Pose, points: &[Vector3<f64>], descs: &[Descriptor]) -> Vec<Keypoint> {
    let cam = PinholeModel::centered(FOCAL);
    points
        .iter()
        .zip(descs.iter())
        .map(|(p, desc)| {
            let px = cam.project(pose, p).expect("point in front of camera");
            Keypoint {
                x: px.x as f32,
                y: px.y as f32,
                desc: *desc,
            }
        })
        .collect()
}

fn feed(
    slam: &mut Slam,
    id: i64,
    orientation: [f64; 3],
    keypoints: Vec<Keypoint>,
) -> ProcessStatus {
    let data = slam
        .extract_keypoints(640.0, 480.0, keypoints)
        .expect("export data");
    let status = slam
        .process(orientation, id, id * 1000, &data)
        .expect("process");
    slam.store().check_invariants().expect("store invariants");
    status
}

#[test]
fn test_forward_translation() {
    let points = world_points(20, 3);
    let descs = random_descriptors(20, 4);
    let truth = [
        Pose::identity(),
        Pose::new(Vector3::new(1.0, 0.0, 0.0), UnitQuaternion::identity()),
        Pose::new(Vector3::new(2.0, 0.0, 0.0), UnitQuaternion::identity()),
    ];

    let mut slam = Slam::new(test_config());
    let statuses: Vec<ProcessStatus> = truth
        .iter()
        .enumerate()
        .map(|(i, pose)| feed(&mut slam, i as i64, [0.0; 3], observe(pose, &points, &descs)))
        .collect();

    assert_eq!(statuses[0], ProcessStatus::Default);
    assert_eq!(statuses[1], ProcessStatus::ValidMatch);
    assert_eq!(statuses[2], ProcessStatus::ValidMatch);
    assert!(slam.is_initialized());

    // The first frame is the committed origin.
    let origin = slam.store().frame(slam_core::FrameId(0)).expect("origin");
    assert!(origin.pose.trans.norm() < 1e-12);
    assert!(origin.pose.rot.angle() < 1e-12);

    // Estimated trajectory within 1 percent of ground truth.
    for (i, pose) in truth.iter().enumerate().skip(1) {
        let est = slam
            .store()
            .frame(slam_core::FrameId(i as i64))
            .expect("frame")
            .pose
            .clone();
        let err = (est.trans - pose.trans).norm();
        assert!(
            err <= 0.01 * pose.trans.norm(),
            "frame {i} translation error {err}"
        );
    }

    // Landmarks within 2 percent of their ground-truth positions, matched
    // through the descriptor of any member point.
    let mut checked = 0;
    for landmark in slam.store().landmarks() {
        if !landmark.valid {
            continue;
        }
        let fp = landmark.fps.iter().next().expect("member point");
        let desc = slam.store().fp(*fp).expect("fp").desc;
        let index = descs
            .iter()
            .position(|d| *d == desc)
            .expect("descriptor belongs to a known world point");
        let err = (landmark.trans - points[index]).norm();
        assert!(
            err <= 0.02 * points[index].norm(),
            "landmark {index} error {err}"
        );
        checked += 1;
    }
    assert!(checked >= 10, "only {checked} landmarks were committed");
}

#[test]
fn test_pure_rotation_is_refused() {
    let points = world_points(20, 5);
    let descs = random_descriptors(20, 6);
    let rotations = [0.0, 5.0f64.to_radians(), 10.0f64.to_radians()];

    let mut slam = Slam::new(test_config());
    let mut statuses = Vec::new();
    for (i, angle) in rotations.iter().enumerate() {
        let pose = Pose::new(
            Vector3::zeros(),
            UnitQuaternion::from_axis_angle(&Vector3::y_axis(), *angle),
        );
        // Orientation prior about y matches the true rotation.
        let status = feed(
            &mut slam,
            i as i64,
            [0.0, *angle, 0.0],
            observe(&pose, &points, &descs),
        );
        statuses.push(status);
    }

    assert_eq!(statuses[0], ProcessStatus::Default);
    assert_eq!(statuses[1], ProcessStatus::MatchInvalid);
    assert_eq!(statuses[2], ProcessStatus::MatchInvalid);
    assert!(!slam.is_initialized());
    // Nothing was committed to the map.
    assert_eq!(slam.store().landmark_count(), 0);
}

#[test]
fn test_sliding_window_eviction() {
    let mut cfg = test_config();
    cfg.max_frames = 10;
    let mut slam = Slam::new(cfg);

    // Zero-parallax frames: nothing ever matches, so no frame beyond the
    // origin becomes a keyframe.
    let points = world_points(15, 7);
    let descs = random_descriptors(15, 8);
    let pose = Pose::identity();
    for i in 0..30 {
        feed(&mut slam, i, [0.0; 3], observe(&pose, &points, &descs));
    }

    assert_eq!(slam.keyframe_count(), 1);
    assert_eq!(slam.frame_count(), 10);
    // 30 frames, 10 in the window, the origin retained: 19 frames evicted
    // outright with their landmark links cleaned.
    let live = (0..30)
        .filter(|i| slam.store().frame(slam_core::FrameId(*i)).is_some())
        .count();
    assert_eq!(live, 11);
    assert!(slam.store().frame(slam_core::FrameId(0)).is_some());
    for i in 1..20 {
        assert!(slam.store().frame(slam_core::FrameId(i)).is_none());
    }
    assert_eq!(slam.store().landmark_count(), 0);
    slam.store().check_invariants().unwrap();
}

#[test]
fn test_duplicate_detection_invariant() {
    // Run the forward-translation scenario with two current-frame keypoints
    // sharing one descriptor: at most one of them may end up in any
    // committed landmark (the store invariant catches violations).
    let mut points = world_points(20, 9);
    let mut descs = random_descriptors(20, 10);
    // Two distinct world points with identical descriptors.
    points.push(Vector3::new(1.1, 0.4, 3.5));
    descs.push(descs[0]);

    let truth = [
        Pose::identity(),
        Pose::new(Vector3::new(1.0, 0.0, 0.0), UnitQuaternion::identity()),
        Pose::new(Vector3::new(2.0, 0.0, 0.0), UnitQuaternion::identity()),
    ];
    let mut slam = Slam::new(test_config());
    for (i, pose) in truth.iter().enumerate() {
        // check_invariants runs after every frame inside feed().
        feed(&mut slam, i as i64, [0.0; 3], observe(pose, &points, &descs));
    }
}

#[test]
fn test_smoothed_translation_tracks_motion() {
    let points = world_points(20, 11);
    let descs = random_descriptors(20, 12);
    let truth = [
        Pose::identity(),
        Pose::new(Vector3::new(1.0, 0.0, 0.0), UnitQuaternion::identity()),
        Pose::new(Vector3::new(2.0, 0.0, 0.0), UnitQuaternion::identity()),
    ];
    // A tolerance wide enough that the inter-frame motion is accepted.
    let mut cfg = test_config();
    cfg.smoothening_tolerance = 1.0;
    let mut slam = Slam::new(cfg);
    for (i, pose) in truth.iter().enumerate() {
        feed(&mut slam, i as i64, [0.0; 3], observe(pose, &points, &descs));
    }
    // The smoothed translation lags the raw one but moves in +x.
    let smooth = slam.smoothed_translation();
    assert!(smooth.x > 0.0);
    let current = slam.current_translation().expect("current frame");
    assert!(current.x > smooth.x);
}
