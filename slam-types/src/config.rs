//! Typed configuration, parsed from the string-keyed mapping exposed to
//! embedders.

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing configuration key: {0}")]
    MissingKey(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Which pose parameterization the bundle adjuster optimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum BaOption {
    /// Translation only; rotation is held at the per-frame orientation prior.
    #[default]
    ThreeDof,
    /// Full SE(3) with tangent-space rotation updates.
    SixDof,
}

/// All tuning parameters of one SLAM instance.
///
/// Immutable after construction except for the focal length, which the
/// focal-length search may overwrite once at map initialization.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SlamConfig {
    // Intrinsics.
    pub cx: f64,
    pub cy: f64,
    pub fx: f64,
    pub fy: f64,
    pub max_depth: f64,
    pub img_width_ratio: f64,
    pub scale: f64,
    pub find_focus: bool,
    pub normalize_kp: bool,

    // Match tree.
    pub leaf_size: usize,
    pub branch_size: usize,
    pub tree_size: usize,
    pub match_hierarchy: bool,

    // Feature budget.
    pub reqd_kps_init: usize,
    pub reqd_kps: usize,

    // Matcher.
    pub max_gap: f64,
    pub min_gap: f64,
    pub min_avg_gap_init: f64,
    pub min_avg_gap: f64,
    pub distance_threshold: f64,
    pub ratio: f64,

    // Bundle adjustment and pipeline.
    pub ba_option: BaOption,
    pub max_frames: usize,
    pub map_initialization_frames: usize,
    pub num_key_frame_matches: usize,
    pub max_dist_ratio: f64,
    pub max_angle: f64,
    pub copy_rotation: bool,
    pub disable_rotation_input: bool,
    pub new_keyframes_ba: bool,
    pub smoothening_tolerance: f64,

    /// Seed for the instance-owned RNG (match-forest shuffles, RANSAC draws).
    pub seed: u64,
}

impl Default for SlamConfig {
    fn default() -> Self {
        Self {
            cx: 320.0,
            cy: 240.0,
            fx: 275.0,
            fy: 275.0,
            max_depth: 100.0,
            img_width_ratio: 1.0,
            scale: 1.0,
            find_focus: false,
            normalize_kp: false,
            leaf_size: 10,
            branch_size: 10,
            tree_size: 5,
            match_hierarchy: true,
            reqd_kps_init: 1000,
            reqd_kps: 500,
            max_gap: 100.0,
            min_gap: 0.0,
            min_avg_gap_init: 10.0,
            min_avg_gap: 2.0,
            distance_threshold: 50.0,
            ratio: 0.8,
            ba_option: BaOption::ThreeDof,
            max_frames: 10,
            map_initialization_frames: 2,
            num_key_frame_matches: 2,
            max_dist_ratio: 1.5,
            max_angle: 30.0,
            copy_rotation: false,
            disable_rotation_input: false,
            new_keyframes_ba: false,
            smoothening_tolerance: 0.05,
            seed: 42,
        }
    }
}

fn parse_f64(
    entries: &BTreeMap<String, String>,
    key: &'static str,
    default: f64,
) -> std::result::Result<f64, ConfigError> {
    match entries.get(key) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            key,
            value: v.clone(),
        }),
    }
}

fn parse_usize(
    entries: &BTreeMap<String, String>,
    key: &'static str,
    default: usize,
) -> std::result::Result<usize, ConfigError> {
    match entries.get(key) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            key,
            value: v.clone(),
        }),
    }
}

fn parse_bool(
    entries: &BTreeMap<String, String>,
    key: &'static str,
    default: bool,
) -> std::result::Result<bool, ConfigError> {
    match entries.get(key) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key,
                value: v.clone(),
            }),
        },
    }
}

impl SlamConfig {
    /// Build a configuration from the string-keyed mapping of the embedded
    /// interface. Unknown keys are ignored; absent keys take their defaults.
    pub fn from_entries(
        entries: &BTreeMap<String, String>,
    ) -> std::result::Result<SlamConfig, ConfigError> {
        let d = SlamConfig::default();
        let ba_option = match entries.get("baOption") {
            None => d.ba_option,
            Some(v) => match v.as_str() {
                "0" | "3DOF" => BaOption::ThreeDof,
                "1" | "6DOF" => BaOption::SixDof,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "baOption",
                        value: v.clone(),
                    })
                }
            },
        };
        Ok(SlamConfig {
            cx: parse_f64(entries, "cx", d.cx)?,
            cy: parse_f64(entries, "cy", d.cy)?,
            fx: parse_f64(entries, "fx", d.fx)?,
            fy: parse_f64(entries, "fy", d.fy)?,
            max_depth: parse_f64(entries, "maxDepth", d.max_depth)?,
            img_width_ratio: parse_f64(entries, "imgWidthRatio", d.img_width_ratio)?,
            scale: parse_f64(entries, "scale", d.scale)?,
            find_focus: parse_bool(entries, "findFocus", d.find_focus)?,
            normalize_kp: parse_bool(entries, "normalizeKP", d.normalize_kp)?,
            leaf_size: parse_usize(entries, "leafSize", d.leaf_size)?,
            branch_size: parse_usize(entries, "branchSize", d.branch_size)?,
            tree_size: parse_usize(entries, "treeSize", d.tree_size)?,
            match_hierarchy: parse_bool(entries, "matchHierarchy", d.match_hierarchy)?,
            reqd_kps_init: parse_usize(entries, "reqdKpsInit", d.reqd_kps_init)?,
            reqd_kps: parse_usize(entries, "reqdKps", d.reqd_kps)?,
            max_gap: parse_f64(entries, "maxGap", d.max_gap)?,
            min_gap: parse_f64(entries, "minGap", d.min_gap)?,
            min_avg_gap_init: parse_f64(entries, "minAvgGapInit", d.min_avg_gap_init)?,
            min_avg_gap: parse_f64(entries, "minAvgGap", d.min_avg_gap)?,
            distance_threshold: parse_f64(entries, "distanceThreshold", d.distance_threshold)?,
            ratio: parse_f64(entries, "ratio", d.ratio)?,
            ba_option,
            max_frames: parse_usize(entries, "maxFrames", d.max_frames)?,
            map_initialization_frames: parse_usize(
                entries,
                "mapInitializationFrames",
                d.map_initialization_frames,
            )?,
            num_key_frame_matches: parse_usize(
                entries,
                "numKeyFrameMatches",
                d.num_key_frame_matches,
            )?,
            max_dist_ratio: parse_f64(entries, "maxDistRatio", d.max_dist_ratio)?,
            max_angle: parse_f64(entries, "maxAngle", d.max_angle)?,
            copy_rotation: parse_bool(entries, "copyRotation", d.copy_rotation)?,
            disable_rotation_input: parse_bool(
                entries,
                "disableRotationInput",
                d.disable_rotation_input,
            )?,
            new_keyframes_ba: parse_bool(entries, "newKeyframesBA", d.new_keyframes_ba)?,
            smoothening_tolerance: parse_f64(
                entries,
                "smootheningTolerance",
                d.smoothening_tolerance,
            )?,
            seed: parse_usize(entries, "seed", d.seed as usize)? as u64,
        })
    }

    /// The focal length the bundle adjuster works with: unity when keypoints
    /// are normalized, the configured `fx` otherwise.
    pub fn ba_focal(&self) -> f64 {
        if self.normalize_kp {
            1.0
        } else {
            self.fx
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entries_from_pairs;

    #[test]
    fn test_defaults_roundtrip() {
        let entries = BTreeMap::new();
        let cfg = SlamConfig::from_entries(&entries).unwrap();
        assert_eq!(cfg, SlamConfig::default());
    }

    #[test]
    fn test_parse_typed_keys() {
        let entries = entries_from_pairs([
            ("fx", "466"),
            ("fy", "466"),
            ("maxDepth", "1000"),
            ("baOption", "6DOF"),
            ("matchHierarchy", "false"),
            ("numKeyFrameMatches", "3"),
            ("ratio", "0.75"),
        ]);
        let cfg = SlamConfig::from_entries(&entries).unwrap();
        assert_eq!(cfg.fx, 466.0);
        assert_eq!(cfg.max_depth, 1000.0);
        assert_eq!(cfg.ba_option, BaOption::SixDof);
        assert!(!cfg.match_hierarchy);
        assert_eq!(cfg.num_key_frame_matches, 3);
        assert_eq!(cfg.ratio, 0.75);
    }

    #[test]
    fn test_invalid_value_names_key() {
        let entries = entries_from_pairs([("maxFrames", "ten")]);
        let err = SlamConfig::from_entries(&entries).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "maxFrames"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_serde_roundtrip() {
        let cfg = SlamConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: SlamConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn test_ba_focal_normalized() {
        let mut cfg = SlamConfig::default();
        cfg.normalize_kp = true;
        assert_eq!(cfg.ba_focal(), 1.0);
        cfg.normalize_kp = false;
        assert_eq!(cfg.ba_focal(), cfg.fx);
    }
}
