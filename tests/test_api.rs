// tests/test_api.rs — public-API tests that run without a GPU.
//
// GPU integration tests live in src/instance.rs behind #[ignore] with
// subprocess wrappers; everything here is pure CPU.

use wgsift::gpu::buffers::truncate_ranked;
use wgsift::gpu::scale_space::{derived_octave_count, PyramidSchedule};
use wgsift::{Config, DescriptorFormat, Error, Feature, InputError, Match2Nn, DESCRIPTOR_SIZE};

// ===== Configuration =====

#[test]
fn default_config_matches_reference_sift_parameters() {
    let cfg = Config::default();
    assert_eq!(cfg.nb_scales_per_octave, 3);
    assert_eq!(cfg.seed_scale_sigma, 1.6);
    assert_eq!(cfg.intensity_threshold, 0.04);
    assert_eq!(cfg.edge_threshold, 10.0);
    assert!(cfg.use_input_upsampling);
    assert_eq!(cfg.descriptor_format, DescriptorFormat::Ubc);
}

#[test]
fn builder_validation_is_recoverable() {
    let err = Config::builder().sift_buffer_count(0).build().unwrap_err();
    // Builder errors are input errors; wrapped in `Error` they must not
    // poison anything.
    let err: Error = err.into();
    assert!(!err.is_fatal());
}

// ===== Feature and match records =====

#[test]
fn feature_is_a_stable_pod_record() {
    assert_eq!(DESCRIPTOR_SIZE, 128);
    assert_eq!(std::mem::size_of::<Feature>(), 164);
    assert_eq!(std::mem::size_of::<Match2Nn>(), 20);

    let f = Feature {
        x: 3.5,
        y: 7.25,
        octave_idx: -1,
        ..Feature::default()
    };
    let bytes = bytemuck::bytes_of(&f);
    let back: Feature = *bytemuck::from_bytes(bytes);
    assert_eq!(back, f);
}

// ===== Pyramid schedule =====

#[test]
fn octave_count_matches_resolution_halving() {
    // Full HD without upsampling: 1080 halves six times before
    // dropping under the minimum octave size.
    assert_eq!(derived_octave_count(1920, 1080), 7);
}

#[test]
fn schedule_upsampling_gains_one_octave_and_reports_minus_one() {
    let with = PyramidSchedule::plan(&Config::default(), 1920, 1080);
    let without = PyramidSchedule::plan(
        &Config::builder().use_input_upsampling(false).build().unwrap(),
        1920,
        1080,
    );
    assert_eq!(with.nb_octaves, without.nb_octaves + 1);
    assert_eq!(with.reported_octave(0), -1);
    assert_eq!(without.reported_octave(0), 0);
}

#[test]
fn absolute_sigma_is_continuous_across_configurations() {
    // A keypoint at reported octave 0, scale 1 must carry the same
    // sigma whether or not the pyramid was built from an upscaled seed.
    let with = PyramidSchedule::plan(&Config::default(), 640, 480);
    let without = PyramidSchedule::plan(
        &Config::builder().use_input_upsampling(false).build().unwrap(),
        640,
        480,
    );
    let a = with.sigma_absolute(0, 1.0);
    let b = without.sigma_absolute(0, 1.0);
    assert!((a - b).abs() < 1e-6);
}

// ===== Capacity policy =====

#[test]
fn capacity_truncation_is_deterministic_and_strength_ranked() {
    let mk = |intensity: f32| Feature {
        intensity,
        ..Feature::default()
    };
    let features: Vec<Feature> = [0.03, -0.9, 0.5, 0.04, -0.5, 0.8]
        .iter()
        .map(|&i| mk(i))
        .collect();

    let once = truncate_ranked(features.clone(), 3);
    let twice = truncate_ranked(features, 3);
    assert_eq!(once, twice);

    let kept: Vec<f32> = once.iter().map(|f| f.intensity).collect();
    // Strongest three magnitudes, original order preserved.
    assert_eq!(kept, vec![-0.9, 0.5, 0.8]);
}

// ===== Errors =====

#[test]
fn error_severities_are_partitioned() {
    let input: Error = InputError::BufferIndexOutOfRange { index: 5, count: 2 }.into();
    assert!(!input.is_fatal());
    let device: Error = wgsift::DeviceError::Poisoned.into();
    assert!(device.is_fatal());
}
