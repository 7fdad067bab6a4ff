// config.rs — immutable engine configuration.
//
// A `Config` is validated once, when the builder's `build()` runs, and is
// frozen afterwards: the instance keeps its own copy and never mutates it.
// `Config::default()` reproduces the reference SIFT parameter set
// (Lowe's constants for the pyramid and thresholds).

use crate::error::{InputError, Result};

/// Descriptor byte encoding. Both formats are 128 bytes; only the bin
/// ordering and rotation convention differ.
///
/// `Ubc` matches Lowe's reference implementation, OpenCV and SiftGPU.
/// `VlFeat` matches VLFeat and PopSift. Pick whichever the consumer of
/// the descriptors expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DescriptorFormat {
    #[default]
    Ubc,
    VlFeat,
}

/// Numeric precision of the scale-space images.
///
/// `Float16` is accepted for compatibility but currently degrades to
/// `Float32` with a warning: WGSL core has no 16-bit float storage texel
/// format, so compute passes cannot write r16float textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PyramidPrecision {
    #[default]
    Float32,
    Float16,
}

/// Validated, immutable engine configuration. Construct via
/// [`Config::builder`] or take [`Config::default`].
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Maximum input image area in pixels (width × height).
    pub input_image_max_size: u32,
    /// Number of device-resident feature buffers.
    pub sift_buffer_count: u32,
    /// Fixed capacity of each feature buffer.
    pub max_nb_sift_per_buffer: u32,
    /// Build the pyramid from a 2× upscaled input. More features, more time.
    pub use_input_upsampling: bool,
    /// Octave count; 0 derives it from the input resolution.
    pub nb_octaves: u8,
    /// Sampled scales per octave.
    pub nb_scales_per_octave: u8,
    /// Assumed blur level of the input image.
    pub input_image_blur_level: f32,
    /// Blur level of the scale-space seed image.
    pub seed_scale_sigma: f32,
    /// DoG intensity threshold in normalized [0, 1] units. Divided by
    /// `nb_scales_per_octave` before use.
    pub intensity_threshold: f32,
    /// Principal-curvature ratio bound for the edge rejection test.
    pub edge_threshold: f32,
    /// Maximum orientations (descriptors) per keypoint; 0 = uncapped.
    pub max_nb_orientation_per_keypoint: u32,
    /// Descriptor byte encoding.
    pub descriptor_format: DescriptorFormat,
    /// Explicit GPU index as listed by `Driver::available_gpus`; negative
    /// selects the best-scoring device automatically.
    pub gpu_device_index: i32,
    /// Use hardware texture samplers for the Gaussian blur fast path.
    pub use_hardware_interpolated_blur: bool,
    /// Scale-space image precision.
    pub pyramid_precision: PyramidPrecision,
    /// Admit CPU-emulated adapters (software rasterizers) during auto
    /// selection.
    pub allow_cpu_device: bool,
    /// Compile the debug presentation path so pipeline frames can be
    /// pushed to a caller-supplied surface for profiling.
    pub enable_debug_presentation: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            input_image_max_size: 1920 * 1080,
            sift_buffer_count: 2,
            max_nb_sift_per_buffer: 100_000,
            use_input_upsampling: true,
            nb_octaves: 0,
            nb_scales_per_octave: 3,
            input_image_blur_level: 0.5,
            seed_scale_sigma: 1.6,
            intensity_threshold: 0.04,
            edge_threshold: 10.0,
            max_nb_orientation_per_keypoint: 4,
            descriptor_format: DescriptorFormat::Ubc,
            gpu_device_index: -1,
            use_hardware_interpolated_blur: true,
            pyramid_precision: PyramidPrecision::Float32,
            allow_cpu_device: false,
            enable_debug_presentation: false,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Validate every field. Called by the builder and again by the
    /// instance factory, so a hand-constructed `Config` cannot bypass the
    /// checks.
    pub(crate) fn validate(&self) -> Result<(), InputError> {
        fn fail(msg: impl Into<String>) -> Result<(), InputError> {
            Err(InputError::Config(msg.into()))
        }

        if self.input_image_max_size == 0 {
            return fail("input_image_max_size must be nonzero");
        }
        if self.sift_buffer_count == 0 {
            return fail("sift_buffer_count must be at least 1");
        }
        if self.max_nb_sift_per_buffer == 0 {
            return fail("max_nb_sift_per_buffer must be at least 1");
        }
        if self.nb_scales_per_octave == 0 || self.nb_scales_per_octave > 8 {
            return fail(format!(
                "nb_scales_per_octave must be in 1..=8 (got {})",
                self.nb_scales_per_octave
            ));
        }
        if !(self.input_image_blur_level > 0.0) {
            return fail("input_image_blur_level must be positive");
        }
        if !(self.seed_scale_sigma > 0.0) {
            return fail("seed_scale_sigma must be positive");
        }
        // The seed blur must exceed the blur already present in the seed
        // image, otherwise the first pre-blur sigma is imaginary.
        let upscale = if self.use_input_upsampling { 2.0 } else { 1.0 };
        if self.seed_scale_sigma <= self.input_image_blur_level * upscale {
            return fail(format!(
                "seed_scale_sigma ({}) must exceed the effective input blur ({})",
                self.seed_scale_sigma,
                self.input_image_blur_level * upscale
            ));
        }
        if self.intensity_threshold < 0.0 || !self.intensity_threshold.is_finite() {
            return fail("intensity_threshold must be finite and non-negative");
        }
        if !(self.edge_threshold >= 1.0) {
            return fail("edge_threshold must be at least 1");
        }
        // The blur coefficients live in a fixed-size uniform; a schedule
        // whose largest kernel overflows it must be rejected here rather
        // than discovered mid-detect.
        let half = crate::gpu::scale_space::largest_scheduled_kernel_half(self);
        let slots = crate::gpu::scale_space::MAX_KERNEL_COEFFS;
        if half >= slots {
            return fail(format!(
                "scheduled blur kernel (half size {half}) exceeds the {slots} \
                 coefficient slots; lower seed_scale_sigma or raise \
                 nb_scales_per_octave"
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`]. Defaults match [`Config::default`]; `build()`
/// validates and freezes the result.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    cfg: Config,
}

impl ConfigBuilder {
    pub fn input_image_max_size(mut self, pixels: u32) -> Self {
        self.cfg.input_image_max_size = pixels;
        self
    }

    pub fn sift_buffer_count(mut self, count: u32) -> Self {
        self.cfg.sift_buffer_count = count;
        self
    }

    pub fn max_nb_sift_per_buffer(mut self, capacity: u32) -> Self {
        self.cfg.max_nb_sift_per_buffer = capacity;
        self
    }

    pub fn use_input_upsampling(mut self, enable: bool) -> Self {
        self.cfg.use_input_upsampling = enable;
        self
    }

    pub fn nb_octaves(mut self, count: u8) -> Self {
        self.cfg.nb_octaves = count;
        self
    }

    pub fn nb_scales_per_octave(mut self, count: u8) -> Self {
        self.cfg.nb_scales_per_octave = count;
        self
    }

    pub fn input_image_blur_level(mut self, sigma: f32) -> Self {
        self.cfg.input_image_blur_level = sigma;
        self
    }

    pub fn seed_scale_sigma(mut self, sigma: f32) -> Self {
        self.cfg.seed_scale_sigma = sigma;
        self
    }

    pub fn intensity_threshold(mut self, threshold: f32) -> Self {
        self.cfg.intensity_threshold = threshold;
        self
    }

    pub fn edge_threshold(mut self, threshold: f32) -> Self {
        self.cfg.edge_threshold = threshold;
        self
    }

    pub fn max_nb_orientation_per_keypoint(mut self, cap: u32) -> Self {
        self.cfg.max_nb_orientation_per_keypoint = cap;
        self
    }

    pub fn descriptor_format(mut self, format: DescriptorFormat) -> Self {
        self.cfg.descriptor_format = format;
        self
    }

    pub fn gpu_device_index(mut self, index: i32) -> Self {
        self.cfg.gpu_device_index = index;
        self
    }

    pub fn use_hardware_interpolated_blur(mut self, enable: bool) -> Self {
        self.cfg.use_hardware_interpolated_blur = enable;
        self
    }

    pub fn pyramid_precision(mut self, precision: PyramidPrecision) -> Self {
        self.cfg.pyramid_precision = precision;
        self
    }

    pub fn allow_cpu_device(mut self, allow: bool) -> Self {
        self.cfg.allow_cpu_device = allow;
        self
    }

    pub fn enable_debug_presentation(mut self, enable: bool) -> Self {
        self.cfg.enable_debug_presentation = enable;
        self
    }

    pub fn build(self) -> Result<Config, InputError> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn default_matches_reference_parameters() {
        let cfg = Config::default();
        assert_eq!(cfg.input_image_max_size, 1920 * 1080);
        assert_eq!(cfg.sift_buffer_count, 2);
        assert_eq!(cfg.max_nb_sift_per_buffer, 100_000);
        assert!(cfg.use_input_upsampling);
        assert_eq!(cfg.nb_octaves, 0);
        assert_eq!(cfg.nb_scales_per_octave, 3);
        assert_eq!(cfg.input_image_blur_level, 0.5);
        assert_eq!(cfg.seed_scale_sigma, 1.6);
        assert_eq!(cfg.intensity_threshold, 0.04);
        assert_eq!(cfg.edge_threshold, 10.0);
        assert_eq!(cfg.max_nb_orientation_per_keypoint, 4);
        assert_eq!(cfg.descriptor_format, DescriptorFormat::Ubc);
        assert_eq!(cfg.gpu_device_index, -1);
        assert!(cfg.use_hardware_interpolated_blur);
        assert_eq!(cfg.pyramid_precision, PyramidPrecision::Float32);
        assert!(!cfg.allow_cpu_device);
        assert!(!cfg.enable_debug_presentation);
    }

    #[test]
    fn oversized_blur_schedule_is_rejected() {
        // sigma 10 with one scale per octave schedules a blur delta whose
        // kernel half size (hundreds of taps) cannot fit the uniform
        // slots; build() must refuse instead of panicking mid-detect.
        let err = Config::builder()
            .seed_scale_sigma(10.0)
            .nb_scales_per_octave(1)
            .use_input_upsampling(false)
            .build()
            .unwrap_err();
        assert!(matches!(err, InputError::Config(_)));

        // The largest sigma that still fits must keep building.
        assert!(Config::builder().seed_scale_sigma(3.0).build().is_ok());
    }

    #[test]
    fn builder_round_trips_fields() {
        let cfg = Config::builder()
            .sift_buffer_count(4)
            .max_nb_sift_per_buffer(5000)
            .use_input_upsampling(false)
            .descriptor_format(DescriptorFormat::VlFeat)
            .allow_cpu_device(true)
            .build()
            .unwrap();
        assert_eq!(cfg.sift_buffer_count, 4);
        assert_eq!(cfg.max_nb_sift_per_buffer, 5000);
        assert!(!cfg.use_input_upsampling);
        assert_eq!(cfg.descriptor_format, DescriptorFormat::VlFeat);
        assert!(cfg.allow_cpu_device);
    }

    #[test]
    fn rejects_zero_buffers() {
        let err = Config::builder().sift_buffer_count(0).build().unwrap_err();
        assert!(matches!(err, InputError::Config(_)));
    }

    #[test]
    fn rejects_zero_capacity() {
        assert!(Config::builder().max_nb_sift_per_buffer(0).build().is_err());
    }

    #[test]
    fn rejects_zero_max_image_size() {
        assert!(Config::builder().input_image_max_size(0).build().is_err());
    }

    #[test]
    fn rejects_bad_scale_count() {
        assert!(Config::builder().nb_scales_per_octave(0).build().is_err());
        assert!(Config::builder().nb_scales_per_octave(9).build().is_err());
        assert!(Config::builder().nb_scales_per_octave(8).build().is_ok());
    }

    #[test]
    fn rejects_seed_sigma_below_input_blur() {
        // With upsampling the effective input blur doubles; a seed sigma
        // of 1.0 is then below 2 * 0.6.
        let err = Config::builder()
            .input_image_blur_level(0.6)
            .seed_scale_sigma(1.0)
            .build()
            .unwrap_err();
        assert!(matches!(err, InputError::Config(_)));

        // The same pair is fine without upsampling.
        assert!(Config::builder()
            .input_image_blur_level(0.6)
            .seed_scale_sigma(1.0)
            .use_input_upsampling(false)
            .build()
            .is_ok());
    }

    #[test]
    fn rejects_edge_threshold_below_one() {
        assert!(Config::builder().edge_threshold(0.5).build().is_err());
    }

    #[test]
    fn rejects_negative_intensity_threshold() {
        assert!(Config::builder().intensity_threshold(-0.1).build().is_err());
        assert!(Config::builder().intensity_threshold(f32::NAN).build().is_err());
    }
}
