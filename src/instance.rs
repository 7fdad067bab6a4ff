// instance.rs — the engine instance: device ownership, pipeline staging
// and the public detect/match/buffer API.
//
// One `SiftInstance` owns one GPU device plus every pipeline and buffer
// the engine needs, all allocated at creation so detect and match calls
// never allocate device memory. Methods take `&mut self`: one instance
// is one serial command stream, and the borrow checker enforces what
// the underlying queue requires anyway.
//
// ERROR HANDLING:
// GPU work runs inside wgpu error scopes (validation + out-of-memory).
// Any device-level failure poisons the instance — every later call
// short-circuits with `DeviceError::Poisoned` — while input errors
// leave it untouched. An optional `ErrorHook` observes every error
// before it is returned.

use crate::config::{Config, PyramidPrecision};
use crate::error::{DeviceError, Error, ErrorHook, InputError, Result};
use crate::feature::{Feature, Match2Nn};
use crate::gpu::buffers::{truncate_ranked, FeatureBuffers};
use crate::gpu::descriptor::{DescriptorJob, DescriptorStage};
use crate::gpu::device::{Driver, GpuDevice};
use crate::gpu::extract::ExtractStage;
use crate::gpu::matcher::MatchStage;
use crate::gpu::orientation::OrientationStage;
use crate::gpu::present::PresentStage;
use crate::gpu::scale_space::{ScaleSpace, ScaleSpacePipelines};

/// A GPU SIFT engine bound to one device.
///
/// Create one per GPU workload; instances are independent and may live
/// side by side on different devices. Dropping the instance releases
/// every GPU resource it owns.
pub struct SiftInstance {
    config: Config,
    gpu: GpuDevice,
    scale_space: ScaleSpacePipelines,
    extract: ExtractStage,
    orientation: OrientationStage,
    descriptor: DescriptorStage,
    matcher: MatchStage,
    present: Option<PresentStage>,
    buffers: FeatureBuffers,
    /// Pyramid of the last detect call, kept for debug presentation.
    last_pyramid: Option<ScaleSpace>,
    error_hook: Option<ErrorHook>,
    poisoned: bool,
}

impl SiftInstance {
    /// Create an instance: select a device per the configuration and
    /// compile every pipeline up front.
    pub fn new(driver: &Driver, config: Config) -> Result<Self> {
        config.validate().map_err(Error::from)?;

        if config.pyramid_precision == PyramidPrecision::Float16 {
            log::warn!(
                "Float16 pyramid precision is not supported by the compute \
                 backend; using Float32"
            );
        }

        let gpu = GpuDevice::select(driver, &config)?;

        gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
        gpu.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);

        let scale_space = ScaleSpacePipelines::new(&gpu);
        let extract = ExtractStage::new(&gpu, &config);
        let orientation = OrientationStage::new(&gpu, &config);
        let descriptor = DescriptorStage::new(&gpu, &config);
        let matcher = MatchStage::new(&gpu, &config);
        let present = config
            .enable_debug_presentation
            .then(|| PresentStage::new(&gpu));
        let buffers = FeatureBuffers::new(&gpu, &config);

        pop_error_scopes(&gpu, "instance creation")?;

        log::info!(
            "instance ready on {}: {} feature buffers x {} capacity",
            gpu.adapter_info,
            config.sift_buffer_count,
            config.max_nb_sift_per_buffer
        );

        Ok(SiftInstance {
            config,
            gpu,
            scale_space,
            extract,
            orientation,
            descriptor,
            matcher,
            present,
            buffers,
            last_pyramid: None,
            error_hook: None,
            poisoned: false,
        })
    }

    /// Install (or clear) the error hook. It is called synchronously
    /// with every error this instance produces.
    pub fn set_error_hook(&mut self, hook: Option<ErrorHook>) {
        self.error_hook = hook;
    }

    /// The configuration this instance was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Detect SIFT features in a tightly-packed 8-bit grayscale image
    /// and replace the content of the target buffer with the result.
    /// Returns the number of features stored.
    pub fn detect_features(
        &mut self,
        image: &[u8],
        width: u32,
        height: u32,
        buffer_index: u32,
    ) -> Result<u32> {
        let result = self.detect_inner(image, width, height, buffer_index);
        self.seal(result)
    }

    fn detect_inner(
        &mut self,
        image: &[u8],
        width: u32,
        height: u32,
        buffer_index: u32,
    ) -> Result<u32> {
        self.guard()?;
        self.buffers.count(buffer_index)?;
        validate_image(image, width, height, self.config.input_image_max_size)?;

        self.gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.gpu.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);

        // The scopes must be popped even when a stage bails early with a
        // recoverable error, or the device scope stack goes stale.
        let run = self.detect_gpu(image, width, height, buffer_index);
        let scopes = pop_error_scopes(&self.gpu, "detect");
        let count = run?;
        scopes?;
        Ok(count)
    }

    fn detect_gpu(
        &mut self,
        image: &[u8],
        width: u32,
        height: u32,
        buffer_index: u32,
    ) -> Result<u32> {
        let pyramid = self
            .scale_space
            .build(&self.gpu, image, width, height, &self.config);
        let candidates = self.extract.run(&self.gpu, &pyramid, &self.config)?;
        let oriented = self.orientation.run(&self.gpu, &pyramid, &candidates)?;
        log::debug!(
            "detect: {} candidates, {} oriented features",
            candidates.len(),
            oriented.len()
        );

        // Expand candidates into feature records (descriptors still
        // zero), apply the capacity policy, then derive the descriptor
        // jobs from the survivors.
        let schedule = &pyramid.schedule;
        let features: Vec<Feature> = oriented
            .iter()
            .map(|&(ci, angle)| {
                let c = &candidates[ci];
                let reported = schedule.reported_octave(c.octave);
                let to_input = schedule.octave_to_input_scale(c.octave);
                Feature {
                    x: c.x * to_input,
                    y: c.y * to_input,
                    scale_x: c.x,
                    scale_y: c.y,
                    scale_idx: c.scale_idx,
                    octave_idx: reported,
                    sigma: schedule
                        .sigma_absolute(reported, c.scale_idx as f32 + c.delta_scale),
                    orientation: angle,
                    intensity: c.response,
                    ..Feature::default()
                }
            })
            .collect();
        let features = truncate_ranked(features, self.buffers.capacity() as usize);

        let octave_offset = if schedule.upsampled { 1 } else { 0 };
        let jobs: Vec<DescriptorJob> = features
            .iter()
            .enumerate()
            .map(|(i, f)| DescriptorJob {
                x: f.scale_x,
                y: f.scale_y,
                // Back from the absolute sigma to octave pixel units.
                sigma: f.sigma / (f.octave_idx as f32).exp2(),
                orientation: f.orientation,
                octave: (f.octave_idx + octave_offset) as u32,
                scale_idx: f.scale_idx,
                feature_index: i as u32,
                _pad: 0,
            })
            .collect();

        self.buffers.write(&self.gpu, buffer_index, &features)?;
        self.descriptor
            .run(&self.gpu, &pyramid, &jobs, self.buffers.raw(buffer_index)?);
        self.gpu.wait_idle();

        self.last_pyramid = Some(pyramid);
        Ok(features.len() as u32)
    }

    /// Number of features currently stored in a buffer.
    pub fn feature_count(&mut self, buffer_index: u32) -> Result<u32> {
        let result = (|| {
            self.guard()?;
            Ok(self.buffers.count(buffer_index)?)
        })();
        self.seal(result)
    }

    /// Copy a buffer's features back to the host, in storage order.
    pub fn download_features(&mut self, buffer_index: u32) -> Result<Vec<Feature>> {
        let result = (|| {
            self.guard()?;
            self.buffers.download(&self.gpu, buffer_index)
        })();
        self.seal(result)
    }

    /// Replace a buffer's content with caller-provided features (e.g.
    /// loaded from disk for matching against a fresh detection).
    pub fn upload_features(&mut self, buffer_index: u32, features: &[Feature]) -> Result<()> {
        let result = (|| {
            self.guard()?;
            Ok(self.buffers.write(&self.gpu, buffer_index, features)?)
        })();
        self.seal(result)
    }

    /// Match every feature of buffer A against buffer B (2-NN, L2 over
    /// descriptors). Either buffer being empty yields zero matches.
    pub fn match_features(&mut self, buffer_a: u32, buffer_b: u32) -> Result<Vec<Match2Nn>> {
        let result = (|| {
            self.guard()?;
            let count_a = self.buffers.count(buffer_a)?;
            let count_b = self.buffers.count(buffer_b)?;

            let buf_a = self.buffers.raw(buffer_a)?;
            let buf_b = self.buffers.raw(buffer_b)?;

            self.gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
            self.gpu.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
            let run = self.matcher.run(&self.gpu, buf_a, count_a, buf_b, count_b);
            let scopes = pop_error_scopes(&self.gpu, "match");
            let matches = run?;
            scopes?;
            Ok(matches)
        })();
        self.seal(result)
    }

    /// Blit one image of the last detect call's pyramid to a
    /// caller-supplied surface. Requires `enable_debug_presentation`.
    pub fn present_debug_frame(
        &mut self,
        surface: &wgpu::Surface<'_>,
        surface_width: u32,
        surface_height: u32,
        octave: u32,
        layer: u32,
        dog: bool,
    ) -> Result<()> {
        let result = (|| {
            self.guard()?;
            let present = self
                .present
                .as_mut()
                .ok_or(InputError::DebugPresentationDisabled)?;
            let pyramid = self.last_pyramid.as_ref().ok_or_else(|| {
                InputError::Config("no pyramid to present; run detect first".into())
            })?;
            let oct = pyramid.octaves.get(octave as usize).ok_or_else(|| {
                InputError::Config(format!(
                    "octave {octave} out of range ({} octaves)",
                    pyramid.octaves.len()
                ))
            })?;
            let views = if dog { &oct.dog_views } else { &oct.gauss_views };
            let view = views.get(layer as usize).ok_or_else(|| {
                InputError::Config(format!(
                    "layer {layer} out of range ({} layers)",
                    views.len()
                ))
            })?;
            present.present(&self.gpu, surface, view, surface_width, surface_height)
        })();
        self.seal(result)
    }

    fn guard(&self) -> Result<()> {
        if self.poisoned {
            Err(DeviceError::Poisoned.into())
        } else {
            Ok(())
        }
    }

    /// Route a result through the poisoning and hook machinery.
    fn seal<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                self.poisoned = true;
                log::error!("instance poisoned: {err}");
            }
            if let Some(hook) = &self.error_hook {
                hook(err);
            }
        }
        result
    }
}

fn validate_image(
    image: &[u8],
    width: u32,
    height: u32,
    max_pixels: u32,
) -> Result<(), InputError> {
    if width == 0 || height == 0 {
        return Err(InputError::EmptyImage { width, height });
    }
    let pixels = width as u64 * height as u64;
    if pixels > max_pixels as u64 {
        return Err(InputError::ImageTooLarge {
            width,
            height,
            max: max_pixels,
        });
    }
    if image.len() as u64 != pixels {
        return Err(InputError::ImageLengthMismatch {
            len: image.len(),
            width,
            height,
        });
    }
    Ok(())
}

fn pop_error_scopes(gpu: &GpuDevice, stage: &'static str) -> Result<()> {
    let oom = pollster::block_on(gpu.device.pop_error_scope());
    let validation = pollster::block_on(gpu.device.pop_error_scope());
    if let Some(e) = oom.or(validation) {
        return Err(DeviceError::Gpu {
            stage,
            message: e.to_string(),
        }
        .into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
