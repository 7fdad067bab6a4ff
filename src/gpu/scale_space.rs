// gpu/scale_space.rs — GPU Gaussian scale-space and DoG pyramid.
//
// Layout: one `OctaveImages` per octave, each holding two R32Float
// texture arrays — `gauss` with nb_scales + 3 layers and `dog` with
// nb_scales + 2 layers — plus a single-layer scratch texture for the
// separable blur. Array textures keep the per-octave bind-group count
// constant: the extraction, orientation and descriptor kernels index
// layers by `scale_idx` instead of needing one bind group per scale.
//
// Construction per detect call:
//   seed pass     : u8 input → f32 [0,1], optional 2× bilinear upsample
//   pre-blur      : bring the seed to `seed_scale_sigma`
//   per scale s   : blur_h + blur_v with the incremental sigma delta
//   per pair      : dog = gauss[s+1] − gauss[s]
//   next octave   : downsample gauss[nb_scales] (the 2σ image) by 2
//
// All passes for one detect call are recorded into a single command
// encoder and submitted once.
//
// PRECISION:
// The configuration may request a Float16 pyramid. WGSL core has no
// 16-bit float storage texel format (`r16float` is not in the storage
// texel list), so compute passes cannot write half-precision textures;
// the request degrades to Float32 with a warning at instance creation.
//
// HARDWARE-INTERPOLATED BLUR:
// With FLOAT32_FILTERABLE granted, the blur uses the `*_lin` shader
// entry points: taps are fetched pairwise at fractional offsets through
// a linear sampler, halving the fetch count. Without the feature the
// plain textureLoad entry points run instead; results agree to within
// interpolation rounding.

use wgpu::util::DeviceExt;

use crate::config::Config;
use crate::gpu::device::GpuDevice;

/// Smallest octave dimension; halving stops before going below this.
const MIN_OCTAVE_DIM: u32 = 16;

/// Uniform coefficient slots for the largest supported blur kernel.
/// `Config::validate` rejects schedules that would exceed this, so the
/// packing in `StageParams::blur` never sees a larger kernel.
pub(crate) const MAX_KERNEL_COEFFS: usize = 32;

// ---------------------------------------------------------------------------
// Schedule (pure CPU)
// ---------------------------------------------------------------------------

/// The per-image pyramid plan: octave count and dimensions, per-scale
/// sigma values and the incremental blur deltas between them.
#[derive(Debug, Clone)]
pub struct PyramidSchedule {
    /// Seed image dimensions (after optional 2× upsampling).
    pub seed_width: u32,
    pub seed_height: u32,
    /// Number of octaves actually built.
    pub nb_octaves: u32,
    /// Sampled scales per octave (from the configuration).
    pub nb_scales: u32,
    /// Whether the seed is the 2× upscaled input.
    pub upsampled: bool,
    /// Seed blur level in octave-local pixel units.
    pub seed_sigma: f32,
    /// Sigma to apply to the raw seed image to reach `seed_sigma`.
    pub seed_delta: f32,
    /// Incremental blur between consecutive gauss layers,
    /// `blur_deltas[s]` taking layer s to layer s+1.
    pub blur_deltas: Vec<f32>,
}

impl PyramidSchedule {
    pub fn plan(config: &Config, width: u32, height: u32) -> Self {
        let upsampled = config.use_input_upsampling;
        let (seed_width, seed_height) = if upsampled {
            (width * 2, height * 2)
        } else {
            (width, height)
        };

        let derived = derived_octave_count(seed_width, seed_height);
        let nb_octaves = if config.nb_octaves == 0 {
            derived
        } else {
            (config.nb_octaves as u32).min(derived)
        };

        let nb_scales = config.nb_scales_per_octave as u32;
        let seed_sigma = config.seed_scale_sigma;

        // Blur already present in the seed: the assumed input blur,
        // doubled when the input was upscaled (pixels stretched 2×).
        let present = config.input_image_blur_level * if upsampled { 2.0 } else { 1.0 };
        let seed_delta = (seed_sigma * seed_sigma - present * present).sqrt();

        // sigma(s) = seed · 2^(s/n); each delta is the blur that takes
        // layer s to layer s+1 (Gaussian sigmas add in quadrature).
        let n = nb_scales as f32;
        let sigma_of = |s: f32| seed_sigma * (s / n).exp2();
        let blur_deltas = (0..gauss_layers(nb_scales) - 1)
            .map(|s| {
                let a = sigma_of(s as f32);
                let b = sigma_of(s as f32 + 1.0);
                (b * b - a * a).sqrt()
            })
            .collect();

        PyramidSchedule {
            seed_width,
            seed_height,
            nb_octaves,
            nb_scales,
            upsampled,
            seed_sigma,
            seed_delta,
            blur_deltas,
        }
    }

    /// Gauss layers per octave: the sampled scales, one below, two above.
    pub fn gauss_per_octave(&self) -> u32 {
        gauss_layers(self.nb_scales)
    }

    /// DoG layers per octave: one per adjacent gauss pair.
    pub fn dog_per_octave(&self) -> u32 {
        gauss_layers(self.nb_scales) - 1
    }

    /// Dimensions of one octave (array index, not reported index).
    pub fn octave_dims(&self, octave: u32) -> (u32, u32) {
        ((self.seed_width >> octave).max(1), (self.seed_height >> octave).max(1))
    }

    /// Reported octave index for an array index: the upscaled seed
    /// octave is −1, so downstream sigma values stay comparable whether
    /// or not upsampling ran.
    pub fn reported_octave(&self, octave: u32) -> i32 {
        octave as i32 - if self.upsampled { 1 } else { 0 }
    }

    /// Blur level within an octave at (possibly fractional) scale `s`,
    /// in that octave's pixel units.
    pub fn sigma_in_octave(&self, s: f32) -> f32 {
        self.seed_sigma * (s / self.nb_scales as f32).exp2()
    }

    /// Absolute blur level at a reported octave and fractional scale;
    /// halves automatically for the upscaled octave (index −1).
    pub fn sigma_absolute(&self, reported_octave: i32, s: f32) -> f32 {
        self.seed_sigma * (reported_octave as f32 + s / self.nb_scales as f32).exp2()
    }

    /// Factor from octave coordinates back to input-image coordinates.
    pub fn octave_to_input_scale(&self, octave: u32) -> f32 {
        let base = (octave as f32).exp2();
        if self.upsampled {
            base * 0.5
        } else {
            base
        }
    }
}

fn gauss_layers(nb_scales: u32) -> u32 {
    nb_scales + 3
}

/// Octaves available for a seed image: halve until the smaller dimension
/// would drop below `MIN_OCTAVE_DIM`. Always at least one.
pub fn derived_octave_count(seed_width: u32, seed_height: u32) -> u32 {
    let mut dim = seed_width.min(seed_height);
    let mut count = 1;
    while dim / 2 >= MIN_OCTAVE_DIM {
        dim /= 2;
        count += 1;
    }
    count
}

/// Half size of the kernel `gaussian_kernel_1d` builds for a sigma.
pub(crate) fn kernel_half(sigma: f32) -> usize {
    ((3.0 * sigma).ceil() as usize).max(1)
}

/// Half size of the largest blur kernel a configuration will schedule.
/// The deltas depend only on the sigma schedule, not on image size.
pub(crate) fn largest_scheduled_kernel_half(config: &Config) -> usize {
    let schedule = PyramidSchedule::plan(config, MIN_OCTAVE_DIM, MIN_OCTAVE_DIM);
    schedule
        .blur_deltas
        .iter()
        .chain(std::iter::once(&schedule.seed_delta))
        .map(|&sigma| kernel_half(sigma))
        .max()
        .unwrap_or(1)
}

/// Normalised 1D Gaussian kernel; length 2·half + 1 with
/// half = ceil(3σ), clamped to at least 1.
pub fn gaussian_kernel_1d(sigma: f32) -> Vec<f32> {
    let half = kernel_half(sigma);
    let len = 2 * half + 1;
    let mut k = vec![0.0f32; len];
    let two_sigma_sq = 2.0 * sigma * sigma;
    for i in 0..=half {
        let v = (-((i * i) as f32) / two_sigma_sq).exp();
        k[half - i] = v;
        k[half + i] = v;
    }
    let sum: f32 = k.iter().sum();
    for v in &mut k {
        *v /= sum;
    }
    k
}

// ---------------------------------------------------------------------------
// Uniform structs (must match scale_space.wgsl layouts)
// ---------------------------------------------------------------------------

/// The single uniform struct shared by every scale-space entry point
/// (the WGSL module has one binding set; see `scale_space.wgsl`).
/// `aux` is the upsample flag for the seed pass and the kernel half
/// size for the blur passes; `coeffs` holds the right half of the
/// symmetric blur kernel, `coeffs[i/4][i%4]` = weight at offset i.
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct StageParams {
    width: u32,
    height: u32,
    aux: u32,
    _pad: u32,
    coeffs: [[f32; 4]; 8],
}

impl StageParams {
    fn plain(width: u32, height: u32, aux: u32) -> Self {
        StageParams {
            width,
            height,
            aux,
            _pad: 0,
            coeffs: [[0.0; 4]; 8],
        }
    }

    fn blur(width: u32, height: u32, kernel: &[f32]) -> Self {
        assert!(kernel.len() % 2 == 1, "kernel must have odd length");
        let half = (kernel.len() - 1) / 2;
        assert!(
            half < MAX_KERNEL_COEFFS,
            "blur kernel half size {half} exceeds the uniform coefficient slots"
        );
        let mut params = StageParams::plain(width, height, half as u32);
        for (i, &c) in kernel[half..].iter().enumerate() {
            params.coeffs[i / 4][i % 4] = c;
        }
        params
    }
}

// ---------------------------------------------------------------------------
// GPU resources
// ---------------------------------------------------------------------------

/// Textures for one octave.
pub struct OctaveImages {
    pub width: u32,
    pub height: u32,
    gauss: wgpu::Texture,
    dog: wgpu::Texture,
    /// One D2 view per gauss layer, for sampling.
    pub gauss_views: Vec<wgpu::TextureView>,
    gauss_stores: Vec<wgpu::TextureView>,
    /// D2Array view over all gauss layers, bound by the orientation and
    /// descriptor kernels.
    pub gauss_array: wgpu::TextureView,
    pub dog_views: Vec<wgpu::TextureView>,
    dog_stores: Vec<wgpu::TextureView>,
    /// D2Array view over all DoG layers, bound by the extraction kernel.
    pub dog_array: wgpu::TextureView,
    scratch_view: wgpu::TextureView,
    scratch_store: wgpu::TextureView,
}

impl OctaveImages {
    fn new(device: &wgpu::Device, width: u32, height: u32, gauss_layers: u32, octave: u32) -> Self {
        let mk_array = |label: &str, layers: u32| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size: wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: layers,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::R32Float,
                usage: wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::STORAGE_BINDING
                    | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            })
        };

        let gauss_label = format!("gauss octave {octave}");
        let dog_label = format!("dog octave {octave}");
        let gauss = mk_array(&gauss_label, gauss_layers);
        let dog = mk_array(&dog_label, gauss_layers - 1);
        let scratch = mk_array("blur scratch", 1);

        let layer_view = |tex: &wgpu::Texture, layer: u32| {
            tex.create_view(&wgpu::TextureViewDescriptor {
                dimension: Some(wgpu::TextureViewDimension::D2),
                base_array_layer: layer,
                array_layer_count: Some(1),
                ..Default::default()
            })
        };
        let array_view = |tex: &wgpu::Texture| {
            tex.create_view(&wgpu::TextureViewDescriptor {
                dimension: Some(wgpu::TextureViewDimension::D2Array),
                ..Default::default()
            })
        };

        let gauss_views = (0..gauss_layers).map(|l| layer_view(&gauss, l)).collect();
        let gauss_stores = (0..gauss_layers).map(|l| layer_view(&gauss, l)).collect();
        let dog_views = (0..gauss_layers - 1).map(|l| layer_view(&dog, l)).collect();
        let dog_stores = (0..gauss_layers - 1).map(|l| layer_view(&dog, l)).collect();
        let gauss_array = array_view(&gauss);
        let dog_array = array_view(&dog);
        // The views keep the scratch texture alive; the handle itself is
        // not needed after construction.
        let scratch_view = layer_view(&scratch, 0);
        let scratch_store = layer_view(&scratch, 0);

        OctaveImages {
            width,
            height,
            gauss,
            dog,
            gauss_views,
            gauss_stores,
            gauss_array,
            dog_views,
            dog_stores,
            dog_array,
            scratch_view,
            scratch_store,
        }
    }
}

/// A built scale-space: the schedule plus the per-octave textures, all
/// device-resident. Valid for one detect call.
pub struct ScaleSpace {
    pub schedule: PyramidSchedule,
    pub octaves: Vec<OctaveImages>,
}

impl ScaleSpace {
    /// Read one image of the pyramid back to the CPU. Synchronous and
    /// expensive; tests and debug tooling only.
    pub fn readback(
        &self,
        gpu: &GpuDevice,
        octave: usize,
        layer: u32,
        dog: bool,
    ) -> Vec<f32> {
        let oct = &self.octaves[octave];
        let texture = if dog { &oct.dog } else { &oct.gauss };
        readback_layer_f32(gpu, texture, layer, oct.width, oct.height)
    }
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

/// Compiled scale-space pipelines. Created once per instance, reused for
/// every detect call.
pub struct ScaleSpacePipelines {
    seed: wgpu::ComputePipeline,
    seed_bgl: wgpu::BindGroupLayout,
    blur_h: wgpu::ComputePipeline,
    blur_v: wgpu::ComputePipeline,
    blur_bgl: wgpu::BindGroupLayout,
    blur_sampler: Option<wgpu::Sampler>,
    downsample: wgpu::ComputePipeline,
    downsample_bgl: wgpu::BindGroupLayout,
    dog: wgpu::ComputePipeline,
    dog_bgl: wgpu::BindGroupLayout,
    hw_interpolated: bool,
}

impl ScaleSpacePipelines {
    pub fn new(gpu: &GpuDevice) -> Self {
        let hw_interpolated = gpu.float32_filterable;

        let shader_src = include_str!("../shaders/scale_space.wgsl")
            .replace("{{WG_X}}", &gpu.workgroup_size.x.to_string())
            .replace("{{WG_Y}}", &gpu.workgroup_size.y.to_string());
        let shader = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("scale_space.wgsl"),
            source: wgpu::ShaderSource::Wgsl(shader_src.into()),
        });

        let tex_entry = |binding: u32, filterable: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Texture {
                multisampled: false,
                view_dimension: wgpu::TextureViewDimension::D2,
                sample_type: wgpu::TextureSampleType::Float { filterable },
            },
            count: None,
        };
        let store_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format: wgpu::TextureFormat::R32Float,
                view_dimension: wgpu::TextureViewDimension::D2,
            },
            count: None,
        };
        let uniform_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        // Seed: input u8 texture → f32 layer, manual bilinear when
        // upsampling (no sampler; four loads and a lerp).
        let seed_bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("seed BGL"),
            entries: &[tex_entry(0, false), store_entry(1), uniform_entry(2)],
        });

        // Blur: input layer, output layer, params; the linear variant
        // additionally binds a filtering sampler.
        let mut blur_entries = vec![tex_entry(0, hw_interpolated), store_entry(1), uniform_entry(2)];
        if hw_interpolated {
            blur_entries.push(wgpu::BindGroupLayoutEntry {
                binding: 3,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            });
        }
        let blur_bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("blur BGL"),
            entries: &blur_entries,
        });

        let downsample_bgl =
            gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("downsample BGL"),
                entries: &[tex_entry(0, false), store_entry(1), uniform_entry(2)],
            });

        // Binding 4 is the second input; the shader module reserves the
        // lower bindings for the shared output/params slots.
        let dog_bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("dog BGL"),
            entries: &[tex_entry(0, false), tex_entry(4, false), store_entry(1), uniform_entry(2)],
        });

        let make = |label: &str, entry: &str, bgl: &wgpu::BindGroupLayout| {
            let layout = gpu
                .device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(label),
                    bind_group_layouts: &[bgl],
                    push_constant_ranges: &[],
                });
            gpu.device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(label),
                    layout: Some(&layout),
                    module: &shader,
                    entry_point: entry,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    cache: None,
                })
        };

        let (blur_h_entry, blur_v_entry) = if hw_interpolated {
            ("blur_h_lin", "blur_v_lin")
        } else {
            ("blur_h", "blur_v")
        };

        let blur_sampler = hw_interpolated.then(|| {
            gpu.device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("blur sampler"),
                address_mode_u: wgpu::AddressMode::ClampToEdge,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                mag_filter: wgpu::FilterMode::Linear,
                min_filter: wgpu::FilterMode::Linear,
                ..Default::default()
            })
        });

        ScaleSpacePipelines {
            seed: make("seed", "seed", &seed_bgl),
            seed_bgl,
            blur_h: make("blur_h", blur_h_entry, &blur_bgl),
            blur_v: make("blur_v", blur_v_entry, &blur_bgl),
            blur_bgl,
            blur_sampler,
            downsample: make("downsample", "downsample", &downsample_bgl),
            downsample_bgl,
            dog: make("dog", "dog", &dog_bgl),
            dog_bgl,
            hw_interpolated,
        }
    }

    pub fn hw_interpolated(&self) -> bool {
        self.hw_interpolated
    }

    /// Build the scale-space for one grayscale image. Dimension checks
    /// happen in the instance controller before this is called.
    pub fn build(
        &self,
        gpu: &GpuDevice,
        image: &[u8],
        width: u32,
        height: u32,
        config: &Config,
    ) -> ScaleSpace {
        let schedule = PyramidSchedule::plan(config, width, height);
        let gauss_layers = schedule.gauss_per_octave();

        let octaves: Vec<OctaveImages> = (0..schedule.nb_octaves)
            .map(|o| {
                let (w, h) = schedule.octave_dims(o);
                OctaveImages::new(&gpu.device, w, h, gauss_layers, o)
            })
            .collect();

        let input_tex = upload_gray_u8(gpu, image, width, height);
        let input_view = input_tex.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("scale_space build"),
            });

        // Seed pass into gauss[0] of octave 0, then the pre-blur that
        // brings it up to seed_scale_sigma.
        self.run_seed(gpu, &mut encoder, &input_view, &octaves[0], &schedule);
        self.run_blur(gpu, &mut encoder, &octaves[0], 0, 0, schedule.seed_delta);

        for o in 0..octaves.len() {
            if o > 0 {
                self.run_downsample(gpu, &mut encoder, &octaves[o - 1], &octaves[o], schedule.nb_scales);
            }
            let oct = &octaves[o];
            for s in 1..gauss_layers {
                self.run_blur(gpu, &mut encoder, oct, s - 1, s, schedule.blur_deltas[(s - 1) as usize]);
            }
            for s in 0..schedule.dog_per_octave() {
                self.run_dog(gpu, &mut encoder, oct, s);
            }
        }

        gpu.queue.submit(std::iter::once(encoder.finish()));

        ScaleSpace { schedule, octaves }
    }

    fn run_seed(
        &self,
        gpu: &GpuDevice,
        encoder: &mut wgpu::CommandEncoder,
        input: &wgpu::TextureView,
        octave0: &OctaveImages,
        schedule: &PyramidSchedule,
    ) {
        let params = StageParams::plain(octave0.width, octave0.height, schedule.upsampled as u32);
        let params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("seed params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("seed BG"),
            layout: &self.seed_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(input),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&octave0.gauss_stores[0]),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buf.as_entire_binding(),
                },
            ],
        });
        self.dispatch(gpu, encoder, &self.seed, &bind, octave0.width, octave0.height, "seed");
    }

    /// Separable blur from gauss[src] to gauss[dst] through the scratch
    /// texture. `src == dst` is allowed (used by the seed pre-blur): the
    /// horizontal pass reads the layer before the vertical pass rewrites it.
    fn run_blur(
        &self,
        gpu: &GpuDevice,
        encoder: &mut wgpu::CommandEncoder,
        oct: &OctaveImages,
        src: u32,
        dst: u32,
        sigma: f32,
    ) {
        let kernel = gaussian_kernel_1d(sigma);
        let params = StageParams::blur(oct.width, oct.height, &kernel);
        let params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("blur params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let mk = |input: &wgpu::TextureView, output: &wgpu::TextureView, label| {
            let mut entries = vec![
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(input),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(output),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buf.as_entire_binding(),
                },
            ];
            if let Some(sampler) = &self.blur_sampler {
                entries.push(wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(sampler),
                });
            }
            gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &self.blur_bgl,
                entries: &entries,
            })
        };

        let bind_h = mk(&oct.gauss_views[src as usize], &oct.scratch_store, "blur_h BG");
        let bind_v = mk(&oct.scratch_view, &oct.gauss_stores[dst as usize], "blur_v BG");
        self.dispatch(gpu, encoder, &self.blur_h, &bind_h, oct.width, oct.height, "blur_h");
        self.dispatch(gpu, encoder, &self.blur_v, &bind_v, oct.width, oct.height, "blur_v");
    }

    /// Halve gauss[nb_scales] of `prev` into gauss[0] of `next`. The
    /// source layer sits exactly one doubling above the octave seed, so
    /// the downsampled image lands at seed sigma in the new octave.
    fn run_downsample(
        &self,
        gpu: &GpuDevice,
        encoder: &mut wgpu::CommandEncoder,
        prev: &OctaveImages,
        next: &OctaveImages,
        nb_scales: u32,
    ) {
        let params = StageParams::plain(next.width, next.height, 0);
        let params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("downsample params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("downsample BG"),
            layout: &self.downsample_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(
                        &prev.gauss_views[nb_scales as usize],
                    ),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&next.gauss_stores[0]),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buf.as_entire_binding(),
                },
            ],
        });
        self.dispatch(gpu, encoder, &self.downsample, &bind, next.width, next.height, "downsample");
    }

    fn run_dog(
        &self,
        gpu: &GpuDevice,
        encoder: &mut wgpu::CommandEncoder,
        oct: &OctaveImages,
        s: u32,
    ) {
        let params = StageParams::plain(oct.width, oct.height, 0);
        let params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("dog params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("dog BG"),
            layout: &self.dog_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&oct.gauss_views[s as usize]),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::TextureView(&oct.gauss_views[s as usize + 1]),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&oct.dog_stores[s as usize]),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buf.as_entire_binding(),
                },
            ],
        });
        self.dispatch(gpu, encoder, &self.dog, &bind, oct.width, oct.height, "dog");
    }

    fn dispatch(
        &self,
        gpu: &GpuDevice,
        encoder: &mut wgpu::CommandEncoder,
        pipeline: &wgpu::ComputePipeline,
        bind: &wgpu::BindGroup,
        width: u32,
        height: u32,
        label: &str,
    ) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, bind, &[]);
        let (dx, dy) = gpu.dispatch_size(width, height);
        pass.dispatch_workgroups(dx, dy, 1);
    }
}

// ---------------------------------------------------------------------------
// Upload / readback helpers
// ---------------------------------------------------------------------------

/// Round `value` up to the next multiple of `alignment`.
#[inline]
pub(crate) fn align_to(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) / alignment * alignment
}

/// Upload a tightly-packed grayscale image as an R8Unorm texture,
/// padding rows to wgpu's 256-byte copy alignment in a staging buffer.
fn upload_gray_u8(gpu: &GpuDevice, image: &[u8], width: u32, height: u32) -> wgpu::Texture {
    let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
        label: Some("input image"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::R8Unorm,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });

    let aligned = align_to(width, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
    let mut staging = vec![0u8; (aligned * height) as usize];
    for y in 0..height as usize {
        let src = y * width as usize;
        let dst = y * aligned as usize;
        staging[dst..dst + width as usize].copy_from_slice(&image[src..src + width as usize]);
    }
    let staging_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("input staging"),
        contents: &staging,
        usage: wgpu::BufferUsages::COPY_SRC,
    });

    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("input upload"),
        });
    encoder.copy_buffer_to_texture(
        wgpu::ImageCopyBuffer {
            buffer: &staging_buf,
            layout: wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(aligned),
                rows_per_image: Some(height),
            },
        },
        wgpu::ImageCopyTexture {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
    gpu.queue.submit(std::iter::once(encoder.finish()));
    texture
}

/// Read one R32Float array layer back to the CPU, stripping row padding.
fn readback_layer_f32(
    gpu: &GpuDevice,
    texture: &wgpu::Texture,
    layer: u32,
    width: u32,
    height: u32,
) -> Vec<f32> {
    let aligned = align_to(width * 4, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
    let readback = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("layer readback"),
        size: (aligned * height) as u64,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("layer readback"),
        });
    encoder.copy_texture_to_buffer(
        wgpu::ImageCopyTexture {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d { x: 0, y: 0, z: layer },
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::ImageCopyBuffer {
            buffer: &readback,
            layout: wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(aligned),
                rows_per_image: Some(height),
            },
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
    gpu.queue.submit(std::iter::once(encoder.finish()));

    let slice = readback.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        let _ = tx.send(r);
    });
    gpu.device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .expect("readback channel closed")
        .expect("readback map failed");

    let mapped = slice.get_mapped_range();
    let mut out = vec![0.0f32; (width * height) as usize];
    for y in 0..height as usize {
        let src = y * aligned as usize;
        let row: &[f32] = bytemuck::cast_slice(&mapped[src..src + width as usize * 4]);
        out[y * width as usize..(y + 1) * width as usize].copy_from_slice(row);
    }
    drop(mapped);
    readback.unmap();
    out
}

// ---------------------------------------------------------------------------
// Tests (pure CPU — GPU coverage lives in instance.rs behind #[ignore])
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn octave_count_halves_down_to_minimum() {
        // 1080 → 540 → 270 → 135 → 67 → 33 → 16: seven octaves.
        assert_eq!(derived_octave_count(1920, 1080), 7);
        // Upsampled full HD gains one octave.
        assert_eq!(derived_octave_count(3840, 2160), 8);
        assert_eq!(derived_octave_count(16, 16), 1);
        assert_eq!(derived_octave_count(31, 31), 1);
        assert_eq!(derived_octave_count(32, 32), 2);
        assert_eq!(derived_octave_count(1, 1), 1);
    }

    #[test]
    fn plan_uses_configured_octaves_but_clamps_to_resolution() {
        let cfg = Config::builder()
            .nb_octaves(3)
            .use_input_upsampling(false)
            .build()
            .unwrap();
        let plan = PyramidSchedule::plan(&cfg, 640, 480);
        assert_eq!(plan.nb_octaves, 3);

        let plan = PyramidSchedule::plan(&cfg, 40, 40);
        // 40 → 20: only two octaves available.
        assert_eq!(plan.nb_octaves, 2);
    }

    #[test]
    fn plan_doubles_seed_when_upsampling() {
        let cfg = Config::default();
        let plan = PyramidSchedule::plan(&cfg, 640, 480);
        assert!(plan.upsampled);
        assert_eq!((plan.seed_width, plan.seed_height), (1280, 960));
        assert_eq!(plan.reported_octave(0), -1);
        assert_eq!(plan.reported_octave(1), 0);

        let cfg = Config::builder().use_input_upsampling(false).build().unwrap();
        let plan = PyramidSchedule::plan(&cfg, 640, 480);
        assert_eq!((plan.seed_width, plan.seed_height), (640, 480));
        assert_eq!(plan.reported_octave(0), 0);
    }

    #[test]
    fn layer_counts_follow_scale_count() {
        let cfg = Config::default(); // 3 scales per octave
        let plan = PyramidSchedule::plan(&cfg, 640, 480);
        assert_eq!(plan.gauss_per_octave(), 6);
        assert_eq!(plan.dog_per_octave(), 5);
    }

    #[test]
    fn sigma_schedule_doubles_per_octave() {
        let cfg = Config::builder().use_input_upsampling(false).build().unwrap();
        let plan = PyramidSchedule::plan(&cfg, 640, 480);
        // In-octave sigma at scale n equals twice the seed sigma.
        let n = plan.nb_scales as f32;
        assert!((plan.sigma_in_octave(n) - 2.0 * plan.seed_sigma).abs() < 1e-5);
        // Absolute sigma doubles across one octave at fixed scale.
        let a = plan.sigma_absolute(0, 1.0);
        let b = plan.sigma_absolute(1, 1.0);
        assert!((b / a - 2.0).abs() < 1e-5);
    }

    #[test]
    fn upsampled_octave_reports_halved_sigma() {
        let cfg = Config::default();
        let plan = PyramidSchedule::plan(&cfg, 640, 480);
        // Reported octave −1 halves the absolute sigma relative to octave 0.
        let up = plan.sigma_absolute(-1, 0.0);
        let base = plan.sigma_absolute(0, 0.0);
        assert!((base / up - 2.0).abs() < 1e-5);
        assert!((base - plan.seed_sigma).abs() < 1e-6);
    }

    #[test]
    fn blur_deltas_compose_to_schedule_sigmas() {
        let cfg = Config::builder().use_input_upsampling(false).build().unwrap();
        let plan = PyramidSchedule::plan(&cfg, 640, 480);
        // Accumulating deltas in quadrature from the seed must land on
        // the scheduled sigma of every layer.
        let mut acc = plan.seed_sigma;
        for (s, d) in plan.blur_deltas.iter().enumerate() {
            acc = (acc * acc + d * d).sqrt();
            let expected = plan.sigma_in_octave(s as f32 + 1.0);
            assert!(
                (acc - expected).abs() < 1e-4,
                "layer {}: accumulated {acc}, scheduled {expected}",
                s + 1
            );
        }
    }

    #[test]
    fn seed_delta_accounts_for_input_blur() {
        let cfg = Config::builder().use_input_upsampling(false).build().unwrap();
        let plan = PyramidSchedule::plan(&cfg, 640, 480);
        // sqrt(1.6² − 0.5²)
        let expected = (1.6f32 * 1.6 - 0.25).sqrt();
        assert!((plan.seed_delta - expected).abs() < 1e-6);

        let cfg = Config::default(); // upsampling on: input blur doubles
        let plan = PyramidSchedule::plan(&cfg, 640, 480);
        let expected = (1.6f32 * 1.6 - 1.0).sqrt();
        assert!((plan.seed_delta - expected).abs() < 1e-6);
    }

    #[test]
    fn octave_to_input_scale_round_trips_positions() {
        let cfg = Config::default();
        let plan = PyramidSchedule::plan(&cfg, 640, 480);
        // Octave 0 is the 2× upscale: pyramid x=100 is input x=50.
        assert_eq!(plan.octave_to_input_scale(0), 0.5);
        assert_eq!(plan.octave_to_input_scale(1), 1.0);
        assert_eq!(plan.octave_to_input_scale(2), 2.0);
    }

    #[test]
    fn gaussian_kernel_normalised_and_symmetric() {
        for sigma in [0.8f32, 1.25, 2.0, 3.1] {
            let k = gaussian_kernel_1d(sigma);
            assert_eq!(k.len() % 2, 1);
            let sum: f32 = k.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "sigma {sigma}: sum {sum}");
            for i in 0..k.len() / 2 {
                assert!((k[i] - k[k.len() - 1 - i]).abs() < 1e-7);
            }
            let mid = k.len() / 2;
            assert!(k[mid] >= k[mid + 1]);
        }
    }

    #[test]
    fn blur_params_pack_right_half() {
        let k = gaussian_kernel_1d(1.0); // half = 3, 7 taps
        assert_eq!(k.len(), 7);
        let p = StageParams::blur(320, 240, &k);
        assert_eq!(p.aux, 3);
        assert_eq!(p.coeffs[0][0], k[3]);
        assert_eq!(p.coeffs[0][3], k[6]);
        assert_eq!(std::mem::size_of::<StageParams>(), 144);
    }

    #[test]
    fn largest_scheduled_blur_fits_coefficient_slots() {
        // The biggest kernel the schedule can produce is the last delta
        // at 8 scales per octave; make sure it fits the uniform array.
        let cfg = Config::builder()
            .nb_scales_per_octave(8)
            .build()
            .unwrap();
        let plan = PyramidSchedule::plan(&cfg, 640, 480);
        let biggest = plan
            .blur_deltas
            .iter()
            .cloned()
            .fold(plan.seed_delta, f32::max);
        let k = gaussian_kernel_1d(biggest);
        assert!((k.len() - 1) / 2 < MAX_KERNEL_COEFFS);
    }

    #[test]
    fn align_to_rounds_up() {
        assert_eq!(align_to(0, 256), 0);
        assert_eq!(align_to(1, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(257, 256), 512);
        assert_eq!(align_to(641, 256), 768);
    }
}
