// gpu/device.rs — driver handle, adapter selection, device context.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` uses power-preference heuristics that
// may grab llvmpipe/softpipe on headless machines (where the software
// renderer appears as a valid Vulkan device). We enumerate explicitly,
// score the adapters ourselves and reject DeviceType::Cpu unless the
// configuration opts in.
//
// DRIVER LIFETIME:
// `Driver` wraps the process-wide `wgpu::Instance` in an `Arc`; every
// `GpuDevice` holds a reference. Load the driver once before creating
// engine instances; the Vulkan instance handle then outlives
// device-level objects even if the caller drops the `Driver` early.
// (Destroying the Vulkan instance while devices hold back-references
// crashes some layered drivers.)

use std::fmt;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{DeviceError, Error, InputError, Result};

/// Process-wide handle to the GPU driver API.
///
/// Cheap to clone; create exactly one per process.
#[derive(Clone)]
pub struct Driver {
    instance: Arc<wgpu::Instance>,
}

impl Driver {
    /// Load the underlying driver API (Vulkan backend only — no DX12,
    /// no Metal, no WebGPU). Never fails on its own: adapter availability
    /// is checked at instance creation, where the error can name the
    /// configuration that was rejected.
    pub fn load() -> Self {
        // Non-conformant adapters (dzn on WSL2, early drivers on ARM
        // boards) are enumerated anyway; the scoring below decides.
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            flags,
            ..Default::default()
        });

        log::debug!("driver API loaded (Vulkan backend)");
        Driver {
            instance: Arc::new(instance),
        }
    }

    /// Ordered list of available GPU names. Pure query, no side effects;
    /// the position of a name is the `gpu_device_index` that selects it.
    pub fn available_gpus(&self) -> Vec<String> {
        self.instance
            .enumerate_adapters(wgpu::Backends::VULKAN)
            .into_iter()
            .map(|a| a.get_info().name)
            .collect()
    }

    pub(crate) fn raw(&self) -> &wgpu::Instance {
        &self.instance
    }

    pub(crate) fn shared(&self) -> Arc<wgpu::Instance> {
        Arc::clone(&self.instance)
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver").finish_non_exhaustive()
    }
}

/// Cached adapter information for logging and debugging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// A workgroup size for 2D compute dispatches. Baked into the WGSL
/// sources via the `{{WG_X}}`/`{{WG_Y}}` tokens before compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    /// 8×8 = 64 invocations: small enough for embedded Vulkan
    /// implementations (VideoCore caps at 256), large enough to keep
    /// desktop GPUs busy across many workgroups.
    pub const DEFAULT: WorkgroupSize = WorkgroupSize { x: 8, y: 8 };

    pub fn total(&self) -> u32 {
        self.x * self.y
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

/// The GPU context owned by one engine instance: device, queue, adapter
/// metadata and the workgroup configuration shared by all pipelines.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    /// Kept for surface capability queries (debug presentation).
    pub(crate) adapter: wgpu::Adapter,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    /// True when FLOAT32_FILTERABLE was granted, enabling the
    /// hardware-interpolated blur fast path on r32float textures.
    pub float32_filterable: bool,
    /// Keeps the `wgpu::Instance` alive until `device` and `queue` are
    /// dropped. Never accessed directly.
    _instance: Arc<wgpu::Instance>,
}

impl GpuDevice {
    /// Select and open a device according to the configuration: explicit
    /// `gpu_device_index`, or the best-scoring adapter with CPU adapters
    /// excluded unless `allow_cpu_device` is set.
    pub fn select(driver: &Driver, config: &Config) -> Result<Self> {
        pollster::block_on(Self::select_async(driver, config))
    }

    async fn select_async(driver: &Driver, config: &Config) -> Result<Self> {
        let adapters: Vec<wgpu::Adapter> = driver
            .raw()
            .enumerate_adapters(wgpu::Backends::VULKAN)
            .into_iter()
            .collect();

        for a in &adapters {
            let info = a.get_info();
            log::debug!(
                "adapter: {} ({:?}, {:?})",
                info.name,
                info.backend,
                info.device_type
            );
        }

        let adapter = if config.gpu_device_index >= 0 {
            let index = config.gpu_device_index as usize;
            if index >= adapters.len() {
                return Err(Error::InvalidInput(InputError::DeviceIndexOutOfRange {
                    index: config.gpu_device_index,
                    available: adapters.len(),
                }));
            }
            adapters.into_iter().nth(index).expect("index checked above")
        } else {
            adapters
                .into_iter()
                .filter(|a| {
                    config.allow_cpu_device
                        || a.get_info().device_type != wgpu::DeviceType::Cpu
                })
                .max_by_key(|a| adapter_score(&a.get_info()))
                .ok_or(Error::Device(DeviceError::NoSuitableAdapter {
                    allow_cpu: config.allow_cpu_device,
                }))?
        };

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };
        log::info!("selected adapter: {adapter_info}");

        // The blur fast path samples r32float with a linear filter, which
        // needs FLOAT32_FILTERABLE. Request it when available; the
        // scale-space builder falls back to the textureLoad path when not.
        let want_filterable = config.use_hardware_interpolated_blur;
        let have_filterable = adapter
            .features()
            .contains(wgpu::Features::FLOAT32_FILTERABLE);
        if want_filterable && !have_filterable {
            log::warn!(
                "adapter {} lacks FLOAT32_FILTERABLE; falling back to \
                 software-interpolated blur",
                adapter_info.name
            );
        }
        let required_features = if want_filterable && have_filterable {
            wgpu::Features::FLOAT32_FILTERABLE
        } else {
            wgpu::Features::empty()
        };

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("wgsift"),
                    required_features,
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(DeviceError::Request)
            .map_err(Error::Device)?;

        Ok(GpuDevice {
            device,
            queue,
            adapter,
            adapter_info,
            workgroup_size: WorkgroupSize::DEFAULT,
            float32_filterable: want_filterable && have_filterable,
            _instance: driver.shared(),
        })
    }

    /// Workgroup counts covering an image of the given size, with ceiling
    /// division so edge pixels are covered. Shaders guard against
    /// out-of-bounds global IDs.
    pub fn dispatch_size(&self, img_w: u32, img_h: u32) -> (u32, u32) {
        let dx = (img_w + self.workgroup_size.x - 1) / self.workgroup_size.x;
        let dy = (img_h + self.workgroup_size.y - 1) / self.workgroup_size.y;
        (dx, dy)
    }

    /// Block until all submitted GPU work has completed.
    pub fn wait_idle(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, workgroup: {} }}",
            self.adapter_info, self.workgroup_size
        )
    }
}

/// Score an adapter class for auto selection; distinct classes never tie.
fn adapter_score(info: &wgpu::AdapterInfo) -> u32 {
    match info.device_type {
        wgpu::DeviceType::DiscreteGpu => 4,
        wgpu::DeviceType::IntegratedGpu => 3,
        wgpu::DeviceType::VirtualGpu => 2,
        wgpu::DeviceType::Other => 1,
        wgpu::DeviceType::Cpu => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests that need an actual GPU follow the crate convention: they are
    // `#[ignore]`d so `cargo test` passes in CI without Vulkan, and run
    // through the subprocess wrappers in instance.rs.

    #[test]
    fn driver_clones_share_one_instance() {
        // Instance creation needs no adapter, so this runs GPU-less.
        let driver = Driver::load();
        let clone = driver.clone();
        assert!(std::ptr::eq(driver.raw(), clone.raw()));
    }

    #[test]
    fn workgroup_default_fits_embedded_limits() {
        assert!(WorkgroupSize::DEFAULT.total() <= 256);
    }

    #[test]
    fn adapter_scores_are_strictly_ordered() {
        let mk = |device_type| wgpu::AdapterInfo {
            name: String::new(),
            vendor: 0,
            device: 0,
            device_type,
            driver: String::new(),
            driver_info: String::new(),
            backend: wgpu::Backend::Vulkan,
        };
        let discrete = adapter_score(&mk(wgpu::DeviceType::DiscreteGpu));
        let integrated = adapter_score(&mk(wgpu::DeviceType::IntegratedGpu));
        let virt = adapter_score(&mk(wgpu::DeviceType::VirtualGpu));
        let other = adapter_score(&mk(wgpu::DeviceType::Other));
        let cpu = adapter_score(&mk(wgpu::DeviceType::Cpu));
        assert!(discrete > integrated);
        assert!(integrated > virt);
        assert!(virt > other);
        assert!(other > cpu);
    }

    #[test]
    fn dispatch_size_uses_ceiling_division() {
        let ws = WorkgroupSize::DEFAULT;
        let ceil = |v: u32, d: u32| (v + d - 1) / d;
        // 100 is not a multiple of 8: the last workgroup covers the edge.
        assert_eq!(ceil(100, ws.x), 13);
        assert_eq!(ceil(640, ws.x), 80);
    }
}
