// gpu/present.rs — debug presentation of pyramid images.
//
// Profiling aid, compiled into the instance only when the configuration
// enables it: blits one scale-space image (Gaussian or DoG, any octave
// and layer) to a caller-supplied surface as grayscale, using a
// fullscreen-triangle render pass. The fragment shader nearest-samples
// via textureLoad, so no sampler or filterable-float feature is needed.
//
// The surface is reconfigured on every present; at debug frame rates
// that costs nothing and spares the instance from tracking resizes. The
// target format comes from the surface capabilities, so the render
// pipeline is built lazily and rebuilt if a new surface negotiates a
// different format.

use wgpu::util::DeviceExt;

use crate::error::{DeviceError, Result};
use crate::gpu::device::GpuDevice;

/// Pick a target format from what the surface supports: the common
/// Vulkan presentation format first, then any sRGB format, then
/// whatever the surface lists first.
fn pick_surface_format(formats: &[wgpu::TextureFormat]) -> Option<wgpu::TextureFormat> {
    formats
        .iter()
        .copied()
        .find(|f| *f == wgpu::TextureFormat::Bgra8UnormSrgb)
        .or_else(|| formats.iter().copied().find(|f| f.is_srgb()))
        .or_else(|| formats.first().copied())
}

pub struct PresentStage {
    shader: wgpu::ShaderModule,
    layout: wgpu::PipelineLayout,
    bgl: wgpu::BindGroupLayout,
    /// Built on first present, keyed by the negotiated surface format.
    pipeline: Option<(wgpu::TextureFormat, wgpu::RenderPipeline)>,
}

impl PresentStage {
    pub fn new(gpu: &GpuDevice) -> Self {
        let shader = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("present.wgsl"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/present.wgsl").into()),
        });

        let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("present BGL"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    },
                    count: None,
                },
                // Surface dimensions, for the source-to-target mapping.
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let layout = gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("present"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });

        PresentStage {
            shader,
            layout,
            bgl,
            pipeline: None,
        }
    }

    fn ensure_pipeline(&mut self, gpu: &GpuDevice, format: wgpu::TextureFormat) {
        let stale = !matches!(&self.pipeline, Some((f, _)) if *f == format);
        if stale {
            let pipeline = gpu
                .device
                .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some("present"),
                    layout: Some(&self.layout),
                    vertex: wgpu::VertexState {
                        module: &self.shader,
                        entry_point: "vs_fullscreen",
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                        buffers: &[],
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: &self.shader,
                        entry_point: "fs_gray",
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                        targets: &[Some(wgpu::ColorTargetState {
                            format,
                            blend: None,
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                    }),
                    primitive: wgpu::PrimitiveState::default(),
                    depth_stencil: None,
                    multisample: wgpu::MultisampleState::default(),
                    multiview: None,
                    cache: None,
                });
            self.pipeline = Some((format, pipeline));
        }
    }

    /// Render one pyramid image view to the surface.
    pub fn present(
        &mut self,
        gpu: &GpuDevice,
        surface: &wgpu::Surface<'_>,
        source: &wgpu::TextureView,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let caps = surface.get_capabilities(&gpu.adapter);
        let format = pick_surface_format(&caps.formats).ok_or_else(|| {
            DeviceError::Surface("surface reports no supported formats".into())
        })?;

        surface.configure(
            &gpu.device,
            &wgpu::SurfaceConfiguration {
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                format,
                width,
                height,
                present_mode: wgpu::PresentMode::Fifo,
                desired_maximum_frame_latency: 2,
                alpha_mode: wgpu::CompositeAlphaMode::Auto,
                view_formats: vec![],
            },
        );
        self.ensure_pipeline(gpu, format);
        let pipeline = match &self.pipeline {
            Some((_, pipeline)) => pipeline,
            None => unreachable!("ensure_pipeline always populates the slot"),
        };
        let frame = surface
            .get_current_texture()
            .map_err(|e| DeviceError::Surface(e.to_string()))?;
        let target = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let dims = [width, height, 0u32, 0u32];
        let dims_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("present dims"),
            contents: bytemuck::cast_slice(&dims),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("present BG"),
            layout: &self.bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(source),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: dims_buf.as_entire_binding(),
                },
            ],
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("present"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("present"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind, &[]);
            pass.draw(0..3, 0..1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
        frame.present();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_format_prefers_bgra_srgb() {
        use wgpu::TextureFormat::*;
        assert_eq!(
            pick_surface_format(&[Rgba8Unorm, Bgra8UnormSrgb, Rgba8UnormSrgb]),
            Some(Bgra8UnormSrgb)
        );
        // No BGRA sRGB: any sRGB format beats a linear one.
        assert_eq!(
            pick_surface_format(&[Rgba8Unorm, Rgba8UnormSrgb]),
            Some(Rgba8UnormSrgb)
        );
        // Linear-only surface: take what it offers.
        assert_eq!(pick_surface_format(&[Rgba8Unorm]), Some(Rgba8Unorm));
        assert_eq!(pick_surface_format(&[]), None);
    }
}
