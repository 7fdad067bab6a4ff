// gpu/buffers.rs — the device-resident feature buffer pool.
//
// The instance owns `sift_buffer_count` fixed-capacity GPU buffers of
// `max_nb_sift_per_buffer` feature records each, allocated up front and
// never resized. A buffer holds the result of the last operation that
// targeted it (detect or upload) — every write replaces the previous
// content entirely. Counts are tracked host-side: the GPU never needs
// them except as matcher parameters, and keeping them on the CPU makes
// `feature_count` free.
//
// A single shared readback buffer serves `download` for all buffers;
// instance methods take `&mut self`, so there is no concurrent use.

use crate::config::Config;
use crate::error::{DeviceError, InputError, Result};
use crate::feature::Feature;
use crate::gpu::device::GpuDevice;

pub struct FeatureBuffers {
    buffers: Vec<wgpu::Buffer>,
    counts: Vec<u32>,
    readback: wgpu::Buffer,
    capacity: u32,
}

impl FeatureBuffers {
    pub fn new(gpu: &GpuDevice, config: &Config) -> Self {
        let capacity = config.max_nb_sift_per_buffer;
        let size = (capacity as u64) * std::mem::size_of::<Feature>() as u64;
        let buffers = (0..config.sift_buffer_count)
            .map(|i| {
                gpu.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("feature buffer {i}")),
                    size,
                    usage: wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::COPY_DST
                        | wgpu::BufferUsages::COPY_SRC,
                    mapped_at_creation: false,
                })
            })
            .collect();
        let readback = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("feature readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        FeatureBuffers {
            buffers,
            counts: vec![0; config.sift_buffer_count as usize],
            readback,
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn buffer_count(&self) -> u32 {
        self.buffers.len() as u32
    }

    fn check_index(&self, index: u32) -> Result<usize, InputError> {
        if (index as usize) < self.buffers.len() {
            Ok(index as usize)
        } else {
            Err(InputError::BufferIndexOutOfRange {
                index,
                count: self.buffers.len() as u32,
            })
        }
    }

    /// Number of features currently stored in a buffer. Zero for a
    /// buffer no operation has targeted yet.
    pub fn count(&self, index: u32) -> Result<u32, InputError> {
        Ok(self.counts[self.check_index(index)?])
    }

    /// Raw handle for the descriptor and matcher bind groups.
    pub(crate) fn raw(&self, index: u32) -> Result<&wgpu::Buffer, InputError> {
        Ok(&self.buffers[self.check_index(index)?])
    }

    /// Replace a buffer's content with host-side feature records.
    /// Detect uses this to store metadata before the descriptor pass;
    /// `upload` is the same operation from the public API.
    pub fn write(
        &mut self,
        gpu: &GpuDevice,
        index: u32,
        features: &[Feature],
    ) -> Result<(), InputError> {
        let i = self.check_index(index)?;
        if features.len() > self.capacity as usize {
            return Err(InputError::UploadOverflow {
                len: features.len(),
                capacity: self.capacity,
            });
        }
        if !features.is_empty() {
            gpu.queue
                .write_buffer(&self.buffers[i], 0, bytemuck::cast_slice(features));
        }
        self.counts[i] = features.len() as u32;
        Ok(())
    }

    /// Copy a buffer's features back to the host. Synchronous; blocks on
    /// all GPU work submitted for this buffer.
    pub fn download(&self, gpu: &GpuDevice, index: u32) -> Result<Vec<Feature>> {
        let i = self.check_index(index)?;
        let count = self.counts[i] as usize;
        if count == 0 {
            return Ok(Vec::new());
        }
        let bytes = (count * std::mem::size_of::<Feature>()) as u64;

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("feature download"),
            });
        encoder.copy_buffer_to_buffer(&self.buffers[i], 0, &self.readback, 0, bytes);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = self.readback.slice(..bytes);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        gpu.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| DeviceError::MapFailed("readback channel closed".into()))?
            .map_err(|e| DeviceError::MapFailed(e.to_string()))?;

        let out = {
            let mapped = slice.get_mapped_range();
            bytemuck::cast_slice::<u8, Feature>(&mapped).to_vec()
        };
        self.readback.unmap();
        Ok(out)
    }
}

/// Capacity policy for a detect run that finds more features than a
/// buffer can hold: keep the strongest responses (largest |intensity|),
/// breaking ties in favor of the earlier feature, and preserve the
/// original order of the survivors so buffer content stays reproducible.
pub fn truncate_ranked(mut features: Vec<Feature>, capacity: usize) -> Vec<Feature> {
    if features.len() <= capacity {
        return features;
    }
    log::warn!(
        "detect found {} features, keeping the {capacity} strongest",
        features.len()
    );
    let mut order: Vec<usize> = (0..features.len()).collect();
    order.sort_unstable_by(|&a, &b| {
        features[b]
            .intensity
            .abs()
            .total_cmp(&features[a].intensity.abs())
            .then(a.cmp(&b))
    });
    order.truncate(capacity);
    order.sort_unstable();

    let mut keep = vec![false; features.len()];
    for &i in &order {
        keep[i] = true;
    }
    let mut i = 0;
    features.retain(|_| {
        let k = keep[i];
        i += 1;
        k
    });
    features
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feat(intensity: f32) -> Feature {
        Feature {
            intensity,
            ..Feature::default()
        }
    }

    #[test]
    fn truncate_keeps_everything_within_capacity() {
        let v = vec![feat(0.1), feat(0.2)];
        let out = truncate_ranked(v.clone(), 2);
        assert_eq!(out, v);
        let out = truncate_ranked(v.clone(), 10);
        assert_eq!(out, v);
    }

    #[test]
    fn truncate_keeps_strongest_responses() {
        let v = vec![feat(0.1), feat(0.5), feat(0.05), feat(-0.6), feat(0.3)];
        let out = truncate_ranked(v, 2);
        let responses: Vec<f32> = out.iter().map(|f| f.intensity).collect();
        // −0.6 and 0.5 are the strongest magnitudes, kept in original order.
        assert_eq!(responses, vec![0.5, -0.6]);
    }

    #[test]
    fn truncate_preserves_original_order_of_survivors() {
        let v = vec![feat(0.9), feat(0.1), feat(0.8), feat(0.2), feat(0.7)];
        let out = truncate_ranked(v, 3);
        let responses: Vec<f32> = out.iter().map(|f| f.intensity).collect();
        assert_eq!(responses, vec![0.9, 0.8, 0.7]);
    }

    #[test]
    fn truncate_breaks_ties_toward_earlier_features() {
        let mut a = feat(0.5);
        a.x = 1.0;
        let mut b = feat(0.5);
        b.x = 2.0;
        let mut c = feat(0.5);
        c.x = 3.0;
        let out = truncate_ranked(vec![a, b, c], 2);
        assert_eq!(out[0].x, 1.0);
        assert_eq!(out[1].x, 2.0);
    }
}
