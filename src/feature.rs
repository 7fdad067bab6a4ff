// feature.rs — host/device data contracts.
//
// `Feature` and `Match2Nn` are `#[repr(C)]` Pod structs shared verbatim
// with the WGSL kernels (descriptor stage writes Features in place, the
// matcher reads them). The descriptor layout — 4×4 spatial cells × 8
// orientation bins, one byte per bin — is the only cross-process contract
// of the engine and must stay byte-for-byte stable; the layout tests at
// the bottom pin it.

/// Spatial histogram cells per descriptor axis.
pub const DESCRIPTOR_NB_HIST: usize = 4;
/// Orientation bins per spatial cell.
pub const DESCRIPTOR_NB_ORI: usize = 8;
/// Total descriptor length in bytes: 4 × 4 × 8.
pub const DESCRIPTOR_SIZE: usize =
    DESCRIPTOR_NB_HIST * DESCRIPTOR_NB_HIST * DESCRIPTOR_NB_ORI;

/// One detected SIFT feature.
///
/// Immutable once written into a feature buffer; identified only by its
/// index within that buffer. Layout mirrors `SiftFeature` in
/// `shaders/descriptor.wgsl` field for field.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Feature {
    /// Keypoint position in input-image coordinates.
    pub x: f32,
    pub y: f32,
    /// Keypoint position in the pyramid image where it was detected.
    pub scale_x: f32,
    pub scale_y: f32,
    /// Index of the Gaussian scale image within its octave.
    pub scale_idx: u32,
    /// Octave index; −1 is the 2× upscaled seed image.
    pub octave_idx: i32,
    /// Blur level of the detection scale. Halved when upsampling was
    /// used, so values stay comparable across configurations.
    pub sigma: f32,
    /// Dominant gradient orientation in radians.
    pub orientation: f32,
    /// DoG response intensity at the detection point.
    pub intensity: f32,
    /// Quantized gradient-histogram descriptor.
    pub descriptor: [u8; DESCRIPTOR_SIZE],
}

impl Default for Feature {
    fn default() -> Self {
        Feature {
            x: 0.0,
            y: 0.0,
            scale_x: 0.0,
            scale_y: 0.0,
            scale_idx: 0,
            octave_idx: 0,
            sigma: 0.0,
            orientation: 0.0,
            intensity: 0.0,
            descriptor: [0u8; DESCRIPTOR_SIZE],
        }
    }
}

/// Two-nearest-neighbor match for one query feature, as produced by
/// [`crate::SiftInstance::match_features`]. Transient — callers usually
/// apply Lowe's ratio test (`dist_a_b1 / dist_a_b2 < 0.75`) and keep the
/// survivors.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Match2Nn {
    /// Feature index in the query buffer A.
    pub idx_a: u32,
    /// Nearest-neighbor index in the target buffer B.
    pub idx_b1: u32,
    /// Second-nearest-neighbor index in B.
    pub idx_b2: u32,
    /// L2 descriptor distance to the nearest neighbor.
    pub dist_a_b1: f32,
    /// L2 descriptor distance to the second-nearest neighbor.
    pub dist_a_b2: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of, size_of};

    // The wire contract: 36 bytes of metadata followed by the 128-byte
    // descriptor. Any change here breaks interoperability with other
    // SIFT-descriptor consumers.

    #[test]
    fn descriptor_is_128_bytes() {
        assert_eq!(DESCRIPTOR_SIZE, 128);
    }

    #[test]
    fn feature_layout_is_stable() {
        assert_eq!(size_of::<Feature>(), 164);
        assert_eq!(align_of::<Feature>(), 4);
        assert_eq!(offset_of!(Feature, x), 0);
        assert_eq!(offset_of!(Feature, y), 4);
        assert_eq!(offset_of!(Feature, scale_x), 8);
        assert_eq!(offset_of!(Feature, scale_y), 12);
        assert_eq!(offset_of!(Feature, scale_idx), 16);
        assert_eq!(offset_of!(Feature, octave_idx), 20);
        assert_eq!(offset_of!(Feature, sigma), 24);
        assert_eq!(offset_of!(Feature, orientation), 28);
        assert_eq!(offset_of!(Feature, intensity), 32);
        assert_eq!(offset_of!(Feature, descriptor), 36);
    }

    #[test]
    fn match_layout_is_stable() {
        assert_eq!(size_of::<Match2Nn>(), 20);
        assert_eq!(offset_of!(Match2Nn, idx_a), 0);
        assert_eq!(offset_of!(Match2Nn, dist_a_b2), 16);
    }

    #[test]
    fn feature_round_trips_through_bytes() {
        let mut f = Feature {
            x: 10.5,
            y: 20.25,
            scale_x: 21.0,
            scale_y: 40.5,
            scale_idx: 2,
            octave_idx: -1,
            sigma: 1.6,
            orientation: 0.7,
            intensity: 0.05,
            ..Feature::default()
        };
        for (i, b) in f.descriptor.iter_mut().enumerate() {
            *b = i as u8;
        }
        let bytes = bytemuck::bytes_of(&f).to_vec();
        assert_eq!(bytes.len(), 164);
        let back: Feature = *bytemuck::from_bytes(&bytes);
        assert_eq!(back, f);
    }
}
