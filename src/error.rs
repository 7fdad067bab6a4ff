// error.rs — two-severity error model.
//
// Every fallible public operation returns `Result<T, Error>`. The two
// variants carry a hard contract:
//
//   Error::InvalidInput — the call was rejected without touching any
//     observable instance state (feature buffers, counts); the instance
//     remains usable.
//
//   Error::Device — the GPU or driver layer failed (allocation failure,
//     device loss, map failure). The instance is poisoned: every further
//     call short-circuits with `DeviceError::Poisoned` and the instance
//     must be dropped.
//
// Embedders that want a callback instead of checking results can install
// an `ErrorHook` on the instance; it is invoked synchronously with every
// error before it is returned.

use thiserror::Error;

/// Recoverable errors caused by caller input. The instance is unaffected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InputError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("buffer index {index} out of range (instance has {count} buffers)")]
    BufferIndexOutOfRange { index: u32, count: u32 },
    #[error("image {width}x{height} exceeds the configured maximum of {max} pixels")]
    ImageTooLarge { width: u32, height: u32, max: u32 },
    #[error("image dimensions must be nonzero (got {width}x{height})")]
    EmptyImage { width: u32, height: u32 },
    #[error("image byte length {len} does not match {width}x{height}")]
    ImageLengthMismatch { len: usize, width: u32, height: u32 },
    #[error("{len} features exceed the per-buffer capacity of {capacity}")]
    UploadOverflow { len: usize, capacity: u32 },
    #[error(
        "extraction found {found} raw keypoints, more than the {capacity} \
         candidate slots; raise max_nb_sift_per_buffer or the thresholds"
    )]
    CandidateOverflow { found: u32, capacity: u32 },
    #[error("GPU device index {index} out of range ({available} devices available)")]
    DeviceIndexOutOfRange { index: i32, available: usize },
    #[error("debug presentation is disabled in the configuration")]
    DebugPresentationDisabled,
}

/// Fatal errors from the GPU/driver layer. The instance must be destroyed.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no suitable GPU adapter found (allow_cpu_device = {allow_cpu})")]
    NoSuitableAdapter { allow_cpu: bool },
    #[error("device request failed: {0}")]
    Request(#[from] wgpu::RequestDeviceError),
    #[error("GPU error during {stage}: {message}")]
    Gpu { stage: &'static str, message: String },
    #[error("buffer readback failed: {0}")]
    MapFailed(String),
    #[error("debug surface error: {0}")]
    Surface(String),
    #[error("instance was poisoned by a previous device error and must be destroyed")]
    Poisoned,
}

/// The error type of every fallible `wgsift` operation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(#[from] InputError),
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

impl Error {
    /// True for device errors: the instance is invalid and no further
    /// calls are safe besides dropping it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Device(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Optional error adapter invoked synchronously with every error an
/// instance produces, before the `Result` is returned to the caller.
/// Lets embedding code translate errors into its own exception idiom.
pub type ErrorHook = Box<dyn Fn(&Error) + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_errors_are_recoverable() {
        let err = Error::from(InputError::BufferIndexOutOfRange { index: 3, count: 2 });
        assert!(!err.is_fatal());
    }

    #[test]
    fn device_errors_are_fatal() {
        let err = Error::from(DeviceError::Poisoned);
        assert!(err.is_fatal());
        let err = Error::from(DeviceError::Gpu {
            stage: "detect",
            message: "out of memory".into(),
        });
        assert!(err.is_fatal());
    }

    #[test]
    fn messages_name_the_offending_values() {
        let msg = Error::from(InputError::BufferIndexOutOfRange { index: 7, count: 2 })
            .to_string();
        assert!(msg.contains('7') && msg.contains('2'), "{msg}");

        let msg = Error::from(InputError::ImageTooLarge {
            width: 4000,
            height: 3000,
            max: 1920 * 1080,
        })
        .to_string();
        assert!(msg.contains("4000x3000") && msg.contains("2073600"), "{msg}");
    }
}
