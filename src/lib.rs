//! GPU-accelerated SIFT feature detection and matching on wgpu/Vulkan.
//!
//! The engine builds a Gaussian scale-space and DoG pyramid on the GPU,
//! extracts keypoints with sub-pixel refinement, assigns orientations,
//! computes 128-byte descriptors, and stores the results in a set of
//! fixed-capacity device-resident feature buffers that can be matched
//! against each other (brute-force 2-NN) without leaving the GPU.
//!
//! ```no_run
//! use wgsift::{Config, Driver, SiftInstance};
//!
//! let driver = Driver::load();
//! let mut sift = SiftInstance::new(&driver, Config::default())?;
//!
//! # let (img_a, img_b) = (vec![0u8; 640 * 480], vec![0u8; 640 * 480]);
//! sift.detect_features(&img_a, 640, 480, 0)?;
//! sift.detect_features(&img_b, 640, 480, 1)?;
//! let matches = sift.match_features(0, 1)?;
//! for m in matches.iter().filter(|m| m.dist_a_b1 < 0.75 * m.dist_a_b2) {
//!     println!("{} -> {}", m.idx_a, m.idx_b1);
//! }
//! # Ok::<(), wgsift::Error>(())
//! ```
//!
//! Detection output is deterministic: the same image, configuration and
//! driver produce bitwise-identical feature buffers on every run.

pub mod config;
pub mod error;
pub mod feature;
pub mod gpu;
pub mod instance;

pub use config::{Config, ConfigBuilder, DescriptorFormat, PyramidPrecision};
pub use error::{DeviceError, Error, ErrorHook, InputError, Result};
pub use feature::{Feature, Match2Nn, DESCRIPTOR_SIZE};
pub use gpu::device::Driver;
pub use instance::SiftInstance;

/// Verbosity of the crate's own diagnostics on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    None,
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn filter(self) -> log::LevelFilter {
        match self {
            LogLevel::None => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
        }
    }
}

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        // Only this crate's records; wgpu's own logging stays with
        // whatever logger the application installed.
        if self.enabled(record.metadata()) && record.target().starts_with("wgsift") {
            eprintln!("[wgsift {}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static STDERR_LOGGER: StderrLogger = StderrLogger;

/// Set the diagnostic verbosity. Installs a stderr logger on first use;
/// if the application already installed its own `log` backend, only the
/// level filter is adjusted and records flow through that backend.
pub fn set_log_level(level: LogLevel) {
    let _ = log::set_logger(&STDERR_LOGGER);
    log::set_max_level(level.filter());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_map_to_filters() {
        assert_eq!(LogLevel::None.filter(), log::LevelFilter::Off);
        assert_eq!(LogLevel::Error.filter(), log::LevelFilter::Error);
        assert_eq!(LogLevel::Debug.filter(), log::LevelFilter::Debug);
    }

    #[test]
    fn set_log_level_is_idempotent() {
        set_log_level(LogLevel::Warn);
        assert_eq!(log::max_level(), log::LevelFilter::Warn);
        set_log_level(LogLevel::Info);
        assert_eq!(log::max_level(), log::LevelFilter::Info);
    }
}
