// gpu/ — device management and the compute stages of the pipeline.
//
// Stage order inside a detect call:
//   scale_space → extract → orientation → descriptor
// with buffers.rs owning the device-resident feature storage the
// descriptor stage writes into and matcher.rs consuming it. present.rs
// is the optional debug view of the pyramid images.

pub mod buffers;
pub mod descriptor;
pub mod device;
pub mod extract;
pub mod matcher;
pub mod orientation;
pub mod present;
pub mod scale_space;
