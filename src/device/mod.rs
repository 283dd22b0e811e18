//! # Devices
//!
//! Everything the bridge knows about a single cast device and the set of all of them.
//!
//! ## Why This Module Exists
//!
//! The bus side only ever deals in device tokens ("Kitchen", "192.168.1.20", or empty
//! for everyone). This module turns those tokens into live handles and keeps the
//! blocking cast protocol out of the async runtime.
//!
//! ## Layout
//!
//! ```text
//! control.rs    DeviceConnector / DeviceControl seam + DeviceError
//! chromecast.rs rust_cast backend behind that seam
//! handle.rs     statum probe lifecycle, DeviceHandle, status watch
//! registry.rs   host and name indices
//! status.rs     snapshot types reported by devices
//! ```

pub mod chromecast;
pub mod control;
pub mod handle;
pub mod registry;
pub mod status;

#[cfg(test)]
pub mod testing;

pub use chromecast::CastConnector;
pub use control::{DeviceConnector, DeviceControl, DeviceError, DeviceEvent, DeviceNotification};
pub use handle::{DeviceHandle, DeviceProbe, DeviceSummary, PlaybackState};
pub use registry::DeviceRegistry;
pub use status::{CastStatus, ConnectionStatus, DeviceInfo, MediaStatus};
