pub mod process;
pub mod registry;

use serde::{Deserialize, Serialize};

pub use process::{DriverProcess, MessageSink, StopOutcome};
pub use registry::DriverRegistry;

/// Backend flavour of a driver, fixed when the driver is loaded.
///
/// Managers that need per-backend behaviour (the VM manager renders a
/// different deployment description for each) match on this instead of
/// subclassing the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Generic,
    Xml,
    Libvirt,
    Xen,
}
