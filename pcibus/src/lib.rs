//! Pre-boot PCIe Bus Enumerator
//!
//! Discovers the subset of PCIe devices the firmware must reach to boot
//! (mass-storage, USB host and SD host controllers), assigns bus numbers to
//! the P2P bridges leading to them, lays out 32-bit memory and I/O BAR
//! ranges under each root bridge, programs BARs and bridge windows, and
//! publishes a per-device I/O access object for downstream firmware modules.
//!
//! # Architecture Overview
//!
//! The crate is organized as a pipeline over one root bridge at a time:
//!
//! - **config** - SBDF coordinates and configuration-space register layout
//! - **platform** - config/MMIO/port access and timer collaborators
//! - **classify** - device presence, type and essentiality tests
//! - **bus** - recursive secondary/subordinate bus-number assignment
//! - **discover** - BAR sizing and resource-tree construction
//! - **align** - in-aperture offset assignment and window synthesis
//! - **program** - BAR and bridge-window register programming
//! - **pci_io** - the per-device access object and attribute handling
//! - **path** - device paths naming published devices
//! - **driver** - per-root-bridge control flow and publication
//!
//! The resource tree is ephemeral; it is dropped once each root bridge has
//! been programmed. Only the published per-device objects survive.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod align;
pub mod bus;
pub mod classify;
pub mod config;
pub mod discover;
pub mod driver;
pub mod path;
pub mod pci_io;
pub mod platform;
pub mod program;
pub mod tree;

#[cfg(test)]
pub(crate) mod mock;

pub use config::{PciWidth, Sbdf};
pub use driver::{
    AddressRange, PciBusDriver, PublishedDevice, RootBridgeDescriptor, RootBridgeEnumerator,
};
pub use path::{DevicePath, DevicePathNode};
pub use pci_io::{AttributeOperation, PciAttributes, PciDevice};
pub use platform::{DmaOperation, EcamPlatform, IommuAccess, IommuServices, MappingToken, PciPlatform};

/// Errors surfaced by enumeration and by the per-device access interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciBusError {
    /// A 64-bit BAR larger than 2 GiB was requested; the device is dropped.
    UnsupportedBar,
    /// No bus number is left under the root bridge's ceiling.
    BusRangeExhausted,
    /// Programming passed the root bridge's memory limit.
    MemExhausted,
    /// Programming passed the root bridge's I/O limit.
    IoExhausted,
    /// A poll deadline expired before the exit criteria matched.
    Timeout,
    /// The requested attribute operation is not supported by the device.
    Unsupported,
    /// A malformed argument was passed to the access interface.
    InvalidParameter,
    /// A collaborator could not satisfy an allocation request.
    OutOfResources,
}

pub type Result<T> = core::result::Result<T, PciBusError>;
