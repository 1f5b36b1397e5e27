//! Device Presence and Classification
//!
//! Answers the questions the enumerator asks about every function it walks:
//! is something there, is it multi-function, is it a P2P bridge, is it one
//! of the device classes the firmware needs to boot, and is it already
//! decoding resources set up by an earlier firmware stage.

use crate::config::{command, reg, Sbdf};
use crate::platform::PciPlatform;

/// PCI capability IDs
pub mod capability {
    pub const MSI: u8 = 0x05;
    pub const PCI_EXPRESS: u8 = 0x10;
    pub const MSIX: u8 = 0x11;
}

/// Class codes of interest to pre-boot enumeration
pub mod class {
    pub const MASS_STORAGE: u8 = 0x01;
    pub const SYSTEM_PERIPHERAL: u8 = 0x08;
    pub const SERIAL_BUS: u8 = 0x0C;

    pub const SUBCLASS_SD_HOST: u8 = 0x05;
    pub const SUBCLASS_USB: u8 = 0x03;
}

/// Function type reported by the PCI Express capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Endpoint,
    UpstreamPort,
    DownstreamPort,
}

/// A function is present when its vendor/device dword is not all-ones.
pub fn is_device_present(platform: &dyn PciPlatform, cfg_base: u64) -> bool {
    platform.cfg_read32(cfg_base + reg::VENDOR_ID as u64) != 0xFFFF_FFFF
}

/// Functions 1-7 exist only when function 0 sets the multi-function bit.
pub fn is_multifunction_device(platform: &dyn PciPlatform, cfg_base: u64) -> bool {
    platform.cfg_read8(cfg_base + reg::HEADER_TYPE as u64) & 0x80 != 0
}

/// Walk the capability chain for the given capability ID.
///
/// Returns the capability's config-space offset, or 0 when the function has
/// no capability list or does not carry the capability.
pub fn find_capability(platform: &dyn PciPlatform, cfg_base: u64, cap_id: u8) -> u8 {
    let status = platform.cfg_read16(cfg_base + reg::STATUS as u64);
    if status & 0x10 == 0 {
        return 0;
    }

    let mut offset = platform.cfg_read8(cfg_base + reg::CAPABILITIES_PTR as u64) & 0xFC;
    while offset != 0 {
        if platform.cfg_read8(cfg_base + offset as u64) == cap_id {
            return offset;
        }
        offset = platform.cfg_read8(cfg_base + offset as u64 + 1) & 0xFC;
    }
    0
}

/// Decode the device/port type field of the PCI Express capability.
///
/// Root ports (type 4) classify as downstream ports: a root port is the
/// root complex's downstream port. Functions without the capability are
/// conventional endpoints.
pub fn device_type(platform: &dyn PciPlatform, sbdf: Sbdf) -> DeviceType {
    if sbdf.pcie_cap == 0 {
        return DeviceType::Endpoint;
    }

    let cap_reg = platform.cfg_read16(sbdf.cfg_base() + sbdf.pcie_cap as u64 + 2);
    match (cap_reg >> 4) & 0xF {
        0x5 => DeviceType::UpstreamPort,
        0x4 | 0x6 => DeviceType::DownstreamPort,
        _ => DeviceType::Endpoint,
    }
}

/// Whether the function forwards a secondary bus.
pub fn is_bridge_device(platform: &dyn PciPlatform, sbdf: Sbdf) -> bool {
    matches!(
        device_type(platform, sbdf),
        DeviceType::UpstreamPort | DeviceType::DownstreamPort
    )
}

/// Whether the function belongs to a device class required for boot.
pub fn is_device_essential(platform: &dyn PciPlatform, sbdf: Sbdf) -> bool {
    let baseclass = platform.cfg_read8(sbdf.cfg_base() + reg::CLASS_CODE as u64);
    let subclass = platform.cfg_read8(sbdf.cfg_base() + reg::SUBCLASS as u64);

    baseclass == class::MASS_STORAGE
        || (baseclass == class::SERIAL_BUS && subclass == class::SUBCLASS_USB)
        || (baseclass == class::SYSTEM_PERIPHERAL && subclass == class::SUBCLASS_SD_HOST)
}

/// Whether an earlier firmware stage already enabled the function's
/// memory-space or I/O-space decode. Such devices must not be re-laid out.
pub fn is_device_decoding(platform: &dyn PciPlatform, sbdf: Sbdf) -> bool {
    let cmd = platform.cfg_read16(sbdf.cfg_base() + reg::COMMAND as u64);
    cmd & (command::MEMORY_SPACE | command::IO_SPACE) != 0
}
