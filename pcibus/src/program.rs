//! Resource Programming
//!
//! Writes the aligned layout to hardware: BAR registers get their absolute
//! addresses, bridge windows get their base/limit pairs, and finally every
//! bridge on an essential path has its command register enabled. Window
//! registers pack the upper address bits of base and limit into one dword:
//! 16+16 bits at 1 MiB granularity for memory, 8+8 bits at 4 KiB
//! granularity for I/O.

use log::error;

use crate::config::reg;
use crate::pci_io::{AttributeOperation, PciAttributes};
use crate::platform::PciPlatform;
use crate::tree::{BridgeHandle, BridgeTree, Resource, ResourceKind};
use crate::{PciBusError, Result};

/// Park every non-root bridge window at the top of the root's ranges so
/// that windows which receive no aperture never decode allocated space.
pub fn init_bridge_windows(
    platform: &dyn PciPlatform,
    tree: &BridgeTree,
    handle: BridgeHandle,
    mem_limit: u32,
    io_limit: u32,
) {
    for &child in &tree.node(handle).children {
        init_bridge_windows(platform, tree, child, mem_limit, io_limit);
    }

    let node = tree.node(handle);
    if node.parent.is_some() {
        let cfg_base = node.device.cfg_base();
        platform.cfg_write32(
            cfg_base + reg::MEMORY_BASE_LIMIT as u64,
            (mem_limit >> 16) | (mem_limit & 0xFFFF_0000),
        );
        platform.cfg_write32(
            cfg_base + reg::IO_BASE_LIMIT as u64,
            (io_limit >> 8) | (io_limit & 0xFF00),
        );
    }
}

/// Program memory BARs and bridge memory windows below `handle`.
///
/// `mem_base` is the absolute address backing this bridge's offset 0.
/// Fails with [`PciBusError::MemExhausted`] once an allocation passes
/// `mem_limit`; the remainder of this root's programming is abandoned.
pub fn apply_mem_resources(
    platform: &dyn PciPlatform,
    tree: &BridgeTree,
    handle: BridgeHandle,
    mem_base: u32,
    mem_limit: u32,
) -> Result<()> {
    let node = tree.node(handle);

    for resource in node.resources.iter().filter(|r| r.kind() == ResourceKind::Mem) {
        match resource {
            Resource::Bar {
                index,
                length,
                offset,
                device,
                ..
            } => {
                let address = mem_base + offset;
                platform.cfg_write32(
                    device.cfg_base() + reg::BAR0 as u64 + 4 * u64::from(*index),
                    address,
                );
                if mem_base + offset + (length - 1) > mem_limit {
                    error!("memory limit reached programming BAR{}", index);
                    return Err(PciBusError::MemExhausted);
                }
            }
            Resource::Aperture {
                length,
                offset,
                bridge,
                ..
            } => {
                let base = mem_base + offset;
                let limit = mem_base + offset + (length - 1);
                let child_device = &tree.node(*bridge).device;
                platform.cfg_write32(
                    child_device.cfg_base() + reg::MEMORY_BASE_LIMIT as u64,
                    (base >> 16) | (limit & 0xFFFF_0000),
                );
                apply_mem_resources(platform, tree, *bridge, base, limit)?;
            }
        }
    }
    Ok(())
}

/// Program I/O BARs and bridge I/O windows below `handle`.
pub fn apply_io_resources(
    platform: &dyn PciPlatform,
    tree: &BridgeTree,
    handle: BridgeHandle,
    io_base: u32,
    io_limit: u32,
) -> Result<()> {
    let node = tree.node(handle);

    for resource in node.resources.iter().filter(|r| r.kind() == ResourceKind::Io) {
        match resource {
            Resource::Bar {
                index,
                length,
                offset,
                device,
                ..
            } => {
                let address = io_base + offset;
                platform.cfg_write32(
                    device.cfg_base() + reg::BAR0 as u64 + 4 * u64::from(*index),
                    address,
                );
                if io_base + offset + (length - 1) > io_limit {
                    error!("I/O limit reached programming BAR{}", index);
                    return Err(PciBusError::IoExhausted);
                }
            }
            Resource::Aperture {
                length,
                offset,
                bridge,
                ..
            } => {
                let base = io_base + offset;
                let limit = io_base + offset + (length - 1);
                let child_device = &tree.node(*bridge).device;
                platform.cfg_write32(
                    child_device.cfg_base() + reg::IO_BASE_LIMIT as u64,
                    (base >> 8) | (limit & 0xFF00),
                );
                apply_io_resources(platform, tree, *bridge, base, limit)?;
            }
        }
    }
    Ok(())
}

/// Enable decoding and bus mastering on every non-root bridge, children
/// first so a window is live before traffic is forwarded into it.
pub fn enable_bridge_devices(tree: &BridgeTree, handle: BridgeHandle) {
    for &child in &tree.node(handle).children {
        enable_bridge_devices(tree, child);
    }

    let node = tree.node(handle);
    if node.parent.is_some() {
        let _ = node
            .device
            .attributes(AttributeOperation::Enable, PciAttributes::DEVICE_ENABLE);
    }
}
