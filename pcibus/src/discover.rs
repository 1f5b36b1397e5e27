//! Resource Discovery
//!
//! Walks every assigned bus and sizes the BARs of each function that is a
//! bridge or boot-essential, building the resource tree the aligner and
//! programmer consume. The write-all-ones probe is destructive; original
//! BAR contents are not restored because programming overwrites them.

use alloc::sync::Arc;
use log::warn;

use crate::classify::{
    capability, find_capability, is_bridge_device, is_device_decoding, is_device_essential,
    is_device_present, is_multifunction_device,
};
use crate::config::{reg, Sbdf, MAX_DEVICE, MAX_FUNCTION};
use crate::pci_io::{PciAttributes, PciDevice};
use crate::platform::PciPlatform;
use crate::tree::{BridgeHandle, BridgeTree, Resource, ResourceKind};

/// Largest size a 64-bit BAR may request and still be allocated below 4 GiB
const SIZE_2GIB: u64 = 0x8000_0000;

/// Discover devices below `handle` and populate its resource list,
/// recursing into every child bridge found on the way.
pub fn enumerate_bridge_resources(
    platform: &Arc<dyn PciPlatform>,
    tree: &mut BridgeTree,
    handle: BridgeHandle,
) {
    let segment = tree.node(handle).device.sbdf().segment;
    let bus = tree.node(handle).sec_bus;

    for device_number in 0..=MAX_DEVICE {
        for function in 0..=MAX_FUNCTION {
            let mut sbdf = Sbdf::new(segment, bus, device_number, function);
            let cfg_base = sbdf.cfg_base();

            if !is_device_present(platform.as_ref(), cfg_base) {
                if function == 0 {
                    break;
                }
                continue;
            }

            sbdf.pcie_cap = find_capability(platform.as_ref(), cfg_base, capability::PCI_EXPRESS);
            let bridge = is_bridge_device(platform.as_ref(), sbdf);

            if (bridge || is_device_essential(platform.as_ref(), sbdf))
                && !is_device_decoding(platform.as_ref(), sbdf)
            {
                // bridges implement BAR0/1 only
                let bar_index_limit = if bridge { 1 } else { 5 };

                let device = PciDevice::new(
                    platform.clone(),
                    sbdf,
                    Some(tree.node(handle).device.clone()),
                    PciAttributes::IO | PciAttributes::MEMORY | PciAttributes::BUS_MASTER,
                );

                probe_bars(platform.as_ref(), tree, handle, &device, bar_index_limit);

                if !bridge {
                    tree.node_mut(handle).endpoints.push(device);
                } else {
                    let sec_bus = platform.cfg_read8(cfg_base + reg::SECONDARY_BUS as u64);
                    let child = tree.add_bridge(handle, device, sec_bus);
                    // a bridge whose secondary bus was never assigned
                    // (bus exhaustion) has nothing reachable behind it
                    if sec_bus > bus {
                        enumerate_bridge_resources(platform, tree, child);
                    }
                }
            }

            if function == 0 && !is_multifunction_device(platform.as_ref(), cfg_base) {
                break;
            }
        }
    }
}

/// Size each implemented BAR and append a resource node for it.
///
/// Probing is destructive: every BAR is overwritten with all-ones to read
/// back its size mask. A 64-bit BAR requesting more than 2 GiB makes the
/// whole device unallocatable; its nodes are discarded and its supported
/// attribute mask cleared.
fn probe_bars(
    platform: &dyn PciPlatform,
    tree: &mut BridgeTree,
    handle: BridgeHandle,
    device: &Arc<PciDevice>,
    bar_index_limit: u8,
) {
    let sbdf = device.sbdf();
    let cfg_base = device.cfg_base();
    let mut skip_next_bar = false;

    for bar_index in 0..=bar_index_limit {
        if skip_next_bar {
            skip_next_bar = false;
            continue;
        }

        let bar_offset = reg::BAR0 as u64 + 4 * bar_index as u64;
        let bar_value = platform.cfg_read32(cfg_base + bar_offset);
        platform.cfg_write32(cfg_base + bar_offset, u32::MAX);
        let size_value = platform.cfg_read32(cfg_base + bar_offset);

        if bar_value == size_value {
            // unimplemented BAR
            continue;
        }

        let kind;
        let bar_size: u64;
        if bar_value & 0x1 != 0 {
            kind = ResourceKind::Io;
            bar_size = u64::from(!(size_value & !0x1u32) as u16) + 1;
        } else {
            kind = ResourceKind::Mem;
            bar_size = u64::from(!(size_value & !0xFu32)) + 1;
            if bar_value & 0x4 != 0 {
                if bar_size <= SIZE_2GIB {
                    // upper half of the 64-bit pair, never sized on its own
                    skip_next_bar = true;
                } else {
                    warn!(
                        "{:04x}:{:02x}:{:02x}.{}: 64-bit BAR{} larger than 2 GiB, dropping device",
                        sbdf.segment, sbdf.bus, sbdf.device, sbdf.function, bar_index
                    );
                    tree.remove_resources_of_device(handle, sbdf);
                    device.clear_supports();
                    return;
                }
            }
        }

        tree.node_mut(handle).resources.push(Resource::Bar {
            kind,
            index: bar_index,
            length: bar_size as u32,
            offset: 0,
            alignment: bar_size as u32 - 1,
            device: device.clone(),
        });
    }
}
