//! Bus Number Assignment
//!
//! Gives every reachable P2P bridge below a root bridge a secondary and
//! subordinate bus number inside the root's budget. Non-bridge functions
//! consume no bus numbers; recursion handles arbitrary bridge depth.

use log::warn;

use crate::classify::{capability, find_capability, is_bridge_device, is_multifunction_device};
use crate::config::{reg, Sbdf, MAX_DEVICE, MAX_FUNCTION};
use crate::platform::PciPlatform;
use crate::{PciBusError, Result};

/// Claim `bus_base` as the secondary bus of `bridge` and number everything
/// behind it, up to the root's `bus_limit` ceiling.
///
/// The subordinate register is opened to the ceiling while the new bus is
/// scanned, then closed down to the highest bus actually reached, which is
/// also the return value. A subtree that runs out of bus numbers is
/// abandoned; siblings already numbered keep their assignment.
pub fn assign_child_buses(
    platform: &dyn PciPlatform,
    bridge: Sbdf,
    bus_base: u8,
    bus_limit: u8,
) -> Result<u8> {
    if bus_base > bus_limit {
        return Err(PciBusError::BusRangeExhausted);
    }

    let cfg_base = bridge.cfg_base();
    platform.cfg_write8(cfg_base + reg::PRIMARY_BUS as u64, bridge.bus);
    platform.cfg_write8(cfg_base + reg::SECONDARY_BUS as u64, bus_base);
    platform.cfg_write8(cfg_base + reg::SUBORDINATE_BUS as u64, bus_limit);

    let mut highest = bus_base;

    for device in 0..=MAX_DEVICE {
        for function in 0..=MAX_FUNCTION {
            let mut sbdf = Sbdf::new(bridge.segment, bus_base, device, function);
            let child_cfg = sbdf.cfg_base();

            if platform.cfg_read16(child_cfg) == 0xFFFF {
                if function == 0 {
                    break;
                }
                continue;
            }

            sbdf.pcie_cap = find_capability(platform, child_cfg, capability::PCI_EXPRESS);
            if is_bridge_device(platform, sbdf) {
                let assigned = match highest.checked_add(1) {
                    Some(next_base) => assign_child_buses(platform, sbdf, next_base, bus_limit),
                    None => Err(PciBusError::BusRangeExhausted),
                };
                match assigned {
                    Ok(subordinate) => highest = subordinate,
                    Err(err) => warn!(
                        "bus assignment below {:02x}:{:02x}.{} stopped: {:?}",
                        bus_base, device, function, err
                    ),
                }
            }

            if function == 0 && !is_multifunction_device(platform, child_cfg) {
                break;
            }
        }
    }

    platform.cfg_write8(cfg_base + reg::SUBORDINATE_BUS as u64, highest);
    Ok(highest)
}
