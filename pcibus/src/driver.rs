//! Root Bridge Enumeration Driver
//!
//! Runs the whole pipeline once per root bridge: bus-number assignment,
//! discovery, alignment, window initialisation, programming, bridge enable
//! and publication. The resource tree is dropped at the end of each root;
//! only published device records survive. Programming exhaustion abandons
//! the rest of that root bridge but never the others.

use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{error, info, warn};

use crate::align::align_resource_tree;
use crate::bus::assign_child_buses;
use crate::classify::{capability, find_capability, is_bridge_device, is_device_essential};
use crate::config::{Sbdf, MAX_DEVICE, MAX_FUNCTION};
use crate::discover::enumerate_bridge_resources;
use crate::path::{DevicePath, DevicePathNode};
use crate::pci_io::{PciAttributes, PciDevice};
use crate::platform::PciPlatform;
use crate::program::{
    apply_io_resources, apply_mem_resources, enable_bridge_devices, init_bridge_windows,
};
use crate::tree::{BridgeHandle, BridgeTree, ROOT_BRIDGE};
use crate::{PciBusError, Result};

/// Inclusive base/limit pair of one allocatable range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddressRange {
    pub base: u64,
    pub limit: u64,
}

impl AddressRange {
    pub const fn new(base: u64, limit: u64) -> Self {
        Self { base, limit }
    }
}

/// One root bridge as reported by the host-bridge enumerator.
///
/// Only `bus`, `mem` and `io` are allocated from here; prefetchable memory
/// above 4 GiB is carried for completeness but never consumed.
#[derive(Debug, Clone, Default)]
pub struct RootBridgeDescriptor {
    pub segment: u16,
    pub supports: PciAttributes,
    pub bus: AddressRange,
    pub io: AddressRange,
    pub mem: AddressRange,
    pub mem_above_4g: AddressRange,
    pub device_path: DevicePath,
}

/// Host-bridge collaborator reporting the root bridges to allocate under.
pub trait RootBridgeEnumerator: Send + Sync {
    fn root_bridges(&self) -> Vec<RootBridgeDescriptor>;
}

/// A published boot-essential endpoint: its path and its access object.
pub struct PublishedDevice {
    pub device_path: DevicePath,
    pub device: Arc<PciDevice>,
}

/// The pre-boot PCI bus driver.
pub struct PciBusDriver {
    platform: Arc<dyn PciPlatform>,
    published: Vec<PublishedDevice>,
    devices_ready: bool,
}

impl PciBusDriver {
    pub fn new(platform: Arc<dyn PciPlatform>) -> Self {
        Self {
            platform,
            published: Vec::new(),
            devices_ready: false,
        }
    }

    /// Enumerate and allocate every root bridge the collaborator reports,
    /// then raise the devices-ready signal.
    pub fn enumerate(&mut self, enumerator: &dyn RootBridgeEnumerator) -> Result<()> {
        let root_bridges = enumerator.root_bridges();
        if root_bridges.is_empty() {
            info!("no PCI root bridges on the system");
            return Err(PciBusError::Unsupported);
        }

        for (index, root_bridge) in root_bridges.iter().enumerate() {
            self.enumerate_root_bridge(root_bridge, index);
        }

        if !self.devices_ready {
            self.devices_ready = true;
            info!("PCI devices ready");
        }
        Ok(())
    }

    /// Endpoints published so far, keyed by device path.
    pub fn published(&self) -> &[PublishedDevice] {
        &self.published
    }

    /// Whether all root bridges have been processed.
    pub fn devices_ready(&self) -> bool {
        self.devices_ready
    }

    fn enumerate_root_bridge(&mut self, root_bridge: &RootBridgeDescriptor, index: usize) {
        info!("enumerating PCI bus {}", index);
        info!("segment {:X}", root_bridge.segment);
        info!("bus {:X} - {:X}", root_bridge.bus.base, root_bridge.bus.limit);
        info!("MEM32 {:X} - {:X}", root_bridge.mem.base, root_bridge.mem.limit);
        info!(
            "MEM64 {:X} - {:X}",
            root_bridge.mem_above_4g.base, root_bridge.mem_above_4g.limit
        );
        info!("IO {:X} - {:X}", root_bridge.io.base, root_bridge.io.limit);

        let platform = self.platform.as_ref();
        let primary_bus = root_bridge.bus.base as u8;

        // Step 1: assign bus numbers to every bridge below this root
        let mut bus_base = primary_bus.saturating_add(1);
        for device in 0..=MAX_DEVICE {
            for function in 0..=MAX_FUNCTION {
                let mut sbdf = Sbdf::new(root_bridge.segment, primary_bus, device, function);
                let cfg_base = sbdf.cfg_base();

                if platform.cfg_read16(cfg_base) == 0xFFFF {
                    if function == 0 {
                        break;
                    }
                    continue;
                }

                sbdf.pcie_cap = find_capability(platform, cfg_base, capability::PCI_EXPRESS);
                if is_bridge_device(platform, sbdf) {
                    match assign_child_buses(platform, sbdf, bus_base, root_bridge.bus.limit as u8) {
                        Ok(highest) => bus_base = highest.saturating_add(1),
                        Err(err) => warn!(
                            "bus assignment under {:02x}:{:02x}.{} failed: {:?}",
                            primary_bus, device, function, err
                        ),
                    }
                }
            }
        }

        // Step 2: build and align the resource tree
        let root_device = PciDevice::new(
            self.platform.clone(),
            Sbdf::new(root_bridge.segment, primary_bus, 0, 0),
            None,
            root_bridge.supports,
        );
        let mut tree = BridgeTree::new(root_device, primary_bus);
        enumerate_bridge_resources(&self.platform, &mut tree, ROOT_BRIDGE);
        align_resource_tree(&mut tree, ROOT_BRIDGE);

        // Step 3: program the proposed layout
        init_bridge_windows(
            platform,
            &tree,
            ROOT_BRIDGE,
            root_bridge.mem.limit as u32,
            u32::from(root_bridge.io.limit as u16),
        );
        if let Err(err) = apply_mem_resources(
            platform,
            &tree,
            ROOT_BRIDGE,
            root_bridge.mem.base as u32,
            root_bridge.mem.limit as u32,
        ) {
            error!("memory programming under root bridge {} failed: {:?}", index, err);
            return;
        }
        if let Err(err) = apply_io_resources(
            platform,
            &tree,
            ROOT_BRIDGE,
            root_bridge.io.base as u32,
            u32::from(root_bridge.io.limit as u16),
        ) {
            error!("I/O programming under root bridge {} failed: {:?}", index, err);
            return;
        }
        enable_bridge_devices(&tree, ROOT_BRIDGE);

        // Step 4: publish access objects for the essential endpoints
        self.publish_devices(&tree, ROOT_BRIDGE, &root_bridge.device_path);
    }

    fn publish_devices(&mut self, tree: &BridgeTree, handle: BridgeHandle, device_path: &DevicePath) {
        let node = tree.node(handle);

        for endpoint in &node.endpoints {
            if is_device_essential(self.platform.as_ref(), endpoint.sbdf()) {
                let location = endpoint.sbdf();
                let path = device_path.appended(DevicePathNode::Pci {
                    device: location.device,
                    function: location.function,
                });
                info!("installing PCI I/O access for {}", path);
                self.published.push(PublishedDevice {
                    device_path: path,
                    device: endpoint.clone(),
                });
            }
        }

        for &child in &node.children {
            let location = tree.node(child).device.sbdf();
            let path = device_path.appended(DevicePathNode::Pci {
                device: location.device,
                function: location.function,
            });
            self.publish_devices(tree, child, &path);
        }
    }
}
