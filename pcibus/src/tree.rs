//! Bridge Resource Tree
//!
//! Mirror of the PCIe topology below one root bridge, built during
//! discovery, reshaped by alignment, consumed by programming and
//! publication, then dropped. Bridges live in one owning vector and refer
//! to each other by index; there are no back-pointers into containers.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::Sbdf;
use crate::pci_io::PciDevice;

/// Index of a bridge node inside a [`BridgeTree`]
pub type BridgeHandle = usize;

/// The root bridge always occupies slot 0.
pub const ROOT_BRIDGE: BridgeHandle = 0;

/// Address space a resource consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Io,
    Mem,
}

/// One allocation request hanging off a bridge.
///
/// `length` of a BAR is the power-of-two size the probe reported; an
/// aperture's length is the padded span of a child bridge's window. Offsets
/// are aperture-relative until programming adds the parent base.
#[derive(Clone)]
pub enum Resource {
    /// A sized BAR of one device on this bridge's secondary bus
    Bar {
        kind: ResourceKind,
        index: u8,
        length: u32,
        offset: u32,
        alignment: u32,
        device: Arc<PciDevice>,
    },
    /// The forwarded window of a child bridge
    Aperture {
        kind: ResourceKind,
        length: u32,
        offset: u32,
        alignment: u32,
        bridge: BridgeHandle,
    },
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Bar { kind, .. } | Resource::Aperture { kind, .. } => *kind,
        }
    }

    pub fn length(&self) -> u32 {
        match self {
            Resource::Bar { length, .. } | Resource::Aperture { length, .. } => *length,
        }
    }

    pub fn offset(&self) -> u32 {
        match self {
            Resource::Bar { offset, .. } | Resource::Aperture { offset, .. } => *offset,
        }
    }

    pub fn alignment(&self) -> u32 {
        match self {
            Resource::Bar { alignment, .. } | Resource::Aperture { alignment, .. } => *alignment,
        }
    }

    pub fn set_offset(&mut self, value: u32) {
        match self {
            Resource::Bar { offset, .. } | Resource::Aperture { offset, .. } => *offset = value,
        }
    }
}

/// One bridge (or the synthetic root) and everything directly below it.
pub struct BridgeNode {
    /// Bus this bridge forwards to
    pub sec_bus: u8,
    pub parent: Option<BridgeHandle>,
    /// Config-space record of the bridge itself
    pub device: Arc<PciDevice>,
    pub children: Vec<BridgeHandle>,
    pub resources: Vec<Resource>,
    /// Non-bridge devices discovered on the secondary bus
    pub endpoints: Vec<Arc<PciDevice>>,
}

impl BridgeNode {
    /// Positions of this bridge's resources of one kind, in list order.
    pub fn kind_indices(&self, kind: ResourceKind) -> Vec<usize> {
        self.resources
            .iter()
            .enumerate()
            .filter(|(_, resource)| resource.kind() == kind)
            .map(|(index, _)| index)
            .collect()
    }
}

/// Ephemeral per-root-bridge topology.
pub struct BridgeTree {
    nodes: Vec<BridgeNode>,
}

impl BridgeTree {
    /// Create a tree rooted at the synthetic root bridge record.
    pub fn new(root_device: Arc<PciDevice>, sec_bus: u8) -> Self {
        Self {
            nodes: alloc::vec![BridgeNode {
                sec_bus,
                parent: None,
                device: root_device,
                children: Vec::new(),
                resources: Vec::new(),
                endpoints: Vec::new(),
            }],
        }
    }

    pub fn node(&self, handle: BridgeHandle) -> &BridgeNode {
        &self.nodes[handle]
    }

    pub fn node_mut(&mut self, handle: BridgeHandle) -> &mut BridgeNode {
        &mut self.nodes[handle]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Link a new child bridge below `parent` and return its handle.
    pub fn add_bridge(
        &mut self,
        parent: BridgeHandle,
        device: Arc<PciDevice>,
        sec_bus: u8,
    ) -> BridgeHandle {
        let handle = self.nodes.len();
        self.nodes.push(BridgeNode {
            sec_bus,
            parent: Some(parent),
            device,
            children: Vec::new(),
            resources: Vec::new(),
            endpoints: Vec::new(),
        });
        self.nodes[parent].children.push(handle);
        handle
    }

    /// Sort one bridge's resources by descending length.
    pub fn sort_resources(&mut self, handle: BridgeHandle) {
        self.nodes[handle]
            .resources
            .sort_by(|a, b| b.length().cmp(&a.length()));
    }

    /// Drop every BAR resource a device contributed to a bridge.
    ///
    /// Used when a device turns out to be unallocatable mid-probe.
    pub fn remove_resources_of_device(&mut self, handle: BridgeHandle, sbdf: Sbdf) {
        self.nodes[handle].resources.retain(|resource| match resource {
            Resource::Bar { device, .. } => device.sbdf() != sbdf,
            Resource::Aperture { .. } => true,
        });
    }
}
