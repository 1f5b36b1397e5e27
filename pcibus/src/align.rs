//! Resource Tree Alignment
//!
//! Turns the raw size requests gathered by discovery into packed,
//! naturally-aligned offsets. Each bridge's list is sorted by descending
//! length so the largest (most aligned) request sits at offset 0 and the
//! round-up of each follower never wastes more than its own alignment.
//! Bridges then publish their packed span to the parent as an aperture,
//! padded to the window granularity the bridge registers can express.

use crate::tree::{BridgeHandle, BridgeTree, Resource, ResourceKind};

/// Bridge memory windows carry 1 MiB granularity
const MEM_APERTURE_GRANULARITY: u32 = 0x10_0000;
/// Bridge I/O windows carry 4 KiB granularity
const IO_APERTURE_GRANULARITY: u32 = 0x1000;

/// Depth-first post-order alignment of the whole tree.
pub fn align_resource_tree(tree: &mut BridgeTree, handle: BridgeHandle) {
    let children = tree.node(handle).children.clone();
    for child in children {
        align_resource_tree(tree, child);
    }

    tree.sort_resources(handle);
    assign_offsets(tree, handle, ResourceKind::Mem);
    assign_offsets(tree, handle, ResourceKind::Io);

    if let Some(parent) = tree.node(handle).parent {
        synthesize_aperture(tree, handle, parent, ResourceKind::Mem);
        synthesize_aperture(tree, handle, parent, ResourceKind::Io);
    }
}

/// Pack one kind of resource into the bridge's aperture.
///
/// The first (largest) node keeps offset 0; every follower starts where its
/// predecessor ends, rounded up to a multiple of its own length.
fn assign_offsets(tree: &mut BridgeTree, handle: BridgeHandle, kind: ResourceKind) {
    let node = tree.node_mut(handle);
    let indices = node.kind_indices(kind);

    for pair in indices.windows(2) {
        let (prev_offset, prev_length) = {
            let resource = &node.resources[pair[0]];
            (resource.offset(), resource.length())
        };
        let length = node.resources[pair[1]].length();

        let mut offset = prev_offset + prev_length;
        if offset & (length - 1) != 0 {
            offset &= !(length - 1);
            offset += length;
        }
        node.resources[pair[1]].set_offset(offset);
    }
}

/// Publish the packed span of `handle` to its parent as an aperture node.
///
/// The aperture inherits the largest child's alignment when that exceeds
/// its own natural alignment, because the parent window imposes the same
/// rule one level up.
fn synthesize_aperture(
    tree: &mut BridgeTree,
    handle: BridgeHandle,
    parent: BridgeHandle,
    kind: ResourceKind,
) {
    let (first_alignment, span) = {
        let node = tree.node(handle);
        let indices = node.kind_indices(kind);
        let (Some(&first), Some(&last)) = (indices.first(), indices.last()) else {
            return;
        };
        let last_resource = &node.resources[last];
        (
            node.resources[first].alignment(),
            last_resource.offset() + last_resource.length(),
        )
    };

    let mut length = span;
    match kind {
        ResourceKind::Mem => {
            if length & (MEM_APERTURE_GRANULARITY - 1) != 0 {
                length = (length & !(MEM_APERTURE_GRANULARITY - 1)) + MEM_APERTURE_GRANULARITY;
            }
        }
        ResourceKind::Io => {
            if length & (IO_APERTURE_GRANULARITY - 1) != 0 {
                length = (length & 0xF000) + IO_APERTURE_GRANULARITY;
            }
        }
    }

    let alignment = first_alignment.max(length - 1);
    tree.node_mut(parent).resources.push(Resource::Aperture {
        kind,
        length,
        offset: 0,
        alignment,
        bridge: handle,
    });
}
