//! Per-device PCI I/O Access
//!
//! Every discovered device is backed by a [`PciDevice`] record. For
//! published endpoints the record doubles as the I/O access object handed to
//! downstream firmware: BAR-relative memory and I/O accessors, bounded
//! polls, configuration access, overlap-safe copies, DMA mapping through the
//! platform's IOMMU, and the attribute state machine that drives the command
//! register of the device and of every bridge above it.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::config::{command, reg, PciWidth, Sbdf};
use crate::platform::{DmaOperation, MappingToken, PciPlatform};
use crate::{PciBusError, Result};

bitflags::bitflags! {
    /// Attribute bits a device can support or have enabled
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PciAttributes: u64 {
        const ISA_MOTHERBOARD_IO = 0x0001;
        const ISA_IO = 0x0002;
        const VGA_PALETTE_IO = 0x0004;
        const VGA_MEMORY = 0x0008;
        const VGA_IO = 0x0010;
        const IDE_PRIMARY_IO = 0x0020;
        const IDE_SECONDARY_IO = 0x0040;
        const MEMORY_WRITE_COMBINE = 0x0080;
        const IO = 0x0100;
        const MEMORY = 0x0200;
        const BUS_MASTER = 0x0400;
        const MEMORY_CACHED = 0x0800;
        const MEMORY_DISABLE = 0x1000;
        const EMBEDDED_DEVICE = 0x2000;
        const EMBEDDED_ROM = 0x4000;
        const DUAL_ADDRESS_CYCLE = 0x8000;
        const ISA_IO_16 = 0x1_0000;
        const VGA_PALETTE_IO_16 = 0x2_0000;
        const VGA_IO_16 = 0x4_0000;

        /// Shorthand enabling everything the device supports
        const DEVICE_ENABLE = 0x0100 | 0x0200 | 0x0400;
    }
}

/// Operations on a device's attribute state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeOperation {
    /// Return the attributes currently enabled
    Get,
    /// Return the attributes the device can ever have
    Supported,
    /// Enable exactly the given attributes, disabling the rest
    Set,
    /// Enable the given attributes
    Enable,
    /// Disable the given attributes
    Disable,
}

/// ACPI small/large resource descriptor encoding
pub mod acpi {
    /// QWORD address-space descriptor tag
    pub const ADDRESS_SPACE_DESCRIPTOR: u8 = 0x8A;
    /// End-tag descriptor
    pub const END_TAG_DESCRIPTOR: u8 = 0x79;
    /// Descriptor body length (total size minus the three header bytes)
    pub const ADDRESS_SPACE_DESCRIPTOR_LENGTH: u16 = 43;

    pub const ADDRESS_SPACE_TYPE_MEM: u8 = 0x00;
    pub const ADDRESS_SPACE_TYPE_IO: u8 = 0x01;
    /// Memory specific-flag value for cacheable prefetchable ranges
    pub const SPECIFIC_FLAG_CACHEABLE_PREFETCHABLE: u8 = 0x06;
}

/// One ACPI QWORD address-space descriptor describing a programmed BAR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcpiAddressSpaceDescriptor {
    pub res_type: u8,
    pub gen_flag: u8,
    pub specific_flag: u8,
    pub addr_space_granularity: u64,
    pub addr_range_min: u64,
    pub addr_range_max: u64,
    pub addr_translation_offset: u64,
    pub addr_len: u64,
}

impl AcpiAddressSpaceDescriptor {
    /// Append the descriptor in its wire format.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(acpi::ADDRESS_SPACE_DESCRIPTOR);
        out.extend_from_slice(&acpi::ADDRESS_SPACE_DESCRIPTOR_LENGTH.to_le_bytes());
        out.push(self.res_type);
        out.push(self.gen_flag);
        out.push(self.specific_flag);
        out.extend_from_slice(&self.addr_space_granularity.to_le_bytes());
        out.extend_from_slice(&self.addr_range_min.to_le_bytes());
        out.extend_from_slice(&self.addr_range_max.to_le_bytes());
        out.extend_from_slice(&self.addr_translation_offset.to_le_bytes());
        out.extend_from_slice(&self.addr_len.to_le_bytes());
    }

    /// Append the end-tag pair closing a descriptor list.
    pub fn encode_end_tag(out: &mut Vec<u8>) {
        out.push(acpi::END_TAG_DESCRIPTOR);
        out.push(0);
    }
}

struct AttributeState {
    supports: PciAttributes,
    attributes: PciAttributes,
}

/// One configuration-space function known to the enumerator.
///
/// Created when the function is first seen during discovery; published
/// endpoint records live on inside [`crate::driver::PublishedDevice`]
/// handles after the resource tree is gone.
pub struct PciDevice {
    platform: Arc<dyn PciPlatform>,
    sbdf: Sbdf,
    cfg_base: u64,
    parent: Option<Arc<PciDevice>>,
    state: Mutex<AttributeState>,
}

impl PciDevice {
    pub(crate) fn new(
        platform: Arc<dyn PciPlatform>,
        sbdf: Sbdf,
        parent: Option<Arc<PciDevice>>,
        supports: PciAttributes,
    ) -> Arc<Self> {
        Arc::new(Self {
            platform,
            cfg_base: sbdf.cfg_base(),
            sbdf,
            parent,
            state: Mutex::new(AttributeState {
                supports,
                attributes: PciAttributes::empty(),
            }),
        })
    }

    /// The device's segment/bus/device/function coordinates.
    pub fn get_location(&self) -> Sbdf {
        self.sbdf
    }

    pub(crate) fn sbdf(&self) -> Sbdf {
        self.sbdf
    }

    pub(crate) fn cfg_base(&self) -> u64 {
        self.cfg_base
    }

    /// Attributes the device can ever have enabled.
    pub fn supports(&self) -> PciAttributes {
        self.state.lock().supports
    }

    /// Invalidate the device after an unallocatable BAR was found.
    pub(crate) fn clear_supports(&self) {
        self.state.lock().supports = PciAttributes::empty();
    }

    fn bar_register(&self, bar_index: u8) -> u64 {
        self.cfg_base + reg::BAR0 as u64 + 4 * bar_index as u64
    }

    fn mem_bar_base(&self, bar_index: u8) -> u64 {
        u64::from(self.platform.cfg_read32(self.bar_register(bar_index)) & 0xFFFF_FFF0)
    }

    fn io_bar_base(&self, bar_index: u8) -> u64 {
        u64::from(self.platform.cfg_read32(self.bar_register(bar_index)) & 0xFFFF_FFFC)
    }

    /// Read `count` values from BAR-relative memory space.
    pub fn mem_read(
        &self,
        width: PciWidth,
        bar_index: u8,
        offset: u64,
        count: usize,
        buffer: &mut [u8],
    ) -> Result<()> {
        let stride = width.stride();
        if buffer.len() < count * stride {
            return Err(PciBusError::InvalidParameter);
        }

        let address = self.mem_bar_base(bar_index) + offset;
        for chunk in buffer[..count * stride].chunks_exact_mut(stride) {
            match width {
                PciWidth::U8 => chunk[0] = self.platform.mem_read8(address),
                PciWidth::U16 => chunk.copy_from_slice(&self.platform.mem_read16(address).to_le_bytes()),
                PciWidth::U32 => chunk.copy_from_slice(&self.platform.mem_read32(address).to_le_bytes()),
            }
        }
        Ok(())
    }

    /// Write `count` values to BAR-relative memory space.
    pub fn mem_write(
        &self,
        width: PciWidth,
        bar_index: u8,
        offset: u64,
        count: usize,
        buffer: &[u8],
    ) -> Result<()> {
        let stride = width.stride();
        if buffer.len() < count * stride {
            return Err(PciBusError::InvalidParameter);
        }

        let address = self.mem_bar_base(bar_index) + offset;
        for chunk in buffer[..count * stride].chunks_exact(stride) {
            match width {
                PciWidth::U8 => self.platform.mem_write8(address, chunk[0]),
                PciWidth::U16 => self
                    .platform
                    .mem_write16(address, u16::from_le_bytes([chunk[0], chunk[1]])),
                PciWidth::U32 => self.platform.mem_write32(
                    address,
                    u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                ),
            }
        }
        Ok(())
    }

    /// Read `count` values from BAR-relative I/O space.
    pub fn io_read(
        &self,
        width: PciWidth,
        bar_index: u8,
        offset: u64,
        count: usize,
        buffer: &mut [u8],
    ) -> Result<()> {
        let stride = width.stride();
        if buffer.len() < count * stride {
            return Err(PciBusError::InvalidParameter);
        }

        let address = self.io_bar_base(bar_index) + offset;
        for chunk in buffer[..count * stride].chunks_exact_mut(stride) {
            match width {
                PciWidth::U8 => chunk[0] = self.platform.io_read8(address),
                PciWidth::U16 => chunk.copy_from_slice(&self.platform.io_read16(address).to_le_bytes()),
                PciWidth::U32 => chunk.copy_from_slice(&self.platform.io_read32(address).to_le_bytes()),
            }
        }
        Ok(())
    }

    /// Write `count` values to BAR-relative I/O space.
    pub fn io_write(
        &self,
        width: PciWidth,
        bar_index: u8,
        offset: u64,
        count: usize,
        buffer: &[u8],
    ) -> Result<()> {
        let stride = width.stride();
        if buffer.len() < count * stride {
            return Err(PciBusError::InvalidParameter);
        }

        let address = self.io_bar_base(bar_index) + offset;
        for chunk in buffer[..count * stride].chunks_exact(stride) {
            match width {
                PciWidth::U8 => self.platform.io_write8(address, chunk[0]),
                PciWidth::U16 => self
                    .platform
                    .io_write16(address, u16::from_le_bytes([chunk[0], chunk[1]])),
                PciWidth::U32 => self.platform.io_write32(
                    address,
                    u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                ),
            }
        }
        Ok(())
    }

    /// Read `count` values from the device's configuration space.
    pub fn pci_read(&self, width: PciWidth, offset: u32, count: usize, buffer: &mut [u8]) -> Result<()> {
        let stride = width.stride();
        if buffer.len() < count * stride {
            return Err(PciBusError::InvalidParameter);
        }

        let address = self.cfg_base + offset as u64;
        for chunk in buffer[..count * stride].chunks_exact_mut(stride) {
            match width {
                PciWidth::U8 => chunk[0] = self.platform.cfg_read8(address),
                PciWidth::U16 => chunk.copy_from_slice(&self.platform.cfg_read16(address).to_le_bytes()),
                PciWidth::U32 => chunk.copy_from_slice(&self.platform.cfg_read32(address).to_le_bytes()),
            }
        }
        Ok(())
    }

    /// Write `count` values to the device's configuration space.
    pub fn pci_write(&self, width: PciWidth, offset: u32, count: usize, buffer: &[u8]) -> Result<()> {
        let stride = width.stride();
        if buffer.len() < count * stride {
            return Err(PciBusError::InvalidParameter);
        }

        let address = self.cfg_base + offset as u64;
        for chunk in buffer[..count * stride].chunks_exact(stride) {
            match width {
                PciWidth::U8 => self.platform.cfg_write8(address, chunk[0]),
                PciWidth::U16 => self
                    .platform
                    .cfg_write16(address, u16::from_le_bytes([chunk[0], chunk[1]])),
                PciWidth::U32 => self.platform.cfg_write32(
                    address,
                    u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                ),
            }
        }
        Ok(())
    }

    fn read_one_mem(&self, width: PciWidth, bar_index: u8, offset: u64) -> u64 {
        let address = self.mem_bar_base(bar_index) + offset;
        match width {
            PciWidth::U8 => u64::from(self.platform.mem_read8(address)),
            PciWidth::U16 => u64::from(self.platform.mem_read16(address)),
            PciWidth::U32 => u64::from(self.platform.mem_read32(address)),
        }
    }

    fn write_one_mem(&self, width: PciWidth, bar_index: u8, offset: u64, value: u64) {
        let address = self.mem_bar_base(bar_index) + offset;
        match width {
            PciWidth::U8 => self.platform.mem_write8(address, value as u8),
            PciWidth::U16 => self.platform.mem_write16(address, value as u16),
            PciWidth::U32 => self.platform.mem_write32(address, value as u32),
        }
    }

    fn read_one_io(&self, width: PciWidth, bar_index: u8, offset: u64) -> u64 {
        let address = self.io_bar_base(bar_index) + offset;
        match width {
            PciWidth::U8 => u64::from(self.platform.io_read8(address)),
            PciWidth::U16 => u64::from(self.platform.io_read16(address)),
            PciWidth::U32 => u64::from(self.platform.io_read32(address)),
        }
    }

    /// Poll BAR-relative memory until `(value & mask) == value` or the
    /// deadline expires. `delay` counts 100 ns units; each retry stalls
    /// 10 microseconds and consumes 100 units. Returns the last value read.
    pub fn poll_mem(
        &self,
        width: PciWidth,
        bar_index: u8,
        offset: u64,
        mask: u64,
        value: u64,
        mut delay: u64,
    ) -> Result<u64> {
        let mut result = self.read_one_mem(width, bar_index, offset);
        if (result & mask) == value || delay == 0 {
            return Ok(result);
        }

        loop {
            self.platform.stall_us(10);
            result = self.read_one_mem(width, bar_index, offset);
            if (result & mask) == value {
                return Ok(result);
            }
            if delay <= 100 {
                return Err(PciBusError::Timeout);
            }
            delay -= 100;
        }
    }

    /// Poll BAR-relative I/O space with the same deadline semantics as
    /// [`Self::poll_mem`].
    pub fn poll_io(
        &self,
        width: PciWidth,
        bar_index: u8,
        offset: u64,
        mask: u64,
        value: u64,
        mut delay: u64,
    ) -> Result<u64> {
        let mut result = self.read_one_io(width, bar_index, offset);
        if (result & mask) == value || delay == 0 {
            return Ok(result);
        }

        loop {
            self.platform.stall_us(10);
            result = self.read_one_io(width, bar_index, offset);
            if (result & mask) == value {
                return Ok(result);
            }
            if delay <= 100 {
                return Err(PciBusError::Timeout);
            }
            delay -= 100;
        }
    }

    /// Copy between two BAR-relative memory regions.
    ///
    /// Copies backwards when the destination overlaps the tail of the
    /// source, so the source bytes are preserved.
    pub fn copy_mem(
        &self,
        width: PciWidth,
        dest_bar_index: u8,
        mut dest_offset: u64,
        src_bar_index: u8,
        mut src_offset: u64,
        count: usize,
    ) -> Result<()> {
        let stride = width.stride() as u64;

        let forward = !(dest_offset > src_offset && dest_offset < src_offset + count as u64 * stride);
        if !forward {
            src_offset += (count as u64 - 1) * stride;
            dest_offset += (count as u64 - 1) * stride;
        }

        for _ in 0..count {
            let value = self.read_one_mem(width, src_bar_index, src_offset);
            self.write_one_mem(width, dest_bar_index, dest_offset, value);
            if forward {
                src_offset += stride;
                dest_offset += stride;
            } else {
                src_offset = src_offset.wrapping_sub(stride);
                dest_offset = dest_offset.wrapping_sub(stride);
            }
        }
        Ok(())
    }

    /// Map a host buffer for bus-master access through the platform IOMMU.
    ///
    /// Returns the device-visible address and the token for [`Self::unmap`].
    pub fn map(
        &self,
        operation: DmaOperation,
        host_address: u64,
        number_of_bytes: &mut usize,
    ) -> Result<(u64, MappingToken)> {
        let iommu = self.platform.iommu().ok_or(PciBusError::Unsupported)?;
        let (device_address, mapping) = iommu.map(operation, host_address, number_of_bytes)?;
        iommu.set_attribute(mapping, operation.access())?;
        Ok((device_address, mapping))
    }

    /// Release a mapping returned by [`Self::map`].
    pub fn unmap(&self, mapping: MappingToken) -> Result<()> {
        let iommu = self.platform.iommu().ok_or(PciBusError::Unsupported)?;
        iommu.set_attribute(mapping, crate::platform::IommuAccess::empty())?;
        iommu.unmap(mapping)
    }

    /// Allocate pages suitable for a common-buffer mapping.
    pub fn allocate_buffer(&self, pages: usize) -> Result<u64> {
        let iommu = self.platform.iommu().ok_or(PciBusError::Unsupported)?;
        iommu.allocate_buffer(pages)
    }

    /// Free pages allocated with [`Self::allocate_buffer`].
    pub fn free_buffer(&self, pages: usize, host_address: u64) -> Result<()> {
        let iommu = self.platform.iommu().ok_or(PciBusError::Unsupported)?;
        iommu.free_buffer(pages, host_address)
    }

    /// Flush posted writes. Nothing is buffered in this implementation.
    pub fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Perform an operation on the device's attribute state.
    ///
    /// `Get` and `Supported` return the corresponding mask. `Enable` and
    /// `Disable` drive the IO/MEMORY/BUS_MASTER command-register bits;
    /// `Enable` additionally propagates the remaining bits to the parent
    /// bridge chain. The root record accepts any supported mask without
    /// touching hardware.
    pub fn attributes(&self, operation: AttributeOperation, attrs: PciAttributes) -> Result<PciAttributes> {
        match operation {
            AttributeOperation::Get => return Ok(self.state.lock().attributes),
            AttributeOperation::Supported => return Ok(self.state.lock().supports),
            AttributeOperation::Set => {
                let supports = self.state.lock().supports;
                self.attributes(AttributeOperation::Enable, attrs)
                    .map_err(|_| PciBusError::Unsupported)?;
                self.attributes(AttributeOperation::Disable, !attrs & supports)
                    .map_err(|_| PciBusError::Unsupported)?;
                return Ok(PciAttributes::empty());
            }
            AttributeOperation::Enable | AttributeOperation::Disable => {}
        }

        let mut attrs = attrs;
        let supports = self.state.lock().supports;

        if attrs.contains(PciAttributes::DEVICE_ENABLE) {
            attrs &= supports;
        }

        if attrs.intersects(PciAttributes::VGA_IO | PciAttributes::VGA_PALETTE_IO)
            && attrs.intersects(PciAttributes::VGA_IO_16 | PciAttributes::VGA_PALETTE_IO_16)
        {
            return Err(PciBusError::Unsupported);
        }

        if !supports.contains(attrs) {
            return Err(PciBusError::Unsupported);
        }

        let Some(parent) = &self.parent else {
            return Ok(PciAttributes::empty());
        };

        let mut command_bits: u16 = 0;
        if attrs.contains(PciAttributes::IO) {
            command_bits |= command::IO_SPACE;
        }
        if attrs.contains(PciAttributes::MEMORY) {
            command_bits |= command::MEMORY_SPACE;
        }
        if attrs.contains(PciAttributes::BUS_MASTER) {
            command_bits |= command::BUS_MASTER;
        }

        let upstream = attrs - (PciAttributes::IO | PciAttributes::MEMORY | PciAttributes::BUS_MASTER);
        let current = self.platform.cfg_read16(self.cfg_base + reg::COMMAND as u64);

        if operation == AttributeOperation::Enable {
            self.platform
                .cfg_write16(self.cfg_base + reg::COMMAND as u64, current | command_bits);
            self.state.lock().attributes |= attrs;
            parent.attributes(AttributeOperation::Enable, upstream)?;
        } else {
            self.platform
                .cfg_write16(self.cfg_base + reg::COMMAND as u64, current & !command_bits);
            self.state.lock().attributes &= !attrs;
        }
        Ok(PciAttributes::empty())
    }

    /// Describe a programmed BAR as an ACPI address-space descriptor list.
    ///
    /// Returns the attributes settable on the BAR (none here) and the
    /// encoded descriptor followed by an end tag.
    pub fn get_bar_attributes(&self, bar_index: u8) -> Result<(PciAttributes, Vec<u8>)> {
        let raw = self.platform.cfg_read32(self.bar_register(bar_index));
        let mut descriptor = AcpiAddressSpaceDescriptor::default();

        if raw & 0x1 != 0 {
            let base = raw & 0xFFFF_FFFC;
            descriptor.res_type = acpi::ADDRESS_SPACE_TYPE_IO;
            if base & 0xFFFF_0000 != 0 {
                descriptor.addr_len = u64::from((!base).wrapping_add(1));
            } else {
                descriptor.addr_len = u64::from(0xFFFF & (!base).wrapping_add(1));
            }
            descriptor.addr_range_max = descriptor.addr_len.wrapping_sub(1);
            descriptor.addr_range_min = u64::from(base);
        } else {
            let base = raw & 0xFFFF_FFF0;
            descriptor.res_type = acpi::ADDRESS_SPACE_TYPE_MEM;
            descriptor.addr_space_granularity = if raw & 0x6 == 0 { 32 } else { 64 };
            if raw & 0x8 != 0 {
                descriptor.specific_flag = acpi::SPECIFIC_FLAG_CACHEABLE_PREFETCHABLE;
            }
            descriptor.addr_len = u64::from((!base).wrapping_add(1));
            descriptor.addr_range_max = descriptor.addr_len.wrapping_sub(1);
            descriptor.addr_range_min = u64::from(base);
        }

        let mut encoded = Vec::new();
        descriptor.encode(&mut encoded);
        AcpiAddressSpaceDescriptor::encode_end_tag(&mut encoded);
        Ok((PciAttributes::empty(), encoded))
    }

    /// Set attributes on a BAR range. Nothing is configurable here.
    pub fn set_bar_attributes(
        &self,
        _attributes: PciAttributes,
        _bar_index: u8,
        _offset: u64,
        _length: u64,
    ) -> Result<()> {
        Ok(())
    }
}
