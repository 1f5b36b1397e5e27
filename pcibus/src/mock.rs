//! Simulated Platform for Tests
//!
//! Emulates enough of a PCIe fabric to exercise enumeration end to end:
//! a config space keyed by packed address with real BAR-sizing semantics
//! (all-ones write reads back the size mask), byte-addressed memory and
//! port spaces, a stall counter, and optional scripted memory updates that
//! land after a number of stalls for poll tests.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::config::Sbdf;
use crate::platform::{DmaOperation, IommuAccess, IommuServices, MappingToken, PciPlatform};
use crate::Result;

/// Behaviour of one BAR of a simulated function
#[derive(Debug, Clone, Copy, Default)]
pub enum MockBar {
    #[default]
    Unimplemented,
    Io {
        size: u32,
    },
    Mem32 {
        size: u32,
        prefetchable: bool,
    },
    Mem64 {
        size: u64,
        prefetchable: bool,
    },
    /// Upper half of the preceding 64-bit BAR
    Mem64Hi,
}

impl MockBar {
    /// Register value after a write, with unimplemented address bits masked
    /// off and the type bits re-asserted.
    fn store(self, value: u32) -> u32 {
        match self {
            MockBar::Unimplemented => 0,
            MockBar::Io { size } => (value & 0xFFFF_FFFC & !(size - 1)) | 0x1,
            MockBar::Mem32 { size, prefetchable } => {
                (value & 0xFFFF_FFF0 & !(size - 1)) | ((prefetchable as u32) << 3)
            }
            MockBar::Mem64 { size, prefetchable } => {
                let mask = !(size - 1) as u32;
                (value & 0xFFFF_FFF0 & mask) | 0x4 | ((prefetchable as u32) << 3)
            }
            MockBar::Mem64Hi => value,
        }
    }

    /// Power-on register value.
    fn reset(self) -> u32 {
        match self {
            MockBar::Unimplemented | MockBar::Mem64Hi => 0,
            MockBar::Io { .. } => 0x1,
            MockBar::Mem32 { prefetchable, .. } => (prefetchable as u32) << 3,
            MockBar::Mem64 { size, prefetchable } => {
                let type_bits = 0x4 | ((prefetchable as u32) << 3);
                if size > 0x8000_0000 {
                    // the low half must read back differently from its
                    // probed value or the pair would pass as unimplemented
                    0x8000_0000 | type_bits
                } else {
                    type_bits
                }
            }
        }
    }
}

/// Register image of one simulated function.
#[derive(Clone)]
pub struct MockFunction {
    regs: [u8; 256],
    pub bars: [MockBar; 6],
    bar_count: usize,
}

impl MockFunction {
    fn blank() -> Self {
        Self {
            regs: [0; 256],
            bars: [MockBar::Unimplemented; 6],
            bar_count: 6,
        }
    }

    /// A type-0 function with the given identity and class code.
    pub fn endpoint(vendor: u16, device: u16, class: u8, subclass: u8, prog_if: u8) -> Self {
        let mut function = Self::blank();
        function.set16(0x00, vendor);
        function.set16(0x02, device);
        function.regs[0x09] = prog_if;
        function.regs[0x0A] = subclass;
        function.regs[0x0B] = class;
        function
    }

    /// A type-1 PCIe bridge with the given port type in its capability.
    pub fn bridge(vendor: u16, device: u16, port_type: u8) -> Self {
        let mut function = Self::blank();
        function.set16(0x00, vendor);
        function.set16(0x02, device);
        function.regs[0x0A] = 0x04;
        function.regs[0x0B] = 0x06;
        function.regs[0x0E] = 0x01;
        // capability list: a single PCI Express capability at 0x40
        function.set16(0x06, 0x0010);
        function.regs[0x34] = 0x40;
        function.regs[0x40] = super::classify::capability::PCI_EXPRESS;
        function.regs[0x41] = 0;
        function.set16(0x42, (port_type as u16) << 4);
        function.bar_count = 2;
        function
    }

    pub fn set_command(&mut self, bits: u16) {
        self.set16(0x04, bits);
    }

    pub fn set_multifunction(&mut self, multifunction: bool) {
        if multifunction {
            self.regs[0x0E] |= 0x80;
        } else {
            self.regs[0x0E] &= !0x80;
        }
    }

    pub fn set_bus_numbers(&mut self, primary: u8, secondary: u8, subordinate: u8) {
        self.regs[0x18] = primary;
        self.regs[0x19] = secondary;
        self.regs[0x1A] = subordinate;
    }

    fn set16(&mut self, offset: usize, value: u16) {
        self.regs[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn set32(&mut self, offset: usize, value: u32) {
        self.regs[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// BAR slot managed at this dword offset, if any.
    fn bar_at(&self, offset: usize) -> Option<MockBar> {
        if offset >= 0x10 && offset < 0x10 + 4 * self.bar_count && (offset - 0x10) % 4 == 0 {
            Some(self.bars[(offset - 0x10) / 4])
        } else {
            None
        }
    }
}

struct PendingWrite {
    stalls_remaining: u32,
    address: u64,
    value: u32,
}

/// Records every IOMMU call so tests can assert the delegation order.
pub struct MockIommu {
    log: Mutex<Vec<String>>,
}

fn access_name(access: IommuAccess) -> &'static str {
    if access == IommuAccess::READ | IommuAccess::WRITE {
        "READ | WRITE"
    } else if access == IommuAccess::READ {
        "READ"
    } else if access == IommuAccess::WRITE {
        "WRITE"
    } else {
        "(empty)"
    }
}

impl IommuServices for MockIommu {
    fn map(
        &self,
        _operation: DmaOperation,
        host_address: u64,
        _number_of_bytes: &mut usize,
    ) -> Result<(u64, MappingToken)> {
        self.log.lock().push(String::from("map"));
        Ok((host_address, MappingToken(1)))
    }

    fn unmap(&self, _mapping: MappingToken) -> Result<()> {
        self.log.lock().push(String::from("unmap"));
        Ok(())
    }

    fn allocate_buffer(&self, _pages: usize) -> Result<u64> {
        self.log.lock().push(String::from("allocate_buffer"));
        Ok(0x10_0000)
    }

    fn free_buffer(&self, _pages: usize, _host_address: u64) -> Result<()> {
        self.log.lock().push(String::from("free_buffer"));
        Ok(())
    }

    fn set_attribute(&self, _mapping: MappingToken, access: IommuAccess) -> Result<()> {
        self.log
            .lock()
            .push(alloc::format!("set_attribute {}", access_name(access)));
        Ok(())
    }
}

/// Simulated bus fabric implementing [`PciPlatform`].
pub struct MockPlatform {
    functions: Mutex<BTreeMap<u64, MockFunction>>,
    mem: Mutex<BTreeMap<u64, u8>>,
    ports: Mutex<BTreeMap<u64, u8>>,
    stall_total_us: Mutex<u64>,
    pending_mem: Mutex<Vec<PendingWrite>>,
    iommu: Option<MockIommu>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            functions: Mutex::new(BTreeMap::new()),
            mem: Mutex::new(BTreeMap::new()),
            ports: Mutex::new(BTreeMap::new()),
            stall_total_us: Mutex::new(0),
            pending_mem: Mutex::new(Vec::new()),
            iommu: None,
        }
    }

    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn new_arc_with_iommu() -> Arc<Self> {
        let mut platform = Self::new();
        platform.iommu = Some(MockIommu {
            log: Mutex::new(Vec::new()),
        });
        Arc::new(platform)
    }

    /// Install a function at the given coordinates, applying BAR reset
    /// values to its register image.
    pub fn add_function(&self, sbdf: Sbdf, mut function: MockFunction) {
        for index in 0..function.bar_count {
            let reset = function.bars[index].reset();
            function.set32(0x10 + 4 * index, reset);
        }
        self.functions.lock().insert(sbdf.cfg_base(), function);
    }

    /// Microseconds spent in stalls so far.
    pub fn stall_total_us(&self) -> u64 {
        *self.stall_total_us.lock()
    }

    /// Schedule a memory write to land after `stalls` stall calls.
    pub fn write_mem32_after_stalls(&self, stalls: u32, address: u64, value: u32) {
        self.pending_mem.lock().push(PendingWrite {
            stalls_remaining: stalls,
            address,
            value,
        });
    }

    /// Calls recorded by the IOMMU, in order.
    pub fn iommu_log(&self) -> Vec<String> {
        self.iommu
            .as_ref()
            .map(|iommu| iommu.log.lock().clone())
            .unwrap_or_default()
    }

    fn cfg_read_bytes(&self, address: u64, out: &mut [u8]) {
        let functions = self.functions.lock();
        let offset = (address & 0xFFF) as usize;
        match functions.get(&(address & !0xFFF)) {
            Some(function) if offset + out.len() <= 256 => {
                out.copy_from_slice(&function.regs[offset..offset + out.len()]);
            }
            _ => out.fill(0xFF),
        }
    }

    fn cfg_write_bytes(&self, address: u64, bytes: &[u8]) {
        let mut functions = self.functions.lock();
        let offset = (address & 0xFFF) as usize;
        if let Some(function) = functions.get_mut(&(address & !0xFFF)) {
            if offset + bytes.len() <= 256 {
                function.regs[offset..offset + bytes.len()].copy_from_slice(bytes);
            }
        }
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl PciPlatform for MockPlatform {
    fn cfg_read8(&self, address: u64) -> u8 {
        let mut out = [0u8; 1];
        self.cfg_read_bytes(address, &mut out);
        out[0]
    }

    fn cfg_read16(&self, address: u64) -> u16 {
        let mut out = [0u8; 2];
        self.cfg_read_bytes(address, &mut out);
        u16::from_le_bytes(out)
    }

    fn cfg_read32(&self, address: u64) -> u32 {
        let mut out = [0u8; 4];
        self.cfg_read_bytes(address, &mut out);
        u32::from_le_bytes(out)
    }

    fn cfg_write8(&self, address: u64, value: u8) {
        self.cfg_write_bytes(address, &[value]);
    }

    fn cfg_write16(&self, address: u64, value: u16) {
        self.cfg_write_bytes(address, &value.to_le_bytes());
    }

    fn cfg_write32(&self, address: u64, value: u32) {
        let mut functions = self.functions.lock();
        let offset = (address & 0xFFF) as usize;
        if let Some(function) = functions.get_mut(&(address & !0xFFF)) {
            if let Some(bar) = function.bar_at(offset) {
                let stored = bar.store(value);
                function.set32(offset, stored);
            } else if offset + 4 <= 256 {
                function.set32(offset, value);
            }
        }
    }

    fn mem_read8(&self, address: u64) -> u8 {
        self.mem.lock().get(&address).copied().unwrap_or(0)
    }

    fn mem_read16(&self, address: u64) -> u16 {
        u16::from_le_bytes([self.mem_read8(address), self.mem_read8(address + 1)])
    }

    fn mem_read32(&self, address: u64) -> u32 {
        u32::from_le_bytes([
            self.mem_read8(address),
            self.mem_read8(address + 1),
            self.mem_read8(address + 2),
            self.mem_read8(address + 3),
        ])
    }

    fn mem_write8(&self, address: u64, value: u8) {
        self.mem.lock().insert(address, value);
    }

    fn mem_write16(&self, address: u64, value: u16) {
        for (index, byte) in value.to_le_bytes().iter().enumerate() {
            self.mem_write8(address + index as u64, *byte);
        }
    }

    fn mem_write32(&self, address: u64, value: u32) {
        for (index, byte) in value.to_le_bytes().iter().enumerate() {
            self.mem_write8(address + index as u64, *byte);
        }
    }

    fn io_read8(&self, port: u64) -> u8 {
        self.ports.lock().get(&port).copied().unwrap_or(0)
    }

    fn io_read16(&self, port: u64) -> u16 {
        u16::from_le_bytes([self.io_read8(port), self.io_read8(port + 1)])
    }

    fn io_read32(&self, port: u64) -> u32 {
        u32::from_le_bytes([
            self.io_read8(port),
            self.io_read8(port + 1),
            self.io_read8(port + 2),
            self.io_read8(port + 3),
        ])
    }

    fn io_write8(&self, port: u64, value: u8) {
        self.ports.lock().insert(port, value);
    }

    fn io_write16(&self, port: u64, value: u16) {
        for (index, byte) in value.to_le_bytes().iter().enumerate() {
            self.io_write8(port + index as u64, *byte);
        }
    }

    fn io_write32(&self, port: u64, value: u32) {
        for (index, byte) in value.to_le_bytes().iter().enumerate() {
            self.io_write8(port + index as u64, *byte);
        }
    }

    fn stall_us(&self, microseconds: u64) {
        *self.stall_total_us.lock() += microseconds;

        let mut due = Vec::new();
        {
            let mut pending = self.pending_mem.lock();
            for write in pending.iter_mut() {
                write.stalls_remaining = write.stalls_remaining.saturating_sub(1);
            }
            pending.retain(|write| {
                if write.stalls_remaining == 0 {
                    due.push((write.address, write.value));
                    false
                } else {
                    true
                }
            });
        }
        for (address, value) in due {
            self.mem_write32(address, value);
        }
    }

    fn iommu(&self) -> Option<&dyn IommuServices> {
        self.iommu.as_ref().map(|iommu| iommu as &dyn IommuServices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bar_sizing_readback() {
        let platform = MockPlatform::new();
        let mut function = MockFunction::endpoint(0x8086, 1, 0x01, 0x06, 0x01);
        function.bars[0] = MockBar::Mem32 {
            size: 0x1_0000,
            prefetchable: false,
        };
        let sbdf = Sbdf::new(0, 0, 1, 0);
        platform.add_function(sbdf, function);

        let bar0 = sbdf.cfg_base() + 0x10;
        platform.cfg_write32(bar0, 0xFFFF_FFFF);
        assert_eq!(platform.cfg_read32(bar0), 0xFFFF_0000);

        platform.cfg_write32(bar0, 0x8000_0000);
        assert_eq!(platform.cfg_read32(bar0), 0x8000_0000);
    }

    #[test]
    fn test_absent_function_reads_ones() {
        let platform = MockPlatform::new();
        assert_eq!(platform.cfg_read32(Sbdf::new(0, 0, 9, 0).cfg_base()), 0xFFFF_FFFF);
    }

    #[test]
    fn test_pending_write_lands_after_stalls() {
        let platform = MockPlatform::new();
        platform.write_mem32_after_stalls(2, 0x1000, 0xABCD);
        platform.stall_us(10);
        assert_eq!(platform.mem_read32(0x1000), 0);
        platform.stall_us(10);
        assert_eq!(platform.mem_read32(0x1000), 0xABCD);
    }
}
