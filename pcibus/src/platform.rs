//! Platform Access Collaborators
//!
//! The enumerator talks to hardware exclusively through [`PciPlatform`], a
//! context object bundling configuration-space access, BAR memory and I/O
//! port access, the microsecond timer, and the optional DMA remapping
//! service. Production firmware hands the driver an [`EcamPlatform`]; tests
//! substitute a simulated bus.

use crate::Result;

bitflags::bitflags! {
    /// Access rights applied to an active IOMMU mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IommuAccess: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
    }
}

/// Direction of a bus-master transfer being mapped
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaOperation {
    /// Device reads system memory
    BusMasterRead = 0,
    /// Device writes system memory
    BusMasterWrite = 1,
    /// Device and processor share the buffer
    BusMasterCommonBuffer = 2,
}

/// Opaque token identifying an active IOMMU mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingToken(pub u64);

/// DMA remapping service consumed by the per-device access interface.
pub trait IommuServices: Send + Sync {
    /// Map a host buffer for bus-master access.
    ///
    /// Returns the device-visible address and a token for [`Self::unmap`].
    /// `number_of_bytes` is updated with the length actually mapped.
    fn map(
        &self,
        operation: DmaOperation,
        host_address: u64,
        number_of_bytes: &mut usize,
    ) -> Result<(u64, MappingToken)>;

    /// Release a mapping returned by [`Self::map`].
    fn unmap(&self, mapping: MappingToken) -> Result<()>;

    /// Allocate pages suitable for a common-buffer mapping.
    fn allocate_buffer(&self, pages: usize) -> Result<u64>;

    /// Free pages allocated with [`Self::allocate_buffer`].
    fn free_buffer(&self, pages: usize, host_address: u64) -> Result<()>;

    /// Change the access rights of an active mapping.
    fn set_attribute(&self, mapping: MappingToken, access: IommuAccess) -> Result<()>;
}

/// Hardware access context shared by every stage of enumeration.
///
/// Configuration addresses are the packed form produced by
/// [`Sbdf::cfg_address`](crate::config::Sbdf::cfg_address); memory addresses
/// are bus addresses programmed into BARs; I/O addresses are port numbers.
pub trait PciPlatform: Send + Sync {
    fn cfg_read8(&self, address: u64) -> u8;
    fn cfg_read16(&self, address: u64) -> u16;
    fn cfg_read32(&self, address: u64) -> u32;
    fn cfg_write8(&self, address: u64, value: u8);
    fn cfg_write16(&self, address: u64, value: u16);
    fn cfg_write32(&self, address: u64, value: u32);

    fn mem_read8(&self, address: u64) -> u8;
    fn mem_read16(&self, address: u64) -> u16;
    fn mem_read32(&self, address: u64) -> u32;
    fn mem_write8(&self, address: u64, value: u8);
    fn mem_write16(&self, address: u64, value: u16);
    fn mem_write32(&self, address: u64, value: u32);

    fn io_read8(&self, port: u64) -> u8;
    fn io_read16(&self, port: u64) -> u16;
    fn io_read32(&self, port: u64) -> u32;
    fn io_write8(&self, port: u64, value: u8);
    fn io_write16(&self, port: u64, value: u16);
    fn io_write32(&self, port: u64, value: u32);

    /// Busy-wait for the given number of microseconds.
    fn stall_us(&self, microseconds: u64);

    /// DMA remapping service, when the platform provides one.
    fn iommu(&self) -> Option<&dyn IommuServices> {
        None
    }
}

/// Hardware-backed platform: ECAM window for configuration space, direct
/// volatile access for BAR memory, and x86 port instructions for I/O space.
pub struct EcamPlatform {
    ecam_base: u64,
    stall: fn(u64),
    iommu: Option<&'static dyn IommuServices>,
}

impl EcamPlatform {
    /// `stall` busy-waits for the requested number of microseconds using
    /// whatever timer the board code has calibrated.
    pub const fn new(ecam_base: u64, stall: fn(u64)) -> Self {
        Self {
            ecam_base,
            stall,
            iommu: None,
        }
    }

    pub fn with_iommu(mut self, iommu: &'static dyn IommuServices) -> Self {
        self.iommu = Some(iommu);
        self
    }

    fn cfg_ptr(&self, address: u64) -> u64 {
        self.ecam_base + address
    }
}

impl PciPlatform for EcamPlatform {
    fn cfg_read8(&self, address: u64) -> u8 {
        unsafe { core::ptr::read_volatile(self.cfg_ptr(address) as *const u8) }
    }

    fn cfg_read16(&self, address: u64) -> u16 {
        unsafe { core::ptr::read_volatile(self.cfg_ptr(address) as *const u16) }
    }

    fn cfg_read32(&self, address: u64) -> u32 {
        unsafe { core::ptr::read_volatile(self.cfg_ptr(address) as *const u32) }
    }

    fn cfg_write8(&self, address: u64, value: u8) {
        unsafe { core::ptr::write_volatile(self.cfg_ptr(address) as *mut u8, value) }
    }

    fn cfg_write16(&self, address: u64, value: u16) {
        unsafe { core::ptr::write_volatile(self.cfg_ptr(address) as *mut u16, value) }
    }

    fn cfg_write32(&self, address: u64, value: u32) {
        unsafe { core::ptr::write_volatile(self.cfg_ptr(address) as *mut u32, value) }
    }

    fn mem_read8(&self, address: u64) -> u8 {
        unsafe { core::ptr::read_volatile(address as *const u8) }
    }

    fn mem_read16(&self, address: u64) -> u16 {
        unsafe { core::ptr::read_volatile(address as *const u16) }
    }

    fn mem_read32(&self, address: u64) -> u32 {
        unsafe { core::ptr::read_volatile(address as *const u32) }
    }

    fn mem_write8(&self, address: u64, value: u8) {
        unsafe { core::ptr::write_volatile(address as *mut u8, value) }
    }

    fn mem_write16(&self, address: u64, value: u16) {
        unsafe { core::ptr::write_volatile(address as *mut u16, value) }
    }

    fn mem_write32(&self, address: u64, value: u32) {
        unsafe { core::ptr::write_volatile(address as *mut u32, value) }
    }

    fn io_read8(&self, port: u64) -> u8 {
        let mut port = x86_64::instructions::port::Port::<u8>::new(port as u16);
        unsafe { port.read() }
    }

    fn io_read16(&self, port: u64) -> u16 {
        let mut port = x86_64::instructions::port::Port::<u16>::new(port as u16);
        unsafe { port.read() }
    }

    fn io_read32(&self, port: u64) -> u32 {
        let mut port = x86_64::instructions::port::Port::<u32>::new(port as u16);
        unsafe { port.read() }
    }

    fn io_write8(&self, port: u64, value: u8) {
        let mut port = x86_64::instructions::port::Port::<u8>::new(port as u16);
        unsafe { port.write(value) }
    }

    fn io_write16(&self, port: u64, value: u16) {
        let mut port = x86_64::instructions::port::Port::<u16>::new(port as u16);
        unsafe { port.write(value) }
    }

    fn io_write32(&self, port: u64, value: u32) {
        let mut port = x86_64::instructions::port::Port::<u32>::new(port as u16);
        unsafe { port.write(value) }
    }

    fn stall_us(&self, microseconds: u64) {
        (self.stall)(microseconds)
    }

    fn iommu(&self) -> Option<&dyn IommuServices> {
        self.iommu
    }
}

impl DmaOperation {
    /// IOMMU access rights implied by the operation
    pub fn access(self) -> IommuAccess {
        match self {
            DmaOperation::BusMasterRead => IommuAccess::READ,
            DmaOperation::BusMasterWrite => IommuAccess::WRITE,
            DmaOperation::BusMasterCommonBuffer => IommuAccess::READ | IommuAccess::WRITE,
        }
    }
}
