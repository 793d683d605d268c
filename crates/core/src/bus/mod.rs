use crate::geometry::FlashGeometry;
use crate::peripherals::{CacheController, FlashController};
use crate::regs::RegisterMap;
use crate::{Peripheral, SimResult, SimulationError};
use flashseq_config::DeviceDescriptor;

pub mod trace;

pub use trace::{BusEvent, TraceBus};

/// Size of the flash controller register window.
pub const FLASH_REG_SPAN: u64 = 0x400;
/// Size of the cache controller register window.
pub const CACHE_REG_SPAN: u64 = 0x100;

/// The simulated address space: flash and cache register windows plus the
/// three flash arrays. Everything else faults.
#[derive(Debug)]
pub struct SystemBus {
    pub regs: RegisterMap,
    pub flash: FlashController,
    pub cache: CacheController,
}

impl Default for SystemBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemBus {
    pub fn new() -> Self {
        Self {
            regs: RegisterMap::default(),
            flash: FlashController::new(FlashGeometry::hk32f39a()),
            cache: CacheController::new(),
        }
    }

    pub fn from_config(device: &DeviceDescriptor) -> anyhow::Result<Self> {
        let geometry = FlashGeometry::from_descriptor(device)?;
        tracing::info!(
            "Device '{}': main {:#x}..{:#x}, page {:#x}",
            device.name,
            geometry.main.start,
            geometry.main.end,
            geometry.page_size
        );
        Ok(Self {
            regs: RegisterMap {
                flash: device.registers.flash,
                cache: device.registers.cache,
            },
            flash: FlashController::new(geometry).with_latency(device.simulation.busy_latency),
            cache: CacheController::new(),
        })
    }

    pub fn geometry(&self) -> &FlashGeometry {
        self.flash.geometry()
    }

    fn register_window(&mut self, addr: u64) -> Option<(&mut dyn Peripheral, u64)> {
        if addr >= self.regs.flash && addr < self.regs.flash + FLASH_REG_SPAN {
            return Some((&mut self.flash, addr - self.regs.flash));
        }
        if addr >= self.regs.cache && addr < self.regs.cache + CACHE_REG_SPAN {
            return Some((&mut self.cache, addr - self.regs.cache));
        }
        None
    }

    fn array_addr(&self, addr: u64) -> Option<u32> {
        let addr = u32::try_from(addr).ok()?;
        self.flash.contains(addr).then_some(addr)
    }
}

impl crate::Bus for SystemBus {
    fn read_u32(&mut self, addr: u64) -> SimResult<u32> {
        if addr % 4 != 0 {
            return Err(SimulationError::Misaligned { addr, width: 4 });
        }
        if let Some((dev, offset)) = self.register_window(addr) {
            return dev.read(offset);
        }
        self.array_addr(addr)
            .and_then(|a| self.flash.read_memory(a, 4))
            .ok_or(SimulationError::MemoryViolation(addr))
    }

    fn write_u32(&mut self, addr: u64, value: u32) -> SimResult<()> {
        if addr % 4 != 0 {
            return Err(SimulationError::Misaligned { addr, width: 4 });
        }
        if let Some((dev, offset)) = self.register_window(addr) {
            return dev.write(offset, value);
        }
        match self.array_addr(addr) {
            Some(a) => self.flash.write_memory(a, value, 4),
            None => Err(SimulationError::MemoryViolation(addr)),
        }
    }

    fn write_u16(&mut self, addr: u64, value: u16) -> SimResult<()> {
        if addr % 2 != 0 {
            return Err(SimulationError::Misaligned { addr, width: 2 });
        }
        if self.register_window(addr).is_some() {
            // Register blocks only decode full words.
            return Err(SimulationError::UnsupportedWidth { addr, width: 2 });
        }
        match self.array_addr(addr) {
            Some(a) => self.flash.write_memory(a, value as u32, 2),
            None => Err(SimulationError::MemoryViolation(addr)),
        }
    }

    fn read_u16(&mut self, addr: u64) -> SimResult<u16> {
        if addr % 2 != 0 {
            return Err(SimulationError::Misaligned { addr, width: 2 });
        }
        if self.register_window(addr).is_some() {
            return Err(SimulationError::UnsupportedWidth { addr, width: 2 });
        }
        self.array_addr(addr)
            .and_then(|a| self.flash.read_memory(a, 2))
            .map(|v| v as u16)
            .ok_or(SimulationError::MemoryViolation(addr))
    }
}
