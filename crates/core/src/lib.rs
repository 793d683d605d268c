pub mod bus;
pub mod geometry;
pub mod memory;
pub mod metrics;
pub mod peripherals;
pub mod regs;
pub mod sequencer;
pub mod snapshot;

pub use flashseq_config::{DisarmPolicy, EraseMode, Outcome, Region, Scope};
pub use sequencer::{
    FlashError, FlashFlag, FlashSequencer, FlashStatus, OperationKind, OperationRequest, Payload,
    SequencerConfig, SequencerObserver, SequencerState,
};

mod tests;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SimulationError {
    #[error("Memory access violation at {0:#x}")]
    MemoryViolation(u64),
    #[error("Unaligned {width}-byte access at {addr:#x}")]
    Misaligned { addr: u64, width: u8 },
    #[error("Unsupported {width}-byte access at {addr:#x}")]
    UnsupportedWidth { addr: u64, width: u8 },
}

pub type SimResult<T> = Result<T, SimulationError>;

/// Trait representing a memory-mapped register window.
///
/// Reads take `&mut self`: status reads advance the simulated hardware.
pub trait Peripheral: std::fmt::Debug + Send {
    fn read(&mut self, offset: u64) -> SimResult<u32>;
    fn write(&mut self, offset: u64, value: u32) -> SimResult<()>;
}

/// Handle over the controller's address space.
///
/// On hardware this is a volatile pointer access; on the host it is the
/// simulated [`bus::SystemBus`] or a recording wrapper around it.
pub trait Bus {
    fn read_u32(&mut self, addr: u64) -> SimResult<u32>;
    fn write_u32(&mut self, addr: u64, value: u32) -> SimResult<()>;
    fn write_u16(&mut self, addr: u64, value: u16) -> SimResult<()>;

    fn read_u16(&mut self, addr: u64) -> SimResult<u16> {
        if addr % 2 != 0 {
            return Err(SimulationError::Misaligned { addr, width: 2 });
        }
        let word = self.read_u32(addr & !3)?;
        // Little Endian
        Ok((word >> ((addr & 2) * 8)) as u16)
    }

    fn modify_u32<F>(&mut self, addr: u64, f: F) -> SimResult<()>
    where
        F: FnOnce(u32) -> u32,
        Self: Sized,
    {
        let value = self.read_u32(addr)?;
        self.write_u32(addr, f(value))
    }
}
