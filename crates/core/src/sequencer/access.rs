use super::{FlashError, FlashSequencer};
use crate::regs::{self, offset, AccessControl, Interrupts, OptionStatus, Status};
use crate::Bus;

/// Individually queryable controller flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashFlag {
    Busy,
    ProgramError,
    WriteProtectError,
    EndOfOperation,
    /// Option bytes failed to load; reported through OBR.
    OptionByteError,
}

impl<B: Bus> FlashSequencer<B> {
    /// Sets the wait-state count. The low three bits go to ACR, the rest to
    /// the extended latency register.
    pub fn set_latency(&mut self, latency: u32) -> Result<(), FlashError> {
        if latency > regs::MAX_LATENCY {
            return Err(FlashError::InvalidLatency(latency));
        }
        let acr = self.config.regs.flash(offset::ACR);
        let low = latency & AccessControl::LATENCY.bits();
        self.bus
            .modify_u32(acr, |v| (v & !AccessControl::LATENCY.bits()) | low)?;
        self.bus
            .write_u32(self.config.regs.flash(offset::LATENCY_EX), latency >> 3)?;
        tracing::debug!("Latency set to {} wait states", latency);
        Ok(())
    }

    pub fn latency(&mut self) -> Result<u32, FlashError> {
        let acr = self.bus.read_u32(self.config.regs.flash(offset::ACR))?;
        let ex = self.bus.read_u32(self.config.regs.flash(offset::LATENCY_EX))?;
        Ok((ex << 3) | (acr & AccessControl::LATENCY.bits()))
    }

    pub fn set_half_cycle_access(&mut self, enable: bool) -> Result<(), FlashError> {
        self.update_acr(AccessControl::HLFCYA, enable)
    }

    pub fn set_prefetch_buffer(&mut self, enable: bool) -> Result<(), FlashError> {
        self.update_acr(AccessControl::PRFTBE, enable)
    }

    pub fn prefetch_buffer_status(&mut self) -> Result<bool, FlashError> {
        let acr = self.bus.read_u32(self.config.regs.flash(offset::ACR))?;
        Ok(AccessControl::from_bits_truncate(acr).contains(AccessControl::PRFTBS))
    }

    /// Enables or disables controller interrupt sources. Operations stay
    /// polled either way.
    pub fn configure_interrupts(&mut self, sources: Interrupts, enable: bool) -> Result<(), FlashError> {
        let cr = self.config.regs.flash(offset::CR);
        let mask = sources.bits();
        self.bus
            .modify_u32(cr, |v| if enable { v | mask } else { v & !mask })?;
        Ok(())
    }

    pub fn flag_status(&mut self, flag: FlashFlag) -> Result<bool, FlashError> {
        let (register, mask) = match flag {
            FlashFlag::Busy => (offset::SR, Status::BSY.bits()),
            FlashFlag::ProgramError => (offset::SR, Status::PGERR.bits()),
            FlashFlag::WriteProtectError => (offset::SR, Status::WRPRTERR.bits()),
            FlashFlag::EndOfOperation => (offset::SR, Status::EOP.bits()),
            FlashFlag::OptionByteError => (offset::OBR, OptionStatus::OPTERR.bits()),
        };
        let value = self.bus.read_u32(self.config.regs.flash(register))?;
        Ok(value & mask != 0)
    }

    /// Write-one-to-clear of the sticky status flags. `BSY` is ignored.
    pub fn clear_flags(&mut self, flags: Status) -> Result<(), FlashError> {
        let clearable = flags & (Status::PGERR | Status::WRPRTERR | Status::EOP);
        self.bus
            .write_u32(self.config.regs.flash(offset::SR), clearable.bits())?;
        Ok(())
    }

    fn update_acr(&mut self, bit: AccessControl, enable: bool) -> Result<(), FlashError> {
        let acr = self.config.regs.flash(offset::ACR);
        self.bus
            .modify_u32(acr, |v| if enable { v | bit.bits() } else { v & !bit.bits() })?;
        Ok(())
    }
}
