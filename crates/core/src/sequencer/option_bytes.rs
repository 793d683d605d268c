//! Option-byte maintenance: read protection, write protection, user
//! configuration, the watchdog reload options and the LSI and debug clock
//! commands.
//!
//! All of these run under a single OPTPG (or OPTER then OPTPG) arming and
//! follow the option-byte disarm rule.

use super::{FlashError, FlashSequencer, FlashStatus, OperationKind, OperationRequest, Payload, SequencerState};
use crate::regs::{self, offset, option_byte, Control, EnableBit, OptionStatus};
use crate::{Bus, EraseMode, Scope};

const OPTER: EnableBit = EnableBit::Control(Control::OPTER);
const OPTPG: EnableBit = EnableBit::Control(Control::OPTPG);

/// USER bits that read back as one regardless of configuration.
const USER_RESERVED: u16 = 0xF8;

impl<B: Bus> FlashSequencer<B> {
    /// Erases every option byte, then restores the read-protection byte so the
    /// device does not become protected as a side effect.
    pub fn erase_option_bytes(&mut self) -> Result<(), FlashError> {
        let rdp = if self.readout_protection_status()? {
            0x0000
        } else {
            regs::RDP_KEY
        };
        let budget = self.config.program_ticks;
        let request = self.option_request(OperationKind::Erase(EraseMode::Mass), option_byte::RDP, Payload::None);
        self.tracked(&request, |seq| seq.erase_and_restore_rdp(rdp, budget))
    }

    /// Rewrites RDP. Enabling protection stores 0x00, disabling stores the RDP
    /// key. Takes effect after the next reset.
    pub fn set_readout_protection(&mut self, enable: bool) -> Result<(), FlashError> {
        let rdp = if enable { 0x0000 } else { regs::RDP_KEY };
        let budget = self.config.erase_ticks;
        let request = self.option_request(OperationKind::Erase(EraseMode::Mass), option_byte::RDP, Payload::HalfWord(rdp));
        self.tracked(&request, |seq| seq.erase_and_restore_rdp(rdp, budget))
    }

    /// Write-protects the main-array page groups set in `pages`. One bit per
    /// WRPR group; groups already protected stay protected.
    pub fn enable_write_protection(&mut self, pages: u32) -> Result<(), FlashError> {
        let cleared = !pages;
        let mut writes = [(0u32, 0u16); 4];
        let mut count = 0;
        for (i, off) in option_byte::WRP.iter().enumerate() {
            let value = ((cleared >> (i * 8)) & 0xFF) as u16;
            if value != 0xFF {
                writes[count] = (*off, value);
                count += 1;
            }
        }
        let request = self.option_request(OperationKind::Program, option_byte::WRP[0], Payload::Word(pages));
        self.tracked(&request, |seq| {
            let prior = seq.wait_for_completion(seq.config.program_ticks)?;
            if prior != FlashStatus::Complete {
                return Ok(prior);
            }
            seq.ensure_disarmed(OPTPG)?;
            seq.set_state(SequencerState::Unlocking);
            seq.write_keys(offset::OPTKEYR)?;
            seq.program_option_half_words(&writes[..count])
        })
    }

    /// Programs the USER option byte. Each flag selects the "no reset" or
    /// software variant of its feature.
    pub fn configure_user_option_bytes(
        &mut self,
        iwdg_software: bool,
        stop_no_reset: bool,
        standby_no_reset: bool,
    ) -> Result<(), FlashError> {
        let user = u16::from(iwdg_software)
            | u16::from(stop_no_reset) << 1
            | u16::from(standby_no_reset) << 2
            | USER_RESERVED;
        self.keyed_option_write(option_byte::USER, user)
    }

    /// Programs the watchdog reload initial value option.
    pub fn set_watchdog_reload_option(&mut self, value: u16) -> Result<(), FlashError> {
        self.keyed_option_write(option_byte::IWDG_RL_IV, value)
    }

    /// Stores (or zeroes) the command word that makes the watchdog pick up its
    /// reload initial value. Stops at the first half word that fails.
    pub fn set_watchdog_reload_command(&mut self, enable: bool) -> Result<(), FlashError> {
        let command = if enable { regs::IWDG_RLIV_CMD } else { 0 };
        let base = self.config.geometry.option_bytes.start + option_byte::IWDG_INI_KEY;
        self.program_half_word(Scope::OptionBytes, base, command as u16)?;
        self.program_half_word(Scope::OptionBytes, base + 2, (command >> 16) as u16)
    }

    /// Keeps the independent watchdog from waking the core out of stop and
    /// standby. Disabling zeroes the watchdog command word rather than the
    /// LSI control word.
    pub fn set_lsi_low_power(&mut self, enable: bool) -> Result<(), FlashError> {
        self.option_command(regs::LSI_LP_CMD, enable)
    }

    /// Gates the debug clock off. Shares the LSI control word, so switching
    /// from one command to the other needs an option-byte erase in between.
    pub fn set_debug_clock_gate(&mut self, enable: bool) -> Result<(), FlashError> {
        self.option_command(regs::DEBUG_CLOCK_CMD, enable)
    }

    /// USER option byte as loaded at reset.
    pub fn user_option_byte(&mut self) -> Result<u32, FlashError> {
        let obr = self.bus.read_u32(self.config.regs.flash(offset::OBR))?;
        Ok(obr >> 2)
    }

    /// WRPR; a cleared bit marks a protected page group.
    pub fn write_protection_option_byte(&mut self) -> Result<u32, FlashError> {
        Ok(self.bus.read_u32(self.config.regs.flash(offset::WRPR))?)
    }

    pub fn readout_protection_status(&mut self) -> Result<bool, FlashError> {
        let obr = self.bus.read_u32(self.config.regs.flash(offset::OBR))?;
        Ok(OptionStatus::from_bits_truncate(obr).contains(OptionStatus::RDPRT))
    }

    fn option_request(&self, kind: OperationKind, field: u32, payload: Payload) -> OperationRequest {
        OperationRequest {
            kind,
            scope: Scope::OptionBytes,
            address: self.config.geometry.option_bytes.start + field,
            payload,
        }
    }

    fn keyed_option_write(&mut self, field: u32, value: u16) -> Result<(), FlashError> {
        let request = self.option_request(OperationKind::Program, field, Payload::HalfWord(value));
        self.keyed_option_writes(&request, &[(field, value)])
    }

    /// Writes a 32-bit command word as two half words, low half first.
    fn option_command(&mut self, command: u32, enable: bool) -> Result<(), FlashError> {
        let (field, word) = if enable {
            (option_byte::LSI_LP_CTL, command)
        } else {
            (option_byte::IWDG_INI_KEY, 0)
        };
        let request = self.option_request(OperationKind::Program, field, Payload::Word(word));
        self.keyed_option_writes(&request, &[(field, word as u16), (field + 2, (word >> 16) as u16)])
    }

    /// Option key first, then drain, then the half words under one OPTPG.
    fn keyed_option_writes(
        &mut self,
        request: &OperationRequest,
        writes: &[(u32, u16)],
    ) -> Result<(), FlashError> {
        self.tracked(request, |seq| {
            seq.ensure_disarmed(OPTPG)?;
            seq.set_state(SequencerState::Unlocking);
            seq.write_keys(offset::OPTKEYR)?;
            let prior = seq.wait_for_completion(seq.config.program_ticks)?;
            if prior != FlashStatus::Complete {
                return Ok(prior);
            }
            seq.program_option_half_words(writes)
        })
    }

    fn erase_and_restore_rdp(&mut self, rdp: u16, program_budget: u32) -> Result<FlashStatus, FlashError> {
        let erase_budget = self.config.erase_ticks;
        let prior = self.wait_for_completion(erase_budget)?;
        if prior != FlashStatus::Complete {
            return Ok(prior);
        }
        self.ensure_disarmed(OPTER)?;

        self.set_state(SequencerState::Unlocking);
        self.write_keys(offset::OPTKEYR)?;
        self.arm(OPTER)?;
        self.invalidate_cache()?;
        self.set_state(SequencerState::Triggered);
        self.start()?;
        self.set_state(SequencerState::Polling);
        let status = self.wait_for_completion(erase_budget)?;
        if status != FlashStatus::Complete {
            self.disarm(OPTER, status, true)?;
            return Ok(status);
        }

        let cr = self.config.regs.flash(offset::CR);
        self.bus.modify_u32(cr, |v| v & !Control::OPTER.bits())?;
        self.program_option_half_words_with(&[(option_byte::RDP, rdp)], program_budget)
    }

    fn program_option_half_words(&mut self, writes: &[(u32, u16)]) -> Result<FlashStatus, FlashError> {
        let budget = self.config.program_ticks;
        self.program_option_half_words_with(writes, budget)
    }

    /// Arms OPTPG once and programs each half word in turn, stopping at the
    /// first one that does not complete.
    fn program_option_half_words_with(
        &mut self,
        writes: &[(u32, u16)],
        budget: u32,
    ) -> Result<FlashStatus, FlashError> {
        let base = self.config.geometry.option_bytes.start;
        self.arm(OPTPG)?;
        let mut status = FlashStatus::Complete;
        for (off, value) in writes {
            self.invalidate_cache()?;
            self.set_state(SequencerState::Triggered);
            self.bus.write_u16((base + off) as u64, *value)?;
            self.set_state(SequencerState::Polling);
            status = self.wait_for_completion(budget)?;
            if status != FlashStatus::Complete {
                break;
            }
        }
        self.disarm(OPTPG, status, true)?;
        Ok(status)
    }
}
