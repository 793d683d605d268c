use crate::geometry::FlashGeometry;
use crate::memory::LinearMemory;
use crate::regs::{
    self, offset, option_byte, AccessControl, Control, ExtControl, OptionStatus, Status,
};
use crate::snapshot::ControllerSnapshot;
use crate::{Peripheral, Scope, SimResult, SimulationError};
use std::collections::BTreeMap;

/// RDP half-word as shipped from the factory: key plus its complement.
const FACTORY_RDP: u16 = 0x5AA5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum KeyStage {
    #[default]
    Idle,
    FirstKey,
    /// A wrong key was written; the register ignores writes until reset.
    Faulted,
}

impl KeyStage {
    /// Feed one key register write. Returns true once the full sequence landed.
    fn accept(&mut self, value: u32) -> bool {
        match (*self, value) {
            (KeyStage::Faulted, _) => false,
            (KeyStage::Idle, regs::KEY1) => {
                *self = KeyStage::FirstKey;
                false
            }
            (KeyStage::FirstKey, regs::KEY2) => {
                *self = KeyStage::Idle;
                true
            }
            _ => {
                *self = KeyStage::Faulted;
                false
            }
        }
    }
}

/// Simulated flash controller together with the arrays it manages.
///
/// Register window semantics:
/// - `KEYR`/`OPTKEYR` take the KEY1, KEY2 sequence; anything else faults the
///   register until [`FlashController::reset`].
/// - Enable bits can only be set while their key domain is open (main bits
///   need `LOCK` clear, info and option-byte bits need `OPTWRE`). Clearing is
///   always accepted.
/// - `STRT`, or a direct write to an armed area, triggers the operation.
///   Triggering with nothing armed raises `WRPRTERR`.
/// - `BSY` stays set for `busy_latency` status reads.
#[derive(Debug)]
pub struct FlashController {
    geometry: FlashGeometry,
    acr: AccessControl,
    latency_ex: u32,
    sr: Status,
    cr: Control,
    ecr: ExtControl,
    ar: u32,
    pw: [u32; 4],
    obr: u32,
    wrpr: u32,
    key: KeyStage,
    opt_key: KeyStage,
    main: LinearMemory,
    info: LinearMemory,
    option_bytes: LinearMemory,
    busy_latency: u32,
    busy_remaining: u32,
    stalled: bool,
    /// The in-flight operation targets the information block.
    info_pending: bool,
    status_reads: u64,
    protocol_violations: u64,
}

impl FlashController {
    pub fn new(geometry: FlashGeometry) -> Self {
        let span = |r: &std::ops::Range<u32>| (r.end - r.start) as usize;
        let main = LinearMemory::new(span(&geometry.main), geometry.main.start);
        let info = LinearMemory::new(span(&geometry.info), geometry.info.start);
        let mut option_bytes =
            LinearMemory::new(span(&geometry.option_bytes), geometry.option_bytes.start);
        option_bytes.write(
            geometry.option_bytes.start + option_byte::RDP,
            FACTORY_RDP as u32,
            2,
        );

        let mut ctrl = Self {
            geometry,
            acr: AccessControl::empty(),
            latency_ex: 0,
            sr: Status::empty(),
            cr: Control::LOCK,
            ecr: ExtControl::empty(),
            ar: 0,
            pw: [0; 4],
            obr: 0,
            wrpr: u32::MAX,
            key: KeyStage::Idle,
            opt_key: KeyStage::Idle,
            main,
            info,
            option_bytes,
            busy_latency: flashseq_config::DEFAULT_BUSY_LATENCY,
            busy_remaining: 0,
            stalled: false,
            info_pending: false,
            status_reads: 0,
            protocol_violations: 0,
        };
        ctrl.reload_option_bytes();
        ctrl
    }

    pub fn with_latency(mut self, busy_latency: u32) -> Self {
        self.busy_latency = busy_latency;
        self
    }

    pub fn geometry(&self) -> &FlashGeometry {
        &self.geometry
    }

    pub fn set_busy_latency(&mut self, busy_latency: u32) {
        self.busy_latency = busy_latency;
    }

    /// Power-on reset: relock both key domains, clear the controller state and
    /// load the option bytes into `OBR`/`WRPR`. Array contents survive.
    pub fn reset(&mut self) {
        self.acr = AccessControl::empty();
        self.latency_ex = 0;
        self.sr = Status::empty();
        self.cr = Control::LOCK;
        self.ecr = ExtControl::empty();
        self.ar = 0;
        self.pw = [0; 4];
        self.key = KeyStage::Idle;
        self.opt_key = KeyStage::Idle;
        self.busy_remaining = 0;
        self.stalled = false;
        self.info_pending = false;
        self.reload_option_bytes();
        tracing::debug!("FLASH: reset, OBR={:#x} WRPR={:#x}", self.obr, self.wrpr);
    }

    /// Keep `BSY` set until [`FlashController::release`].
    pub fn stall(&mut self) {
        self.sr.insert(Status::BSY);
        self.stalled = true;
    }

    pub fn release(&mut self) {
        if self.stalled {
            self.stalled = false;
            self.finish();
        }
    }

    /// Pretend an operation started elsewhere is still running for `reads`
    /// status reads.
    pub fn inject_busy(&mut self, reads: u32) {
        if reads == 0 {
            return;
        }
        self.sr.insert(Status::BSY);
        self.busy_remaining = reads;
        self.info_pending = false;
    }

    pub fn status_reads(&self) -> u64 {
        self.status_reads
    }

    /// Enable bits set, or triggers issued, while `BSY` was high.
    pub fn protocol_violations(&self) -> u64 {
        self.protocol_violations
    }

    pub fn is_locked(&self) -> bool {
        self.cr.contains(Control::LOCK)
    }

    pub fn option_write_enabled(&self) -> bool {
        self.cr.contains(Control::OPTWRE)
    }

    pub fn control(&self) -> Control {
        self.cr
    }

    pub fn extended_control(&self) -> ExtControl {
        self.ecr
    }

    /// Status register without advancing the busy countdown.
    pub fn peek_status(&self) -> Status {
        self.sr
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.geometry.scope_of(addr).is_some()
    }

    pub fn read_memory(&self, addr: u32, width: usize) -> Option<u32> {
        let scope = self.geometry.scope_of(addr)?;
        self.memory(scope).read(addr, width)
    }

    /// Direct data write into one of the arrays. Programs when the matching
    /// enable bit is armed.
    pub fn write_memory(&mut self, addr: u32, value: u32, width: usize) -> SimResult<()> {
        let scope = self
            .geometry
            .scope_of(addr)
            .ok_or(SimulationError::MemoryViolation(addr as u64))?;

        if self.sr.contains(Status::BSY) {
            self.protocol_violations += 1;
            tracing::warn!("FLASH: write to {:#x} while busy ignored", addr);
            return Ok(());
        }

        let armed = match (scope, width) {
            (Scope::Main, 4) => self.ecr.contains(ExtControl::WPG),
            (Scope::Main, 2) => self.cr.contains(Control::PG),
            (Scope::Info, 4) => self.ecr.contains(ExtControl::INF_WPG),
            (Scope::Info, 2) => self.ecr.contains(ExtControl::INF_HWPG),
            (Scope::OptionBytes, 2) => self.cr.contains(Control::OPTPG),
            _ => false,
        };
        if !armed {
            self.fail(Status::WRPRTERR, "direct write without program enable");
            return Ok(());
        }

        match self.program_at(scope, addr, value, width) {
            Ok(()) => self.begin(scope == Scope::Info),
            Err(flag) => self.fail(flag, "direct program rejected"),
        }
        Ok(())
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        let mut registers = BTreeMap::new();
        registers.insert("acr".to_string(), self.acr.bits());
        registers.insert("latency_ex".to_string(), self.latency_ex);
        registers.insert("sr".to_string(), self.sr.bits());
        registers.insert("cr".to_string(), self.cr.bits());
        registers.insert("ecr".to_string(), self.ecr.bits());
        registers.insert("ar".to_string(), self.ar);
        registers.insert("obr".to_string(), self.obr);
        registers.insert("wrpr".to_string(), self.wrpr);

        let base = self.geometry.option_bytes.start;
        let option_bytes = (0..self.option_bytes.data.len() as u32 / 2)
            .filter_map(|i| self.option_bytes.read_u16(base + i * 2))
            .collect();

        ControllerSnapshot {
            registers,
            option_bytes,
            status_reads: self.status_reads,
            protocol_violations: self.protocol_violations,
        }
    }

    fn memory(&self, scope: Scope) -> &LinearMemory {
        match scope {
            Scope::Main => &self.main,
            Scope::Info => &self.info,
            Scope::OptionBytes => &self.option_bytes,
        }
    }

    fn memory_mut(&mut self, scope: Scope) -> &mut LinearMemory {
        match scope {
            Scope::Main => &mut self.main,
            Scope::Info => &mut self.info,
            Scope::OptionBytes => &mut self.option_bytes,
        }
    }

    fn reload_option_bytes(&mut self) {
        let base = self.geometry.option_bytes.start;
        let byte = |ob: &LinearMemory, off: u32| {
            ob.read_u16(base + off).map_or(0xFF, |hw| (hw & 0xFF) as u32)
        };

        let mut obr = 0;
        if byte(&self.option_bytes, option_byte::RDP) != regs::RDP_KEY as u32 {
            obr |= OptionStatus::RDPRT.bits();
        }
        obr |= byte(&self.option_bytes, option_byte::USER) << 2;
        self.obr = obr;

        self.wrpr = option_byte::WRP
            .iter()
            .enumerate()
            .fold(0, |acc, (i, off)| acc | (byte(&self.option_bytes, *off) << (i * 8)));
    }

    fn write_protected(&self, addr: u32) -> bool {
        match self.geometry.wrp_bit(addr) {
            Some(bit) => self.wrpr & (1 << bit) == 0,
            None => false,
        }
    }

    fn program_at(&mut self, scope: Scope, addr: u32, value: u32, width: usize) -> Result<(), Status> {
        if addr as usize % width != 0 {
            return Err(Status::PGERR);
        }
        if scope == Scope::Main && self.write_protected(addr) {
            return Err(Status::WRPRTERR);
        }
        let erased = if width == 4 { u32::MAX } else { 0xFFFF };
        let current = self.memory(scope).read(addr, width).ok_or(Status::PGERR)?;
        // Bits can only be cleared; an all-zero write is always accepted.
        if current != erased && value != 0 {
            return Err(Status::PGERR);
        }
        self.memory_mut(scope).write(addr, value, width);
        Ok(())
    }

    fn erase_block(&mut self, scope: Scope, addr: u32, size: u32) -> Result<(), Status> {
        let range = self.geometry.range(scope).clone();
        if !range.contains(&addr) {
            return Err(Status::PGERR);
        }
        if scope == Scope::Main && self.write_protected(addr) {
            return Err(Status::WRPRTERR);
        }
        let start = range.start + ((addr - range.start) & !(size - 1));
        if !self.memory_mut(scope).erase(start, size as usize) {
            return Err(Status::PGERR);
        }
        tracing::debug!("FLASH: erased {:#x} bytes at {:#x}", size, start);
        Ok(())
    }

    fn program_payload(&mut self, scope: Scope, words: usize) -> Result<(), Status> {
        for i in 0..words {
            let addr = self.ar.wrapping_add(4 * i as u32);
            if self.geometry.scope_of(addr) != Some(scope) {
                return Err(Status::PGERR);
            }
        }
        for i in 0..words {
            let addr = self.ar + 4 * i as u32;
            self.program_at(scope, addr, self.pw[i], 4)?;
        }
        Ok(())
    }

    fn start(&mut self) {
        if self.sr.contains(Status::BSY) {
            self.protocol_violations += 1;
            tracing::warn!("FLASH: STRT while busy ignored");
            return;
        }

        let armed_cr = self.cr & (Control::PER | Control::MER | Control::OPTER);
        let armed_ecr = self.ecr
            & (ExtControl::HPER
                | ExtControl::INF_HPER
                | ExtControl::WPG2
                | ExtControl::WPG4
                | ExtControl::INF_WPG2
                | ExtControl::INF_WPG4);
        match armed_cr.bits().count_ones() + armed_ecr.bits().count_ones() {
            0 => return self.fail(Status::WRPRTERR, "STRT without an armed operation"),
            1 => {}
            _ => return self.fail(Status::PGERR, "conflicting operations armed"),
        }

        let page = self.geometry.page_size;
        let half = self.geometry.half_page_size();
        let ar = self.ar;
        let (scope, result) = if armed_cr.contains(Control::PER) {
            (Scope::Main, self.erase_block(Scope::Main, ar, page))
        } else if armed_cr.contains(Control::MER) {
            let result = if self.wrpr != u32::MAX {
                Err(Status::WRPRTERR)
            } else {
                self.main.erase_all();
                Ok(())
            };
            (Scope::Main, result)
        } else if armed_cr.contains(Control::OPTER) {
            self.option_bytes.erase_all();
            (Scope::OptionBytes, Ok(()))
        } else if armed_ecr.contains(ExtControl::HPER) {
            (Scope::Main, self.erase_block(Scope::Main, ar, half))
        } else if armed_ecr.contains(ExtControl::INF_HPER) {
            (Scope::Info, self.erase_block(Scope::Info, ar, half))
        } else if armed_ecr.contains(ExtControl::WPG2) {
            (Scope::Main, self.program_payload(Scope::Main, 2))
        } else if armed_ecr.contains(ExtControl::WPG4) {
            (Scope::Main, self.program_payload(Scope::Main, 4))
        } else if armed_ecr.contains(ExtControl::INF_WPG2) {
            (Scope::Info, self.program_payload(Scope::Info, 2))
        } else {
            (Scope::Info, self.program_payload(Scope::Info, 4))
        };

        match result {
            Ok(()) => self.begin(scope == Scope::Info),
            Err(flag) => self.fail(flag, "operation rejected"),
        }
    }

    fn begin(&mut self, info: bool) {
        self.info_pending = info;
        if self.busy_latency == 0 {
            self.finish();
        } else {
            self.sr.insert(Status::BSY);
            self.busy_remaining = self.busy_latency;
        }
    }

    fn finish(&mut self) {
        self.sr.remove(Status::BSY);
        self.sr.insert(Status::EOP);
        self.busy_remaining = 0;
        if self.info_pending {
            // Every information-block operation needs a fresh option key.
            self.cr.remove(Control::OPTWRE);
            self.info_pending = false;
        }
    }

    fn fail(&mut self, flag: Status, reason: &str) {
        tracing::debug!("FLASH: {} ({:?})", reason, flag);
        self.sr.insert(flag);
    }

    fn is_busy(&self) -> bool {
        self.sr.contains(Status::BSY)
    }

    /// Apply a write to a register where `gated` bits may only be set while
    /// `may_set` holds. Clearing is always allowed.
    fn gated(old: u32, req: u32, gated: u32, may_set: bool) -> u32 {
        let kept = if may_set { req & gated } else { old & req & gated };
        (old & !gated) | kept
    }

    fn arms_while_busy(&self, old: u32, new: u32) -> bool {
        self.is_busy() && (new & !old) != 0
    }

    fn write_cr(&mut self, value: u32) {
        let old = self.cr.bits();
        let locked = self.is_locked();
        let optwre = self.option_write_enabled();

        let mut new = Self::gated(old, value, Control::MAIN_ENABLES.bits(), !locked);
        new = Self::gated(new, value, Control::OPTION_ENABLES.bits(), optwre);
        if value & Control::LOCK.bits() != 0 {
            new |= Control::LOCK.bits();
        }
        if value & Control::OPTWRE.bits() == 0 {
            new &= !Control::OPTWRE.bits();
        }

        let enables = (Control::MAIN_ENABLES | Control::OPTION_ENABLES).bits();
        if self.arms_while_busy(old & enables, new & enables) {
            self.protocol_violations += 1;
            tracing::warn!("FLASH: CR enable set while busy");
        }
        self.cr = Control::from_bits_truncate(new);

        if value & Control::STRT.bits() != 0 {
            if !locked || optwre {
                self.start();
            } else {
                self.fail(Status::WRPRTERR, "STRT while locked");
            }
        }
    }

    fn write_ecr(&mut self, value: u32) {
        let old = self.ecr.bits();
        let mut new = Self::gated(old, value, ExtControl::MAIN_ENABLES.bits(), !self.is_locked());
        new = Self::gated(
            new,
            value,
            ExtControl::INFO_ENABLES.bits(),
            self.option_write_enabled(),
        );
        if self.arms_while_busy(old, new) {
            self.protocol_violations += 1;
            tracing::warn!("FLASH: ECR enable set while busy");
        }
        self.ecr = ExtControl::from_bits_truncate(new);
    }
}

impl Peripheral for FlashController {
    fn read(&mut self, offset: u64) -> SimResult<u32> {
        let value = match offset {
            offset::ACR => {
                let mut acr = self.acr;
                acr.set(AccessControl::PRFTBS, acr.contains(AccessControl::PRFTBE));
                acr.bits()
            }
            offset::SR => {
                self.status_reads += 1;
                let value = self.sr.bits();
                if self.is_busy() && !self.stalled {
                    self.busy_remaining = self.busy_remaining.saturating_sub(1);
                    if self.busy_remaining == 0 {
                        self.finish();
                    }
                }
                value
            }
            offset::CR => self.cr.bits(),
            offset::AR => self.ar,
            offset::OBR => self.obr,
            offset::WRPR => self.wrpr,
            offset::ECR => self.ecr.bits(),
            offset::PW0 => self.pw[0],
            offset::PW1 => self.pw[1],
            offset::PW2 => self.pw[2],
            offset::PW3 => self.pw[3],
            offset::LATENCY_EX => self.latency_ex,
            // KEYR and OPTKEYR read as zero
            _ => 0,
        };
        Ok(value)
    }

    fn write(&mut self, offset: u64, value: u32) -> SimResult<()> {
        match offset {
            offset::ACR => {
                let writable = AccessControl::LATENCY | AccessControl::HLFCYA | AccessControl::PRFTBE;
                self.acr = AccessControl::from_bits_truncate(value) & writable;
            }
            offset::KEYR => {
                if self.key.accept(value) {
                    self.cr.remove(Control::LOCK);
                    tracing::debug!("FLASH: main array unlocked");
                } else if self.key == KeyStage::Faulted {
                    self.cr.insert(Control::LOCK);
                    tracing::warn!("FLASH: bad key {:#x}, KEYR locked until reset", value);
                }
            }
            offset::OPTKEYR => {
                if self.opt_key.accept(value) {
                    self.cr.insert(Control::OPTWRE);
                    tracing::debug!("FLASH: option write enabled");
                } else if self.opt_key == KeyStage::Faulted {
                    self.cr.remove(Control::OPTWRE);
                    tracing::warn!("FLASH: bad option key {:#x}, OPTKEYR locked until reset", value);
                }
            }
            offset::SR => {
                // Write one to clear
                let clear = Status::from_bits_truncate(value)
                    & (Status::PGERR | Status::WRPRTERR | Status::EOP);
                self.sr.remove(clear);
            }
            offset::CR => self.write_cr(value),
            offset::AR => self.ar = value,
            offset::ECR => self.write_ecr(value),
            offset::PW0 => self.pw[0] = value,
            offset::PW1 => self.pw[1] = value,
            offset::PW2 => self.pw[2] = value,
            offset::PW3 => self.pw[3] = value,
            offset::LATENCY_EX => self.latency_ex = value & 0x3,
            _ => {}
        }
        Ok(())
    }
}
