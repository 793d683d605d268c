//! Register-level flash operation sequencer.
//!
//! Every operation follows the same protocol: drain the previous operation,
//! write the key sequence its scope needs, arm exactly one enable bit, stage
//! the payload, invalidate the cache, trigger, poll with a bounded budget and
//! finally disarm according to the [`DisarmPolicy`].

use crate::geometry::FlashGeometry;
use crate::regs::{self, offset, Control, EnableBit, ExtControl, RegisterMap, Status};
use crate::{Bus, DisarmPolicy, EraseMode, Outcome, Region, Scope, SimulationError};
use flashseq_config::DeviceDescriptor;
use std::sync::Arc;

mod access;
mod option_bytes;
pub mod plan;

pub use access::FlashFlag;
use plan::{Budget, OperationPlan, PayloadShape, Trigger, UnlockMode};

/// Result of one status-register evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashStatus {
    Busy,
    Complete,
    ProgramError,
    WriteProtectError,
    Timeout,
}

impl FlashStatus {
    pub fn from_bits(sr: Status) -> Self {
        if sr.contains(Status::BSY) {
            FlashStatus::Busy
        } else if sr.contains(Status::PGERR) {
            FlashStatus::ProgramError
        } else if sr.contains(Status::WRPRTERR) {
            FlashStatus::WriteProtectError
        } else {
            FlashStatus::Complete
        }
    }

    /// Terminal status as an operation result.
    pub fn into_result(self) -> Result<(), FlashError> {
        match self {
            FlashStatus::Complete => Ok(()),
            FlashStatus::ProgramError => Err(FlashError::ProgramError),
            FlashStatus::WriteProtectError => Err(FlashError::WriteProtectError),
            // Polling never hands back Busy, only Timeout.
            FlashStatus::Busy | FlashStatus::Timeout => Err(FlashError::Timeout),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlashError {
    #[error("Address {address:#010x} is not a valid {scope:?} target")]
    InvalidAddress { scope: Scope, address: u32 },
    #[error("Invalid payload of {0} words")]
    InvalidPayload(usize),
    #[error("{kind:?} is not supported on {scope:?}")]
    UnsupportedOperation { kind: OperationKind, scope: Scope },
    #[error("Latency {0} exceeds the maximum of 31 wait states")]
    InvalidLatency(u32),
    #[error("Programming error")]
    ProgramError,
    #[error("Write protection error")]
    WriteProtectError,
    #[error("Operation timed out")]
    Timeout,
    #[error("{0:?} is still armed by an earlier operation")]
    StillArmed(EnableBit),
    #[error("Bus fault: {0}")]
    Bus(#[from] SimulationError),
}

impl From<&FlashError> for Outcome {
    fn from(err: &FlashError) -> Self {
        match err {
            FlashError::InvalidAddress { .. } => Outcome::InvalidAddress,
            FlashError::InvalidPayload(_) | FlashError::InvalidLatency(_) => {
                Outcome::InvalidPayload
            }
            FlashError::UnsupportedOperation { .. } => Outcome::UnsupportedOperation,
            FlashError::ProgramError => Outcome::ProgramError,
            FlashError::WriteProtectError => Outcome::WriteProtectError,
            FlashError::Timeout => Outcome::Timeout,
            FlashError::StillArmed(_) => Outcome::StillArmed,
            FlashError::Bus(_) => Outcome::BusFault,
        }
    }
}

impl From<FlashStatus> for Outcome {
    fn from(status: FlashStatus) -> Self {
        match status {
            FlashStatus::Complete => Outcome::Complete,
            FlashStatus::ProgramError => Outcome::ProgramError,
            FlashStatus::WriteProtectError => Outcome::WriteProtectError,
            FlashStatus::Busy | FlashStatus::Timeout => Outcome::Timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    None,
    HalfWord(u16),
    Word(u32),
    TwoWords([u32; 2]),
    FourWords([u32; 4]),
}

impl Payload {
    /// Packs 1, 2 or 4 words.
    pub fn from_words(words: &[u32]) -> Result<Self, FlashError> {
        match *words {
            [w] => Ok(Payload::Word(w)),
            [a, b] => Ok(Payload::TwoWords([a, b])),
            [a, b, c, d] => Ok(Payload::FourWords([a, b, c, d])),
            _ => Err(FlashError::InvalidPayload(words.len())),
        }
    }

    pub fn words(&self) -> &[u32] {
        match self {
            Payload::Word(w) => std::slice::from_ref(w),
            Payload::TwoWords(w) => w,
            Payload::FourWords(w) => w,
            Payload::None | Payload::HalfWord(_) => &[],
        }
    }

    fn word_count(&self) -> usize {
        match self {
            Payload::None => 0,
            Payload::HalfWord(_) => 0,
            _ => self.words().len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Erase(EraseMode),
    Program,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub scope: Scope,
    pub address: u32,
    pub payload: Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    Unlocking,
    Armed,
    Triggered,
    Polling,
    Complete,
    Error,
    Timeout,
}

/// Hooks into the sequencer's progress. All methods default to no-ops.
pub trait SequencerObserver: std::fmt::Debug + Send + Sync {
    fn on_operation_start(&self, _request: &OperationRequest) {}
    fn on_state_change(&self, _from: SequencerState, _to: SequencerState) {}
    fn on_poll(&self, _status: FlashStatus) {}
    fn on_operation_end(&self, _request: &OperationRequest, _result: &Result<(), FlashError>) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerConfig {
    pub regs: RegisterMap,
    pub geometry: FlashGeometry,
    pub erase_ticks: u32,
    pub program_ticks: u32,
    pub disarm_policy: DisarmPolicy,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            regs: RegisterMap::default(),
            geometry: FlashGeometry::hk32f39a(),
            erase_ticks: flashseq_config::DEFAULT_ERASE_TICKS,
            program_ticks: flashseq_config::DEFAULT_PROGRAM_TICKS,
            disarm_policy: DisarmPolicy::default(),
        }
    }
}

impl SequencerConfig {
    pub fn from_descriptor(device: &DeviceDescriptor) -> anyhow::Result<Self> {
        Ok(Self {
            regs: RegisterMap {
                flash: device.registers.flash,
                cache: device.registers.cache,
            },
            geometry: FlashGeometry::from_descriptor(device)?,
            erase_ticks: device.timeouts.erase_ticks,
            program_ticks: device.timeouts.program_ticks,
            disarm_policy: device.disarm_policy,
        })
    }

    fn budget(&self, budget: Budget) -> u32 {
        match budget {
            Budget::Erase => self.erase_ticks,
            Budget::Program => self.program_ticks,
        }
    }
}

/// Drives erase and program operations over a register [`Bus`].
///
/// Every method takes `&mut self`, so an operation owns the controller from
/// the first key write to the final disarm.
#[derive(Debug)]
pub struct FlashSequencer<B: Bus> {
    bus: B,
    config: SequencerConfig,
    state: SequencerState,
    observers: Vec<Arc<dyn SequencerObserver>>,
}

impl<B: Bus> FlashSequencer<B> {
    pub fn new(bus: B, config: SequencerConfig) -> Self {
        Self {
            bus,
            config,
            state: SequencerState::Idle,
            observers: Vec::new(),
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn SequencerObserver>) {
        self.observers.push(observer);
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Writes the KEY1/KEY2 sequence to the region's key register.
    pub fn unlock(&mut self, region: Region) -> Result<(), FlashError> {
        self.set_state(SequencerState::Unlocking);
        let result = match region {
            Region::Main => self.write_keys(offset::KEYR),
            Region::Info => self.write_keys(offset::OPTKEYR),
        };
        self.set_state(SequencerState::Idle);
        if result.is_ok() {
            tracing::debug!("Unlocked {:?}", region);
        }
        result
    }

    /// Main sets `CR.LOCK`, Info clears `CR.OPTWRE`.
    pub fn lock(&mut self, region: Region) -> Result<(), FlashError> {
        let cr = self.config.regs.flash(offset::CR);
        match region {
            Region::Main => self.bus.modify_u32(cr, |v| v | Control::LOCK.bits())?,
            Region::Info => self.bus.modify_u32(cr, |v| v & !Control::OPTWRE.bits())?,
        }
        tracing::debug!("Locked {:?}", region);
        Ok(())
    }

    /// One status-register read, decoded.
    pub fn status(&mut self) -> Result<FlashStatus, FlashError> {
        let sr = self.bus.read_u32(self.config.regs.flash(offset::SR))?;
        let status = FlashStatus::from_bits(Status::from_bits_truncate(sr));
        for observer in &self.observers {
            observer.on_poll(status);
        }
        Ok(status)
    }

    /// Polls at most `timeout_ticks` times for the controller to leave Busy.
    pub fn wait_for_completion(&mut self, timeout_ticks: u32) -> Result<FlashStatus, FlashError> {
        for _ in 0..timeout_ticks {
            let status = self.status()?;
            if status != FlashStatus::Busy {
                return Ok(status);
            }
        }
        Ok(FlashStatus::Timeout)
    }

    pub fn erase(&mut self, mode: EraseMode, scope: Scope, address: u32) -> Result<(), FlashError> {
        self.execute(&OperationRequest {
            kind: OperationKind::Erase(mode),
            scope,
            address,
            payload: Payload::None,
        })
    }

    /// Programs 1, 2 or 4 consecutive words.
    pub fn program(&mut self, scope: Scope, address: u32, words: &[u32]) -> Result<(), FlashError> {
        let payload = Payload::from_words(words)?;
        self.execute(&OperationRequest {
            kind: OperationKind::Program,
            scope,
            address,
            payload,
        })
    }

    pub fn program_half_word(&mut self, scope: Scope, address: u32, value: u16) -> Result<(), FlashError> {
        self.execute(&OperationRequest {
            kind: OperationKind::Program,
            scope,
            address,
            payload: Payload::HalfWord(value),
        })
    }

    /// Runs a single operation through the dispatch table.
    pub fn execute(&mut self, request: &OperationRequest) -> Result<(), FlashError> {
        let request = *request;
        self.tracked(&request, |seq| {
            let shape = PayloadShape::from(&request.payload);
            let plan = plan::lookup(request.kind, request.scope, shape).ok_or_else(|| {
                match (request.kind, shape) {
                    (OperationKind::Program, PayloadShape::None) => FlashError::InvalidPayload(0),
                    (OperationKind::Erase(_), PayloadShape::None) | (OperationKind::Program, _) => {
                        FlashError::UnsupportedOperation {
                            kind: request.kind,
                            scope: request.scope,
                        }
                    }
                    (OperationKind::Erase(_), _) => {
                        FlashError::InvalidPayload(request.payload.word_count())
                    }
                }
            })?;
            if plan.writes_address || plan.trigger != Trigger::Start {
                seq.config.geometry.check(
                    request.scope,
                    request.address,
                    plan.span(shape),
                    plan.alignment(shape),
                )?;
            }
            seq.run_plan(plan, &request)
        })
    }

    fn run_plan(&mut self, plan: &OperationPlan, request: &OperationRequest) -> Result<FlashStatus, FlashError> {
        let budget = self.config.budget(plan.budget);
        let prior = self.wait_for_completion(budget)?;
        if prior != FlashStatus::Complete {
            tracing::warn!("Previous operation not complete ({:?}), {:?} not started", prior, request.kind);
            return Ok(prior);
        }
        self.ensure_disarmed(plan.enable)?;

        self.set_state(SequencerState::Unlocking);
        match plan.unlock {
            UnlockMode::None => {}
            UnlockMode::OptionKey => self.write_keys(offset::OPTKEYR)?,
            UnlockMode::MainAndOptionKey => {
                self.write_keys(offset::KEYR)?;
                self.write_keys(offset::OPTKEYR)?;
            }
        }

        self.arm(plan.enable)?;
        for (slot, word) in request.payload.words().iter().take(plan.staged_words).enumerate() {
            self.bus.write_u32(self.config.regs.flash(offset::PAYLOAD[slot]), *word)?;
        }
        if plan.writes_address {
            self.bus.write_u32(self.config.regs.flash(offset::AR), request.address)?;
        }
        self.invalidate_cache()?;

        self.set_state(SequencerState::Triggered);
        let target = request.address as u64;
        match (plan.trigger, request.payload) {
            (Trigger::DirectWord, Payload::Word(word)) => self.bus.write_u32(target, word)?,
            (Trigger::DirectHalfWord, Payload::HalfWord(value)) => self.bus.write_u16(target, value)?,
            _ => self.start()?,
        }

        self.set_state(SequencerState::Polling);
        let status = self.wait_for_completion(budget)?;
        self.disarm(plan.enable, status, plan.option_path)?;
        Ok(status)
    }

    /// Wraps an operation body with observer notifications and the terminal
    /// state transitions.
    fn tracked<F>(&mut self, request: &OperationRequest, body: F) -> Result<(), FlashError>
    where
        F: FnOnce(&mut Self) -> Result<FlashStatus, FlashError>,
    {
        for observer in &self.observers {
            observer.on_operation_start(request);
        }

        let result = body(self).and_then(FlashStatus::into_result);
        let terminal = match &result {
            Ok(()) => SequencerState::Complete,
            Err(FlashError::Timeout) => SequencerState::Timeout,
            Err(_) => SequencerState::Error,
        };
        self.set_state(terminal);

        match &result {
            Ok(()) => tracing::info!(
                "{:?} {:?} at {:#010x} complete",
                request.kind,
                request.scope,
                request.address
            ),
            Err(e) => tracing::warn!(
                "{:?} {:?} at {:#010x} failed: {}",
                request.kind,
                request.scope,
                request.address,
                e
            ),
        }

        for observer in &self.observers {
            observer.on_operation_end(request, &result);
        }
        self.set_state(SequencerState::Idle);
        result
    }

    fn set_state(&mut self, to: SequencerState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        for observer in &self.observers {
            observer.on_state_change(from, to);
        }
    }

    fn write_keys(&mut self, key_register: u64) -> Result<(), FlashError> {
        let addr = self.config.regs.flash(key_register);
        self.bus.write_u32(addr, regs::KEY1)?;
        self.bus.write_u32(addr, regs::KEY2)?;
        Ok(())
    }

    /// Refuses to arm `enable` while a different operation's enable bit is
    /// still set, e.g. after an option-byte timeout left OPTPG behind.
    fn ensure_disarmed(&mut self, enable: EnableBit) -> Result<(), FlashError> {
        let cr = self.bus.read_u32(self.config.regs.flash(offset::CR))?;
        let ecr = self.bus.read_u32(self.config.regs.flash(offset::ECR))?;
        let mut cr = Control::from_bits_truncate(cr) & Control::OPERATIONS;
        let mut ecr = ExtControl::from_bits_truncate(ecr);
        match enable {
            EnableBit::Control(bit) => cr.remove(bit),
            EnableBit::Extended(bit) => ecr.remove(bit),
        }

        let leftover = if !cr.is_empty() {
            EnableBit::Control(cr)
        } else if !ecr.is_empty() {
            EnableBit::Extended(ecr)
        } else {
            return Ok(());
        };
        tracing::warn!("{:?} still armed, {:?} not started", leftover, enable);
        Err(FlashError::StillArmed(leftover))
    }

    fn arm(&mut self, enable: EnableBit) -> Result<(), FlashError> {
        let addr = self.config.regs.flash(enable.offset());
        self.bus.modify_u32(addr, |v| v | enable.mask())?;
        self.set_state(SequencerState::Armed);
        tracing::debug!("Armed {:?}", enable);
        Ok(())
    }

    fn disarm(&mut self, enable: EnableBit, status: FlashStatus, option_path: bool) -> Result<(), FlashError> {
        let clear = match self.config.disarm_policy {
            DisarmPolicy::Always => true,
            DisarmPolicy::SkipOnTimeout => status != FlashStatus::Timeout,
            DisarmPolicy::AsBuilt => !option_path || status != FlashStatus::Timeout,
        };
        if clear {
            let addr = self.config.regs.flash(enable.offset());
            self.bus.modify_u32(addr, |v| v & !enable.mask())?;
        } else {
            tracing::warn!("{:?} left armed after timeout", enable);
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), FlashError> {
        let cr = self.config.regs.flash(offset::CR);
        self.bus.modify_u32(cr, |v| v | Control::STRT.bits())?;
        Ok(())
    }

    fn invalidate_cache(&mut self) -> Result<(), FlashError> {
        let ctl = self.config.regs.cache_ctl();
        self.bus.modify_u32(ctl, |v| v | regs::CACHE_INVALIDATE)?;
        Ok(())
    }
}
