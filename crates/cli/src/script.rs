use flashseq_config::{
    ClearFlagsStep, EraseStep, HalfWordStep, LatencyStep, LockStep, MemoryWordAssertion,
    OperationScript, Outcome, PrefetchStep, ProgramStep, ReadoutAssertion, ReadoutProtectStep,
    ResetStep, ScriptAssertion, ScriptStep, StatusAssertion, UnlockStep, UserOptionStep,
    WriteProtectStep,
};
use flashseq_core::bus::SystemBus;
use flashseq_core::regs::Status;
use flashseq_core::{Bus, FlashError, FlashSequencer};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub step: &'static str,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AssertionRecord {
    pub assertion: ScriptAssertion,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

#[derive(Debug)]
pub struct ScriptReport {
    pub steps: Vec<StepRecord>,
    pub assertions: Vec<AssertionRecord>,
    pub final_outcome: Outcome,
}

impl ScriptReport {
    /// Without assertions a script passes when its last step completed.
    pub fn passed(&self) -> bool {
        if self.assertions.is_empty() {
            self.final_outcome == Outcome::Complete
        } else {
            self.assertions.iter().all(|a| a.passed)
        }
    }
}

fn step_name(step: &ScriptStep) -> &'static str {
    match step {
        ScriptStep::Unlock(_) => "unlock",
        ScriptStep::Lock(_) => "lock",
        ScriptStep::Erase(_) => "erase",
        ScriptStep::Program(_) => "program",
        ScriptStep::ProgramHalfWord(_) => "program_half_word",
        ScriptStep::ClearFlags(_) => "clear_flags",
        ScriptStep::SetLatency(_) => "set_latency",
        ScriptStep::Prefetch(_) => "prefetch",
        ScriptStep::WriteProtect(_) => "write_protect",
        ScriptStep::ReadoutProtect(_) => "readout_protect",
        ScriptStep::UserOptionBytes(_) => "user_option_bytes",
        ScriptStep::Reset(_) => "reset",
    }
}

fn run_step(seq: &mut FlashSequencer<SystemBus>, step: &ScriptStep) -> Result<(), FlashError> {
    match step {
        ScriptStep::Unlock(UnlockStep { unlock }) => seq.unlock(*unlock),
        ScriptStep::Lock(LockStep { lock }) => seq.lock(*lock),
        ScriptStep::Erase(EraseStep { erase }) => seq.erase(erase.mode, erase.scope, erase.address),
        ScriptStep::Program(ProgramStep { program }) => {
            seq.program(program.scope, program.address, &program.words)
        }
        ScriptStep::ProgramHalfWord(HalfWordStep { program_half_word: hw }) => {
            seq.program_half_word(hw.scope, hw.address, hw.value)
        }
        ScriptStep::ClearFlags(ClearFlagsStep { clear_flags }) => {
            if *clear_flags {
                seq.clear_flags(Status::all())
            } else {
                Ok(())
            }
        }
        ScriptStep::SetLatency(LatencyStep { set_latency }) => seq.set_latency(*set_latency),
        ScriptStep::Prefetch(PrefetchStep { prefetch }) => seq.set_prefetch_buffer(*prefetch),
        ScriptStep::WriteProtect(WriteProtectStep { write_protect }) => {
            seq.enable_write_protection(*write_protect)
        }
        ScriptStep::ReadoutProtect(ReadoutProtectStep { readout_protect }) => {
            seq.set_readout_protection(*readout_protect)
        }
        ScriptStep::UserOptionBytes(UserOptionStep { user_option_bytes: u }) => {
            seq.configure_user_option_bytes(u.iwdg_software, u.stop_no_reset, u.standby_no_reset)
        }
        ScriptStep::Reset(ResetStep { reset }) => {
            if *reset {
                seq.bus_mut().flash.reset();
            }
            Ok(())
        }
    }
}

fn check(
    seq: &mut FlashSequencer<SystemBus>,
    assertion: &ScriptAssertion,
    final_outcome: Outcome,
) -> AssertionRecord {
    let (passed, actual) = match assertion {
        ScriptAssertion::ExpectedStatus(StatusAssertion { expected_status }) => {
            (*expected_status == final_outcome, format!("{:?}", final_outcome))
        }
        ScriptAssertion::MemoryWord(MemoryWordAssertion { memory_word }) => {
            match seq.bus_mut().read_u32(memory_word.address as u64) {
                Ok(value) => (value == memory_word.value, format!("{:#010x}", value)),
                Err(e) => (false, e.to_string()),
            }
        }
        ScriptAssertion::ReadoutProtected(ReadoutAssertion { readout_protected }) => {
            match seq.readout_protection_status() {
                Ok(active) => (active == *readout_protected, active.to_string()),
                Err(e) => (false, e.to_string()),
            }
        }
    };
    AssertionRecord {
        assertion: assertion.clone(),
        passed,
        actual: (!passed).then_some(actual),
    }
}

/// Executes every step in order, then evaluates the assertions against the
/// outcome of the last executed step.
pub fn run_script(seq: &mut FlashSequencer<SystemBus>, script: &OperationScript) -> ScriptReport {
    let mut steps = Vec::with_capacity(script.steps.len());
    let mut final_outcome = Outcome::Complete;

    for (index, step) in script.steps.iter().enumerate() {
        let name = step_name(step);
        let result = run_step(seq, step);
        let (outcome, detail) = match &result {
            Ok(()) => (Outcome::Complete, None),
            Err(e) => (Outcome::from(e), Some(e.to_string())),
        };
        info!("Step {} ({}): {:?}", index, name, outcome);
        steps.push(StepRecord {
            index,
            step: name,
            outcome,
            detail,
        });
        final_outcome = outcome;

        if result.is_err() && !script.limits.continue_on_error {
            warn!("Stopping after failed step {}", index);
            break;
        }
    }

    let assertions = script
        .assertions
        .iter()
        .map(|a| check(seq, a, final_outcome))
        .collect();

    ScriptReport {
        steps,
        assertions,
        final_outcome,
    }
}
