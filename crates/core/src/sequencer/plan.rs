//! Dispatch table mapping an operation shape onto the register protocol that
//! carries it out.

use super::{OperationKind, Payload};
use crate::regs::{Control, EnableBit, ExtControl};
use crate::{EraseMode, Scope};

/// Key sequences written after the prior operation has drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockMode {
    None,
    OptionKey,
    /// KEYR then OPTKEYR.
    MainAndOptionKey,
}

/// What starts the operation once it is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Start,
    DirectWord,
    DirectHalfWord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    Erase,
    Program,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    None,
    HalfWord,
    Words(usize),
}

impl From<&Payload> for PayloadShape {
    fn from(payload: &Payload) -> Self {
        match payload {
            Payload::None => PayloadShape::None,
            Payload::HalfWord(_) => PayloadShape::HalfWord,
            Payload::Word(_) => PayloadShape::Words(1),
            Payload::TwoWords(_) => PayloadShape::Words(2),
            Payload::FourWords(_) => PayloadShape::Words(4),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationPlan {
    pub enable: EnableBit,
    pub unlock: UnlockMode,
    /// Words staged in PW0.. before the trigger.
    pub staged_words: usize,
    pub writes_address: bool,
    pub trigger: Trigger,
    pub budget: Budget,
    /// Option-byte paths keep their enable bit on timeout under
    /// `DisarmPolicy::AsBuilt`.
    pub option_path: bool,
}

impl OperationPlan {
    /// Bytes touched at the target address, for range checks.
    pub fn span(&self, shape: PayloadShape) -> u32 {
        match shape {
            PayloadShape::None => 4,
            PayloadShape::HalfWord => 2,
            PayloadShape::Words(n) => 4 * n as u32,
        }
    }

    pub fn alignment(&self, shape: PayloadShape) -> u32 {
        match shape {
            PayloadShape::HalfWord => 2,
            _ => 4,
        }
    }
}

struct PlanEntry {
    kind: OperationKind,
    scope: Scope,
    shape: PayloadShape,
    plan: OperationPlan,
}

const fn erase(
    mode: EraseMode,
    scope: Scope,
    enable: EnableBit,
    unlock: UnlockMode,
    writes_address: bool,
    option_path: bool,
) -> PlanEntry {
    PlanEntry {
        kind: OperationKind::Erase(mode),
        scope,
        shape: PayloadShape::None,
        plan: OperationPlan {
            enable,
            unlock,
            staged_words: 0,
            writes_address,
            trigger: Trigger::Start,
            budget: Budget::Erase,
            option_path,
        },
    }
}

const fn program(scope: Scope, shape: PayloadShape, enable: EnableBit, unlock: UnlockMode) -> PlanEntry {
    let (staged_words, writes_address, trigger) = match shape {
        PayloadShape::HalfWord => (0, false, Trigger::DirectHalfWord),
        PayloadShape::Words(1) => (0, false, Trigger::DirectWord),
        PayloadShape::Words(n) => (n, true, Trigger::Start),
        PayloadShape::None => (0, true, Trigger::Start),
    };
    PlanEntry {
        kind: OperationKind::Program,
        scope,
        shape,
        plan: OperationPlan {
            enable,
            unlock,
            staged_words,
            writes_address,
            trigger,
            budget: Budget::Program,
            option_path: matches!(scope, Scope::OptionBytes),
        },
    }
}

static PLANS: [PlanEntry; 14] = [
    erase(EraseMode::Page, Scope::Main, EnableBit::Control(Control::PER), UnlockMode::None, true, false),
    erase(EraseMode::HalfPage, Scope::Main, EnableBit::Extended(ExtControl::HPER), UnlockMode::None, true, false),
    erase(EraseMode::Mass, Scope::Main, EnableBit::Control(Control::MER), UnlockMode::None, false, false),
    erase(EraseMode::HalfPage, Scope::Info, EnableBit::Extended(ExtControl::INF_HPER), UnlockMode::OptionKey, true, false),
    erase(EraseMode::Mass, Scope::OptionBytes, EnableBit::Control(Control::OPTER), UnlockMode::OptionKey, false, true),
    program(Scope::Main, PayloadShape::Words(1), EnableBit::Extended(ExtControl::WPG), UnlockMode::None),
    program(Scope::Main, PayloadShape::Words(2), EnableBit::Extended(ExtControl::WPG2), UnlockMode::None),
    program(Scope::Main, PayloadShape::Words(4), EnableBit::Extended(ExtControl::WPG4), UnlockMode::None),
    program(Scope::Main, PayloadShape::HalfWord, EnableBit::Control(Control::PG), UnlockMode::None),
    program(Scope::Info, PayloadShape::Words(1), EnableBit::Extended(ExtControl::INF_WPG), UnlockMode::OptionKey),
    program(Scope::Info, PayloadShape::Words(2), EnableBit::Extended(ExtControl::INF_WPG2), UnlockMode::OptionKey),
    program(Scope::Info, PayloadShape::Words(4), EnableBit::Extended(ExtControl::INF_WPG4), UnlockMode::OptionKey),
    program(Scope::Info, PayloadShape::HalfWord, EnableBit::Extended(ExtControl::INF_HWPG), UnlockMode::OptionKey),
    program(Scope::OptionBytes, PayloadShape::HalfWord, EnableBit::Control(Control::OPTPG), UnlockMode::MainAndOptionKey),
];

/// Finds the register protocol for an operation, if the controller supports it.
pub fn lookup(kind: OperationKind, scope: Scope, shape: PayloadShape) -> Option<&'static OperationPlan> {
    PLANS
        .iter()
        .find(|e| e.kind == kind && e.scope == scope && e.shape == shape)
        .map(|e| &e.plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_entry_is_unique() {
        for (i, a) in PLANS.iter().enumerate() {
            for b in &PLANS[i + 1..] {
                assert!(
                    !(a.kind == b.kind && a.scope == b.scope && a.shape == b.shape),
                    "duplicate plan for {:?} {:?}",
                    a.kind,
                    a.scope
                );
            }
        }
    }

    #[test]
    fn test_info_paths_need_option_key() {
        for entry in PLANS.iter().filter(|e| e.scope == Scope::Info) {
            assert_eq!(entry.plan.unlock, UnlockMode::OptionKey);
        }
    }

    #[test]
    fn test_dual_unlock_only_for_option_half_word() {
        let dual: Vec<_> = PLANS
            .iter()
            .filter(|e| e.plan.unlock == UnlockMode::MainAndOptionKey)
            .collect();
        assert_eq!(dual.len(), 1);
        assert_eq!(dual[0].scope, Scope::OptionBytes);
        assert_eq!(dual[0].shape, PayloadShape::HalfWord);
    }

    #[test]
    fn test_multi_word_program_stages_payload() {
        let plan = lookup(OperationKind::Program, Scope::Main, PayloadShape::Words(4)).unwrap();
        assert_eq!(plan.staged_words, 4);
        assert!(plan.writes_address);
        assert_eq!(plan.trigger, Trigger::Start);

        let plan = lookup(OperationKind::Program, Scope::Info, PayloadShape::Words(1)).unwrap();
        assert_eq!(plan.staged_words, 0);
        assert_eq!(plan.trigger, Trigger::DirectWord);
    }

    #[test]
    fn test_unsupported_shapes_have_no_plan() {
        assert!(lookup(OperationKind::Erase(EraseMode::Page), Scope::Info, PayloadShape::None).is_none());
        assert!(lookup(OperationKind::Program, Scope::OptionBytes, PayloadShape::Words(1)).is_none());
        assert!(lookup(OperationKind::Program, Scope::Main, PayloadShape::Words(3)).is_none());
    }
}
