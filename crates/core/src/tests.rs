#[cfg(test)]
mod tests {
    use crate::bus::{BusEvent, SystemBus, TraceBus};
    use crate::geometry::FlashGeometry;
    use crate::metrics::OperationMetrics;
    use crate::peripherals::FlashController;
    use crate::regs::{self, offset, Control, EnableBit, ExtControl, Status};
    use crate::snapshot::DeviceSnapshot;
    use crate::{
        Bus, DisarmPolicy, EraseMode, FlashError, FlashFlag, FlashSequencer, FlashStatus,
        OperationKind, OperationRequest, Outcome, Payload, Region, Scope, SequencerConfig,
        SequencerObserver, SequencerState, SimResult, SimulationError,
    };
    use std::sync::{Arc, Mutex};

    const FLASH: u64 = flashseq_config::DEFAULT_FLASH_REG_BASE;
    const CACHE_CTL: u64 = flashseq_config::DEFAULT_CACHE_REG_BASE;
    const MAIN: u32 = 0x0800_0000;
    const INFO: u32 = 0x1FFF_F000;
    const OB: u32 = 0x1FFF_F800;

    fn sequencer() -> FlashSequencer<SystemBus> {
        FlashSequencer::new(SystemBus::new(), SequencerConfig::default())
    }

    fn sequencer_with(config: SequencerConfig) -> FlashSequencer<SystemBus> {
        FlashSequencer::new(SystemBus::new(), config)
    }

    fn traced() -> FlashSequencer<TraceBus<SystemBus>> {
        FlashSequencer::new(TraceBus::new(SystemBus::new()), SequencerConfig::default())
    }

    fn short_budgets(disarm_policy: DisarmPolicy) -> SequencerConfig {
        SequencerConfig {
            erase_ticks: 5,
            program_ticks: 5,
            disarm_policy,
            ..SequencerConfig::default()
        }
    }

    /// Swallows every option-key write.
    #[derive(Debug)]
    struct DropOptionKeys(SystemBus);

    impl Bus for DropOptionKeys {
        fn read_u32(&mut self, addr: u64) -> SimResult<u32> {
            self.0.read_u32(addr)
        }

        fn write_u32(&mut self, addr: u64, value: u32) -> SimResult<()> {
            if addr == FLASH + offset::OPTKEYR {
                return Ok(());
            }
            self.0.write_u32(addr, value)
        }

        fn write_u16(&mut self, addr: u64, value: u16) -> SimResult<()> {
            self.0.write_u16(addr, value)
        }
    }

    #[derive(Debug, Default)]
    struct StateRecorder {
        states: Mutex<Vec<SequencerState>>,
    }

    impl SequencerObserver for StateRecorder {
        fn on_state_change(&self, _from: SequencerState, to: SequencerState) {
            self.states.lock().unwrap().push(to);
        }
    }

    fn position(writes: &[(u64, u32)], addr: u64) -> usize {
        writes
            .iter()
            .position(|(a, _)| *a == addr)
            .unwrap_or_else(|| panic!("no write to {:#x}", addr))
    }

    #[test]
    fn test_status_decoding_priority() {
        assert_eq!(FlashStatus::from_bits(Status::BSY | Status::PGERR), FlashStatus::Busy);
        assert_eq!(
            FlashStatus::from_bits(Status::PGERR | Status::WRPRTERR),
            FlashStatus::ProgramError
        );
        assert_eq!(
            FlashStatus::from_bits(Status::WRPRTERR | Status::EOP),
            FlashStatus::WriteProtectError
        );
        assert_eq!(FlashStatus::from_bits(Status::EOP), FlashStatus::Complete);
        assert_eq!(FlashStatus::from_bits(Status::empty()), FlashStatus::Complete);
    }

    #[test]
    fn test_erase_page_completes_and_disarms() {
        let mut seq = sequencer();
        seq.unlock(Region::Main).unwrap();
        seq.program(Scope::Main, MAIN, &[0x1234_5678]).unwrap();

        seq.erase(EraseMode::Page, Scope::Main, MAIN).unwrap();

        assert_eq!(seq.bus_mut().read_u32(MAIN as u64).unwrap(), 0xFFFF_FFFF);
        assert!(!seq.bus().flash.control().contains(Control::PER));
        assert!(!seq.bus().flash.peek_status().contains(Status::BSY));
        assert_eq!(seq.state(), SequencerState::Idle);
    }

    #[test]
    fn test_program_word_reads_back() {
        let mut seq = sequencer();
        seq.unlock(Region::Main).unwrap();
        seq.program(Scope::Main, MAIN + 0x800, &[0xDEAD_BEEF]).unwrap();

        assert_eq!(seq.bus_mut().read_u32((MAIN + 0x800) as u64).unwrap(), 0xDEAD_BEEF);
        assert!(!seq.bus().flash.extended_control().contains(ExtControl::WPG));
    }

    #[test]
    fn test_half_word_and_two_word_programs() {
        let mut seq = sequencer();
        seq.unlock(Region::Main).unwrap();
        seq.program_half_word(Scope::Main, MAIN + 2, 0xBEEF).unwrap();
        seq.program(Scope::Main, MAIN + 8, &[0x1111_1111, 0x2222_2222]).unwrap();

        let bus = seq.bus_mut();
        assert_eq!(bus.read_u16((MAIN + 2) as u64).unwrap(), 0xBEEF);
        assert_eq!(bus.read_u32(MAIN as u64).unwrap(), 0xBEEF_FFFF);
        assert_eq!(bus.read_u32((MAIN + 8) as u64).unwrap(), 0x1111_1111);
        assert_eq!(bus.read_u32((MAIN + 12) as u64).unwrap(), 0x2222_2222);
        assert!(!bus.flash.control().contains(Control::PG));
    }

    #[test]
    fn test_stalled_controller_times_out_after_exact_polls() {
        let mut seq = sequencer();
        seq.bus_mut().flash.stall();

        let before = seq.bus().flash.status_reads();
        assert_eq!(seq.wait_for_completion(10).unwrap(), FlashStatus::Timeout);
        assert_eq!(seq.bus().flash.status_reads() - before, 10);

        seq.bus_mut().flash.release();
        assert_eq!(seq.wait_for_completion(10).unwrap(), FlashStatus::Complete);
    }

    #[test]
    fn test_zero_tick_wait_does_not_poll() {
        let mut seq = sequencer();
        assert_eq!(seq.wait_for_completion(0).unwrap(), FlashStatus::Timeout);
        assert_eq!(seq.bus().flash.status_reads(), 0);
    }

    #[test]
    fn test_busy_prior_operation_times_out_without_arming() {
        let mut seq = sequencer_with(short_budgets(DisarmPolicy::AsBuilt));
        seq.unlock(Region::Main).unwrap();
        seq.bus_mut().flash.stall();

        let err = seq.erase(EraseMode::Page, Scope::Main, MAIN).unwrap_err();

        assert_eq!(err, FlashError::Timeout);
        assert_eq!(seq.bus().flash.status_reads(), 5);
        assert!(!seq.bus().flash.control().contains(Control::PER));
        assert_eq!(seq.bus().flash.protocol_violations(), 0);
    }

    #[test]
    fn test_four_word_program_write_order() {
        let mut seq = traced();
        seq.unlock(Region::Main).unwrap();
        seq.bus_mut().clear();

        let words = [0xA0A0_A0A0, 0xB1B1_B1B1, 0xC2C2_C2C2, 0xD3D3_D3D3];
        seq.program(Scope::Main, MAIN + 0x10, &words).unwrap();

        let writes = seq.bus().writes();
        let ecr = position(&writes, FLASH + offset::ECR);
        let pw: Vec<usize> = offset::PAYLOAD
            .iter()
            .map(|o| position(&writes, FLASH + o))
            .collect();
        let ar = position(&writes, FLASH + offset::AR);
        let cache = position(&writes, CACHE_CTL);
        let strt = position(&writes, FLASH + offset::CR);

        assert!(ecr < pw[0]);
        assert!(pw.windows(2).all(|w| w[0] < w[1]));
        assert!(pw[3] < ar && ar < cache && cache < strt);
        assert_eq!(writes[ar].1, MAIN + 0x10);
        assert_ne!(writes[strt].1 & Control::STRT.bits(), 0);
        for (slot, word) in pw.iter().zip(words) {
            assert_eq!(writes[*slot].1, word);
        }

        let bus = seq.bus_mut().inner_mut();
        for (i, word) in words.iter().enumerate() {
            assert_eq!(bus.read_u32((MAIN + 0x10) as u64 + 4 * i as u64).unwrap(), *word);
        }
    }

    #[test]
    fn test_single_word_program_invalidates_before_direct_write() {
        let mut seq = traced();
        seq.unlock(Region::Main).unwrap();
        seq.bus_mut().clear();

        seq.program(Scope::Main, MAIN, &[0xDEAD_BEEF]).unwrap();

        let writes = seq.bus().writes();
        let ecr = position(&writes, FLASH + offset::ECR);
        let cache = position(&writes, CACHE_CTL);
        let target = position(&writes, MAIN as u64);
        assert!(ecr < cache && cache < target);
        assert_eq!(writes[target].1, 0xDEAD_BEEF);
        assert!(!writes.iter().any(|(a, _)| *a == FLASH + offset::AR));
    }

    #[test]
    fn test_option_half_word_writes_both_key_sequences() {
        let mut seq = traced();
        seq.program_half_word(Scope::OptionBytes, OB + 4, 0x1234).unwrap();

        let keys: Vec<(u64, u32)> = seq
            .bus()
            .writes()
            .into_iter()
            .filter(|(a, _)| *a == FLASH + offset::KEYR || *a == FLASH + offset::OPTKEYR)
            .collect();
        assert_eq!(
            keys,
            vec![
                (FLASH + offset::KEYR, regs::KEY1),
                (FLASH + offset::KEYR, regs::KEY2),
                (FLASH + offset::OPTKEYR, regs::KEY1),
                (FLASH + offset::OPTKEYR, regs::KEY2),
            ]
        );
        assert_eq!(seq.bus_mut().read_u16((OB + 4) as u64).unwrap(), 0x1234);
    }

    #[test]
    fn test_info_operation_without_option_key_is_rejected() {
        let mut seq = FlashSequencer::new(DropOptionKeys(SystemBus::new()), SequencerConfig::default());
        seq.unlock(Region::Main).unwrap();

        let err = seq.erase(EraseMode::HalfPage, Scope::Info, INFO).unwrap_err();
        assert_eq!(err, FlashError::WriteProtectError);
        assert!(!seq.bus().0.flash.extended_control().contains(ExtControl::INF_HPER));

        seq.clear_flags(Status::all()).unwrap();
        let err = seq.program(Scope::Info, INFO, &[0x1234_5678]).unwrap_err();
        assert_eq!(err, FlashError::WriteProtectError);
        assert_eq!(seq.bus().0.flash.read_memory(INFO, 4), Some(0xFFFF_FFFF));
    }

    #[test]
    fn test_info_block_program_and_erase() {
        let mut seq = sequencer();
        seq.program(Scope::Info, INFO, &[0xCAFE_BABE]).unwrap();
        assert_eq!(seq.bus_mut().read_u32(INFO as u64).unwrap(), 0xCAFE_BABE);
        // The option key is consumed by each information-block operation.
        assert!(!seq.bus().flash.option_write_enabled());

        seq.program(Scope::Info, INFO + 0x10, &[1, 2, 3, 4]).unwrap();
        seq.program_half_word(Scope::Info, INFO + 0x20, 0x5A5A).unwrap();
        assert_eq!(seq.bus_mut().read_u32((INFO + 0x1C) as u64).unwrap(), 4);

        seq.erase(EraseMode::HalfPage, Scope::Info, INFO).unwrap();
        assert_eq!(seq.bus_mut().read_u32(INFO as u64).unwrap(), 0xFFFF_FFFF);
        assert_eq!(seq.bus_mut().read_u16((INFO + 0x20) as u64).unwrap(), 0xFFFF);
        assert!(!seq.bus().flash.extended_control().contains(ExtControl::INF_HPER));
    }

    #[test]
    fn test_unlock_is_idempotent() {
        let mut seq = sequencer();
        seq.unlock(Region::Main).unwrap();
        seq.unlock(Region::Main).unwrap();
        assert!(!seq.bus().flash.is_locked());
        seq.program(Scope::Main, MAIN, &[0xDEAD_BEEF]).unwrap();
    }

    #[test]
    fn test_lock_main_blocks_programming() {
        let mut seq = sequencer();
        seq.unlock(Region::Main).unwrap();
        seq.lock(Region::Main).unwrap();
        assert!(seq.bus().flash.is_locked());

        let err = seq.program(Scope::Main, MAIN, &[0xDEAD_BEEF]).unwrap_err();
        assert_eq!(err, FlashError::WriteProtectError);
        assert_eq!(seq.bus().flash.read_memory(MAIN, 4), Some(0xFFFF_FFFF));
    }

    #[test]
    fn test_lock_info_clears_option_write_enable() {
        let mut seq = sequencer();
        seq.unlock(Region::Info).unwrap();
        assert!(seq.bus().flash.option_write_enabled());
        seq.lock(Region::Info).unwrap();
        assert!(!seq.bus().flash.option_write_enabled());
    }

    #[test]
    fn test_wrong_key_faults_until_reset() {
        let mut seq = sequencer();
        seq.bus_mut().write_u32(FLASH + offset::KEYR, 0x1111_2222).unwrap();
        seq.unlock(Region::Main).unwrap();
        assert!(seq.bus().flash.is_locked());

        seq.bus_mut().flash.reset();
        seq.unlock(Region::Main).unwrap();
        assert!(!seq.bus().flash.is_locked());
    }

    #[test]
    fn test_no_arm_while_previous_operation_busy() {
        let mut seq = traced();
        seq.unlock(Region::Main).unwrap();
        seq.bus_mut().inner_mut().flash.inject_busy(5);
        seq.bus_mut().clear();

        seq.program(Scope::Main, MAIN, &[0x0BAD_F00D]).unwrap();

        let events = seq.bus().events();
        let drained = events
            .iter()
            .position(|e| {
                matches!(e, BusEvent::Read { addr, value }
                    if *addr == FLASH + offset::SR && value & Status::BSY.bits() == 0)
            })
            .unwrap();
        let first_arm = events
            .iter()
            .position(|e| matches!(e, BusEvent::Write { addr, .. } if *addr == FLASH + offset::ECR))
            .unwrap();
        assert!(drained < first_arm);
        assert_eq!(seq.bus().inner().flash.protocol_violations(), 0);
    }

    #[test]
    fn test_simulator_counts_arming_while_busy() {
        let mut bus = SystemBus::new();
        bus.flash.inject_busy(3);
        bus.write_u32(FLASH + offset::KEYR, regs::KEY1).unwrap();
        bus.write_u32(FLASH + offset::KEYR, regs::KEY2).unwrap();
        bus.write_u32(FLASH + offset::ECR, ExtControl::WPG.bits()).unwrap();
        assert_eq!(bus.flash.protocol_violations(), 1);
    }

    #[test]
    fn test_sticky_error_blocks_next_operation_until_cleared() {
        let mut seq = sequencer();
        seq.unlock(Region::Main).unwrap();
        seq.program(Scope::Main, MAIN, &[0x1234_5678]).unwrap();

        let err = seq.program(Scope::Main, MAIN, &[0x0000_FFFF]).unwrap_err();
        assert_eq!(err, FlashError::ProgramError);
        assert!(seq.flag_status(FlashFlag::ProgramError).unwrap());

        let err = seq.erase(EraseMode::Page, Scope::Main, MAIN).unwrap_err();
        assert_eq!(err, FlashError::ProgramError);
        assert_eq!(seq.bus().flash.read_memory(MAIN, 4), Some(0x1234_5678));

        seq.clear_flags(Status::PGERR | Status::WRPRTERR | Status::EOP).unwrap();
        seq.erase(EraseMode::Page, Scope::Main, MAIN).unwrap();
        assert_eq!(seq.bus().flash.read_memory(MAIN, 4), Some(0xFFFF_FFFF));
    }

    #[test]
    fn test_programming_zero_over_data_is_allowed() {
        let mut seq = sequencer();
        seq.unlock(Region::Main).unwrap();
        seq.program(Scope::Main, MAIN, &[0x1234_5678]).unwrap();
        seq.program(Scope::Main, MAIN, &[0]).unwrap();
        assert_eq!(seq.bus().flash.read_memory(MAIN, 4), Some(0));
    }

    #[test]
    fn test_invalid_requests_touch_no_registers() {
        let mut seq = traced();

        let err = seq.program(Scope::Main, 0x2000_0000, &[1]).unwrap_err();
        assert!(matches!(err, FlashError::InvalidAddress { scope: Scope::Main, .. }));
        let err = seq.program(Scope::Main, MAIN + 2, &[1]).unwrap_err();
        assert!(matches!(err, FlashError::InvalidAddress { .. }));
        let err = seq.program(Scope::Info, MAIN, &[1]).unwrap_err();
        assert!(matches!(err, FlashError::InvalidAddress { scope: Scope::Info, .. }));
        // Four words starting at the last word of the array overrun it.
        let err = seq.program(Scope::Main, 0x0807_FFFC, &[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(err, FlashError::InvalidAddress { .. }));

        assert_eq!(seq.program(Scope::Main, MAIN, &[1, 2, 3]), Err(FlashError::InvalidPayload(3)));
        assert_eq!(seq.program(Scope::Main, MAIN, &[]), Err(FlashError::InvalidPayload(0)));
        assert_eq!(
            seq.erase(EraseMode::Page, Scope::Info, INFO),
            Err(FlashError::UnsupportedOperation {
                kind: OperationKind::Erase(EraseMode::Page),
                scope: Scope::Info
            })
        );
        assert!(matches!(
            seq.program(Scope::OptionBytes, OB, &[1]),
            Err(FlashError::UnsupportedOperation { .. })
        ));

        assert!(seq.bus().events().is_empty());
        assert_eq!(seq.state(), SequencerState::Idle);
    }

    #[test]
    fn test_half_page_erase_keeps_other_half() {
        let mut seq = sequencer();
        seq.unlock(Region::Main).unwrap();
        seq.program(Scope::Main, MAIN, &[0x1111_1111]).unwrap();
        seq.program(Scope::Main, MAIN + 0x400, &[0x2222_2222]).unwrap();

        seq.erase(EraseMode::HalfPage, Scope::Main, MAIN).unwrap();

        assert_eq!(seq.bus().flash.read_memory(MAIN, 4), Some(0xFFFF_FFFF));
        assert_eq!(seq.bus().flash.read_memory(MAIN + 0x400, 4), Some(0x2222_2222));
        assert!(!seq.bus().flash.extended_control().contains(ExtControl::HPER));
    }

    #[test]
    fn test_mass_erase_clears_every_page() {
        let mut seq = sequencer();
        seq.unlock(Region::Main).unwrap();
        seq.program(Scope::Main, MAIN, &[0x1111_1111]).unwrap();
        seq.program(Scope::Main, 0x0807_F000, &[0x2222_2222]).unwrap();

        seq.erase(EraseMode::Mass, Scope::Main, 0).unwrap();

        assert_eq!(seq.bus().flash.read_memory(MAIN, 4), Some(0xFFFF_FFFF));
        assert_eq!(seq.bus().flash.read_memory(0x0807_F000, 4), Some(0xFFFF_FFFF));
        assert!(!seq.bus().flash.control().contains(Control::MER));
    }

    #[test]
    fn test_disarm_policy_on_timeout() {
        let cases = [
            (DisarmPolicy::AsBuilt, Scope::Main, false),
            (DisarmPolicy::AsBuilt, Scope::OptionBytes, true),
            (DisarmPolicy::Always, Scope::OptionBytes, false),
            (DisarmPolicy::SkipOnTimeout, Scope::Main, true),
        ];
        for (policy, scope, left_armed) in cases {
            let mut seq = sequencer_with(short_budgets(policy));
            seq.bus_mut().flash.set_busy_latency(100);
            seq.unlock(Region::Main).unwrap();

            let (address, bit) = match scope {
                Scope::OptionBytes => (OB + 4, Control::OPTPG),
                _ => (MAIN, Control::PG),
            };
            let err = seq.program_half_word(scope, address, 0x00AA).unwrap_err();

            assert_eq!(err, FlashError::Timeout);
            assert_eq!(
                seq.bus().flash.control().contains(bit),
                left_armed,
                "{:?} on {:?}",
                policy,
                scope
            );
        }
    }

    #[test]
    fn test_observers_see_state_sequence() {
        let mut seq = sequencer();
        let recorder = Arc::new(StateRecorder::default());
        let metrics = Arc::new(OperationMetrics::new());
        seq.add_observer(recorder.clone());
        seq.add_observer(metrics.clone());

        seq.unlock(Region::Main).unwrap();
        recorder.states.lock().unwrap().clear();
        seq.erase(EraseMode::Page, Scope::Main, MAIN).unwrap();

        assert_eq!(
            *recorder.states.lock().unwrap(),
            vec![
                SequencerState::Unlocking,
                SequencerState::Armed,
                SequencerState::Triggered,
                SequencerState::Polling,
                SequencerState::Complete,
                SequencerState::Idle,
            ]
        );
        let summary = metrics.summary();
        assert_eq!(summary.operations, 1);
        assert_eq!(summary.completed, 1);
        assert!(summary.busy_polls >= 1);
        assert!(summary.polls > summary.busy_polls);
    }

    #[test]
    fn test_timeout_is_reported_to_observers() {
        let mut seq = sequencer_with(short_budgets(DisarmPolicy::AsBuilt));
        let recorder = Arc::new(StateRecorder::default());
        let metrics = Arc::new(OperationMetrics::new());
        seq.add_observer(recorder.clone());
        seq.add_observer(metrics.clone());
        seq.bus_mut().flash.stall();

        assert!(seq.erase(EraseMode::Page, Scope::Main, MAIN).is_err());

        let states = recorder.states.lock().unwrap();
        assert_eq!(*states, vec![SequencerState::Timeout, SequencerState::Idle]);
        assert_eq!(metrics.get_timeouts(), 1);
        assert_eq!(metrics.get_polls(), 5);
    }

    #[test]
    fn test_execute_runs_request_directly() {
        let mut seq = sequencer();
        seq.unlock(Region::Main).unwrap();
        let request = OperationRequest {
            kind: OperationKind::Program,
            scope: Scope::Main,
            address: MAIN + 0x40,
            payload: Payload::FourWords([5, 6, 7, 8]),
        };
        seq.execute(&request).unwrap();
        assert_eq!(seq.bus().flash.read_memory(MAIN + 0x4C, 4), Some(8));

        let erase_payload = OperationRequest {
            kind: OperationKind::Erase(EraseMode::Page),
            scope: Scope::Main,
            address: MAIN,
            payload: Payload::Word(1),
        };
        assert_eq!(seq.execute(&erase_payload), Err(FlashError::InvalidPayload(1)));
    }

    #[test]
    fn test_raw_option_byte_erase_leaves_device_protected() {
        let mut seq = sequencer();
        seq.erase(EraseMode::Mass, Scope::OptionBytes, OB).unwrap();
        assert!(!seq.bus().flash.control().contains(Control::OPTER));

        seq.bus_mut().flash.reset();
        assert!(seq.readout_protection_status().unwrap());
    }

    #[test]
    fn test_erase_option_bytes_restores_read_protection_key() {
        let mut seq = sequencer();
        seq.configure_user_option_bytes(true, false, true).unwrap();
        seq.bus_mut().flash.reset();
        assert_eq!(seq.user_option_byte().unwrap(), 0xFD);

        seq.erase_option_bytes().unwrap();
        seq.bus_mut().flash.reset();

        assert_eq!(seq.user_option_byte().unwrap(), 0xFF);
        assert!(!seq.readout_protection_status().unwrap());
        assert_eq!(seq.bus_mut().read_u16(OB as u64).unwrap(), regs::RDP_KEY);
        assert!(!seq.bus().flash.control().contains(Control::OPTPG));
    }

    #[test]
    fn test_readout_protection_round_trip() {
        let mut seq = sequencer();
        seq.set_readout_protection(true).unwrap();
        assert!(!seq.readout_protection_status().unwrap());
        seq.bus_mut().flash.reset();
        assert!(seq.readout_protection_status().unwrap());

        seq.set_readout_protection(false).unwrap();
        seq.bus_mut().flash.reset();
        assert!(!seq.readout_protection_status().unwrap());
    }

    #[test]
    fn test_write_protection_blocks_protected_pages() {
        let mut seq = sequencer();
        seq.enable_write_protection(0x0000_0001).unwrap();
        seq.bus_mut().flash.reset();
        assert_eq!(seq.write_protection_option_byte().unwrap(), 0xFFFF_FFFE);

        seq.unlock(Region::Main).unwrap();
        assert_eq!(
            seq.erase(EraseMode::Page, Scope::Main, MAIN),
            Err(FlashError::WriteProtectError)
        );
        seq.clear_flags(Status::all()).unwrap();

        // Page 2 is outside the first protection group.
        seq.program(Scope::Main, MAIN + 0x1000, &[0xAAAA_5555]).unwrap();
        assert_eq!(
            seq.erase(EraseMode::Mass, Scope::Main, 0),
            Err(FlashError::WriteProtectError)
        );
    }

    #[test]
    fn test_watchdog_reload_options() {
        let mut seq = sequencer();
        seq.set_watchdog_reload_option(0x0FFF).unwrap();
        seq.set_watchdog_reload_command(true).unwrap();

        let bus = seq.bus_mut();
        assert_eq!(bus.read_u16((OB + 0x30) as u64).unwrap(), 0x0FFF);
        assert_eq!(bus.read_u16((OB + 0x34) as u64).unwrap(), 0x5B1E);
        assert_eq!(bus.read_u16((OB + 0x36) as u64).unwrap(), 0xA5A5);
        // Option half-word programming also opens the main key domain.
        assert!(!bus.flash.is_locked());

        seq.set_watchdog_reload_command(false).unwrap();
        assert_eq!(seq.bus_mut().read_u32((OB + 0x34) as u64).unwrap(), 0);
    }

    #[test]
    fn test_latency_and_prefetch() {
        let mut seq = sequencer();
        seq.set_latency(19).unwrap();
        assert_eq!(seq.latency().unwrap(), 19);
        assert_eq!(seq.bus_mut().read_u32(FLASH + offset::ACR).unwrap() & 0x7, 3);
        assert_eq!(seq.bus_mut().read_u32(FLASH + offset::LATENCY_EX).unwrap(), 2);
        assert_eq!(seq.set_latency(32), Err(FlashError::InvalidLatency(32)));

        seq.set_prefetch_buffer(true).unwrap();
        seq.set_half_cycle_access(true).unwrap();
        assert!(seq.prefetch_buffer_status().unwrap());
        seq.set_prefetch_buffer(false).unwrap();
        assert!(!seq.prefetch_buffer_status().unwrap());
        assert_eq!(seq.latency().unwrap(), 19);
    }

    #[test]
    fn test_flags_and_interrupt_config() {
        let mut seq = sequencer();
        seq.unlock(Region::Main).unwrap();
        seq.configure_interrupts(regs::Interrupts::all(), true).unwrap();
        assert!(seq.bus().flash.control().contains(Control::EOPIE | Control::ERRIE));

        seq.program(Scope::Main, MAIN, &[0x5555_AAAA]).unwrap();
        assert!(seq.flag_status(FlashFlag::EndOfOperation).unwrap());
        assert!(!seq.flag_status(FlashFlag::Busy).unwrap());
        assert!(!seq.flag_status(FlashFlag::OptionByteError).unwrap());

        seq.clear_flags(Status::EOP).unwrap();
        assert!(!seq.flag_status(FlashFlag::EndOfOperation).unwrap());

        seq.configure_interrupts(regs::Interrupts::ERROR, false).unwrap();
        assert!(!seq.bus().flash.control().contains(Control::ERRIE));
    }

    #[test]
    fn test_bus_rejects_bad_accesses() {
        let mut bus = SystemBus::new();
        assert_eq!(
            bus.write_u16(FLASH + offset::CR, 1),
            Err(SimulationError::UnsupportedWidth { addr: FLASH + offset::CR, width: 2 })
        );
        assert_eq!(
            bus.read_u32(0x2000_0000),
            Err(SimulationError::MemoryViolation(0x2000_0000))
        );
        assert_eq!(
            bus.read_u32(MAIN as u64 + 1),
            Err(SimulationError::Misaligned { addr: MAIN as u64 + 1, width: 4 })
        );
        assert_eq!(bus.read_u32(FLASH + offset::OBR).unwrap() & 0x2, 0);
    }

    #[test]
    fn test_bus_from_device_descriptor() {
        let device = flashseq_config::DeviceDescriptor::hk32f39a();
        let bus = SystemBus::from_config(&device).unwrap();
        assert_eq!(bus.geometry().main.start, MAIN);
        assert_eq!(bus.geometry().page_count(), 256);

        let config = SequencerConfig::from_descriptor(&device).unwrap();
        assert_eq!(config, SequencerConfig::default());
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut seq = sequencer();
        seq.unlock(Region::Main).unwrap();
        seq.program(Scope::Main, MAIN, &[1, 2]).unwrap();

        let snapshot = DeviceSnapshot::capture(seq.bus());
        assert_eq!(snapshot.controller.option_bytes.len(), 32);
        assert_eq!(snapshot.controller.option_bytes[0], 0x5AA5);
        assert_eq!(snapshot.controller.registers["cr"] & Control::LOCK.bits(), 0);
        assert!(snapshot.peripherals.contains_key("cache"));

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("status_reads"));
    }

    #[test]
    fn test_leftover_enable_bit_blocks_next_operation() {
        let mut seq = FlashSequencer::new(
            TraceBus::new(SystemBus::new()),
            short_budgets(DisarmPolicy::AsBuilt),
        );
        seq.bus_mut().inner_mut().flash.set_busy_latency(8);

        assert_eq!(
            seq.program_half_word(Scope::OptionBytes, OB + 4, 0x00AA),
            Err(FlashError::Timeout)
        );
        assert!(seq.bus().inner().flash.control().contains(Control::OPTPG));

        seq.bus_mut().clear();
        let err = seq.program(Scope::Main, MAIN, &[0x1234_5678]).unwrap_err();
        assert_eq!(err, FlashError::StillArmed(EnableBit::Control(Control::OPTPG)));
        assert_eq!(Outcome::from(&err), Outcome::StillArmed);
        assert!(seq.bus().writes().is_empty());
        assert!(!seq.bus().inner().flash.extended_control().contains(ExtControl::WPG));
        assert_eq!(seq.bus().inner().flash.read_memory(MAIN, 4), Some(0xFFFF_FFFF));

        // Finishing an operation that owns the bit releases it.
        seq.bus_mut().inner_mut().flash.set_busy_latency(2);
        seq.program_half_word(Scope::OptionBytes, OB + 6, 0x0055).unwrap();
        assert!(!seq.bus().inner().flash.control().contains(Control::OPTPG));
        seq.program(Scope::Main, MAIN, &[0x1234_5678]).unwrap();
        assert_eq!(seq.bus().inner().flash.read_memory(MAIN, 4), Some(0x1234_5678));
    }

    #[test]
    fn test_half_page_erase_past_info_end_fails() {
        let geometry = FlashGeometry {
            info: 0x1FFF_F000..0x1FFF_F200,
            ..FlashGeometry::hk32f39a()
        };
        let mut bus = SystemBus::new();
        bus.flash = FlashController::new(geometry.clone());
        let config = SequencerConfig {
            geometry,
            ..SequencerConfig::default()
        };
        let mut seq = FlashSequencer::new(bus, config);
        seq.program(Scope::Info, INFO, &[0xCAFE_BABE]).unwrap();

        let bus = seq.bus_mut();
        bus.write_u32(FLASH + offset::SR, Status::EOP.bits()).unwrap();
        bus.write_u32(FLASH + offset::OPTKEYR, regs::KEY1).unwrap();
        bus.write_u32(FLASH + offset::OPTKEYR, regs::KEY2).unwrap();
        bus.write_u32(FLASH + offset::ECR, ExtControl::INF_HPER.bits()).unwrap();
        bus.write_u32(FLASH + offset::AR, INFO).unwrap();
        bus.modify_u32(FLASH + offset::CR, |v| v | Control::STRT.bits()).unwrap();

        let status = seq.bus().flash.peek_status();
        assert!(status.contains(Status::PGERR));
        assert!(!status.contains(Status::EOP));
        assert_eq!(seq.bus().flash.read_memory(INFO, 4), Some(0xCAFE_BABE));
    }

    #[test]
    fn test_lsi_and_debug_clock_commands() {
        let mut seq = sequencer();
        seq.set_lsi_low_power(true).unwrap();
        assert_eq!(seq.bus_mut().read_u32((OB + 0x38) as u64).unwrap(), regs::LSI_LP_CMD);
        assert!(!seq.bus().flash.control().contains(Control::OPTPG));

        // Both commands share one word, so switching needs an option erase.
        assert_eq!(seq.set_debug_clock_gate(true), Err(FlashError::ProgramError));
        assert!(!seq.bus().flash.control().contains(Control::OPTPG));
        seq.clear_flags(Status::all()).unwrap();
        seq.erase_option_bytes().unwrap();

        seq.set_debug_clock_gate(true).unwrap();
        assert_eq!(
            seq.bus_mut().read_u32((OB + 0x38) as u64).unwrap(),
            regs::DEBUG_CLOCK_CMD
        );
    }

    #[test]
    fn test_lsi_disable_clears_watchdog_command_word() {
        let mut seq = sequencer();
        seq.set_watchdog_reload_command(true).unwrap();

        seq.set_lsi_low_power(false).unwrap();

        let bus = seq.bus_mut();
        assert_eq!(bus.read_u32((OB + 0x34) as u64).unwrap(), 0);
        assert_eq!(bus.read_u32((OB + 0x38) as u64).unwrap(), 0xFFFF_FFFF);
        assert!(!bus.flash.control().contains(Control::OPTPG));
    }

    #[test]
    fn test_erase_write_order() {
        let cases = [
            (EraseMode::Page, Scope::Main, MAIN + 0x800, offset::CR, Control::PER.bits()),
            (EraseMode::HalfPage, Scope::Main, MAIN + 0x400, offset::ECR, ExtControl::HPER.bits()),
            (EraseMode::HalfPage, Scope::Info, INFO, offset::ECR, ExtControl::INF_HPER.bits()),
        ];
        for (mode, scope, address, enable_reg, enable_bit) in cases {
            let mut seq = traced();
            seq.unlock(Region::Main).unwrap();
            seq.bus_mut().clear();

            seq.erase(mode, scope, address).unwrap();

            let writes = seq.bus().writes();
            let arm = writes
                .iter()
                .position(|(a, v)| *a == FLASH + enable_reg && v & enable_bit != 0)
                .unwrap();
            let ar = position(&writes, FLASH + offset::AR);
            let cache = position(&writes, CACHE_CTL);
            let strt = writes
                .iter()
                .position(|(a, v)| *a == FLASH + offset::CR && v & Control::STRT.bits() != 0)
                .unwrap();
            assert!(arm < ar && ar < cache && cache < strt, "{:?} {:?}", mode, scope);
            assert_eq!(writes[ar].1, address);
        }
    }

    #[test]
    fn test_mass_and_option_erase_skip_address_register() {
        let mut seq = traced();
        seq.unlock(Region::Main).unwrap();
        seq.bus_mut().clear();

        seq.erase(EraseMode::Mass, Scope::Main, 0).unwrap();
        seq.erase(EraseMode::Mass, Scope::OptionBytes, OB).unwrap();

        let writes = seq.bus().writes();
        assert!(!writes.iter().any(|(a, _)| *a == FLASH + offset::AR));
        let starts = writes
            .iter()
            .filter(|(a, v)| *a == FLASH + offset::CR && v & Control::STRT.bits() != 0)
            .count();
        assert_eq!(starts, 2);
    }

    #[test]
    fn test_cache_invalidated_once_per_operation() {
        let mut seq = sequencer();
        seq.unlock(Region::Main).unwrap();
        assert_eq!(seq.bus().cache.invalidations(), 0);

        seq.erase(EraseMode::Page, Scope::Main, MAIN).unwrap();
        assert_eq!(seq.bus().cache.invalidations(), 1);

        seq.program(Scope::Main, MAIN, &[1, 2, 3, 4]).unwrap();
        assert_eq!(seq.bus().cache.invalidations(), 2);

        seq.program(Scope::Info, INFO, &[0x5A5A_5A5A]).unwrap();
        assert_eq!(seq.bus().cache.invalidations(), 3);

        // Two command half words, two operations.
        seq.set_watchdog_reload_command(true).unwrap();
        assert_eq!(seq.bus().cache.invalidations(), 5);
    }

    #[test]
    fn test_erase_option_bytes_keeps_active_read_protection() {
        let mut seq = sequencer();
        seq.set_readout_protection(true).unwrap();
        seq.bus_mut().flash.reset();
        assert!(seq.readout_protection_status().unwrap());

        seq.erase_option_bytes().unwrap();
        assert_eq!(seq.bus_mut().read_u16(OB as u64).unwrap(), 0x0000);

        seq.bus_mut().flash.reset();
        assert!(seq.readout_protection_status().unwrap());
        assert!(!seq.bus().flash.control().intersects(Control::OPTER | Control::OPTPG));
    }

    #[test]
    fn test_option_erase_timeout_disarm() {
        for (policy, left_armed) in [(DisarmPolicy::AsBuilt, true), (DisarmPolicy::Always, false)] {
            let mut seq = sequencer_with(short_budgets(policy));
            seq.bus_mut().flash.set_busy_latency(100);

            assert_eq!(seq.erase_option_bytes(), Err(FlashError::Timeout));

            let cr = seq.bus().flash.control();
            assert_eq!(cr.contains(Control::OPTER), left_armed, "{:?}", policy);
            assert!(!cr.contains(Control::OPTPG));
        }
    }
}
