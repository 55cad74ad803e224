use armory::prelude::*;
use std::sync::Arc;
use unicorn_engine::RegisterARM;

const FLASH_BASE: u64 = 0x1000_0000;

/// Firmware with a single guarded branch. The `movs r1, #1` scrambles the
/// flags so only defeating the `b fail` itself opens the secure path:
///
/// ```text
/// 0x00  movs r0, #0      ; auth_ok = 0
/// 0x02  movs r1, #1      ; leaves the flags non-equal
/// 0x04  cmp  r0, #1
/// 0x06  beq  secure
/// 0x08  b    fail
/// 0x0A  nop              ; padding, unreachable
/// 0x0C  secure: b .
/// 0x0E  fail:   b .
/// ```
const SINGLE_CHECK: [u8; 16] = [
    0x00, 0x20, // movs r0, #0
    0x01, 0x21, // movs r1, #1
    0x01, 0x28, // cmp r0, #1
    0x01, 0xD0, // beq +2 -> 0x0C
    0x01, 0xE0, // b +2 -> 0x0E
    0x00, 0xBF, // nop
    0xFE, 0xE7, // b .
    0xFE, 0xE7, // b .
];
const SINGLE_SECURE: u64 = FLASH_BASE + 0x0C;
const SINGLE_FAIL: u64 = FLASH_BASE + 0x0E;

/// Firmware comparing a counter against 3:
///
/// ```text
/// 0x00  movs r0, #2      ; differs from 3 in bit 0 only
/// 0x02  cmp  r0, #3
/// 0x04  beq  secure
/// 0x06  b    fail
/// ```
const COUNTER_CHECK: [u8; 14] = [
    0x02, 0x20, // movs r0, #2
    0x03, 0x28, // cmp r0, #3
    0x01, 0xD0, // beq +2 -> 0x0A
    0x01, 0xE0, // b +2 -> 0x0C
    0x00, 0xBF, // nop
    0xFE, 0xE7, // secure: b .
    0xFE, 0xE7, // fail: b .
];
const COUNTER_SECURE: u64 = FLASH_BASE + 0x0A;
const COUNTER_FAIL: u64 = FLASH_BASE + 0x0C;

/// Firmware requiring two consecutive checks to be defeated. Each compare
/// is preceded by a flag-scrambling `movs`, so only skipping both guarding
/// branches reaches the secure path:
///
/// ```text
/// 0x00  movs r0, #0
/// 0x02  movs r1, #1
/// 0x04  cmp  r0, #1
/// 0x06  bne  fail        ; check 1
/// 0x08  movs r2, #1
/// 0x0A  cmp  r0, #2
/// 0x0C  bne  fail        ; check 2
/// 0x0E  secure: b .
/// 0x10  nop              ; padding, unreachable
/// 0x12  fail:   b .
/// ```
const DOUBLE_CHECK: [u8; 20] = [
    0x00, 0x20, // movs r0, #0
    0x01, 0x21, // movs r1, #1
    0x01, 0x28, // cmp r0, #1
    0x04, 0xD1, // bne +8 -> 0x12
    0x01, 0x22, // movs r2, #1
    0x02, 0x28, // cmp r0, #2
    0x01, 0xD1, // bne +2 -> 0x12
    0xFE, 0xE7, // secure: b .
    0x00, 0xBF, // nop
    0xFE, 0xE7, // fail: b .
];
const DOUBLE_SECURE: u64 = FLASH_BASE + 0x0E;
const DOUBLE_FAIL: u64 = FLASH_BASE + 0x12;

/// Firmware granting access when r0 is zero at the check:
///
/// ```text
/// 0x00  movs r0, #1
/// 0x02  cmp  r0, #0
/// 0x04  beq  secure
/// 0x06  b    fail
/// ```
const ZERO_CHECK: [u8; 14] = [
    0x01, 0x20, // movs r0, #1
    0x00, 0x28, // cmp r0, #0
    0x01, 0xD0, // beq +2 -> 0x0A
    0x01, 0xE0, // b +2 -> 0x0C
    0x00, 0xBF, // nop
    0xFE, 0xE7, // secure: b .
    0xFE, 0xE7, // fail: b .
];
const ZERO_SECURE: u64 = FLASH_BASE + 0x0A;
const ZERO_FAIL: u64 = FLASH_BASE + 0x0C;

fn setup(firmware: &[u8], halt: &[u64], exploit: &[u64]) -> (FaultSimulator, Cpu) {
    let program = Arc::new(Program::new(
        vec![CodeSection {
            name: ".text".to_string(),
            bytes: firmware.to_vec(),
            address: FLASH_BASE,
        }],
        FLASH_BASE,
    ));
    let ctx = Context {
        decision_model: Arc::new(AddressDecision::new(exploit.iter().copied(), [])),
        flash: MemoryRange::new(FLASH_BASE, 0x1000),
        ram: MemoryRange::new(0x2000_0000, 0x1000),
        halt_addresses: halt.to_vec(),
        max_instructions: 1000,
    };
    let cpu = Cpu::new(program, &ctx).unwrap();
    let mut simulator = FaultSimulator::new(ctx);
    simulator.set_number_of_threads(1);
    (simulator, cpu)
}

#[test]
/// An empty fault model list yields no findings and injects nothing.
fn empty_model_list_finds_nothing() {
    let (mut simulator, cpu) = setup(&SINGLE_CHECK, &[SINGLE_FAIL], &[SINGLE_SECURE]);
    let findings = simulator.simulate_faults(&cpu, &[], 0).unwrap();
    assert!(findings.is_empty());
    assert_eq!(simulator.get_number_of_injected_faults(), 0);
}

#[test]
/// A single instruction skip defeats the guarded branch: only skipping the
/// `b fail` at 0x08 reaches the secure path. One injection per instruction
/// of the fault-free run.
fn single_skip_defeats_guarded_branch() {
    let (mut simulator, cpu) = setup(&SINGLE_CHECK, &[SINGLE_FAIL], &[SINGLE_SECURE]);
    let models = vec![(InstructionSkip::new() as FaultModelRef, 1)];

    let findings = simulator.simulate_faults(&cpu, &models, 1).unwrap();

    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].len(), 1);
    let fault = &findings[0].faults[0];
    assert_eq!(fault.address, FLASH_BASE + 0x08);
    assert_eq!(fault.time, 4);
    // the fault-free run executes 5 instructions
    assert_eq!(simulator.get_number_of_injected_faults(), 5);
}

#[test]
/// A one-bit register corruption can only fix up the counter comparison by
/// flipping the single differing bit before the compare executes.
fn register_bit_flip_fixes_counter_compare() {
    let (mut simulator, cpu) = setup(&COUNTER_CHECK, &[COUNTER_FAIL], &[COUNTER_SECURE]);
    let models = vec![(get_fault_from("regbf_r0").unwrap(), 1)];

    let findings = simulator.simulate_faults(&cpu, &models, 1).unwrap();

    assert_eq!(findings.len(), 1);
    let fault = &findings[0].faults[0];
    assert_eq!(fault.parameter, 0, "only bit 0 differs between 2 and 3");
    assert_eq!(fault.time, 1, "flip must land before the compare");
    assert_eq!(
        fault.target,
        FaultTarget::Register {
            register: RegisterARM::R0
        }
    );
    // 4 sites x 32 bits
    assert_eq!(simulator.get_number_of_injected_faults(), 128);
}

#[test]
/// Once the single skip is proven exploitable, every two-skip chain carries
/// its shape and is pruned as redundant.
fn known_single_skip_prunes_double_chains() {
    let (mut simulator, cpu) = setup(&SINGLE_CHECK, &[SINGLE_FAIL], &[SINGLE_SECURE]);
    let models = vec![(InstructionSkip::new() as FaultModelRef, 2)];

    let findings = simulator.simulate_faults(&cpu, &models, 2).unwrap();

    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].len(), 1);
    assert_eq!(findings[0].faults[0].address, FLASH_BASE + 0x08);
}

#[test]
/// Two sequential checks need two skips; no single fault works and the two
/// fault times are strictly increasing.
fn two_checks_need_two_ordered_skips() {
    let (mut simulator, cpu) = setup(&DOUBLE_CHECK, &[DOUBLE_FAIL], &[DOUBLE_SECURE]);
    let models = vec![(InstructionSkip::new() as FaultModelRef, 2)];

    let findings = simulator.simulate_faults(&cpu, &models, 2).unwrap();

    assert_eq!(findings.len(), 1);
    let chain = &findings[0];
    assert_eq!(chain.len(), 2, "no single skip may succeed");
    assert_eq!(chain.faults[0].address, FLASH_BASE + 0x06);
    assert_eq!(chain.faults[1].address, FLASH_BASE + 0x0C);
    assert!(chain.faults[0].time < chain.faults[1].time);
}

#[test]
/// On a site that is visited once, the permanent skip finds exactly what
/// the transient skip finds.
fn permanent_and_transient_skip_agree_on_single_visit() {
    let (mut simulator, cpu) = setup(&SINGLE_CHECK, &[SINGLE_FAIL], &[SINGLE_SECURE]);
    let transient = simulator
        .simulate_faults(&cpu, &[(InstructionSkip::new() as FaultModelRef, 1)], 1)
        .unwrap();

    let (mut simulator, cpu) = setup(&SINGLE_CHECK, &[SINGLE_FAIL], &[SINGLE_SECURE]);
    let permanent = simulator
        .simulate_faults(&cpu, &[(PermanentSkip::new() as FaultModelRef, 1)], 1)
        .unwrap();

    let transient_sites: Vec<(u64, u64)> = transient
        .iter()
        .map(|chain| (chain.faults[0].time, chain.faults[0].address))
        .collect();
    let permanent_sites: Vec<(u64, u64)> = permanent
        .iter()
        .map(|chain| (chain.faults[0].time, chain.faults[0].address))
        .collect();
    assert_eq!(transient_sites, permanent_sites);
}

#[test]
/// Substituting the failing branch with a nop opens the secure path.
fn replace_with_nop_defeats_branch() {
    let (mut simulator, cpu) = setup(&SINGLE_CHECK, &[SINGLE_FAIL], &[SINGLE_SECURE]);
    let models = vec![(get_fault_from("replace_00bf").unwrap(), 1)];

    let findings = simulator.simulate_faults(&cpu, &models, 1).unwrap();

    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].faults[0].address, FLASH_BASE + 0x08);
}

#[test]
/// Holding r0 at zero across the check grants access; holding it at all
/// ones does not. Equal-shape findings at different times collapse into one.
fn stuck_register_at_zero_grants_access() {
    let (mut simulator, cpu) = setup(&ZERO_CHECK, &[ZERO_FAIL], &[ZERO_SECURE]);
    let models = vec![(get_fault_from("regstuck_r0").unwrap(), 1)];

    let findings = simulator.simulate_faults(&cpu, &models, 1).unwrap();

    assert_eq!(findings.len(), 1);
    let fault = &findings[0].faults[0];
    assert_eq!(fault.parameter, 0, "only the all-zeros value passes the check");
    assert_eq!(
        fault.target,
        FaultTarget::Register {
            register: RegisterARM::R0
        }
    );
}

#[test]
/// Findings and injection counts are independent of the worker thread
/// count.
fn findings_are_deterministic_across_thread_counts() {
    let run = |threads: u32| {
        let (mut simulator, cpu) = setup(&DOUBLE_CHECK, &[DOUBLE_FAIL], &[DOUBLE_SECURE]);
        simulator.set_number_of_threads(threads);
        let models = vec![(InstructionSkip::new() as FaultModelRef, 2)];
        let findings = simulator.simulate_faults(&cpu, &models, 2).unwrap();
        let mut fingerprints: Vec<u64> = findings.iter().map(|chain| chain.fingerprint()).collect();
        fingerprints.sort_unstable();
        (fingerprints, simulator.get_number_of_injected_faults())
    };

    let (fingerprints_single, injections_single) = run(1);
    let (fingerprints_parallel, injections_parallel) = run(4);
    assert_eq!(fingerprints_single, fingerprints_parallel);
    assert_eq!(injections_single, injections_parallel);
}

#[test]
/// Returned chains keep their faults in strictly increasing time order.
fn chains_are_temporally_ordered() {
    let (mut simulator, cpu) = setup(&DOUBLE_CHECK, &[DOUBLE_FAIL], &[DOUBLE_SECURE]);
    let models = vec![
        (InstructionSkip::new() as FaultModelRef, 2),
        (get_fault_from("regbf_r0").unwrap(), 1),
    ];

    let findings = simulator.simulate_faults(&cpu, &models, 2).unwrap();

    assert!(!findings.is_empty());
    for chain in &findings {
        for window in chain.faults.windows(2) {
            assert!(window[0].time < window[1].time);
        }
    }
}

#[test]
/// Configuration errors abort before any work starts.
fn invalid_configurations_are_rejected() {
    let (mut simulator, cpu) = setup(&SINGLE_CHECK, &[SINGLE_FAIL], &[SINGLE_SECURE]);

    let duplicated = vec![
        (InstructionSkip::new() as FaultModelRef, 1),
        (InstructionSkip::new() as FaultModelRef, 1),
    ];
    assert!(matches!(
        simulator.simulate_faults(&cpu, &duplicated, 0),
        Err(SimulationError::InvalidConfig(_))
    ));

    let models = vec![(InstructionSkip::new() as FaultModelRef, 2)];
    assert!(matches!(
        simulator.simulate_faults(&cpu, &models, 3),
        Err(SimulationError::InvalidConfig(_))
    ));
}

#[test]
/// A pre-run that never reaches an end condition aborts the simulation.
fn diverging_pre_run_is_rejected() {
    // b . with no halt address spins until the instruction cap
    let endless: [u8; 2] = [0xFE, 0xE7];
    let (mut simulator, cpu) = setup(&endless, &[], &[FLASH_BASE + 0x100]);
    let models = vec![(InstructionSkip::new() as FaultModelRef, 1)];

    assert!(matches!(
        simulator.simulate_faults(&cpu, &models, 1),
        Err(SimulationError::PreRunDiverged(_))
    ));
}
