use criterion::{criterion_group, criterion_main, Criterion};

use armory::prelude::*;
use std::sync::Arc;

const FLASH_BASE: u64 = 0x1000_0000;

// movs r0, #0; movs r1, #1; cmp r0, #1; bne fail; movs r2, #1; cmp r0, #2;
// bne fail; secure: b .; nop; fail: b .
const DOUBLE_CHECK: [u8; 20] = [
    0x00, 0x20, 0x01, 0x21, 0x01, 0x28, 0x04, 0xD1, 0x01, 0x22, 0x02, 0x28, 0x01, 0xD1, 0xFE, 0xE7,
    0x00, 0xBF, 0xFE, 0xE7,
];

fn setup() -> (FaultSimulator, Cpu) {
    let program = Arc::new(Program::new(
        vec![CodeSection {
            name: ".text".to_string(),
            bytes: DOUBLE_CHECK.to_vec(),
            address: FLASH_BASE,
        }],
        FLASH_BASE,
    ));
    let ctx = Context {
        decision_model: Arc::new(AddressDecision::new([FLASH_BASE + 0x0E], [])),
        flash: MemoryRange::new(FLASH_BASE, 0x1000),
        ram: MemoryRange::new(0x2000_0000, 0x1000),
        halt_addresses: vec![FLASH_BASE + 0x12],
        max_instructions: 1000,
    };
    let cpu = Cpu::new(program, &ctx).unwrap();
    let mut simulator = FaultSimulator::new(ctx);
    simulator.set_number_of_threads(1);
    (simulator, cpu)
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_performance");
    group.warm_up_time(std::time::Duration::from_secs(1));
    group.sample_size(10);
    group.bench_function("single skip campaign", |b| {
        b.iter(|| {
            let (mut simulator, cpu) = setup();
            let models = vec![(InstructionSkip::new() as FaultModelRef, 1)];
            simulator.simulate_faults(&cpu, &models, 1).unwrap();
        })
    });
    group.bench_function("double skip campaign", |b| {
        b.iter(|| {
            let (mut simulator, cpu) = setup();
            let models = vec![(InstructionSkip::new() as FaultModelRef, 2)];
            simulator.simulate_faults(&cpu, &models, 2).unwrap();
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
