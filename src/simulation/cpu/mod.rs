use crate::simulation::context::{Context, Decision, DecisionModelBuilder, ExploitabilityModel, MemoryRange};
use crate::simulation::error::SimulationError;
use crate::simulation::snapshot::{Snapshot, PAGE_SIZE};

mod callback;

use callback::{end_detection_callback, instruction_collector_callback, memory_write_tracking_callback};

use unicorn_engine::unicorn_const::{uc_error, Arch, HookType, Mode, Permission, SECOND_SCALE};
use unicorn_engine::{RegisterARM, UcHookId, Unicorn};

use log::debug;
use std::collections::HashSet;
use std::sync::Arc;

/// Handle of a hook installed on a worker emulator, removed on rollback.
pub type HookHandle = UcHookId;

pub const ARM_REG: [RegisterARM; 17] = [
    RegisterARM::R0,
    RegisterARM::R1,
    RegisterARM::R2,
    RegisterARM::R3,
    RegisterARM::R4,
    RegisterARM::R5,
    RegisterARM::R6,
    RegisterARM::R7,
    RegisterARM::R8,
    RegisterARM::R9,
    RegisterARM::R10,
    RegisterARM::R11,
    RegisterARM::R12,
    RegisterARM::SP,
    RegisterARM::LR,
    RegisterARM::PC,
    RegisterARM::CPSR,
];

/// One loadable piece of the target image.
#[derive(Debug, Clone)]
pub struct CodeSection {
    pub name: String,
    pub bytes: Vec<u8>,
    pub address: u64,
}

/// The target image and its entry point.
#[derive(Debug, Clone)]
pub struct Program {
    pub sections: Vec<CodeSection>,
    pub start_address: u64,
}

impl Program {
    pub fn new(sections: Vec<CodeSection>, start_address: u64) -> Self {
        Self {
            sections,
            start_address,
        }
    }
}

/// Portable copy of a `Cpu` state, used to seed worker emulators.
///
/// Unicorn instances are bound to the thread that created them, so workers
/// rebuild their emulator from this plain-data state instead of receiving a
/// live instance.
pub struct BaseState {
    program: Arc<Program>,
    flash: MemoryRange,
    ram: MemoryRange,
    halt_addresses: Vec<u64>,
    decision_model: Arc<dyn DecisionModelBuilder>,
    registers: [u64; ARM_REG.len()],
    program_counter: u64,
    regions: Vec<(u64, Vec<u8>)>,
}

pub(crate) struct CpuState {
    program: Arc<Program>,
    halt_addresses: HashSet<u64>,
    decision_builder: Arc<dyn DecisionModelBuilder>,
    decision_model: Option<Box<dyn ExploitabilityModel>>,
    end_reached: bool,
    decision: Option<Decision>,
    oracle_errors: u64,
    collector_active: bool,
    collected: Vec<(u64, u8)>,
    snapshots: Vec<Snapshot>,
}

/// Read-only view of the emulator handed to the exploitability model.
pub struct CpuView<'v, 'e> {
    emu: &'v Unicorn<'e, CpuState>,
    address: u64,
}

impl<'v, 'e> CpuView<'v, 'e> {
    pub(crate) fn new(emu: &'v Unicorn<'e, CpuState>, address: u64) -> Self {
        Self { emu, address }
    }

    /// Address of the instruction about to execute.
    pub fn program_counter(&self) -> u64 {
        self.address
    }

    pub fn register_read(&self, register: RegisterARM) -> Result<u64, uc_error> {
        self.emu.reg_read(register)
    }

    pub fn memory_read(&self, address: u64, buffer: &mut [u8]) -> Result<(), uc_error> {
        self.emu.mem_read(address, buffer)
    }
}

/// Worker-owned ARM emulator front-end.
///
/// Wraps a unicorn instance set up for ARMv7-M Thumb execution together with
/// the hooks the engine relies on: end-of-execution detection, instruction
/// order collection and dirty-page tracking for snapshots. Every access of
/// the engine and of the fault models goes through this type.
pub struct Cpu {
    emu: Unicorn<'static, CpuState>,
    program_counter: u64,
    flash: MemoryRange,
    ram: MemoryRange,
}

impl Cpu {
    /// Creates a fresh emulator with the program loaded and all engine hooks
    /// installed. Registers are cleared, the stack pointer is set to the top
    /// of RAM and the PC to the program entry.
    pub fn new(program: Arc<Program>, ctx: &Context) -> Result<Self, SimulationError> {
        Self::build(
            program,
            ctx.flash,
            ctx.ram,
            ctx.halt_addresses.clone(),
            Arc::clone(&ctx.decision_model),
        )
    }

    fn build(
        program: Arc<Program>,
        flash: MemoryRange,
        ram: MemoryRange,
        halt_addresses: Vec<u64>,
        decision_builder: Arc<dyn DecisionModelBuilder>,
    ) -> Result<Self, SimulationError> {
        let decision_model = decision_builder.build();
        let state = CpuState {
            program: Arc::clone(&program),
            halt_addresses: halt_addresses.iter().copied().collect(),
            decision_builder,
            decision_model: Some(decision_model),
            end_reached: false,
            decision: None,
            oracle_errors: 0,
            collector_active: false,
            collected: Vec::new(),
            snapshots: Vec::new(),
        };

        // Setup platform -> ARMv7-M Thumb
        let mut emu = Unicorn::new_with_data(Arch::ARM, Mode::LITTLE_ENDIAN | Mode::MCLASS, state)
            .map_err(SimulationError::Emulator)?;

        debug!("setup new unicorn instance");

        let page_mask = (PAGE_SIZE - 1) as usize;
        emu.mem_map(
            flash.base,
            (flash.size as usize + page_mask) & !page_mask,
            Permission::ALL,
        )?;
        emu.mem_map(
            ram.base,
            (ram.size as usize + page_mask) & !page_mask,
            Permission::READ | Permission::WRITE,
        )?;

        for section in &program.sections {
            emu.mem_write(section.address, &section.bytes)?;
        }

        // Hook order matters: end detection must run before the collector so
        // suppressed instructions are never recorded.
        emu.add_code_hook(flash.base, flash.end(), end_detection_callback)?;
        emu.add_code_hook(flash.base, flash.end(), instruction_collector_callback)?;
        emu.add_mem_hook(HookType::MEM_WRITE, 0, u64::MAX, memory_write_tracking_callback)?;

        let mut cpu = Self {
            emu,
            program_counter: program.start_address,
            flash,
            ram,
        };
        cpu.init_registers()?;
        Ok(cpu)
    }

    /// Clear all registers and point SP at the top of RAM.
    fn init_registers(&mut self) -> Result<(), SimulationError> {
        for register in ARM_REG.iter() {
            self.emu.reg_write(*register, 0x00)?;
        }
        self.emu
            .reg_write(RegisterARM::SP, self.ram.end() - 4)?;
        Ok(())
    }

    /// Captures the full state of this emulator as plain data.
    pub fn save_state(&self) -> Result<BaseState, SimulationError> {
        let mut registers = [0u64; ARM_REG.len()];
        for (index, register) in ARM_REG.iter().enumerate() {
            registers[index] = self.emu.reg_read(*register)?;
        }

        let mut regions = Vec::new();
        for region in self.emu.mem_regions()? {
            let length = (region.end - region.begin + 1) as usize;
            let mut data = vec![0u8; length];
            self.emu.mem_read(region.begin, &mut data)?;
            regions.push((region.begin, data));
        }

        let state = self.emu.get_data();
        Ok(BaseState {
            program: Arc::clone(&state.program),
            flash: self.flash,
            ram: self.ram,
            halt_addresses: state.halt_addresses.iter().copied().collect(),
            decision_model: Arc::clone(&state.decision_builder),
            registers,
            program_counter: self.program_counter,
            regions,
        })
    }

    /// Builds a new emulator seeded from a captured state. The decision
    /// model is rebuilt through its factory, so every clone owns a fresh
    /// instance.
    pub fn from_state(state: &BaseState) -> Result<Self, SimulationError> {
        let mut cpu = Self::build(
            Arc::clone(&state.program),
            state.flash,
            state.ram,
            state.halt_addresses.clone(),
            Arc::clone(&state.decision_model),
        )?;

        for (base, data) in &state.regions {
            cpu.emu.mem_write(*base, data)?;
        }
        for (index, register) in ARM_REG.iter().enumerate() {
            cpu.emu.reg_write(*register, state.registers[index])?;
        }
        cpu.program_counter = state.program_counter;
        Ok(cpu)
    }

    /// Execute up to `cycles` instructions from the current PC.
    ///
    /// Stops early when a hook ends the run; the verdict is available via
    /// `end_reached` and `decision` afterwards.
    pub fn run_steps(&mut self, cycles: usize) -> Result<(), uc_error> {
        let end_address = self.flash.end();
        // Thumb execution, start from the last PC
        let ret_val = self.emu.emu_start(
            self.program_counter | 1,
            end_address | 1,
            SECOND_SCALE,
            cycles,
        );
        self.program_counter = self.emu.pc_read()?;
        ret_val
    }

    /// Run from the current state recording every executed instruction,
    /// bounded by `limit` instructions. Emulator failures end the collection
    /// at the last valid instruction.
    pub fn collect_instruction_order(&mut self, limit: usize) -> Vec<(u64, u8)> {
        {
            let state = self.emu.get_data_mut();
            state.collector_active = true;
            state.collected.clear();
        }
        if limit > 0 {
            if let Err(error) = self.run_steps(limit) {
                debug!(
                    "instruction collection stopped at 0x{:08X}: {:?}",
                    self.program_counter, error
                );
            }
        }
        let state = self.emu.get_data_mut();
        state.collector_active = false;
        std::mem::take(&mut state.collected)
    }

    /// True once a halt address ended the current run.
    pub fn end_reached(&self) -> bool {
        self.emu.get_data().end_reached
    }

    /// Verdict of the decision model for the current run, if any.
    pub fn decision(&self) -> Option<Decision> {
        self.emu.get_data().decision
    }

    /// Returns and resets the number of decision model failures.
    pub fn take_oracle_errors(&mut self) -> u64 {
        std::mem::take(&mut self.emu.get_data_mut().oracle_errors)
    }

    pub fn get_program_counter(&self) -> u64 {
        self.program_counter
    }

    pub fn set_program_counter(&mut self, program_counter: u64) {
        self.program_counter = program_counter;
    }

    pub fn register_read(&self, register: RegisterARM) -> Result<u64, uc_error> {
        self.emu.reg_read(register)
    }

    pub fn register_write(&mut self, register: RegisterARM, value: u64) -> Result<(), uc_error> {
        self.emu.reg_write(register, value)
    }

    pub fn memory_read(&self, address: u64, buffer: &mut [u8]) -> Result<(), uc_error> {
        self.emu.mem_read(address, buffer)
    }

    /// Write memory through the snapshot tracking, so engine-driven writes
    /// (opcode substitution) roll back like emulated ones.
    pub fn memory_write(&mut self, address: u64, data: &[u8]) -> Result<(), uc_error> {
        self.save_write_preimage(address, data.len());
        self.emu.mem_write(address, data)
    }

    fn save_write_preimage(&mut self, address: u64, length: usize) {
        if length == 0 || self.emu.get_data().snapshots.is_empty() {
            return;
        }
        let first = address & !(PAGE_SIZE - 1);
        let last = (address + length as u64 - 1) & !(PAGE_SIZE - 1);
        let mut page = first;
        loop {
            let saved = self
                .emu
                .get_data()
                .snapshots
                .last()
                .map(|snapshot| snapshot.has_page(page))
                .unwrap_or(true);
            if !saved {
                let mut data = vec![0u8; PAGE_SIZE as usize];
                if self.emu.mem_read(page, &mut data).is_ok() {
                    if let Some(snapshot) = self.emu.get_data_mut().snapshots.last_mut() {
                        snapshot.save_page(page, data);
                    }
                }
            }
            if page == last {
                break;
            }
            page += PAGE_SIZE;
        }
    }

    /// Determine the width of the Thumb instruction at `address`.
    pub fn instruction_size(&self, address: u64) -> Option<usize> {
        let mut data: [u8; 2] = [0; 2];
        // Check for 32 bit cmd (0b11101... 0b1111....)
        if self.emu.mem_read(address, &mut data).is_ok() {
            if (data[1] & 0xF8 == 0xE8) || (data[1] & 0xF0 == 0xF0) {
                return Some(4);
            }
            return Some(2);
        }
        None
    }

    /// Install a hook that skips the instruction at `address` on every
    /// future visit. The caller attaches the handle to the live snapshot.
    pub fn install_permanent_skip(&mut self, address: u64, size: u8) -> Result<HookHandle, uc_error> {
        let width = size as u64;
        self.emu
            .add_code_hook(address, address + 1, move |emu, hooked_address, _size| {
                let _ = emu.reg_write(RegisterARM::PC, (hooked_address + width) | 1);
            })
    }

    /// Install a hook holding `register` at `value` across every executed
    /// instruction until rollback.
    pub fn install_register_stuck(
        &mut self,
        register: RegisterARM,
        value: u64,
    ) -> Result<HookHandle, uc_error> {
        self.emu
            .add_code_hook(self.flash.base, self.flash.end(), move |emu, _address, _size| {
                let _ = emu.reg_write(register, value);
            })
    }

    /// Attach a hook handle to the innermost snapshot so the rollback
    /// uninstalls it.
    pub fn attach_hook(&mut self, hook: HookHandle) {
        self.emu
            .get_data_mut()
            .snapshots
            .last_mut()
            .expect("no snapshot to attach the hook to")
            .attach_hook(hook);
    }

    /// Push a snapshot of the current state onto the snapshot stack.
    pub fn push_snapshot(&mut self) {
        let mut registers = [0u64; ARM_REG.len()];
        for (index, register) in ARM_REG.iter().enumerate() {
            registers[index] = self.emu.reg_read(*register).expect("failed to read register");
        }
        let state = self.emu.get_data_mut();
        let snapshot = Snapshot::capture(
            registers,
            self.program_counter,
            state.end_reached,
            state.decision,
        );
        state.snapshots.push(snapshot);
    }

    /// Pop the innermost snapshot, restoring registers, written pages and
    /// the run flags, and uninstalling any hooks attached to it.
    pub fn pop_snapshot(&mut self) {
        let snapshot = self
            .emu
            .get_data_mut()
            .snapshots
            .pop()
            .expect("snapshot stack underflow");

        let registers = *snapshot.registers();
        self.program_counter = snapshot.program_counter();
        let end_reached = snapshot.end_reached();
        let decision = snapshot.decision();
        let (pages, hooks) = snapshot.into_rollback();

        for hook in hooks {
            let _ = self.emu.remove_hook(hook);
        }
        for (page, data) in pages {
            self.emu
                .mem_write(page, &data)
                .expect("failed to restore memory page");
        }
        for (index, register) in ARM_REG.iter().enumerate() {
            self.emu
                .reg_write(*register, registers[index])
                .expect("failed to restore register");
        }

        let state = self.emu.get_data_mut();
        state.end_reached = end_reached;
        state.decision = decision;
    }

    pub fn snapshot_depth(&self) -> usize {
        self.emu.get_data().snapshots.len()
    }
}
