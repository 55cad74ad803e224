use crate::simulation::combination::FaultCombination;
use crate::simulation::cpu::Program;
use crate::simulation::faults::FaultModelRef;

use addr2line::gimli;
use capstone::prelude::*;

type DebugContext = addr2line::Context<gimli::EndianReader<gimli::RunTimeEndian, std::rc::Rc<[u8]>>>;

/// Disassembly helper for human readable fault reports.
pub struct Disassembly {
    cs: Capstone,
}

impl Disassembly {
    pub fn new() -> Self {
        let cs = Capstone::new()
            .arm()
            .mode(arch::arm::ArchMode::Thumb)
            .extra_mode([arch::arm::ArchExtraMode::MClass].iter().copied())
            .detail(true)
            .build()
            .expect("Failed to create Capstone object");

        Self { cs }
    }

    fn bin_to_asm(&self, data: &[u8], address: u64) -> String {
        match self.cs.disasm_count(data, address, 1) {
            Ok(instructions) => match instructions.as_ref().first() {
                Some(instruction) => format!(
                    "{} {}",
                    instruction.mnemonic().unwrap_or("?"),
                    instruction.op_str().unwrap_or("")
                ),
                None => "<unknown>".to_string(),
            },
            Err(_) => "<unknown>".to_string(),
        }
    }

    fn instruction_bytes(program: &Program, address: u64, size: usize) -> Option<Vec<u8>> {
        for section in &program.sections {
            let end = section.address + section.bytes.len() as u64;
            if address >= section.address && address + size as u64 <= end {
                let offset = (address - section.address) as usize;
                return Some(section.bytes[offset..offset + size].to_vec());
            }
        }
        None
    }

    fn source_location(debug: Option<&DebugContext>, address: u64) -> Option<String> {
        let location = debug?.find_location(address).ok()??;
        let file = location.file?;
        let line = location.line?;
        Some(format!("{file}:{line}"))
    }

    /// Prints every found fault combination, one line per fault with time,
    /// address, disassembled target instruction and the model's description
    /// of the concrete fault.
    pub fn print_fault_records(
        &self,
        combinations: &[FaultCombination],
        models: &[FaultModelRef],
        program: &Program,
        debug: Option<&DebugContext>,
    ) {
        for (index, combination) in combinations.iter().enumerate() {
            println!("Combination {}:", index + 1);
            for fault in &combination.faults {
                let model = &models[fault.model as usize];
                let size = match fault.target {
                    crate::simulation::combination::FaultTarget::Instruction { size } => size as usize,
                    crate::simulation::combination::FaultTarget::Register { .. } => 2,
                };
                let asm = Self::instruction_bytes(program, fault.address, size)
                    .map(|bytes| self.bin_to_asm(&bytes, fault.address))
                    .unwrap_or_else(|| "<outside image>".to_string());
                let location = Self::source_location(debug, fault.address)
                    .map(|loc| format!("  ({loc})"))
                    .unwrap_or_default();
                println!(
                    "  t={:<6} 0x{:08X}:  {:<24} -> {}{}",
                    fault.time,
                    fault.address,
                    asm,
                    model.describe(fault),
                    location
                );
            }
            println!();
        }
    }
}

impl Default for Disassembly {
    fn default() -> Self {
        Self::new()
    }
}
