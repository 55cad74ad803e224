use super::{FaultKind, FaultModel, FaultModelRef};
use crate::simulation::combination::{Fault, FaultTarget};
use crate::simulation::cpu::{Cpu, HookHandle};
use crate::simulation::error::SimulationError;

use std::fmt::Debug;
use std::sync::Arc;

/// Transient skip of a single instruction.
///
/// Advances the PC past the targeted instruction without executing it,
/// modeling the most common outcome of clock and voltage glitches.
#[derive(Clone, Copy)]
pub struct InstructionSkip;

impl Debug for InstructionSkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InstructionSkip (skip)")
    }
}

impl InstructionSkip {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }

    pub fn try_parse(input: &str) -> Option<FaultModelRef> {
        (input == "skip").then(|| Self::new() as FaultModelRef)
    }
}

impl FaultModel for InstructionSkip {
    fn name(&self) -> String {
        "skip".to_string()
    }

    fn kind(&self) -> FaultKind {
        FaultKind::InstructionSkip
    }

    fn parameter_count(&self) -> usize {
        1
    }

    fn apply(&self, cpu: &mut Cpu, fault: &Fault) -> Result<Option<HookHandle>, SimulationError> {
        let FaultTarget::Instruction { size } = fault.target else {
            return Err(SimulationError::InvalidConfig(
                "instruction skip applied to a register target".to_string(),
            ));
        };
        cpu.set_program_counter(fault.address + size as u64);
        Ok(None)
    }

    fn describe(&self, fault: &Fault) -> String {
        match fault.target {
            FaultTarget::Instruction { size } => {
                format!("skip {size} byte instruction")
            }
            FaultTarget::Register { .. } => "skip".to_string(),
        }
    }
}

/// Permanent skip of an instruction site.
///
/// Skips the targeted instruction now and installs a hook that keeps
/// skipping it on every later visit until the snapshot rollback removes the
/// hook. Models a stuck fetch stage.
#[derive(Clone, Copy)]
pub struct PermanentSkip;

impl Debug for PermanentSkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PermanentSkip (skip_perm)")
    }
}

impl PermanentSkip {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }

    pub fn try_parse(input: &str) -> Option<FaultModelRef> {
        (input == "skip_perm").then(|| Self::new() as FaultModelRef)
    }
}

impl FaultModel for PermanentSkip {
    fn name(&self) -> String {
        "skip_perm".to_string()
    }

    fn kind(&self) -> FaultKind {
        FaultKind::InstructionPermanent
    }

    fn parameter_count(&self) -> usize {
        1
    }

    fn apply(&self, cpu: &mut Cpu, fault: &Fault) -> Result<Option<HookHandle>, SimulationError> {
        let FaultTarget::Instruction { size } = fault.target else {
            return Err(SimulationError::InvalidConfig(
                "instruction skip applied to a register target".to_string(),
            ));
        };
        // The current visit is skipped directly, the hook covers revisits.
        cpu.set_program_counter(fault.address + size as u64);
        let hook = cpu.install_permanent_skip(fault.address, size)?;
        Ok(Some(hook))
    }

    fn describe(&self, fault: &Fault) -> String {
        match fault.target {
            FaultTarget::Instruction { size } => {
                format!("permanently skip {size} byte instruction")
            }
            FaultTarget::Register { .. } => "skip_perm".to_string(),
        }
    }
}

/// Substitute opcode execution.
///
/// Writes one of the model's substitute encodings over the targeted
/// instruction; the engine executes it once and restores the original
/// bytes. Substitutes only apply to sites of matching width.
#[derive(Clone)]
pub struct InstructionReplace {
    substitutes: Vec<Vec<u8>>,
}

impl Debug for InstructionReplace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InstructionReplace ({} substitutes)", self.substitutes.len())
    }
}

impl InstructionReplace {
    pub fn new(substitutes: Vec<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self { substitutes })
    }

    /// Parse `replace_<hexbytes>[_<hexbytes>...]`, e.g. `replace_00bf`.
    pub fn try_parse(input: &str) -> Option<FaultModelRef> {
        let rest = input.strip_prefix("replace_")?;
        let mut substitutes = Vec::new();
        for token in rest.split('_') {
            if token.is_empty() || token.len() % 2 != 0 {
                return None;
            }
            let mut bytes = Vec::with_capacity(token.len() / 2);
            for pair in 0..token.len() / 2 {
                let byte = u8::from_str_radix(&token[pair * 2..pair * 2 + 2], 16).ok()?;
                bytes.push(byte);
            }
            substitutes.push(bytes);
        }
        Some(Self::new(substitutes) as FaultModelRef)
    }
}

impl FaultModel for InstructionReplace {
    fn name(&self) -> String {
        "replace".to_string()
    }

    fn kind(&self) -> FaultKind {
        FaultKind::InstructionReplace
    }

    fn parameter_count(&self) -> usize {
        self.substitutes.len()
    }

    fn parameter_applies(&self, parameter: u32, target: &FaultTarget) -> bool {
        match target {
            FaultTarget::Instruction { size } => {
                self.substitutes[parameter as usize].len() == *size as usize
            }
            FaultTarget::Register { .. } => false,
        }
    }

    fn apply(&self, cpu: &mut Cpu, fault: &Fault) -> Result<Option<HookHandle>, SimulationError> {
        let substitute = &self.substitutes[fault.parameter as usize];
        cpu.memory_write(fault.address, substitute)?;
        Ok(None)
    }

    fn describe(&self, fault: &Fault) -> String {
        let substitute = &self.substitutes[fault.parameter as usize];
        let encoded: String = substitute.iter().map(|byte| format!("{byte:02x}")).collect();
        format!("replace instruction with {encoded}")
    }
}
