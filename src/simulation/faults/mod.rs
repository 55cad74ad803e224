use crate::simulation::combination::{Fault, FaultTarget};
use crate::simulation::cpu::{Cpu, HookHandle};
use crate::simulation::error::SimulationError;

use std::fmt::Debug;
use std::sync::Arc;

use unicorn_engine::RegisterARM;

pub mod instruction;
pub mod register;

pub use instruction::{InstructionReplace, InstructionSkip, PermanentSkip};
pub use register::{RegisterBitFlip, RegisterStuck};

/// The five supported fault families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Transiently advance past one instruction.
    InstructionSkip,
    /// Execute a substitute opcode instead of the original, once.
    InstructionReplace,
    /// Force the instruction effect on every future visit until rollback.
    InstructionPermanent,
    /// Corrupt a register value exactly once.
    RegisterTransient,
    /// Hold a register at a forced value until rollback.
    RegisterPermanent,
}

impl FaultKind {
    /// Whether faults of this kind target instruction sites rather than
    /// registers.
    pub fn targets_instructions(&self) -> bool {
        matches!(
            self,
            FaultKind::InstructionSkip | FaultKind::InstructionReplace | FaultKind::InstructionPermanent
        )
    }
}

/// A parametric description of a class of physical faults.
///
/// Models are immutable after construction and shared between worker
/// threads. The parameter space is a finite range indexed by
/// `0..parameter_count()`; register models additionally expose the registers
/// they attack. `apply` mutates the emulator at the injection point and
/// returns the handle of any persistent hook it installed, which the engine
/// attaches to the live snapshot for uninstallation on rollback.
pub trait FaultModel: Send + Sync + Debug {
    fn name(&self) -> String;
    fn kind(&self) -> FaultKind;
    fn parameter_count(&self) -> usize;

    /// Registers attacked by register-kind models.
    fn registers(&self) -> Vec<RegisterARM> {
        Vec::new()
    }

    /// Whether a parameter is usable for the given target.
    fn parameter_applies(&self, _parameter: u32, _target: &FaultTarget) -> bool {
        true
    }

    fn apply(&self, cpu: &mut Cpu, fault: &Fault) -> Result<Option<HookHandle>, SimulationError>;

    /// Human readable description of a concrete fault for reports.
    fn describe(&self, fault: &Fault) -> String;
}

/// Shared handle to a fault model in the engine's model table.
pub type FaultModelRef = Arc<dyn FaultModel>;

/// Registers attackable by the shipped register fault models.
pub(crate) const GENERAL_PURPOSE_REG: [RegisterARM; 13] = [
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
];

/// Parse a fault model from its command line spelling.
pub fn get_fault_from(input: &str) -> Result<FaultModelRef, String> {
    let parsers: [fn(&str) -> Option<FaultModelRef>; 5] = [
        InstructionSkip::try_parse,
        PermanentSkip::try_parse,
        InstructionReplace::try_parse,
        RegisterBitFlip::try_parse,
        RegisterStuck::try_parse,
    ];
    parsers
        .iter()
        .find_map(|parser| parser(input))
        .ok_or_else(|| format!("Unknown fault model: {input:?}"))
}

/// Spellings of all suggested fault models.
pub fn get_fault_lists() -> Vec<String> {
    let mut list = vec![
        "skip".to_string(),
        "skip_perm".to_string(),
        "replace_00bf".to_string(),
    ];
    for reg in 0..=12 {
        list.push(format!("regbf_r{reg}"));
        list.push(format!("regstuck_r{reg}"));
    }
    list
}

pub(crate) fn parse_register(token: &str) -> Option<RegisterARM> {
    let index: usize = token.strip_prefix('r')?.parse().ok()?;
    GENERAL_PURPOSE_REG.get(index).copied()
}

pub(crate) fn register_number(register: RegisterARM) -> u32 {
    register as u32 - RegisterARM::R0 as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_catalog_spellings() {
        assert_eq!(get_fault_from("skip").unwrap().kind(), FaultKind::InstructionSkip);
        assert_eq!(
            get_fault_from("skip_perm").unwrap().kind(),
            FaultKind::InstructionPermanent
        );
        assert_eq!(
            get_fault_from("replace_00bf").unwrap().kind(),
            FaultKind::InstructionReplace
        );
        assert_eq!(
            get_fault_from("regbf_r3").unwrap().kind(),
            FaultKind::RegisterTransient
        );
        assert_eq!(
            get_fault_from("regstuck").unwrap().kind(),
            FaultKind::RegisterPermanent
        );
        assert!(get_fault_from("glitch_1").is_err());
    }

    #[test]
    fn register_model_spellings_narrow_the_target_list() {
        let all = get_fault_from("regbf").unwrap();
        let single = get_fault_from("regbf_r5").unwrap();
        assert_eq!(all.registers().len(), 13);
        assert_eq!(single.registers(), vec![RegisterARM::R5]);
    }
}
