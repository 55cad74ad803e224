use super::{parse_register, register_number, FaultKind, FaultModel, FaultModelRef, GENERAL_PURPOSE_REG};
use crate::simulation::combination::{Fault, FaultTarget};
use crate::simulation::cpu::{Cpu, HookHandle};
use crate::simulation::error::SimulationError;

use std::fmt::Debug;
use std::sync::Arc;

use unicorn_engine::RegisterARM;

/// Transient one-bit register corruption.
///
/// XORs a single bit of the targeted register at the injection point; the
/// parameter selects the bit position.
#[derive(Clone)]
pub struct RegisterBitFlip {
    registers: Vec<RegisterARM>,
}

impl Debug for RegisterBitFlip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RegisterBitFlip ({} registers)", self.registers.len())
    }
}

impl RegisterBitFlip {
    pub fn new(registers: Vec<RegisterARM>) -> Arc<Self> {
        Arc::new(Self { registers })
    }

    /// Parse `regbf` (r0..r12) or `regbf_r<N>`.
    pub fn try_parse(input: &str) -> Option<FaultModelRef> {
        if input == "regbf" {
            return Some(Self::new(GENERAL_PURPOSE_REG.to_vec()) as FaultModelRef);
        }
        let register = parse_register(input.strip_prefix("regbf_")?)?;
        Some(Self::new(vec![register]) as FaultModelRef)
    }
}

impl FaultModel for RegisterBitFlip {
    fn name(&self) -> String {
        match self.registers.as_slice() {
            [register] => format!("regbf_r{}", register_number(*register)),
            _ => "regbf".to_string(),
        }
    }

    fn kind(&self) -> FaultKind {
        FaultKind::RegisterTransient
    }

    fn parameter_count(&self) -> usize {
        32
    }

    fn registers(&self) -> Vec<RegisterARM> {
        self.registers.clone()
    }

    fn apply(&self, cpu: &mut Cpu, fault: &Fault) -> Result<Option<HookHandle>, SimulationError> {
        let FaultTarget::Register { register } = fault.target else {
            return Err(SimulationError::InvalidConfig(
                "register bit flip applied to an instruction target".to_string(),
            ));
        };
        let value = cpu.register_read(register)?;
        cpu.register_write(register, value ^ (1u64 << fault.parameter))?;
        Ok(None)
    }

    fn describe(&self, fault: &Fault) -> String {
        match fault.target {
            FaultTarget::Register { register } => format!(
                "flip bit {} of r{}",
                fault.parameter,
                register_number(register)
            ),
            FaultTarget::Instruction { .. } => "regbf".to_string(),
        }
    }
}

/// Permanent register overwrite.
///
/// Forces the targeted register to an all-zeros or all-ones value and
/// installs a hook that re-applies the value before every executed
/// instruction until rollback, modeling a bus line stuck at ground or
/// supply level.
#[derive(Clone)]
pub struct RegisterStuck {
    registers: Vec<RegisterARM>,
}

const STUCK_VALUES: [u64; 2] = [0x0000_0000, 0xFFFF_FFFF];

impl Debug for RegisterStuck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RegisterStuck ({} registers)", self.registers.len())
    }
}

impl RegisterStuck {
    pub fn new(registers: Vec<RegisterARM>) -> Arc<Self> {
        Arc::new(Self { registers })
    }

    /// Parse `regstuck` (r0..r12) or `regstuck_r<N>`.
    pub fn try_parse(input: &str) -> Option<FaultModelRef> {
        if input == "regstuck" {
            return Some(Self::new(GENERAL_PURPOSE_REG.to_vec()) as FaultModelRef);
        }
        let register = parse_register(input.strip_prefix("regstuck_")?)?;
        Some(Self::new(vec![register]) as FaultModelRef)
    }
}

impl FaultModel for RegisterStuck {
    fn name(&self) -> String {
        match self.registers.as_slice() {
            [register] => format!("regstuck_r{}", register_number(*register)),
            _ => "regstuck".to_string(),
        }
    }

    fn kind(&self) -> FaultKind {
        FaultKind::RegisterPermanent
    }

    fn parameter_count(&self) -> usize {
        STUCK_VALUES.len()
    }

    fn registers(&self) -> Vec<RegisterARM> {
        self.registers.clone()
    }

    fn apply(&self, cpu: &mut Cpu, fault: &Fault) -> Result<Option<HookHandle>, SimulationError> {
        let FaultTarget::Register { register } = fault.target else {
            return Err(SimulationError::InvalidConfig(
                "register overwrite applied to an instruction target".to_string(),
            ));
        };
        let value = STUCK_VALUES[fault.parameter as usize];
        cpu.register_write(register, value)?;
        let hook = cpu.install_register_stuck(register, value)?;
        Ok(Some(hook))
    }

    fn describe(&self, fault: &Fault) -> String {
        match fault.target {
            FaultTarget::Register { register } => format!(
                "hold r{} at 0x{:08X}",
                register_number(register),
                STUCK_VALUES[fault.parameter as usize]
            ),
            FaultTarget::Instruction { .. } => "regstuck".to_string(),
        }
    }
}
