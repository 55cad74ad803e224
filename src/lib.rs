mod config;
mod disassembly;
mod elf_file;
mod simulation;

pub mod prelude {
    pub use crate::config::{parse_hex, Args, Config};
    pub use crate::disassembly::Disassembly;
    pub use crate::elf_file::ElfFile;
    pub use crate::simulation::combination::{Fault, FaultCombination, FaultTarget};
    pub use crate::simulation::context::{
        AddressDecision, Context, Decision, DecisionModelBuilder, ExploitabilityModel, MemoryRange,
    };
    pub use crate::simulation::cpu::{CodeSection, Cpu, CpuView, Program};
    pub use crate::simulation::error::SimulationError;
    pub use crate::simulation::faults::{
        get_fault_from, get_fault_lists, FaultKind, FaultModel, FaultModelRef, InstructionReplace,
        InstructionSkip, PermanentSkip, RegisterBitFlip, RegisterStuck,
    };
    pub use crate::simulation::FaultSimulator;
}
