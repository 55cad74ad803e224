use crate::simulation::cpu::CpuView;
use std::collections::HashSet;
use std::sync::Arc;

/// A contiguous memory range of the simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub base: u64,
    pub size: u64,
}

impl MemoryRange {
    pub fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    /// First address past the range.
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.end()
    }
}

/// Verdict of the exploitability decision model for the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Keep executing, no verdict yet.
    Continue,
    /// The replay reached an attacker-favorable state.
    Exploitable,
    /// The replay is proven harmless, stop early.
    NotExploitable,
}

/// User-supplied predicate deciding whether the current emulator state
/// constitutes a successful attack.
///
/// The model is consulted before every executed instruction. Returning an
/// error is treated like `NotExploitable` for the current replay and counted
/// separately by the engine.
pub trait ExploitabilityModel {
    fn decide(&mut self, cpu: &CpuView) -> Result<Decision, String>;
}

/// Factory producing a fresh decision model per worker emulator.
pub trait DecisionModelBuilder: Send + Sync {
    fn build(&self) -> Box<dyn ExploitabilityModel>;
}

/// Exploitability context for a simulation run.
#[derive(Clone)]
pub struct Context {
    /// Builder for the per-worker exploitability decision model.
    pub decision_model: Arc<dyn DecisionModelBuilder>,
    /// Flash range, mapped executable.
    pub flash: MemoryRange,
    /// RAM range, mapped read/write. The stack pointer starts at its top.
    pub ram: MemoryRange,
    /// Reaching one of these addresses ends the replay without a verdict.
    pub halt_addresses: Vec<u64>,
    /// Instruction cap for the fault-free pre-run.
    pub max_instructions: usize,
}

/// Decision model driven by plain address sets.
///
/// Reaching an exploit address decides `Exploitable`, reaching a benign
/// address decides `NotExploitable`. This is the model the command line
/// front-end builds from its `exploit_addresses` / `benign_addresses`
/// configuration.
#[derive(Debug, Clone, Default)]
pub struct AddressDecision {
    exploit: HashSet<u64>,
    benign: HashSet<u64>,
}

impl AddressDecision {
    pub fn new(exploit: impl IntoIterator<Item = u64>, benign: impl IntoIterator<Item = u64>) -> Self {
        Self {
            exploit: exploit.into_iter().collect(),
            benign: benign.into_iter().collect(),
        }
    }
}

impl ExploitabilityModel for AddressDecision {
    fn decide(&mut self, cpu: &CpuView) -> Result<Decision, String> {
        let address = cpu.program_counter();
        if self.exploit.contains(&address) {
            return Ok(Decision::Exploitable);
        }
        if self.benign.contains(&address) {
            return Ok(Decision::NotExploitable);
        }
        Ok(Decision::Continue)
    }
}

impl DecisionModelBuilder for AddressDecision {
    fn build(&self) -> Box<dyn ExploitabilityModel> {
        Box::new(self.clone())
    }
}
