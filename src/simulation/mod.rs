pub mod combination;
pub mod context;
pub mod cpu;
pub mod error;
pub mod faults;
pub mod known_faults;
pub mod model_combinations;
pub mod snapshot;

use combination::{Fault, FaultCombination, FaultTarget};
use context::{Context, Decision};
use cpu::{BaseState, Cpu};
use error::SimulationError;
use faults::{FaultKind, FaultModelRef};
use known_faults::KnownFaults;
use model_combinations::compute_model_combinations;

use crossbeam_channel::unbounded;
use log::{debug, info};
use std::sync::Arc;
use std::thread;

/// Extra replay cycles granted beyond the fault-free run length, so faulted
/// runs that take a slightly longer path can still reach an end condition.
const CYCLE_SLACK: usize = 32;

/// Parallel fault-injection engine.
///
/// Given a base emulator state and a catalog of fault models with
/// multiplicities, the engine exhaustively replays every combination of
/// concrete faults an attacker could induce and returns every combination
/// that drives the target into a state the exploitability model accepts.
///
/// Model arrangements are attacked shortest first; once a chain is proven
/// exploitable, every longer chain containing its time-independent shape is
/// pruned as redundant. Work is spread over a pool of worker threads, each
/// owning a private emulator clone with a nested snapshot stack for exact
/// rollback of speculative faults.
pub struct FaultSimulator {
    ctx: Context,
    num_threads: usize,
    print_progress: bool,
    progress: u32,
    num_fault_injections: u64,
    num_emulator_errors: u64,
    num_oracle_errors: u64,
}

/// Recursion seed handed to a worker: one top-level placement slot of one
/// model arrangement, together with the chains that can prune it.
struct WorkItem {
    arrangement: Arc<Vec<u32>>,
    known: Arc<Vec<FaultCombination>>,
    seed: usize,
}

/// Per-seed outcome reported back to the coordinator.
struct WorkResult {
    found: Vec<FaultCombination>,
    injections: u64,
    emulator_errors: u64,
    oracle_errors: u64,
}

/// State owned exclusively by one worker thread.
struct ThreadContext<'m> {
    cpu: Cpu,
    models: &'m [FaultModelRef],
    universe: &'m [(u64, u8)],
    total_cycles: usize,
    new_faults: Vec<FaultCombination>,
    injections: u64,
    emulator_errors: u64,
}

impl FaultSimulator {
    /// Creates a new fault simulator with the given context. The context
    /// defines when a fault chain counts as exploitable.
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            num_threads: 0,
            print_progress: false,
            progress: 0,
            num_fault_injections: 0,
            num_emulator_errors: 0,
            num_oracle_errors: 0,
        }
    }

    /// Sets the number of worker threads. 0 (default) uses the available
    /// hardware parallelism.
    pub fn set_number_of_threads(&mut self, threads: u32) {
        self.num_threads = threads as usize;
    }

    /// Enables progress printing to stderr, disabled by default. Progress is
    /// printed to stderr in order to be separable from other output.
    pub fn enable_progress_printing(&mut self, enable: bool) {
        self.print_progress = enable;
    }

    /// Number of faults injected during the last `simulate_faults` run.
    pub fn get_number_of_injected_faults(&self) -> u64 {
        self.num_fault_injections
    }

    /// Number of replays the emulator aborted during the last run. Such
    /// replays are rolled back and count no finding.
    pub fn get_number_of_emulator_errors(&self) -> u64 {
        self.num_emulator_errors
    }

    /// Number of exploitability model failures during the last run, each
    /// treated as a harmless replay.
    pub fn get_number_of_oracle_errors(&self) -> u64 {
        self.num_oracle_errors
    }

    /// Runs the fault simulation and returns all exploitable fault chains,
    /// deduplicated by fingerprint.
    ///
    /// `base` is taken as the starting state: callers may initialize
    /// registers and memory or emulate a prefix before handing it over.
    /// Every fault model must appear only once; its multiplicity selects how
    /// many instances of it may participate in one chain. At most
    /// `max_simultaneous` faults are combined per replay, 0 meaning no upper
    /// limit.
    pub fn simulate_faults(
        &mut self,
        base: &Cpu,
        fault_models: &[(FaultModelRef, u32)],
        max_simultaneous: u32,
    ) -> Result<Vec<FaultCombination>, SimulationError> {
        self.progress = 0;
        self.num_fault_injections = 0;
        self.num_emulator_errors = 0;
        self.num_oracle_errors = 0;

        if fault_models.is_empty() {
            return Ok(Vec::new());
        }
        self.validate_models(fault_models, max_simultaneous)?;

        let base_state = base.save_state()?;

        // Fault-free pre-run establishing the instruction universe. Faults
        // are only placed at these sites, which makes the enumeration
        // finite.
        let universe = self.gather_faultable_instructions(&base_state)?;
        info!(
            "gathered {} faultable instructions from the pre-run",
            universe.len()
        );

        let counts: Vec<u32> = fault_models.iter().map(|(_, count)| *count).collect();
        let arrangements = compute_model_combinations(&counts, max_simultaneous);
        let models_table: Vec<FaultModelRef> =
            fault_models.iter().map(|(model, _)| Arc::clone(model)).collect();
        let total_cycles = universe.len() + CYCLE_SLACK;

        let num_threads = if self.num_threads == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            self.num_threads
        };
        let total_items = (arrangements.len() * universe.len()) as u64;
        debug!(
            "running {} arrangements over {} sites on {} threads",
            arrangements.len(),
            universe.len(),
            num_threads
        );

        let mut table = KnownFaults::default();
        let mut findings: Vec<FaultCombination> = Vec::new();

        let (work_sender, work_receiver) = unbounded::<WorkItem>();
        let (result_sender, result_receiver) = unbounded::<WorkResult>();

        let state_ref = &base_state;
        let models_ref = models_table.as_slice();
        let universe_ref = universe.as_slice();

        thread::scope(|scope| {
            for _ in 0..num_threads {
                let receiver = work_receiver.clone();
                let sender = result_sender.clone();
                scope.spawn(move || {
                    let cpu = Cpu::from_state(state_ref).expect("failed to clone emulator state");
                    let mut thread_ctx = ThreadContext {
                        cpu,
                        models: models_ref,
                        universe: universe_ref,
                        total_cycles,
                        new_faults: Vec::new(),
                        injections: 0,
                        emulator_errors: 0,
                    };
                    while let Ok(item) = receiver.recv() {
                        let result = thread_ctx.process(&item);
                        if sender.send(result).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_sender);

            let mut done: u64 = 0;
            for arrangement in &arrangements {
                // Chains proven in earlier, shorter iterations prune this
                // one; the table is frozen while workers run.
                let known = Arc::new(table.prepare(arrangement));
                let arrangement = Arc::new(arrangement.clone());

                for seed in 0..universe.len() {
                    work_sender
                        .send(WorkItem {
                            arrangement: Arc::clone(&arrangement),
                            known: Arc::clone(&known),
                            seed,
                        })
                        .expect("worker pool disconnected");
                }

                let mut fresh = Vec::new();
                for _ in 0..universe.len() {
                    let result = result_receiver.recv().expect("worker pool disconnected");
                    done += 1;
                    self.num_fault_injections += result.injections;
                    self.num_emulator_errors += result.emulator_errors;
                    self.num_oracle_errors += result.oracle_errors;
                    fresh.extend(result.found);
                    self.update_progress(((done * 100) / total_items) as u32);
                }

                for chain in fresh {
                    if table.insert(chain.clone()) {
                        findings.push(chain);
                    }
                }
            }
            drop(work_sender);
        });

        info!(
            "fault simulation finished: {} findings, {} injections",
            findings.len(),
            self.num_fault_injections
        );
        Ok(findings)
    }

    fn validate_models(
        &self,
        fault_models: &[(FaultModelRef, u32)],
        max_simultaneous: u32,
    ) -> Result<(), SimulationError> {
        for (index, (model, count)) in fault_models.iter().enumerate() {
            if *count == 0 {
                return Err(SimulationError::InvalidConfig(format!(
                    "fault model {:?} has zero multiplicity",
                    model.name()
                )));
            }
            if fault_models[..index]
                .iter()
                .any(|(other, _)| other.name() == model.name())
            {
                return Err(SimulationError::InvalidConfig(format!(
                    "fault model {:?} appears more than once, use its multiplicity instead",
                    model.name()
                )));
            }
        }
        let total: u32 = fault_models.iter().map(|(_, count)| *count).sum();
        if max_simultaneous > total {
            return Err(SimulationError::InvalidConfig(format!(
                "max_simultaneous ({max_simultaneous}) exceeds the total model multiplicity ({total})"
            )));
        }
        Ok(())
    }

    /// Fault-free pre-run recording every executed instruction.
    fn gather_faultable_instructions(
        &self,
        base_state: &BaseState,
    ) -> Result<Vec<(u64, u8)>, SimulationError> {
        let mut cpu = Cpu::from_state(base_state)?;
        let universe = cpu.collect_instruction_order(self.ctx.max_instructions);

        if !cpu.end_reached() && cpu.decision().is_none() && universe.len() >= self.ctx.max_instructions {
            return Err(SimulationError::PreRunDiverged(self.ctx.max_instructions));
        }
        if universe.is_empty() {
            return Err(SimulationError::InvalidConfig(
                "the fault-free pre-run executed no instructions".to_string(),
            ));
        }
        Ok(universe)
    }

    fn update_progress(&mut self, percent: u32) {
        if percent > self.progress {
            self.progress = percent;
            if self.print_progress {
                eprintln!("[armory] progress: {percent}%");
            }
        }
    }
}

impl<'m> ThreadContext<'m> {
    /// Runs one recursion seed: advance the private emulator to the seed
    /// site, try every fault of the arrangement's first model there, and
    /// explore all deeper placements depth first. The snapshot stack
    /// guarantees the emulator is back at the base state afterwards.
    fn process(&mut self, item: &WorkItem) -> WorkResult {
        self.new_faults.clear();
        self.injections = 0;
        self.emulator_errors = 0;

        self.cpu.push_snapshot();
        let mut advanced = true;
        if item.seed > 0 {
            if let Err(error) = self.cpu.run_steps(item.seed) {
                debug!("seed advance failed: {error:?}");
                self.emulator_errors += 1;
                advanced = false;
            }
        }
        if advanced && !self.cpu.end_reached() && self.cpu.decision().is_none() {
            let site = self.universe[item.seed];
            let budget = self.total_cycles - item.seed;
            self.inject_at_site(item, 0, site, item.seed as u64, budget, &FaultCombination::default());
        }
        self.cpu.pop_snapshot();
        debug_assert_eq!(self.cpu.snapshot_depth(), 0);

        WorkResult {
            found: std::mem::take(&mut self.new_faults),
            injections: self.injections,
            emulator_errors: self.emulator_errors,
            oracle_errors: self.cpu.take_oracle_errors(),
        }
    }

    /// Tries every (target, parameter) instance of the arrangement's model
    /// at `depth` on the instruction site the emulator currently sits on.
    ///
    /// The emulator is expected to be stopped right before executing the
    /// site. Each instance is applied under its own snapshot and rolled
    /// back before the next one.
    fn inject_at_site(
        &mut self,
        item: &WorkItem,
        depth: usize,
        site: (u64, u8),
        time: u64,
        budget: usize,
        chain: &FaultCombination,
    ) {
        let (address, size) = site;
        let model_index = item.arrangement[depth];
        let model = Arc::clone(&self.models[model_index as usize]);

        let targets: Vec<FaultTarget> = if model.kind().targets_instructions() {
            vec![FaultTarget::Instruction { size }]
        } else {
            model
                .registers()
                .into_iter()
                .map(|register| FaultTarget::Register { register })
                .collect()
        };

        for target in targets {
            for parameter in 0..model.parameter_count() as u32 {
                if !model.parameter_applies(parameter, &target) {
                    continue;
                }

                let fault = Fault {
                    model: model_index,
                    parameter,
                    time,
                    address,
                    target,
                };

                self.cpu.push_snapshot();

                // Stash the original encoding for transient substitution.
                let replaced = if model.kind() == FaultKind::InstructionReplace {
                    let mut original = vec![0u8; size as usize];
                    match self.cpu.memory_read(address, &mut original) {
                        Ok(()) => Some(original),
                        Err(_) => None,
                    }
                } else {
                    None
                };

                match model.apply(&mut self.cpu, &fault) {
                    // Persistent hooks are uninstalled by the rollback of
                    // the snapshot they were installed under.
                    Ok(Some(hook)) => self.cpu.attach_hook(hook),
                    Ok(None) => (),
                    Err(error) => {
                        debug!("fault application failed at 0x{address:08X}: {error}");
                        self.emulator_errors += 1;
                        self.cpu.pop_snapshot();
                        continue;
                    }
                }
                self.injections += 1;

                let chain = chain.with(fault);
                if known_faults::is_redundant(&chain, &item.known) {
                    self.cpu.pop_snapshot();
                    continue;
                }

                // Skips consume their slot by moving the PC; all other
                // kinds execute the (possibly substituted) site instruction
                // before anything deeper happens, keeping fault times
                // strictly increasing.
                let mut dead = false;
                let steps_through_site = !matches!(
                    model.kind(),
                    FaultKind::InstructionSkip | FaultKind::InstructionPermanent
                );
                if steps_through_site {
                    if let Err(error) = self.cpu.run_steps(1) {
                        debug!("faulted instruction failed at 0x{address:08X}: {error:?}");
                        self.emulator_errors += 1;
                        dead = true;
                    }
                    if let Some(original) = replaced {
                        let _ = self.cpu.memory_write(address, &original);
                    }
                }

                if !dead {
                    match self.cpu.decision() {
                        Some(Decision::Exploitable) => self.record(&chain),
                        Some(Decision::NotExploitable) => (),
                        None if self.cpu.end_reached() => (),
                        None => {
                            if depth + 1 == item.arrangement.len() {
                                self.finish_replay(&chain, budget.saturating_sub(1));
                            } else if budget > 1 {
                                self.descend(item, depth + 1, time + 1, budget - 1, &chain);
                            }
                        }
                    }
                }

                self.cpu.pop_snapshot();
            }
        }
    }

    /// Collects the instruction order reachable from the current faulted
    /// state and walks it for the next placement level.
    fn descend(
        &mut self,
        item: &WorkItem,
        depth: usize,
        time_base: u64,
        budget: usize,
        chain: &FaultCombination,
    ) {
        self.cpu.push_snapshot();
        let order = self.cpu.collect_instruction_order(budget);
        let decision = self.cpu.decision();
        self.cpu.pop_snapshot();

        match decision {
            // The chain placed so far already wins without the remaining
            // faults; record the shorter chain and do not deepen.
            Some(Decision::Exploitable) => {
                self.record(chain);
                return;
            }
            Some(Decision::NotExploitable) => return,
            None => (),
        }
        if order.is_empty() {
            return;
        }
        self.place_faults(item, depth, &order, time_base, budget, chain);
    }

    /// Walks an instruction order, injecting at every slot and executing
    /// the real instruction between slots.
    fn place_faults(
        &mut self,
        item: &WorkItem,
        depth: usize,
        order: &[(u64, u8)],
        time_base: u64,
        budget: usize,
        chain: &FaultCombination,
    ) {
        for (slot, &site) in order.iter().enumerate() {
            if slot >= budget {
                break;
            }
            self.inject_at_site(item, depth, site, time_base + slot as u64, budget - slot, chain);

            if slot + 1 == order.len() {
                break;
            }
            if let Err(error) = self.cpu.run_steps(1) {
                debug!("advance failed at 0x{:08X}: {error:?}", site.0);
                self.emulator_errors += 1;
                break;
            }
            if self.cpu.end_reached() || self.cpu.decision().is_some() {
                break;
            }
        }
    }

    /// Resumes the fully faulted replay to its end and records the chain if
    /// the decision model accepts the reached state.
    fn finish_replay(&mut self, chain: &FaultCombination, budget: usize) {
        if budget > 0 {
            if let Err(error) = self.cpu.run_steps(budget) {
                debug!("replay failed: {error:?}");
                self.emulator_errors += 1;
                return;
            }
        }
        if self.cpu.decision() == Some(Decision::Exploitable) {
            self.record(chain);
        }
    }

    fn record(&mut self, chain: &FaultCombination) {
        let fingerprint = chain.fingerprint();
        if self
            .new_faults
            .iter()
            .any(|candidate| candidate.fingerprint() == fingerprint)
        {
            return;
        }
        self.new_faults.push(chain.clone());
    }
}
