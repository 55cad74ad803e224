use clap::Parser;
use std::sync::Arc;

use armory::prelude::*;

use git_version::git_version;
const GIT_VERSION: &str = git_version!(fallback = "unknown");

/// Resolve a config entry into an address: hex literal or ELF symbol name.
fn resolve_address(input: &str, elf: &ElfFile) -> Result<u64, String> {
    let cleaned = input.strip_prefix("0x").unwrap_or(input);
    if !cleaned.is_empty() && cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
        return parse_hex(input);
    }
    elf.symbol_address(input)
        .ok_or_else(|| format!("Unknown symbol or address: {input:?}"))
}

fn resolve_addresses(inputs: &[String], elf: &ElfFile) -> Result<Vec<u64>, String> {
    inputs.iter().map(|input| resolve_address(input, elf)).collect()
}

/// Parse a fault spec of the form `name[:count]`.
fn parse_fault_spec(spec: &str) -> Result<(FaultModelRef, u32), String> {
    let (name, count) = match spec.split_once(':') {
        Some((name, count)) => {
            let count: u32 = count
                .parse()
                .map_err(|e| format!("Invalid multiplicity in {spec:?}: {e}"))?;
            (name, count)
        }
        None => (spec, 1),
    };
    Ok((get_fault_from(name)?, count))
}

/// Program to find exploitable fault-injection attacks on ARM firmware
fn main() -> Result<(), String> {
    let args = Args::parse();
    env_logger::init(); // Switch on with: RUST_LOG=debug cargo run

    println!("--- armory fault injection simulator: {GIT_VERSION} ---\n");

    // Load configuration file if provided, then apply CLI overrides
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.override_with_args(&args);

    let elf_path = config
        .elf
        .clone()
        .ok_or("No ELF file given, use --elf or the config file")?;
    println!("Loading target: {}", elf_path.display());
    let elf = ElfFile::new(elf_path)?;

    if config.faults.is_empty() {
        println!("No fault models selected. Available models:");
        for name in get_fault_lists() {
            println!("  {name}");
        }
        return Ok(());
    }

    let fault_models = config
        .faults
        .iter()
        .map(|spec| parse_fault_spec(spec))
        .collect::<Result<Vec<_>, String>>()?;

    let flash = MemoryRange::new(parse_hex(&config.flash_base)?, parse_hex(&config.flash_size)?);
    let ram = MemoryRange::new(parse_hex(&config.ram_base)?, parse_hex(&config.ram_size)?);

    let halt_addresses = resolve_addresses(&config.halt_addresses, &elf)?;
    let exploit_addresses = resolve_addresses(&config.exploit_addresses, &elf)?;
    let benign_addresses = resolve_addresses(&config.benign_addresses, &elf)?;
    if exploit_addresses.is_empty() {
        return Err("No exploit addresses given, nothing can be found".to_string());
    }

    let ctx = Context {
        decision_model: Arc::new(AddressDecision::new(exploit_addresses, benign_addresses)),
        flash,
        ram,
        halt_addresses,
        max_instructions: config.max_instructions,
    };

    let mut program = elf.to_program();
    if let Some(start) = &config.start_address {
        program.start_address = resolve_address(start, &elf)? & 0xFFFF_FFFE;
    }
    let program = Arc::new(program);

    // Base emulator state: loaded image plus the configured register values
    let mut base = Cpu::new(Arc::clone(&program), &ctx).map_err(|e| e.to_string())?;
    for (register, value) in &config.initial_registers {
        base.register_write(*register, *value)
            .map_err(|e| format!("Failed to set register: {e:?}"))?;
    }

    let mut simulator = FaultSimulator::new(ctx);
    simulator.set_number_of_threads(config.threads);
    simulator.enable_progress_printing(config.progress);

    println!("\nRun fault simulations:");
    let findings = simulator
        .simulate_faults(&base, &fault_models, config.max_simultaneous)
        .map_err(|e| e.to_string())?;

    let models: Vec<FaultModelRef> = fault_models.iter().map(|(model, _)| model.clone()).collect();
    let cs = Disassembly::new();
    let debug_context = elf.get_debug_context();

    if findings.is_empty() {
        println!("No exploitable fault combinations found!");
    } else {
        println!("Found {} exploitable fault combinations:\n", findings.len());
        cs.print_fault_records(&findings, &models, &program, debug_context.as_ref());
    }

    println!(
        "Overall faults injected: {} ({} emulator errors, {} oracle errors)",
        simulator.get_number_of_injected_faults(),
        simulator.get_number_of_emulator_errors(),
        simulator.get_number_of_oracle_errors()
    );

    Ok(())
}
