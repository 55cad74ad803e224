use clap::Parser;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::path::PathBuf;
use unicorn_engine::RegisterARM;

/// Parse hex address strings to u64 values
pub fn parse_hex(s: &str) -> Result<u64, String> {
    let cleaned = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(cleaned, 16).map_err(|e| format!("Invalid hex address '{}': {}", s, e))
}

/// Convert register name string to RegisterARM enum
fn get_register_from_name(name: &str) -> Option<RegisterARM> {
    match name.to_uppercase().as_str() {
        "R0" => Some(RegisterARM::R0),
        "R1" => Some(RegisterARM::R1),
        "R2" => Some(RegisterARM::R2),
        "R3" => Some(RegisterARM::R3),
        "R4" => Some(RegisterARM::R4),
        "R5" => Some(RegisterARM::R5),
        "R6" => Some(RegisterARM::R6),
        "R7" => Some(RegisterARM::R7),
        "R8" => Some(RegisterARM::R8),
        "R9" => Some(RegisterARM::R9),
        "R10" => Some(RegisterARM::R10),
        "R11" => Some(RegisterARM::R11),
        "R12" => Some(RegisterARM::R12),
        "SP" => Some(RegisterARM::SP),
        "LR" => Some(RegisterARM::LR),
        "PC" => Some(RegisterARM::PC),
        "CPSR" => Some(RegisterARM::CPSR),
        _ => None,
    }
}

/// Custom deserializer for register context that validates register names
/// and handles hex values
fn deserialize_register_context<'de, D>(
    deserializer: D,
) -> Result<HashMap<RegisterARM, u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    let entries: HashMap<String, serde_json::Value> = Deserialize::deserialize(deserializer)?;
    let mut registers = HashMap::new();
    for (key, value) in entries {
        let register = get_register_from_name(&key)
            .ok_or_else(|| de::Error::custom(format!("Invalid register name: '{}'", key)))?;
        let reg_value = match value {
            serde_json::Value::String(s) => parse_hex(&s).map_err(de::Error::custom)?,
            serde_json::Value::Number(n) => n
                .as_u64()
                .ok_or_else(|| de::Error::custom(format!("Invalid value for register {}", key)))?,
            _ => {
                return Err(de::Error::custom(format!(
                    "Register {} value must be a string or number",
                    key
                )))
            }
        };
        registers.insert(register, reg_value);
    }
    Ok(registers)
}

/// Configuration structure that can be loaded from JSON5
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub elf: Option<PathBuf>,
    #[serde(default)]
    pub threads: u32,
    #[serde(default = "Config::default_max_instructions")]
    pub max_instructions: usize,
    #[serde(default)]
    pub faults: Vec<String>,
    #[serde(default)]
    pub max_simultaneous: u32,
    #[serde(default)]
    pub progress: bool,
    #[serde(default = "Config::default_flash_base")]
    pub flash_base: String,
    #[serde(default = "Config::default_flash_size")]
    pub flash_size: String,
    #[serde(default = "Config::default_ram_base")]
    pub ram_base: String,
    #[serde(default = "Config::default_ram_size")]
    pub ram_size: String,
    /// Entry point override, hex address or symbol name.
    #[serde(default)]
    pub start_address: Option<String>,
    /// Addresses or symbol names that end a replay without a verdict.
    #[serde(default)]
    pub halt_addresses: Vec<String>,
    /// Addresses or symbol names deciding a replay exploitable.
    #[serde(default)]
    pub exploit_addresses: Vec<String>,
    /// Addresses or symbol names deciding a replay harmless.
    #[serde(default)]
    pub benign_addresses: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_register_context")]
    pub initial_registers: HashMap<RegisterARM, u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            elf: None,
            threads: 0,
            max_instructions: Self::default_max_instructions(),
            faults: Vec::new(),
            max_simultaneous: 0,
            progress: false,
            flash_base: Self::default_flash_base(),
            flash_size: Self::default_flash_size(),
            ram_base: Self::default_ram_base(),
            ram_size: Self::default_ram_size(),
            start_address: None,
            halt_addresses: Vec::new(),
            exploit_addresses: Vec::new(),
            benign_addresses: Vec::new(),
            initial_registers: HashMap::new(),
        }
    }
}

impl Config {
    // Keep defaults in sync with CLI defaults
    fn default_max_instructions() -> usize {
        2000
    }

    fn default_flash_base() -> String {
        "0x08000000".to_string()
    }

    fn default_flash_size() -> String {
        "0x100000".to_string()
    }

    fn default_ram_base() -> String {
        "0x20000000".to_string()
    }

    fn default_ram_size() -> String {
        "0x40000".to_string()
    }

    /// Load configuration from JSON5 file
    pub fn from_file(path: &PathBuf) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        json5::from_str(&content).map_err(|e| format!("Failed to parse JSON5 config: {}", e))
    }

    /// Override config values with command line arguments
    pub fn override_with_args(&mut self, args: &Args) {
        if args.elf.is_some() {
            self.elf = args.elf.clone();
        }
        if args.threads != 0 {
            self.threads = args.threads;
        }
        if let Some(max_instructions) = args.max_instructions {
            self.max_instructions = max_instructions;
        }
        if !args.faults.is_empty() {
            self.faults = args.faults.clone();
        }
        if let Some(max_simultaneous) = args.max_simultaneous {
            self.max_simultaneous = max_simultaneous;
        }
        if args.progress {
            self.progress = true;
        }
        if !args.halt_addresses.is_empty() {
            self.halt_addresses = args.halt_addresses.clone();
        }
        if !args.exploit_addresses.is_empty() {
            self.exploit_addresses = args.exploit_addresses.clone();
        }
        if !args.benign_addresses.is_empty() {
            self.benign_addresses = args.benign_addresses.clone();
        }
    }
}

/// Command line parameter structure
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Load configuration from JSON5 file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// ELF file of the target firmware
    #[arg(short, long)]
    pub elf: Option<PathBuf>,

    /// Number of worker threads, 0 = number of CPU cores
    #[arg(short, long, default_value_t = 0)]
    pub threads: u32,

    /// Maximum number of instructions of the fault-free run
    #[arg(short, long)]
    pub max_instructions: Option<usize>,

    /// Fault models to combine, e.g. skip:2 regbf_r0 replace_00bf
    ///   A ':count' suffix sets the model multiplicity (default 1)
    #[arg(long, value_delimiter = ' ', num_args = 1.., verbatim_doc_comment)]
    pub faults: Vec<String>,

    /// Maximum number of simultaneous faults per replay, 0 = unbounded
    #[arg(short = 's', long)]
    pub max_simultaneous: Option<u32>,

    /// Print progress information to stderr
    #[arg(short, long, default_value_t = false)]
    pub progress: bool,

    /// Addresses or symbols that end a replay without a verdict
    #[arg(long, num_args = 0..)]
    pub halt_addresses: Vec<String>,

    /// Addresses or symbols that decide a replay exploitable
    #[arg(long, num_args = 0..)]
    pub exploit_addresses: Vec<String>,

    /// Addresses or symbols that decide a replay harmless
    #[arg(long, num_args = 0..)]
    pub benign_addresses: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_addresses() {
        assert_eq!(parse_hex("0x08000000"), Ok(0x0800_0000));
        assert_eq!(parse_hex("1000"), Ok(0x1000));
        assert!(parse_hex("0xZZ").is_err());
    }

    #[test]
    fn parses_json5_config() {
        let config: Config = json5::from_str(
            r#"{
                faults: ["skip:2", "regbf_r0"],
                max_simultaneous: 2,
                halt_addresses: ["0x080001F0"],
                exploit_addresses: ["secure_entry"],
                initial_registers: { R0: "0x10", R1: 2 },
            }"#,
        )
        .unwrap();
        assert_eq!(config.faults.len(), 2);
        assert_eq!(config.max_simultaneous, 2);
        assert_eq!(config.max_instructions, 2000);
        assert_eq!(config.initial_registers[&RegisterARM::R0], 0x10);
        assert_eq!(config.initial_registers[&RegisterARM::R1], 2);
    }
}
