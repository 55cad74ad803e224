//! ELF parsing for the simulator front-end.
//!
//! Extracts the loadable segments and the symbol table of the target binary
//! and exposes a DWARF context for source locations in fault reports.

use crate::simulation::cpu::{CodeSection, Program};

use addr2line::{gimli, object::read, Context};
use elf::{endian::AnyEndian, file::FileHeader, symbol::Symbol, ElfBytes};
use std::collections::HashMap;

pub use elf::abi::*;

/// Parsed target binary.
pub struct ElfFile {
    /// ELF file header with architecture and entry point information.
    pub header: FileHeader<AnyEndian>,
    /// Loadable program segments as (physical address, bytes) pairs.
    pub program_data: Vec<(u64, Vec<u8>)>,
    /// Global and weak symbols by name.
    pub symbol_map: HashMap<String, Symbol>,
    file_data: Vec<u8>,
}

impl ElfFile {
    pub fn new(path: std::path::PathBuf) -> Result<Self, String> {
        let file_data =
            std::fs::read(&path).map_err(|e| format!("Could not read {}: {e}", path.display()))?;
        let elf_data = ElfBytes::<AnyEndian>::minimal_parse(file_data.as_ref())
            .map_err(|e| format!("Not a valid ELF file: {e}"))?;

        // Get all loadable program headers with their data
        let program_data: Vec<(u64, Vec<u8>)> = elf_data
            .segments()
            .ok_or("ELF file has no program headers")?
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD && ph.p_filesz != 0)
            .map(|ph| {
                elf_data
                    .segment_data(&ph)
                    .map(|data| (ph.p_paddr, data.to_vec()))
                    .map_err(|e| format!("Failed to read segment data: {e}"))
            })
            .collect::<Result<_, _>>()?;

        // Sum strings with their symbol into a hashmap
        let common = elf_data
            .find_common_data()
            .map_err(|e| format!("Failed to parse section data: {e}"))?;
        let symbol_map: HashMap<String, Symbol> = match (common.symtab, common.symtab_strs) {
            (Some(symtab), Some(strtab)) => symtab
                .iter()
                .filter(|sym| sym.st_bind() & STB_GLOBAL != 0 || sym.st_bind() & STB_WEAK != 0)
                .filter_map(|sym| {
                    strtab
                        .get(sym.st_name as usize)
                        .ok()
                        .map(|name| (name.to_string(), sym))
                })
                .collect(),
            _ => HashMap::new(),
        };

        Ok(Self {
            header: elf_data.ehdr,
            program_data,
            symbol_map,
            file_data,
        })
    }

    /// Address of a global or weak symbol, with the Thumb bit cleared.
    pub fn symbol_address(&self, name: &str) -> Option<u64> {
        self.symbol_map
            .get(name)
            .map(|symbol| symbol.st_value & 0xFFFF_FFFE)
    }

    /// Converts the loadable segments into the image the emulator loads.
    /// The entry point comes from the ELF header.
    pub fn to_program(&self) -> Program {
        let sections = self
            .program_data
            .iter()
            .enumerate()
            .map(|(index, (address, bytes))| CodeSection {
                name: format!("load{index}"),
                bytes: bytes.clone(),
                address: *address,
            })
            .collect();
        Program::new(sections, self.header.e_entry & 0xFFFF_FFFE)
    }

    /// DWARF debug context for mapping addresses to source locations.
    pub fn get_debug_context(
        &self,
    ) -> Option<Context<gimli::EndianReader<gimli::RunTimeEndian, std::rc::Rc<[u8]>>>> {
        let object = read::File::parse(&*self.file_data).ok()?;
        Context::new(&object).ok()
    }
}
