use crate::simulation::context::Decision;
use crate::simulation::cpu::{HookHandle, ARM_REG};
use std::collections::HashMap;

/// Page granularity of memory pre-images.
pub const PAGE_SIZE: u64 = 0x1000;

/// Delta snapshot of emulator state since the previous snapshot on the same
/// stack.
///
/// Registers are captured eagerly on push. Memory is captured lazily as 4 KiB
/// pre-images the first time a page is written while the snapshot is the top
/// of its stack. Hook handles installed by permanent faults are attached to
/// the live snapshot and uninstalled on rollback. Lifetime is strictly
/// nested: push before a speculative step, pop on return.
pub struct Snapshot {
    registers: [u64; ARM_REG.len()],
    program_counter: u64,
    pages: HashMap<u64, Vec<u8>>,
    hooks: Vec<HookHandle>,
    end_reached: bool,
    decision: Option<Decision>,
}

impl Snapshot {
    pub(crate) fn capture(
        registers: [u64; ARM_REG.len()],
        program_counter: u64,
        end_reached: bool,
        decision: Option<Decision>,
    ) -> Self {
        Self {
            registers,
            program_counter,
            pages: HashMap::new(),
            hooks: Vec::new(),
            end_reached,
            decision,
        }
    }

    pub(crate) fn has_page(&self, page: u64) -> bool {
        self.pages.contains_key(&page)
    }

    pub(crate) fn save_page(&mut self, page: u64, data: Vec<u8>) {
        self.pages.insert(page, data);
    }

    pub(crate) fn attach_hook(&mut self, hook: HookHandle) {
        self.hooks.push(hook);
    }

    pub(crate) fn registers(&self) -> &[u64; ARM_REG.len()] {
        &self.registers
    }

    pub(crate) fn program_counter(&self) -> u64 {
        self.program_counter
    }

    pub(crate) fn end_reached(&self) -> bool {
        self.end_reached
    }

    pub(crate) fn decision(&self) -> Option<Decision> {
        self.decision
    }

    pub(crate) fn into_rollback(self) -> (HashMap<u64, Vec<u8>>, Vec<HookHandle>) {
        (self.pages, self.hooks)
    }
}
