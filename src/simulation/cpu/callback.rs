use super::{CpuState, CpuView};
use crate::simulation::context::Decision;
use crate::simulation::snapshot::PAGE_SIZE;

use unicorn_engine::unicorn_const::MemType;
use unicorn_engine::Unicorn;

use log::debug;

/// Hook for end-of-execution detection.
///
/// Runs before every executed instruction: halt addresses end the replay
/// without a verdict, otherwise the exploitability model is consulted and a
/// verdict other than `Continue` stops the emulator.
pub fn end_detection_callback(emu: &mut Unicorn<CpuState>, address: u64, _size: u32) {
    if emu.get_data().halt_addresses.contains(&address) {
        emu.get_data_mut().end_reached = true;
        emu.emu_stop().expect("failed to stop emulation");
        return;
    }

    if let Some(mut model) = emu.get_data_mut().decision_model.take() {
        let verdict = model.decide(&CpuView::new(emu, address));
        emu.get_data_mut().decision_model = Some(model);
        match verdict {
            Ok(Decision::Continue) => (),
            Ok(decision) => {
                emu.get_data_mut().decision = Some(decision);
                emu.emu_stop().expect("failed to stop emulation");
            }
            Err(error) => {
                debug!("exploitability model failed at 0x{address:08X}: {error}");
                let state = emu.get_data_mut();
                state.oracle_errors += 1;
                state.decision = Some(Decision::NotExploitable);
                emu.emu_stop().expect("failed to stop emulation");
            }
        }
    }
}

/// Hook recording every executed instruction as an `(address, size)` pair.
///
/// Only active while an instruction order is being collected. Instructions
/// suppressed by the end detection above are not recorded.
pub fn instruction_collector_callback(emu: &mut Unicorn<CpuState>, address: u64, size: u32) {
    let state = emu.get_data_mut();
    if state.collector_active && !state.end_reached && state.decision.is_none() {
        state.collected.push((address, size as u8));
    }
}

/// Hook capturing page pre-images for the innermost snapshot.
///
/// Fires before the write is committed, so reading the page yields its
/// content at the time the snapshot was pushed.
pub fn memory_write_tracking_callback(
    emu: &mut Unicorn<CpuState>,
    _mem_type: MemType,
    address: u64,
    size: usize,
    _value: i64,
) -> bool {
    let first = address & !(PAGE_SIZE - 1);
    let last = (address + size.max(1) as u64 - 1) & !(PAGE_SIZE - 1);

    let mut page = first;
    loop {
        let saved = match emu.get_data().snapshots.last() {
            Some(snapshot) => snapshot.has_page(page),
            None => true,
        };
        if !saved {
            let mut data = vec![0u8; PAGE_SIZE as usize];
            if emu.mem_read(page, &mut data).is_ok() {
                if let Some(snapshot) = emu.get_data_mut().snapshots.last_mut() {
                    snapshot.save_page(page, data);
                }
            }
        }
        if page == last {
            break;
        }
        page += PAGE_SIZE;
    }
    true
}
