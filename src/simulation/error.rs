use thiserror::Error;
use unicorn_engine::unicorn_const::uc_error;

/// Errors surfaced by the fault simulation engine.
///
/// Per-replay emulator and decision-model failures are not surfaced here;
/// they are swallowed into the rollback path and exposed through the
/// diagnostic counters of the engine.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// The fault model list or the simulation parameters are inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The fault-free pre-run did not reach an end condition within the
    /// instruction cap.
    #[error("fault-free pre-run did not finish within {0} instructions")]
    PreRunDiverged(usize),

    /// The emulator failed outside of a rollback-protected replay.
    #[error("emulator failure: {0:?}")]
    Emulator(uc_error),

    /// The exploitability decision model failed while no replay was active.
    #[error("exploitability decision failed: {0}")]
    Oracle(String),
}

impl From<uc_error> for SimulationError {
    fn from(error: uc_error) -> Self {
        SimulationError::Emulator(error)
    }
}
