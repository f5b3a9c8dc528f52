pub mod accounts;
pub mod engine;
pub mod montecarlo;
pub mod random;
pub mod strategy;
pub mod tax;
pub mod types;

pub use engine::{rrif_minimum_fraction, run_single_simulation};
pub use montecarlo::run_batch;
pub use random::ReturnGenerator;
pub use types::{
    BatchResult, EngineError, Progress, Scenario, SimulationResult, SimulationStatus,
    YearlyRecord,
};
