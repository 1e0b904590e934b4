pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::{cli::LocalStorage, CliConfig};

pub use adapters::{
    IntersectionSpec, LaneSpec, PhaseSpec, QueueSimConfig, QueueSimulation, SumoConfig, SumoSimulation,
};
pub use config::{Backend, TrafficConfig};
pub use core::{
    fuzzy::FuzzyRunner,
    runner::{Baseline, Evaluator},
    trainer::Trainer,
};
pub use utils::error::{Result, TrafficError};
