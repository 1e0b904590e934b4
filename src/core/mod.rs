pub mod agent;
pub mod discretize;
pub mod emissions;
pub mod fuzzy;
pub mod lanes;
pub mod metrics;
pub mod qtable;
pub mod runner;
pub mod trainer;

pub use crate::domain::model::{EpisodeSummary, RunReport};
pub use crate::domain::ports::{Storage, TrafficSimulation};
pub use crate::utils::error::Result;
