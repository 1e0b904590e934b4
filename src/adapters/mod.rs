pub mod queue_sim;
pub mod traci;

pub use queue_sim::{IntersectionSpec, LaneSpec, PhaseSpec, QueueSimConfig, QueueSimulation};
pub use traci::{SumoConfig, SumoSimulation};
