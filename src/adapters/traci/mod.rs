//! SUMO 的 TraCI TCP 用戶端

pub mod client;
pub mod codec;
pub mod constants;

pub use client::{SumoConfig, SumoSimulation};
pub use codec::TraciValue;
