use crate::domain::ports::TrafficSimulation;
use crate::utils::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopAccounting {
    /// 每一步低於門檻都累加
    #[default]
    Cumulative,
    /// 只計第一次停車，車輛再次移動後不再累加
    FirstStop,
}

#[derive(Debug, Clone)]
struct StopEntry {
    stopped_time: f64,
    still_stopped: bool,
}

/// 每輛車的停車時間，依第一次出現的順序輸出
#[derive(Debug, Clone)]
pub struct StopTimeTracker {
    threshold: f64,
    accounting: StopAccounting,
    order: Vec<String>,
    entries: HashMap<String, StopEntry>,
}

impl StopTimeTracker {
    pub fn new(threshold: f64, accounting: StopAccounting) -> Self {
        Self {
            threshold,
            accounting,
            order: Vec::new(),
            entries: HashMap::new(),
        }
    }

    pub fn observe(&mut self, vehicle_id: &str, speed: f64, delta_t: f64) {
        let stopped = speed < self.threshold;

        match self.entries.get_mut(vehicle_id) {
            None => {
                if stopped {
                    let initial = match self.accounting {
                        StopAccounting::Cumulative => delta_t,
                        StopAccounting::FirstStop => 0.0,
                    };
                    self.order.push(vehicle_id.to_string());
                    self.entries.insert(
                        vehicle_id.to_string(),
                        StopEntry {
                            stopped_time: initial,
                            still_stopped: true,
                        },
                    );
                }
            }
            Some(entry) => match self.accounting {
                StopAccounting::Cumulative => {
                    if stopped {
                        entry.stopped_time += delta_t;
                    }
                }
                StopAccounting::FirstStop => {
                    if !stopped {
                        entry.still_stopped = false;
                    } else if entry.still_stopped {
                        entry.stopped_time += delta_t;
                    }
                }
            },
        }
    }

    pub async fn observe_step<S: TrafficSimulation + ?Sized>(
        &mut self,
        sim: &mut S,
        delta_t: f64,
    ) -> Result<()> {
        for vehicle_id in sim.vehicle_ids().await? {
            let speed = sim.vehicle_speed(&vehicle_id).await?;
            self.observe(&vehicle_id, speed, delta_t);
        }
        Ok(())
    }

    pub fn stop_times(&self) -> Vec<(String, f64)> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|e| (id.clone(), e.stopped_time)))
            .collect()
    }

    pub fn total(&self) -> f64 {
        self.entries.values().map(|e| e.stopped_time).sum()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// 每步累加所有車輛的等待時間，最後除以出現過的車輛數
#[derive(Debug, Clone, Default)]
pub struct WaitingTimeTracker {
    total_wait: f64,
    vehicles: HashSet<String>,
}

impl WaitingTimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, vehicle_id: &str, waiting_time: f64) {
        if !self.vehicles.contains(vehicle_id) {
            self.vehicles.insert(vehicle_id.to_string());
        }
        self.total_wait += waiting_time;
    }

    pub async fn observe_step<S: TrafficSimulation + ?Sized>(&mut self, sim: &mut S) -> Result<()> {
        for vehicle_id in sim.vehicle_ids().await? {
            let wait = sim.vehicle_waiting_time(&vehicle_id).await?;
            self.record(&vehicle_id, wait);
        }
        Ok(())
    }

    pub fn vehicle_count(&self) -> usize {
        self.vehicles.len()
    }

    pub fn total_wait(&self) -> f64 {
        self.total_wait
    }

    pub fn average(&self) -> f64 {
        if self.vehicles.is_empty() {
            0.0
        } else {
            self.total_wait / self.vehicles.len() as f64
        }
    }
}
