//! 內建的點狀排隊模擬器，不需要安裝 SUMO 就能訓練與測試代理人。
//!
//! 每條進入車道是一個佇列：車輛依預先產生的到達時刻出現，行駛
//! `approach_steps` 步後抵達停止線，綠燈時每步最多放行
//! `discharge_per_step` 輛。號誌依時相長度自動輪替，`set_phase`
//! 會立即切換並重新計時，行為與 SUMO 一致。

use crate::domain::model::{PhaseDef, TlsProgram};
use crate::domain::ports::TrafficSimulation;
use crate::utils::error::{Result, TrafficError};
use crate::utils::validation::{validate_positive_number, validate_range, Validate};
use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneSpec {
    pub id: String,
    /// 每秒到達率
    pub arrival_rate: f64,
    pub link_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub duration: f64,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntersectionSpec {
    pub id: String,
    pub lanes: Vec<LaneSpec>,
    pub phases: Vec<PhaseSpec>,
}

impl IntersectionSpec {
    /// 四岔路口，南北與東西兩個綠燈時相，中間各有黃燈
    pub fn four_way(id: &str, rates: [f64; 4]) -> Self {
        let lane_ids = ["-E0_0", "E1_0", "E2_0", "E3_0"];
        Self {
            id: id.to_string(),
            lanes: lane_ids
                .iter()
                .zip(rates)
                .enumerate()
                .map(|(i, (lane, rate))| LaneSpec {
                    id: lane.to_string(),
                    arrival_rate: rate,
                    link_index: i,
                })
                .collect(),
            phases: vec![
                PhaseSpec {
                    duration: 31.0,
                    state: "GGrr".to_string(),
                },
                PhaseSpec {
                    duration: 4.0,
                    state: "yyrr".to_string(),
                },
                PhaseSpec {
                    duration: 31.0,
                    state: "rrGG".to_string(),
                },
                PhaseSpec {
                    duration: 4.0,
                    state: "rryy".to_string(),
                },
            ],
        }
    }

    /// 多個路口時車道 id 不能重複，例如 `A` -> `A-E0_0`
    pub fn with_lane_prefix(mut self, prefix: &str) -> Self {
        for lane in &mut self.lanes {
            lane.id = format!("{}{}", prefix, lane.id);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSimConfig {
    pub seed: u64,
    pub step_length: f64,
    /// 超過這個秒數不再產生新車
    pub demand_end: f64,
    pub approach_steps: usize,
    pub discharge_per_step: usize,
    pub cruise_speed: f64,
    pub intersections: Vec<IntersectionSpec>,
}

impl Default for QueueSimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            step_length: 1.0,
            demand_end: 3600.0,
            approach_steps: 5,
            discharge_per_step: 1,
            cruise_speed: 13.89,
            intersections: vec![IntersectionSpec::four_way("C", [0.12, 0.12, 0.08, 0.08])],
        }
    }
}

impl Validate for QueueSimConfig {
    fn validate(&self) -> Result<()> {
        validate_range("simulation.builtin.step_length", self.step_length, 0.001, 3600.0)?;
        validate_positive_number(
            "simulation.builtin.discharge_per_step",
            self.discharge_per_step,
            1,
        )?;
        if self.intersections.is_empty() {
            return Err(TrafficError::MissingConfigError {
                field: "simulation.builtin.intersections".to_string(),
            });
        }

        let mut lane_ids = HashSet::new();
        for its in &self.intersections {
            let field = format!("simulation.builtin.intersections[{}]", its.id);
            if its.phases.is_empty() {
                return Err(TrafficError::ConfigValidationError {
                    field,
                    message: "at least one phase is required".to_string(),
                });
            }
            let links = its.lanes.len();
            let mut seen = vec![false; links];
            for lane in &its.lanes {
                if !lane_ids.insert(lane.id.as_str()) {
                    return Err(TrafficError::ConfigValidationError {
                        field,
                        message: format!("lane '{}' is used by more than one intersection", lane.id),
                    });
                }
                validate_range(&format!("{}.{}.arrival_rate", field, lane.id), lane.arrival_rate, 0.0, 1.0e3)?;
                match seen.get_mut(lane.link_index) {
                    Some(slot) if !*slot => *slot = true,
                    _ => {
                        return Err(TrafficError::ConfigValidationError {
                            field,
                            message: format!(
                                "link indices must be unique and below {} (lane {})",
                                links, lane.id
                            ),
                        })
                    }
                }
            }
            if let Some(bad) = its.phases.iter().find(|p| p.state.len() != links || p.duration <= 0.0) {
                return Err(TrafficError::ConfigValidationError {
                    field,
                    message: format!(
                        "phase '{}' must have {} signal characters and a positive duration",
                        bad.state, links
                    ),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Vehicle {
    id: String,
    waiting: f64,
}

#[derive(Debug, Clone, Default)]
struct LaneState {
    /// 車輛與剩餘行駛步數
    approaching: VecDeque<(Vehicle, usize)>,
    queue: VecDeque<Vehicle>,
    /// 依出發步數排序
    schedule: VecDeque<(usize, String)>,
}

#[derive(Debug, Clone)]
struct SignalState {
    phase: usize,
    remaining: f64,
}

#[derive(Debug, Clone, Copy)]
struct VehicleSnapshot {
    speed: f64,
    waiting: f64,
}

pub struct QueueSimulation {
    config: QueueSimConfig,
    episode: u64,
    running: bool,
    step: usize,
    lanes: Vec<Vec<LaneState>>,
    signals: Vec<SignalState>,
    snapshot: HashMap<String, VehicleSnapshot>,
    vehicle_order: Vec<String>,
    departed: usize,
}

impl QueueSimulation {
    pub fn new(config: QueueSimConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            episode: 0,
            running: false,
            step: 0,
            lanes: Vec::new(),
            signals: Vec::new(),
            snapshot: HashMap::new(),
            vehicle_order: Vec::new(),
            departed: 0,
        })
    }

    pub fn config(&self) -> &QueueSimConfig {
        &self.config
    }

    pub fn current_step(&self) -> usize {
        self.step
    }

    /// 已經通過路口的車輛數
    pub fn departed(&self) -> usize {
        self.departed
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running {
            Ok(())
        } else {
            Err(TrafficError::simulation("simulation is not running, call start() first"))
        }
    }

    fn intersection_index(&self, tls_id: &str) -> Result<usize> {
        self.config
            .intersections
            .iter()
            .position(|i| i.id == tls_id)
            .ok_or_else(|| TrafficError::UnknownObject {
                kind: "traffic light".to_string(),
                id: tls_id.to_string(),
            })
    }

    fn lane_state(&self, lane_id: &str) -> Result<&LaneState> {
        for (i, its) in self.config.intersections.iter().enumerate() {
            if let Some(j) = its.lanes.iter().position(|l| l.id == lane_id) {
                return Ok(&self.lanes[i][j]);
            }
        }
        Err(TrafficError::UnknownObject {
            kind: "lane".to_string(),
            id: lane_id.to_string(),
        })
    }

    fn vehicle(&self, vehicle_id: &str) -> Result<VehicleSnapshot> {
        self.snapshot
            .get(vehicle_id)
            .copied()
            .ok_or_else(|| TrafficError::UnknownObject {
                kind: "vehicle".to_string(),
                id: vehicle_id.to_string(),
            })
    }

    fn generate_demand(&mut self) {
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(self.episode));
        let demand_steps = (self.config.demand_end / self.config.step_length).ceil().max(0.0) as usize;
        let mut counter = 0usize;

        self.lanes = self
            .config
            .intersections
            .iter()
            .map(|its| vec![LaneState::default(); its.lanes.len()])
            .collect();

        for step in 0..demand_steps {
            for (i, its) in self.config.intersections.iter().enumerate() {
                for (j, lane) in its.lanes.iter().enumerate() {
                    let p = (lane.arrival_rate * self.config.step_length).clamp(0.0, 1.0);
                    if rng.gen_bool(p) {
                        self.lanes[i][j]
                            .schedule
                            .push_back((step, format!("veh{}", counter)));
                        counter += 1;
                    }
                }
            }
        }
        tracing::debug!(
            "Generated {} vehicles for episode {} (seed {})",
            counter,
            self.episode,
            self.config.seed.wrapping_add(self.episode)
        );
    }

    fn rebuild_snapshot(&mut self) {
        self.snapshot.clear();
        self.vehicle_order.clear();
        for lanes in &self.lanes {
            for lane in lanes {
                for (v, _) in &lane.approaching {
                    self.vehicle_order.push(v.id.clone());
                    self.snapshot.insert(
                        v.id.clone(),
                        VehicleSnapshot {
                            speed: self.config.cruise_speed,
                            waiting: 0.0,
                        },
                    );
                }
                for v in &lane.queue {
                    self.vehicle_order.push(v.id.clone());
                    self.snapshot.insert(
                        v.id.clone(),
                        VehicleSnapshot {
                            speed: 0.0,
                            waiting: v.waiting,
                        },
                    );
                }
            }
        }
    }

    fn advance(&mut self) {
        let dt = self.config.step_length;
        let step = self.step;

        for (i, its) in self.config.intersections.iter().enumerate() {
            let signal = &mut self.signals[i];
            let state = its.phases[signal.phase].state.as_bytes();

            for (j, lane_spec) in its.lanes.iter().enumerate() {
                let lane = &mut self.lanes[i][j];
                let green = matches!(state.get(lane_spec.link_index), Some(b'G') | Some(b'g'));
                let mut capacity = if green { self.config.discharge_per_step } else { 0 };

                while capacity > 0 && lane.queue.pop_front().is_some() {
                    capacity -= 1;
                    self.departed += 1;
                }
                for v in lane.queue.iter_mut() {
                    v.waiting += dt;
                }

                let mut still_approaching = VecDeque::with_capacity(lane.approaching.len());
                while let Some((v, remaining)) = lane.approaching.pop_front() {
                    if remaining > 1 {
                        still_approaching.push_back((v, remaining - 1));
                    } else if capacity > 0 && lane.queue.is_empty() {
                        // 綠燈且前方無車，直接通過不停車
                        capacity -= 1;
                        self.departed += 1;
                    } else {
                        lane.queue.push_back(v);
                    }
                }
                lane.approaching = still_approaching;

                while lane.schedule.front().is_some_and(|(s, _)| *s <= step) {
                    if let Some((_, id)) = lane.schedule.pop_front() {
                        let vehicle = Vehicle { id, waiting: 0.0 };
                        if self.config.approach_steps == 0 {
                            lane.queue.push_back(vehicle);
                        } else {
                            lane.approaching
                                .push_back((vehicle, self.config.approach_steps));
                        }
                    }
                }
            }

            signal.remaining -= dt;
            if signal.remaining <= 1e-9 {
                signal.phase = (signal.phase + 1) % its.phases.len();
                signal.remaining = its.phases[signal.phase].duration;
            }
        }

        self.step += 1;
    }
}

#[async_trait]
impl TrafficSimulation for QueueSimulation {
    async fn start(&mut self) -> Result<()> {
        self.episode += 1;
        self.step = 0;
        self.departed = 0;
        self.signals = self
            .config
            .intersections
            .iter()
            .map(|its| SignalState {
                phase: 0,
                remaining: its.phases[0].duration,
            })
            .collect();
        self.generate_demand();
        self.rebuild_snapshot();
        self.running = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }

    async fn simulation_step(&mut self) -> Result<()> {
        self.ensure_running()?;
        self.advance();
        self.rebuild_snapshot();
        Ok(())
    }

    async fn traffic_light_ids(&mut self) -> Result<Vec<String>> {
        self.ensure_running()?;
        Ok(self.config.intersections.iter().map(|i| i.id.clone()).collect())
    }

    async fn controlled_lanes(&mut self, tls_id: &str) -> Result<Vec<String>> {
        let idx = self.intersection_index(tls_id)?;
        let mut lanes: Vec<&LaneSpec> = self.config.intersections[idx].lanes.iter().collect();
        lanes.sort_by_key(|l| l.link_index);
        Ok(lanes.into_iter().map(|l| l.id.clone()).collect())
    }

    async fn program(&mut self, tls_id: &str) -> Result<TlsProgram> {
        let idx = self.intersection_index(tls_id)?;
        let its = &self.config.intersections[idx];
        Ok(TlsProgram {
            program_id: "0".to_string(),
            current_phase: self.signals.get(idx).map(|s| s.phase).unwrap_or(0),
            phases: its
                .phases
                .iter()
                .map(|p| PhaseDef::new(p.duration, p.state.clone()))
                .collect(),
        })
    }

    async fn phase(&mut self, tls_id: &str) -> Result<usize> {
        self.ensure_running()?;
        let idx = self.intersection_index(tls_id)?;
        Ok(self.signals[idx].phase)
    }

    async fn set_phase(&mut self, tls_id: &str, phase: usize) -> Result<()> {
        self.ensure_running()?;
        let idx = self.intersection_index(tls_id)?;
        let phases = &self.config.intersections[idx].phases;
        let duration = phases.get(phase).map(|p| p.duration).ok_or_else(|| {
            TrafficError::simulation(format!(
                "phase index {} is not in the allowed range [0,{}] for '{}'",
                phase,
                phases.len() - 1,
                tls_id
            ))
        })?;
        self.signals[idx] = SignalState {
            phase,
            remaining: duration,
        };
        Ok(())
    }

    async fn lane_halting_number(&mut self, lane_id: &str) -> Result<u32> {
        self.ensure_running()?;
        Ok(self.lane_state(lane_id)?.queue.len() as u32)
    }

    async fn lane_waiting_time(&mut self, lane_id: &str) -> Result<f64> {
        self.ensure_running()?;
        Ok(self.lane_state(lane_id)?.queue.iter().map(|v| v.waiting).sum())
    }

    async fn colliding_vehicles_number(&mut self) -> Result<u32> {
        self.ensure_running()?;
        Ok(0)
    }

    async fn vehicle_ids(&mut self) -> Result<Vec<String>> {
        self.ensure_running()?;
        Ok(self.vehicle_order.clone())
    }

    async fn vehicle_speed(&mut self, vehicle_id: &str) -> Result<f64> {
        Ok(self.vehicle(vehicle_id)?.speed)
    }

    async fn vehicle_waiting_time(&mut self, vehicle_id: &str) -> Result<f64> {
        Ok(self.vehicle(vehicle_id)?.waiting)
    }

    async fn delta_t(&mut self) -> Result<f64> {
        Ok(self.config.step_length)
    }

    async fn min_expected_number(&mut self) -> Result<u32> {
        self.ensure_running()?;
        let pending: usize = self
            .lanes
            .iter()
            .flatten()
            .map(|l| l.schedule.len() + l.approaching.len() + l.queue.len())
            .sum();
        Ok(pending as u32)
    }
}
