use crate::core::lanes::{group_lanes, link_index, unique_lanes, LaneOrder};
use crate::core::metrics::{StopAccounting, StopTimeTracker, WaitingTimeTracker};
use crate::domain::model::RunReport;
use crate::domain::ports::TrafficSimulation;
use crate::utils::error::{Result, TrafficError};

/// 三角形隸屬函數 `trimf(a, b, c)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangle {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl Triangle {
    pub const fn new(a: f64, b: f64, c: f64) -> Self {
        Self { a, b, c }
    }

    pub fn membership(&self, x: f64) -> f64 {
        if x < self.a || x > self.c {
            return 0.0;
        }
        if x == self.b {
            return 1.0;
        }
        if x < self.b {
            if self.b == self.a {
                1.0
            } else {
                (x - self.a) / (self.b - self.a)
            }
        } else if self.c == self.b {
            1.0
        } else {
            (self.c - x) / (self.c - self.b)
        }
    }
}

const QUEUE_LOW: Triangle = Triangle::new(0.0, 0.0, 3.0);
const QUEUE_MEDIUM: Triangle = Triangle::new(1.0, 5.0, 9.0);
const QUEUE_HIGH: Triangle = Triangle::new(7.0, 10.0, 10.0);
const NO_CHANGE: Triangle = Triangle::new(0.0, 0.0, 5.0);
const CHANGE: Triangle = Triangle::new(5.0, 10.0, 10.0);

/// 輸出大於此值就切換時相
pub const CHANGE_THRESHOLD: f64 = 5.0;
const UNIVERSE_MAX: u32 = 10;

/// Mamdani 推論：min 蘊含、max 聚合、重心法解模糊
///
/// 重心在取樣點 0..=10 之間以線性內插積分，所以完全不變更時輸出 5/3
#[derive(Debug, Clone, Default)]
pub struct FuzzyController;

impl FuzzyController {
    pub fn new() -> Self {
        Self
    }

    pub fn compute(&self, queue_length: f64) -> Result<f64> {
        let x = queue_length.clamp(0.0, f64::from(UNIVERSE_MAX));
        let no_change = QUEUE_LOW.membership(x);
        let change = QUEUE_MEDIUM.membership(x).max(QUEUE_HIGH.membership(x));

        let aggregated = |y: f64| {
            NO_CHANGE
                .membership(y)
                .min(no_change)
                .max(CHANGE.membership(y).min(change))
        };

        // 每段 [x0, x1] 上 mu 為線性
        let (mut num, mut den) = (0.0, 0.0);
        for i in 0..UNIVERSE_MAX {
            let (x0, x1) = (f64::from(i), f64::from(i + 1));
            let (m0, m1) = (aggregated(x0), aggregated(x1));
            den += (x1 - x0) * (m0 + m1) / 2.0;
            num += (x1 - x0) * (m0 * (2.0 * x0 + x1) + m1 * (x0 + 2.0 * x1)) / 6.0;
        }

        if den == 0.0 {
            return Err(TrafficError::ProcessingError {
                message: format!("Fuzzy output is empty for queue length {}", queue_length),
            });
        }
        Ok(num / den)
    }

    pub fn should_change(&self, queue_length: f64) -> Result<bool> {
        Ok(self.compute(queue_length)? > CHANGE_THRESHOLD)
    }
}

#[derive(Debug, Clone)]
struct FuzzyIntersection {
    tls_id: String,
    ns_lanes: Vec<String>,
    ew_lanes: Vec<String>,
    ns_phase: usize,
    ew_phase: usize,
    phase: usize,
    last_change: usize,
}

#[derive(Debug, Clone)]
pub struct FuzzySettings {
    pub max_steps: usize,
    pub decision_interval: usize,
    pub min_green: usize,
    pub stop_speed_threshold: f64,
    pub stop_accounting: StopAccounting,
}

impl Default for FuzzySettings {
    fn default() -> Self {
        Self {
            max_steps: 3600,
            decision_interval: 5,
            min_green: 10,
            stop_speed_threshold: 0.5,
            stop_accounting: StopAccounting::Cumulative,
        }
    }
}

pub struct FuzzyRunner<S: TrafficSimulation> {
    sim: S,
    settings: FuzzySettings,
    controller: FuzzyController,
}

impl<S: TrafficSimulation> FuzzyRunner<S> {
    pub fn new(sim: S, settings: FuzzySettings) -> Self {
        Self {
            sim,
            settings,
            controller: FuzzyController::new(),
        }
    }

    pub fn into_simulation(self) -> S {
        self.sim
    }

    async fn setup(&mut self, tls_id: &str) -> Result<Option<FuzzyIntersection>> {
        let controlled = self.sim.controlled_lanes(tls_id).await?;
        let lanes = unique_lanes(&controlled, LaneOrder::Insertion);
        let groups = group_lanes(&lanes);
        let (ns_lanes, ew_lanes): (Vec<_>, Vec<_>) =
            groups.into_iter().partition(|(dir, _)| dir.is_north_south());
        let ns_lanes: Vec<String> = ns_lanes.into_iter().flat_map(|(_, l)| l).collect();
        let ew_lanes: Vec<String> = ew_lanes.into_iter().flat_map(|(_, l)| l).collect();

        let program = self.sim.program(tls_id).await?;
        let (mut ns_phase, mut ew_phase) = (None, None);
        for (i, phase) in program.phases.iter().enumerate() {
            let green = |lane: &String| {
                link_index(&controlled, lane)
                    .map(|idx| phase.is_green_for(idx))
                    .unwrap_or(false)
            };
            if ns_lanes.iter().any(green) {
                ns_phase = Some(i);
            } else if ew_lanes.iter().any(green) {
                ew_phase = Some(i);
            }
        }

        match (ns_phase, ew_phase) {
            (Some(ns_phase), Some(ew_phase)) => {
                tracing::info!(
                    "🚦 {}: NS phase {}, EW phase {}",
                    tls_id,
                    ns_phase,
                    ew_phase
                );
                Ok(Some(FuzzyIntersection {
                    tls_id: tls_id.to_string(),
                    ns_lanes,
                    ew_lanes,
                    ns_phase,
                    ew_phase,
                    phase: self.sim.phase(tls_id).await?,
                    last_change: 0,
                }))
            }
            _ => {
                tracing::warn!(
                    "⚠️ {} has no separate NS/EW green phases, leaving it on its program",
                    tls_id
                );
                Ok(None)
            }
        }
    }

    async fn queue(&mut self, lanes: &[String]) -> Result<u32> {
        let mut total = 0;
        for lane in lanes {
            total += self.sim.lane_halting_number(lane).await?;
        }
        Ok(total)
    }

    pub async fn run(&mut self) -> Result<RunReport> {
        self.sim.start().await?;
        let result = self.run_inner().await;
        let closed = self.sim.close().await;
        let report = result?;
        closed?;
        Ok(report)
    }

    async fn run_inner(&mut self) -> Result<RunReport> {
        let tls_ids = self.sim.traffic_light_ids().await?;
        if tls_ids.is_empty() {
            return Err(TrafficError::NoTrafficLights);
        }

        let mut intersections = Vec::new();
        for tls_id in &tls_ids {
            if let Some(intersection) = self.setup(tls_id).await? {
                intersections.push(intersection);
            }
        }

        let delta_t = self.sim.delta_t().await?;
        let mut waits = WaitingTimeTracker::new();
        let mut stops = StopTimeTracker::new(
            self.settings.stop_speed_threshold,
            self.settings.stop_accounting,
        );
        let mut steps = 0;

        while steps < self.settings.max_steps {
            for idx in 0..intersections.len() {
                let mut its = intersections[idx].clone();
                let action = if steps.saturating_sub(its.last_change) < self.settings.min_green {
                    its.phase
                } else {
                    let queue_ns = self.queue(&its.ns_lanes).await?;
                    let queue_ew = self.queue(&its.ew_lanes).await?;
                    let (input, next) = if its.phase == its.ns_phase {
                        (queue_ew, its.ew_phase)
                    } else {
                        (queue_ns, its.ns_phase)
                    };
                    if self.controller.should_change(f64::from(input))? {
                        if next != its.phase {
                            its.last_change = steps;
                        }
                        next
                    } else {
                        its.phase
                    }
                };
                self.sim.set_phase(&its.tls_id, action).await?;
                its.phase = self.sim.phase(&its.tls_id).await?;
                intersections[idx] = its;
            }

            for _ in 0..self.settings.decision_interval {
                self.sim.simulation_step().await?;
                steps += 1;
                waits.observe_step(&mut self.sim).await?;
                stops.observe_step(&mut self.sim, delta_t).await?;
                if steps >= self.settings.max_steps {
                    break;
                }
            }
        }

        tracing::info!("🏁 Fuzzy control finished after {} steps", steps);
        Ok(RunReport {
            controller: "fuzzy".to_string(),
            steps,
            vehicles: waits.vehicle_count(),
            average_wait: waits.average(),
            total_stopped_time: stops.total(),
        })
    }
}
