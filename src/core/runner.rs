use crate::core::agent::{build_agents, AgentSettings};
use crate::core::metrics::{StopAccounting, StopTimeTracker, WaitingTimeTracker};
use crate::core::qtable::QTableSet;
use crate::domain::model::RunReport;
use crate::domain::ports::TrafficSimulation;
use crate::utils::error::{Result, TrafficError};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_steps: usize,
    pub decision_interval: usize,
    pub warmup_steps: usize,
    /// 每步之間的延遲，搭配 sumo-gui 觀察用
    pub step_delay_ms: u64,
    pub stop_speed_threshold: f64,
    pub stop_accounting: StopAccounting,
    pub seed: u64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_steps: 3600,
            decision_interval: 5,
            warmup_steps: 1,
            step_delay_ms: 0,
            stop_speed_threshold: 0.5,
            stop_accounting: StopAccounting::Cumulative,
            seed: 0,
        }
    }
}

/// 推進一步並更新統計
struct StepObserver {
    waits: WaitingTimeTracker,
    stops: StopTimeTracker,
    delta_t: f64,
    delay: Option<Duration>,
}

impl StepObserver {
    async fn new<S: TrafficSimulation + ?Sized>(sim: &mut S, settings: &RunSettings) -> Result<Self> {
        Ok(Self {
            waits: WaitingTimeTracker::new(),
            stops: StopTimeTracker::new(settings.stop_speed_threshold, settings.stop_accounting),
            delta_t: sim.delta_t().await?,
            delay: (settings.step_delay_ms > 0)
                .then(|| Duration::from_millis(settings.step_delay_ms)),
        })
    }

    async fn step<S: TrafficSimulation + ?Sized>(&mut self, sim: &mut S) -> Result<()> {
        sim.simulation_step().await?;
        self.waits.observe_step(sim).await?;
        self.stops.observe_step(sim, self.delta_t).await?;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn report(&self, controller: &str, steps: usize) -> RunReport {
        RunReport {
            controller: controller.to_string(),
            steps,
            vehicles: self.waits.vehicle_count(),
            average_wait: self.waits.average(),
            total_stopped_time: self.stops.total(),
        }
    }
}

/// 以訓練好的 Q 表貪婪控制號誌
pub struct Evaluator<S: TrafficSimulation> {
    sim: S,
    tables: QTableSet,
    agent_settings: AgentSettings,
    settings: RunSettings,
    rng: ChaCha8Rng,
}

impl<S: TrafficSimulation> Evaluator<S> {
    pub fn new(sim: S, tables: QTableSet, agent_settings: AgentSettings, settings: RunSettings) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(settings.seed);
        Self {
            sim,
            tables,
            agent_settings,
            settings,
            rng,
        }
    }

    pub fn into_simulation(self) -> S {
        self.sim
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
        for _ in 0..self.settings.warmup_steps {
            self.sim.simulation_step().await?;
        }

        let mut agents = build_agents(&mut self.sim, &tls_ids, &self.agent_settings).await?;
        for agent in &mut agents {
            let table = self.tables.table(&agent.name).ok_or_else(|| TrafficError::QTableMismatch {
                table: agent.name.clone(),
                message: "no Q-table was trained for this agent".to_string(),
            })?;
            if let Some(n) = table.action_count() {
                if n != agent.n_actions {
                    return Err(TrafficError::QTableMismatch {
                        table: agent.name.clone(),
                        message: format!("table has {} actions, network has {}", n, agent.n_actions),
                    });
                }
            }
            let obs = agent.observe(&mut self.sim, &self.agent_settings).await?;
            agent.reset_baseline(&obs);
        }

        let mut observer = StepObserver::new(&mut self.sim, &self.settings).await?;
        let mut steps = 0;
        let mut unknown_states = 0usize;

        while steps < self.settings.max_steps {
            for agent in &mut agents {
                let table = self.tables.table_mut(&agent.name);
                if table.row(&agent.state_key).is_none() {
                    unknown_states += 1;
                }
                let hold = agent.hold_active(steps, self.agent_settings.min_green);
                let action = if hold {
                    agent.current_action()
                } else {
                    table.greedy_action(&agent.state_key, agent.n_actions, &mut self.rng)
                };
                agent
                    .apply(&mut self.sim, action, steps, hold, &self.agent_settings)
                    .await?;
            }

            for _ in 0..self.settings.decision_interval {
                observer.step(&mut self.sim).await?;
                steps += 1;
                if steps >= self.settings.max_steps {
                    break;
                }
            }

            for agent in &mut agents {
                agent.refresh_phases(&mut self.sim).await?;
                let obs = agent.observe(&mut self.sim, &self.agent_settings).await?;
                agent.state_key = obs.key;
            }
        }

        if unknown_states > 0 {
            tracing::warn!(
                "⚠️ {} decisions hit states missing from the Q-table (random action used)",
                unknown_states
            );
        }
        tracing::info!("🏁 Greedy control finished after {} steps", steps);
        Ok(observer.report("q-learning", steps))
    }
}

/// 不介入號誌，跑網路內建的固定時制
pub struct Baseline<S: TrafficSimulation> {
    sim: S,
    settings: RunSettings,
}

impl<S: TrafficSimulation> Baseline<S> {
    pub fn new(sim: S, settings: RunSettings) -> Self {
        Self { sim, settings }
    }

    pub fn into_simulation(self) -> S {
        self.sim
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
        let mut observer = StepObserver::new(&mut self.sim, &self.settings).await?;
        let mut steps = 0;
        while steps < self.settings.max_steps {
            observer.step(&mut self.sim).await?;
            steps += 1;
        }
        tracing::info!("🏁 Fixed-time baseline finished after {} steps", steps);
        Ok(observer.report("fixed-time", steps))
    }
}

/// 跑到所有車輛離開（或達到上限），回傳每輛車的停車時間
pub async fn collect_stop_times<S: TrafficSimulation + ?Sized>(
    sim: &mut S,
    settings: &RunSettings,
) -> Result<Vec<(String, f64)>> {
    sim.start().await?;
    let result = async {
        let delta_t = sim.delta_t().await?;
        let mut stops = StopTimeTracker::new(settings.stop_speed_threshold, settings.stop_accounting);
        let mut steps = 0;
        while sim.min_expected_number().await? > 0 {
            if steps >= settings.max_steps {
                tracing::warn!(
                    "⚠️ Reached {} steps with vehicles still expected, stopping early",
                    settings.max_steps
                );
                break;
            }
            sim.simulation_step().await?;
            stops.observe_step(sim, delta_t).await?;
            steps += 1;
        }
        tracing::info!(
            "🚗 Recorded stop times for {} vehicles over {} steps",
            stops.len(),
            steps
        );
        Ok::<_, TrafficError>(stops.stop_times())
    }
    .await;
    let closed = sim.close().await;
    let times = result?;
    closed?;
    Ok(times)
}
