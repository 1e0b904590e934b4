use crate::core::agent::{build_agents, Agent, AgentSettings};
use crate::core::metrics::WaitingTimeTracker;
use crate::core::qtable::{EpsilonSchedule, QTableSet};
use crate::domain::model::EpisodeSummary;
use crate::domain::ports::{Storage, TrafficSimulation};
use crate::utils::error::{Result, TrafficError};
use crate::utils::monitor::SystemMonitor;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

#[derive(Debug, Clone)]
pub struct TrainingSettings {
    pub episodes: usize,
    pub max_steps: usize,
    pub decision_interval: usize,
    pub warmup_steps: usize,
    pub alpha: f64,
    pub gamma: f64,
    pub epsilon: EpsilonSchedule,
    pub seed: u64,
    pub q_table_file: String,
    pub save_interval: usize,
    pub checkpoint_interval: Option<usize>,
    pub training_log: Option<String>,
    /// 每隔多少次決策輸出一次 debug 進度
    pub progress_interval: usize,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            episodes: 200,
            max_steps: 3600,
            decision_interval: 5,
            warmup_steps: 1,
            alpha: 0.7,
            gamma: 0.9,
            epsilon: EpsilonSchedule::default(),
            seed: 0,
            q_table_file: "q_table.json".to_string(),
            save_interval: 1,
            checkpoint_interval: None,
            training_log: Some("training_log.csv".to_string()),
            progress_interval: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub episodes: Vec<EpisodeSummary>,
    pub q_table_file: String,
    pub state_count: usize,
}

impl TrainingReport {
    pub fn final_epsilon(&self) -> Option<f64> {
        self.episodes.last().map(|e| e.epsilon)
    }
}

pub struct Trainer<S: TrafficSimulation, St: Storage> {
    sim: S,
    storage: St,
    agent_settings: AgentSettings,
    settings: TrainingSettings,
    tables: QTableSet,
    rng: ChaCha8Rng,
    monitor: SystemMonitor,
    fresh: bool,
}

impl<S: TrafficSimulation, St: Storage> Trainer<S, St> {
    pub fn new(sim: S, storage: St, agent_settings: AgentSettings, settings: TrainingSettings) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(settings.seed);
        Self {
            sim,
            storage,
            agent_settings,
            settings,
            tables: QTableSet::new(),
            rng,
            monitor: SystemMonitor::new(false),
            fresh: false,
        }
    }

    pub fn new_with_monitoring(
        sim: S,
        storage: St,
        agent_settings: AgentSettings,
        settings: TrainingSettings,
        monitor_enabled: bool,
    ) -> Self {
        let mut trainer = Self::new(sim, storage, agent_settings, settings);
        trainer.monitor = SystemMonitor::new(monitor_enabled);
        trainer
    }

    /// 忽略已存在的 Q 表，從零開始
    pub fn fresh_start(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    pub fn tables(&self) -> &QTableSet {
        &self.tables
    }

    pub fn into_parts(self) -> (S, St, QTableSet) {
        (self.sim, self.storage, self.tables)
    }

    pub async fn run(&mut self) -> Result<TrainingReport> {
        tracing::info!(
            "🧠 Starting Q-learning: {} episodes, {} steps each, decision every {} steps",
            self.settings.episodes,
            self.settings.max_steps,
            self.settings.decision_interval
        );
        self.monitor.log_stats("Training start");

        self.tables = if self.fresh {
            QTableSet::new()
        } else {
            QTableSet::load_or_new(&self.storage, &self.settings.q_table_file).await?
        };

        let mut epsilon = self.settings.epsilon.start;
        let mut summaries = Vec::with_capacity(self.settings.episodes);

        for episode in 1..=self.settings.episodes {
            let summary = self.run_episode(episode, epsilon).await?;
            epsilon = self.settings.epsilon.next(epsilon);
            self.tables.episodes += 1;

            tracing::info!(
                "Episode {}/{} | Total Reward: {:.2} | Avg wait: {:.2}s | Epsilon: {:.4}{}",
                episode,
                self.settings.episodes,
                summary.total_reward,
                summary.avg_wait,
                epsilon,
                if summary.collided { " | collision" } else { "" }
            );
            self.monitor.log_stats(&format!("Episode {}", episode));

            if self.settings.save_interval > 0 && episode % self.settings.save_interval == 0 {
                self.tables
                    .save(&self.storage, &self.settings.q_table_file)
                    .await?;
            }
            if let Some(interval) = self.settings.checkpoint_interval {
                if interval > 0 && episode % interval == 0 {
                    let path = checkpoint_name(&self.settings.q_table_file, episode);
                    self.tables.save(&self.storage, &path).await?;
                    tracing::info!("💾 Checkpoint saved: {}", path);
                }
            }

            summaries.push(summary);
        }

        self.tables
            .save(&self.storage, &self.settings.q_table_file)
            .await?;
        tracing::info!(
            "✅ Training finished. Final Q-tables saved to {} ({} states)",
            self.settings.q_table_file,
            self.tables.state_count()
        );

        if let Some(log_path) = &self.settings.training_log {
            write_training_log(&self.storage, log_path, &summaries).await?;
            tracing::info!("📝 Training log written to {}", log_path);
        }
        self.monitor.log_final_stats();

        Ok(TrainingReport {
            episodes: summaries,
            q_table_file: self.settings.q_table_file.clone(),
            state_count: self.tables.state_count(),
        })
    }

    async fn run_episode(&mut self, episode: usize, epsilon: f64) -> Result<EpisodeSummary> {
        self.sim.start().await?;
        let result = self.episode_inner(episode, epsilon).await;
        let closed = self.sim.close().await;
        let summary = result?;
        closed?;
        Ok(summary)
    }

    async fn prepare_agents(&mut self) -> Result<Vec<Agent>> {
        let tls_ids = self.sim.traffic_light_ids().await?;
        if tls_ids.is_empty() {
            return Err(TrafficError::NoTrafficLights);
        }
        for _ in 0..self.settings.warmup_steps {
            self.sim.simulation_step().await?;
        }

        let mut agents = build_agents(&mut self.sim, &tls_ids, &self.agent_settings).await?;
        for agent in &mut agents {
            let table = self.tables.table_mut(&agent.name);
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
            table.ensure_row(&agent.state_key, agent.n_actions);
        }
        Ok(agents)
    }

    async fn episode_inner(&mut self, episode: usize, epsilon: f64) -> Result<EpisodeSummary> {
        let mut agents = self.prepare_agents().await?;
        let mut waits = WaitingTimeTracker::new();
        let (alpha, gamma) = (self.settings.alpha, self.settings.gamma);
        let mut steps = 0;
        let mut decisions = 0;
        let mut collided = false;

        'episode: while steps < self.settings.max_steps {
            for agent in &mut agents {
                let hold = agent.hold_active(steps, self.agent_settings.min_green);
                let action = if hold {
                    agent.current_action()
                } else {
                    self.tables.table_mut(&agent.name).choose_action(
                        &agent.state_key,
                        agent.n_actions,
                        epsilon,
                        &mut self.rng,
                    )
                };
                agent
                    .apply(&mut self.sim, action, steps, hold, &self.agent_settings)
                    .await?;
            }

            for _ in 0..self.settings.decision_interval {
                self.sim.simulation_step().await?;
                steps += 1;
                waits.observe_step(&mut self.sim).await?;

                if let Some(penalty) = self.agent_settings.collision_penalty {
                    let collisions = self.sim.colliding_vehicles_number().await?;
                    if collisions > 0 {
                        tracing::warn!(
                            "💥 {} colliding vehicles at step {}, ending episode {}",
                            collisions,
                            steps,
                            episode
                        );
                        for agent in &mut agents {
                            self.tables.table_mut(&agent.name).terminal_update(
                                &agent.state_key,
                                agent.action,
                                -penalty,
                                alpha,
                            )?;
                            agent.total_reward -= penalty;
                        }
                        collided = true;
                        break 'episode;
                    }
                }

                if steps >= self.settings.max_steps {
                    break;
                }
            }

            for agent in &mut agents {
                agent.refresh_phases(&mut self.sim).await?;
                let obs = agent.observe(&mut self.sim, &self.agent_settings).await?;
                let reward = agent.reward(&obs, &self.agent_settings);

                let table = self.tables.table_mut(&agent.name);
                table.ensure_row(&obs.key, agent.n_actions);
                table.update(&agent.state_key, agent.action, reward, &obs.key, alpha, gamma)?;

                agent.state_key = obs.key;
                agent.total_reward += reward;
            }

            decisions += 1;
            if self.settings.progress_interval > 0 && decisions % self.settings.progress_interval == 0 {
                let so_far: f64 = agents.iter().map(|a| a.total_reward).sum();
                tracing::debug!(
                    "episode {} step {}/{} reward_so_far {:.2} eps {:.3}",
                    episode,
                    steps,
                    self.settings.max_steps,
                    so_far,
                    epsilon
                );
            }
        }

        Ok(EpisodeSummary {
            episode,
            total_reward: agents.iter().map(|a| a.total_reward).sum(),
            epsilon,
            steps,
            avg_wait: waits.average(),
            vehicles: waits.vehicle_count(),
            collided,
        })
    }
}

/// `q_table.json` -> `q_table_ep12.json`
pub fn checkpoint_name(q_table_file: &str, episode: usize) -> String {
    match q_table_file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => {
            format!("{}_ep{}.{}", stem, episode, ext)
        }
        _ => format!("{}_ep{}", q_table_file, episode),
    }
}

pub async fn write_training_log<St: Storage>(
    storage: &St,
    path: &str,
    summaries: &[EpisodeSummary],
) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    for summary in summaries {
        wtr.serialize(summary)?;
    }
    let data = wtr.into_inner().map_err(|e| TrafficError::ProcessingError {
        message: format!("Failed to finish training log: {}", e),
    })?;
    storage.write_file(path, &data).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_name() {
        assert_eq!(checkpoint_name("q_table.json", 12), "q_table_ep12.json");
        assert_eq!(checkpoint_name("tables/multi.json", 3), "tables/multi_ep3.json");
        assert_eq!(checkpoint_name("q_table", 1), "q_table_ep1");
        assert_eq!(checkpoint_name("./out/q", 2), "./out/q_ep2");
    }
}
