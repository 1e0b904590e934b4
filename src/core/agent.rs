use crate::core::discretize::{state_key, StateBins};
use crate::core::lanes::{group_lanes, unique_lanes, LaneOrder};
use crate::domain::model::Direction;
use crate::domain::ports::TrafficSimulation;
use crate::utils::error::{Result, TrafficError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 聯合代理人在 Q 表檔案中的名稱
pub const JOINT_AGENT: &str = "__joint__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    /// 只控制模擬器回報的第一個號誌
    #[default]
    Single,
    /// 每個號誌一個代理人、一張 Q 表
    Independent,
    /// 一個代理人控制全部號誌，動作為各號誌時相的笛卡兒積
    Joint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateEncoding {
    #[default]
    PerLane,
    /// 目前時相 + 各方向停等車數總和
    Grouped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    #[default]
    HaltReduction,
    WaitReduction,
    MeanHalts,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    pub mode: AgentMode,
    pub state: StateEncoding,
    pub lane_order: LaneOrder,
    pub bins: StateBins,
    pub reward: RewardKind,
    pub phase_change_penalty: f64,
    pub collision_penalty: Option<f64>,
    pub min_green: usize,
    pub green_phases_only: bool,
    pub max_joint_actions: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            mode: AgentMode::Single,
            state: StateEncoding::PerLane,
            lane_order: LaneOrder::Insertion,
            bins: StateBins::default(),
            reward: RewardKind::HaltReduction,
            phase_change_penalty: 0.1,
            collision_penalty: None,
            min_green: 0,
            green_phases_only: false,
            max_joint_actions: 4096,
        }
    }
}

/// 代理人控制的一個號誌
#[derive(Debug, Clone)]
pub struct TlsMember {
    pub tls_id: String,
    pub lanes: Vec<String>,
    pub groups: Vec<(Direction, Vec<String>)>,
    pub n_phases: usize,
    pub current_phase: usize,
}

/// 一次觀測：狀態鍵與計算獎勵需要的原始量
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub key: String,
    pub total_halts: f64,
    pub waits: HashMap<String, f64>,
    pub group_count: usize,
}

#[derive(Debug, Clone)]
pub struct Agent {
    pub name: String,
    pub members: Vec<TlsMember>,
    pub n_actions: usize,
    pub state_key: String,
    pub action: usize,
    pub phase_changed: bool,
    pub last_change: usize,
    pub total_reward: f64,
    prev_total_halts: f64,
    prev_waits: HashMap<String, f64>,
}

impl Agent {
    fn new(name: String, members: Vec<TlsMember>, n_actions: usize) -> Self {
        Self {
            name,
            members,
            n_actions,
            state_key: String::new(),
            action: 0,
            phase_changed: false,
            last_change: 0,
            total_reward: 0.0,
            prev_total_halts: 0.0,
            prev_waits: HashMap::new(),
        }
    }

    pub fn action_sizes(&self) -> Vec<usize> {
        self.members.iter().map(|m| m.n_phases).collect()
    }

    /// 目前實際時相對應的動作索引
    pub fn current_action(&self) -> usize {
        let phases: Vec<usize> = self.members.iter().map(|m| m.current_phase).collect();
        encode_action(&phases, &self.action_sizes())
    }

    pub fn hold_active(&self, step: usize, min_green: usize) -> bool {
        min_green > 0 && step.saturating_sub(self.last_change) < min_green
    }

    pub async fn observe<S: TrafficSimulation + ?Sized>(
        &self,
        sim: &mut S,
        settings: &AgentSettings,
    ) -> Result<Observation> {
        let mut state = Vec::new();
        let mut total_halts = 0.0;
        let mut waits = HashMap::new();
        let mut group_count = 0;

        for member in &self.members {
            let mut halts = HashMap::with_capacity(member.lanes.len());
            for lane in &member.lanes {
                let count = sim.lane_halting_number(lane).await?;
                total_halts += f64::from(count);
                halts.insert(lane.as_str(), count);
                if settings.reward == RewardKind::WaitReduction {
                    waits.insert(lane.clone(), sim.lane_waiting_time(lane).await?);
                }
            }
            group_count += member.groups.len();

            match settings.state {
                StateEncoding::PerLane => {
                    state.extend(member.lanes.iter().map(|l| settings.bins.bin(halts[l.as_str()])));
                }
                StateEncoding::Grouped => {
                    state.push(member.current_phase);
                    state.extend(member.groups.iter().map(|(_, lanes)| {
                        let sum: u32 = lanes.iter().map(|l| halts[l.as_str()]).sum();
                        settings.bins.bin(sum)
                    }));
                }
            }
        }

        Ok(Observation {
            key: state_key(&state),
            total_halts,
            waits,
            group_count,
        })
    }

    /// 回合開始時記錄初始狀態，作為第一次獎勵的基準
    pub fn reset_baseline(&mut self, obs: &Observation) {
        self.state_key = obs.key.clone();
        self.prev_total_halts = obs.total_halts;
        self.prev_waits = obs.waits.clone();
        self.total_reward = 0.0;
        self.last_change = 0;
        self.phase_changed = false;
    }

    pub fn reward(&mut self, obs: &Observation, settings: &AgentSettings) -> f64 {
        let base = match settings.reward {
            RewardKind::HaltReduction => self.prev_total_halts - obs.total_halts,
            RewardKind::WaitReduction => obs
                .waits
                .iter()
                .map(|(lane, cur)| self.prev_waits.get(lane).copied().unwrap_or(0.0) - cur)
                .sum(),
            RewardKind::MeanHalts => -(obs.total_halts / obs.group_count.max(1) as f64),
        };
        self.prev_total_halts = obs.total_halts;
        self.prev_waits = obs.waits.clone();

        if self.phase_changed {
            base - settings.phase_change_penalty
        } else {
            base
        }
    }

    /// 套用動作；`green_phases_only` 時奇數時相（黃/紅轉換）不送給模擬器
    pub async fn apply<S: TrafficSimulation + ?Sized>(
        &mut self,
        sim: &mut S,
        action: usize,
        step: usize,
        hold: bool,
        settings: &AgentSettings,
    ) -> Result<()> {
        let phases = decode_action(action, &self.action_sizes());
        self.phase_changed = self
            .members
            .iter()
            .zip(&phases)
            .any(|(m, &p)| m.current_phase != p);

        for (member, &phase) in self.members.iter().zip(&phases) {
            if settings.green_phases_only && phase % 2 == 1 {
                tracing::debug!(
                    "Skipping transition phase {} for {}",
                    phase,
                    member.tls_id
                );
                continue;
            }
            sim.set_phase(&member.tls_id, phase).await?;
        }

        if self.phase_changed && !hold {
            self.last_change = step;
        }
        self.action = action;
        Ok(())
    }

    /// 決策間隔結束後讀回實際時相
    pub async fn refresh_phases<S: TrafficSimulation + ?Sized>(&mut self, sim: &mut S) -> Result<()> {
        for member in &mut self.members {
            member.current_phase = sim.phase(&member.tls_id).await?;
        }
        Ok(())
    }
}

/// 混合進位編碼，最後一個號誌變化最快（與 itertools.product 相同順序）
pub fn encode_action(phases: &[usize], sizes: &[usize]) -> usize {
    phases
        .iter()
        .zip(sizes)
        .fold(0, |acc, (&p, &n)| acc * n + p.min(n.saturating_sub(1)))
}

pub fn decode_action(mut action: usize, sizes: &[usize]) -> Vec<usize> {
    let mut phases = vec![0; sizes.len()];
    for (slot, &n) in phases.iter_mut().zip(sizes).rev() {
        if n == 0 {
            continue;
        }
        *slot = action % n;
        action /= n;
    }
    phases
}

async fn build_member<S: TrafficSimulation + ?Sized>(
    sim: &mut S,
    tls_id: &str,
    settings: &AgentSettings,
) -> Result<TlsMember> {
    let controlled = sim.controlled_lanes(tls_id).await?;
    let lanes = unique_lanes(&controlled, settings.lane_order);
    let groups = group_lanes(&lanes);
    let program = sim.program(tls_id).await?;
    if program.phase_count() == 0 {
        return Err(TrafficError::simulation(format!(
            "Traffic light '{}' has no phases",
            tls_id
        )));
    }
    let current_phase = sim.phase(tls_id).await?;

    tracing::info!(
        "🚦 {}: {} controlled lanes, {} phases",
        tls_id,
        lanes.len(),
        program.phase_count()
    );

    Ok(TlsMember {
        tls_id: tls_id.to_string(),
        lanes,
        groups,
        n_phases: program.phase_count(),
        current_phase,
    })
}

pub async fn build_agents<S: TrafficSimulation + ?Sized>(
    sim: &mut S,
    tls_ids: &[String],
    settings: &AgentSettings,
) -> Result<Vec<Agent>> {
    let first = tls_ids.first().ok_or(TrafficError::NoTrafficLights)?;

    match settings.mode {
        AgentMode::Single => {
            let member = build_member(sim, first, settings).await?;
            let n = member.n_phases;
            Ok(vec![Agent::new(first.clone(), vec![member], n)])
        }
        AgentMode::Independent => {
            let mut agents = Vec::with_capacity(tls_ids.len());
            for tls_id in tls_ids {
                let member = build_member(sim, tls_id, settings).await?;
                let n = member.n_phases;
                agents.push(Agent::new(tls_id.clone(), vec![member], n));
            }
            Ok(agents)
        }
        AgentMode::Joint => {
            let mut members = Vec::with_capacity(tls_ids.len());
            for tls_id in tls_ids {
                members.push(build_member(sim, tls_id, settings).await?);
            }
            let n_actions = members
                .iter()
                .try_fold(1usize, |acc, m| acc.checked_mul(m.n_phases))
                .filter(|&n| n <= settings.max_joint_actions)
                .ok_or_else(|| TrafficError::ConfigError {
                    message: format!(
                        "Joint action space over {} traffic lights exceeds agent.max_joint_actions ({})",
                        members.len(),
                        settings.max_joint_actions
                    ),
                })?;
            tracing::info!("🔗 Joint agent with {} actions", n_actions);
            Ok(vec![Agent::new(JOINT_AGENT.to_string(), members, n_actions)])
        }
    }
}
