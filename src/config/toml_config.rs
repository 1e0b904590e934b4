use crate::adapters::queue_sim::QueueSimConfig;
use crate::adapters::traci::SumoConfig;
use crate::core::agent::{AgentMode, AgentSettings, RewardKind, StateEncoding};
use crate::core::discretize::StateBins;
use crate::core::emissions::VehicleMix;
use crate::core::fuzzy::FuzzySettings;
use crate::core::lanes::LaneOrder;
use crate::core::metrics::StopAccounting;
use crate::core::qtable::EpsilonSchedule;
use crate::core::runner::RunSettings;
use crate::core::trainer::TrainingSettings;
use crate::utils::error::{Result, TrafficError};
use crate::utils::validation::{
    validate_ascending, validate_path, validate_positive_number, validate_range, Validate,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum Backend {
    Sumo,
    /// 內建排隊模擬器
    #[default]
    Builtin,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Sumo => write!(f, "sumo"),
            Backend::Builtin => write!(f, "builtin"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    pub simulation: SimulationSection,
    pub learning: LearningSection,
    pub agent: AgentSection,
    pub output: OutputSection,
    pub fuzzy: FuzzySection,
    pub analysis: AnalysisSection,
    pub monitoring: MonitoringSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSection {
    pub backend: Backend,
    pub max_steps: usize,
    pub decision_interval: usize,
    pub warmup_steps: usize,
    pub step_delay_ms: u64,
    pub seed: u64,
    pub sumo: SumoConfig,
    pub builtin: QueueSimConfig,
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            backend: Backend::Builtin,
            max_steps: 3600,
            decision_interval: 5,
            warmup_steps: 1,
            step_delay_ms: 0,
            seed: 0,
            sumo: SumoConfig::default(),
            builtin: QueueSimConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningSection {
    pub episodes: usize,
    pub alpha: f64,
    pub gamma: f64,
    pub epsilon_start: f64,
    pub epsilon_end: f64,
    pub epsilon_decay: f64,
    pub save_interval: usize,
    pub checkpoint_interval: Option<usize>,
    pub progress_interval: usize,
}

impl Default for LearningSection {
    fn default() -> Self {
        let eps = EpsilonSchedule::default();
        Self {
            episodes: 200,
            alpha: 0.7,
            gamma: 0.9,
            epsilon_start: eps.start,
            epsilon_end: eps.end,
            epsilon_decay: eps.decay,
            save_interval: 1,
            checkpoint_interval: None,
            progress_interval: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub mode: AgentMode,
    pub state: StateEncoding,
    pub lane_order: LaneOrder,
    pub bins: Vec<u32>,
    pub reward: RewardKind,
    pub phase_change_penalty: f64,
    pub collision_penalty: Option<f64>,
    pub min_green: usize,
    pub green_phases_only: bool,
    pub max_joint_actions: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        let settings = AgentSettings::default();
        Self {
            mode: settings.mode,
            state: settings.state,
            lane_order: settings.lane_order,
            bins: settings.bins.thresholds().to_vec(),
            reward: settings.reward,
            phase_change_penalty: settings.phase_change_penalty,
            collision_penalty: settings.collision_penalty,
            min_green: settings.min_green,
            green_phases_only: settings.green_phases_only,
            max_joint_actions: settings.max_joint_actions,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    pub dir: String,
    pub q_table_file: String,
    pub training_log: Option<String>,
    pub stop_times_file: String,
    pub emissions_json: Option<String>,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            dir: "./output".to_string(),
            q_table_file: "q_table.json".to_string(),
            training_log: Some("training_log.csv".to_string()),
            stop_times_file: "vehicle_stop_times.csv".to_string(),
            emissions_json: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzySection {
    pub decision_interval: usize,
    pub min_green: usize,
}

impl Default for FuzzySection {
    fn default() -> Self {
        let settings = FuzzySettings::default();
        Self {
            decision_interval: settings.decision_interval,
            min_green: settings.min_green,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSection {
    pub stop_speed_threshold: f64,
    pub stop_accounting: StopAccounting,
    pub vehicle_mix: VehicleMix,
    /// 車種分配與排放抽樣用
    pub seed: u64,
}

impl Default for AnalysisSection {
    fn default() -> Self {
        Self {
            stop_speed_threshold: 0.5,
            stop_accounting: StopAccounting::Cumulative,
            vehicle_mix: VehicleMix::default(),
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSection {
    pub enabled: bool,
}

impl TrafficConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| TrafficError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${SUMO_HOME})，未設定的保留原樣
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| TrafficError::ConfigError {
            message: format!("invalid substitution pattern: {}", e),
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            mode: self.agent.mode,
            state: self.agent.state,
            lane_order: self.agent.lane_order,
            bins: StateBins::new(self.agent.bins.clone()),
            reward: self.agent.reward,
            phase_change_penalty: self.agent.phase_change_penalty,
            collision_penalty: self.agent.collision_penalty,
            min_green: self.agent.min_green,
            green_phases_only: self.agent.green_phases_only,
            max_joint_actions: self.agent.max_joint_actions,
        }
    }

    pub fn training_settings(&self) -> TrainingSettings {
        TrainingSettings {
            episodes: self.learning.episodes,
            max_steps: self.simulation.max_steps,
            decision_interval: self.simulation.decision_interval,
            warmup_steps: self.simulation.warmup_steps,
            alpha: self.learning.alpha,
            gamma: self.learning.gamma,
            epsilon: EpsilonSchedule {
                start: self.learning.epsilon_start,
                end: self.learning.epsilon_end,
                decay: self.learning.epsilon_decay,
            },
            seed: self.simulation.seed,
            q_table_file: self.output.q_table_file.clone(),
            save_interval: self.learning.save_interval,
            checkpoint_interval: self.learning.checkpoint_interval,
            training_log: self.output.training_log.clone(),
            progress_interval: self.learning.progress_interval,
        }
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            max_steps: self.simulation.max_steps,
            decision_interval: self.simulation.decision_interval,
            warmup_steps: self.simulation.warmup_steps,
            step_delay_ms: self.simulation.step_delay_ms,
            stop_speed_threshold: self.analysis.stop_speed_threshold,
            stop_accounting: self.analysis.stop_accounting,
            seed: self.simulation.seed,
        }
    }

    pub fn fuzzy_settings(&self) -> FuzzySettings {
        FuzzySettings {
            max_steps: self.simulation.max_steps,
            decision_interval: self.fuzzy.decision_interval,
            min_green: self.fuzzy.min_green,
            stop_speed_threshold: self.analysis.stop_speed_threshold,
            stop_accounting: self.analysis.stop_accounting,
        }
    }

    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring.enabled
    }

    /// 執行前顯示的設定摘要
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("backend            : {}", self.simulation.backend),
            format!(
                "steps              : {} (decision every {}, warmup {})",
                self.simulation.max_steps, self.simulation.decision_interval, self.simulation.warmup_steps
            ),
            format!(
                "learning           : {} episodes, alpha {}, gamma {}",
                self.learning.episodes, self.learning.alpha, self.learning.gamma
            ),
            format!(
                "epsilon            : {} -> {} (x{} per episode)",
                self.learning.epsilon_start, self.learning.epsilon_end, self.learning.epsilon_decay
            ),
            format!(
                "agent              : {:?}, {:?} state, {:?} reward, bins {:?}",
                self.agent.mode, self.agent.state, self.agent.reward, self.agent.bins
            ),
            format!("output             : {}/{}", self.output.dir, self.output.q_table_file),
        ];
        match self.simulation.backend {
            Backend::Sumo => lines.push(format!(
                "sumo               : {} -n {} -r {}",
                self.simulation.sumo.binary, self.simulation.sumo.net_file, self.simulation.sumo.route_file
            )),
            Backend::Builtin => lines.push(format!(
                "builtin            : {} intersection(s), seed {}",
                self.simulation.builtin.intersections.len(),
                self.simulation.builtin.seed
            )),
        }
        lines.join("\n")
    }

    /// 驗證配置的合理性
    pub fn validate_config(&self) -> Result<()> {
        validate_positive_number("simulation.max_steps", self.simulation.max_steps, 1)?;
        validate_positive_number("simulation.decision_interval", self.simulation.decision_interval, 1)?;
        match self.simulation.backend {
            Backend::Sumo => self.simulation.sumo.validate()?,
            Backend::Builtin => self.simulation.builtin.validate()?,
        }

        validate_positive_number("learning.episodes", self.learning.episodes, 1)?;
        validate_range("learning.alpha", self.learning.alpha, f64::MIN_POSITIVE, 1.0)?;
        validate_range("learning.gamma", self.learning.gamma, 0.0, 1.0)?;
        validate_range("learning.epsilon_start", self.learning.epsilon_start, 0.0, 1.0)?;
        validate_range("learning.epsilon_end", self.learning.epsilon_end, 0.0, self.learning.epsilon_start)?;
        validate_range("learning.epsilon_decay", self.learning.epsilon_decay, f64::MIN_POSITIVE, 1.0)?;

        validate_ascending("agent.bins", &self.agent.bins)?;
        validate_range("agent.phase_change_penalty", self.agent.phase_change_penalty, 0.0, f64::MAX)?;
        if let Some(penalty) = self.agent.collision_penalty {
            validate_range("agent.collision_penalty", penalty, 0.0, f64::MAX)?;
        }
        validate_positive_number("agent.max_joint_actions", self.agent.max_joint_actions, 1)?;

        validate_path("output.dir", &self.output.dir)?;
        validate_path("output.q_table_file", &self.output.q_table_file)?;
        validate_path("output.stop_times_file", &self.output.stop_times_file)?;

        validate_positive_number("fuzzy.decision_interval", self.fuzzy.decision_interval, 1)?;
        validate_range("analysis.stop_speed_threshold", self.analysis.stop_speed_threshold, 0.0, f64::MAX)?;

        let mix = &self.analysis.vehicle_mix;
        let total = mix.diesel + mix.gasoline + mix.electric;
        if mix.diesel < 0.0 || mix.gasoline < 0.0 || mix.electric < 0.0 || (total - 1.0).abs() > 1e-6 {
            return Err(TrafficError::ConfigValidationError {
                field: "analysis.vehicle_mix".to_string(),
                message: format!("shares must be non-negative and sum to 1 (got {:.3})", total),
            });
        }

        Ok(())
    }
}

impl Validate for TrafficConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = TrafficConfig::from_toml_str("").unwrap();
        assert_eq!(config.simulation.backend, Backend::Builtin);
        assert_eq!(config.learning.episodes, 200);
        assert_eq!(config.agent.bins, vec![0, 1, 3]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml_content = r#"
[simulation]
backend = "sumo"
max_steps = 1000
decision_interval = 10

[simulation.sumo]
binary = "sumo-gui"
net_file = "cross.net.xml"
route_file = "cross.rou.xml"
step_length = 0.5

[learning]
episodes = 20
epsilon_decay = 0.99

[agent]
mode = "independent"
state = "grouped"
lane_order = "sorted"
reward = "wait_reduction"
collision_penalty = 100.0
min_green = 10

[analysis]
stop_accounting = "first_stop"
"#;

        let config = TrafficConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.simulation.backend, Backend::Sumo);
        assert_eq!(config.simulation.sumo.binary, "sumo-gui");
        assert_eq!(config.simulation.sumo.step_length, Some(0.5));

        let agent = config.agent_settings();
        assert_eq!(agent.mode, AgentMode::Independent);
        assert_eq!(agent.state, StateEncoding::Grouped);
        assert_eq!(agent.lane_order, LaneOrder::Sorted);
        assert_eq!(agent.collision_penalty, Some(100.0));

        let training = config.training_settings();
        assert_eq!(training.episodes, 20);
        assert_eq!(training.max_steps, 1000);
        assert_eq!(training.epsilon.decay, 0.99);
        assert_eq!(config.run_settings().stop_accounting, StopAccounting::FirstStop);
        assert_eq!(config.fuzzy_settings().stop_accounting, StopAccounting::FirstStop);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("TRAFFIC_RL_TEST_NET", "/nets/grid.net.xml");

        let toml_content = r#"
[simulation.sumo]
net_file = "${TRAFFIC_RL_TEST_NET}"
route_file = "${TRAFFIC_RL_UNSET_VAR}"
"#;

        let config = TrafficConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.simulation.sumo.net_file, "/nets/grid.net.xml");
        assert_eq!(config.simulation.sumo.route_file, "${TRAFFIC_RL_UNSET_VAR}");

        std::env::remove_var("TRAFFIC_RL_TEST_NET");
    }

    #[test]
    fn test_config_validation() {
        let bad_bins = TrafficConfig::from_toml_str("[agent]\nbins = [3, 1]\n").unwrap();
        assert!(bad_bins.validate().is_err());

        let bad_alpha = TrafficConfig::from_toml_str("[learning]\nalpha = 0.0\n").unwrap();
        assert!(bad_alpha.validate().is_err());

        let bad_mix = TrafficConfig::from_toml_str(
            "[analysis.vehicle_mix]\ndiesel = 0.5\ngasoline = 0.2\nelectric = 0.1\n",
        )
        .unwrap();
        assert!(bad_mix.validate().is_err());

        let bad_interval = TrafficConfig::from_toml_str("[simulation]\ndecision_interval = 0\n").unwrap();
        assert!(bad_interval.validate().is_err());
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = TrafficConfig::from_toml_str(include_str!("../../traffic-rl.example.toml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.agent_settings(), AgentSettings::default());
    }

    #[test]
    fn test_unknown_enum_value_is_parse_error() {
        let result = TrafficConfig::from_toml_str("[agent]\nmode = \"swarm\"\n");
        assert!(matches!(result, Err(TrafficError::ConfigValidationError { .. })));
    }

    #[test]
    fn test_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"[learning]\nepisodes = 3\n\n[output]\ndir = \"./runs\"\n")
            .unwrap();

        let config = TrafficConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.learning.episodes, 3);
        assert_eq!(config.output.dir, "./runs");
        assert!(config.summary().contains("builtin"));
    }
}
