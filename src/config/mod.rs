pub mod toml_config;

#[cfg(feature = "cli")]
pub mod cli;

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
pub use toml_config::{Backend, TrafficConfig};

/// 沒有指定 `--config` 時嘗試讀取的檔案
pub const DEFAULT_CONFIG_FILE: &str = "traffic-rl.toml";

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Parser)]
#[command(name = "traffic-rl")]
#[command(about = "Q-learning traffic signal control on SUMO or a built-in queue simulator")]
pub struct CliConfig {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Log CPU and memory usage while running
    #[arg(long, global = true)]
    pub monitor: bool,

    /// Override the simulation backend from config
    #[arg(long, value_enum, global = true)]
    pub backend: Option<Backend>,

    /// Override the output directory from config
    #[arg(long, global = true)]
    pub output_dir: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Train Q-tables over a number of episodes
    Train {
        #[arg(long)]
        episodes: Option<usize>,
        /// Ignore an existing Q-table file
        #[arg(long)]
        fresh: bool,
        /// Validate and show the configuration without simulating
        #[arg(long)]
        dry_run: bool,
    },
    /// Control the signals greedily with trained Q-tables
    Run {
        #[arg(long)]
        q_table: Option<String>,
        #[arg(long)]
        step_delay_ms: Option<u64>,
    },
    /// Run the network's own fixed-time programs
    Baseline,
    /// Control the signals with the fuzzy queue controller
    Fuzzy,
    /// Record how long every vehicle stood still
    StopTimes {
        #[arg(long)]
        output: Option<String>,
    },
    /// Estimate emissions from a stop-time CSV
    Emissions {
        #[arg(long)]
        input: Option<String>,
        /// Show a single vehicle
        #[arg(long)]
        vehicle: Option<String>,
        /// Also write the report as JSON
        #[arg(long)]
        json: Option<String>,
    },
}

#[cfg(feature = "cli")]
impl CliConfig {
    /// 讀取設定檔並套用命令列覆蓋
    pub fn load_config(&self) -> crate::utils::error::Result<TrafficConfig> {
        let mut config = match &self.config {
            Some(path) => TrafficConfig::from_file(path)?,
            None if std::path::Path::new(DEFAULT_CONFIG_FILE).exists() => {
                TrafficConfig::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => {
                tracing::info!(
                    "📄 No {} found, using built-in defaults",
                    DEFAULT_CONFIG_FILE
                );
                TrafficConfig::default()
            }
        };
        self.apply_overrides(&mut config);
        Ok(config)
    }

    pub fn apply_overrides(&self, config: &mut TrafficConfig) {
        if let Some(backend) = self.backend {
            config.simulation.backend = backend;
            tracing::info!("🔧 Backend overridden to: {}", backend);
        }
        if let Some(dir) = &self.output_dir {
            config.output.dir = dir.clone();
        }
        if self.monitor {
            config.monitoring.enabled = true;
        }
        match &self.command {
            Command::Train {
                episodes: Some(n), ..
            } => {
                config.learning.episodes = *n;
                tracing::info!("🔧 Episodes overridden to: {}", n);
            }
            Command::Run {
                q_table,
                step_delay_ms,
            } => {
                if let Some(path) = q_table {
                    config.output.q_table_file = path.clone();
                }
                if let Some(ms) = step_delay_ms {
                    config.simulation.step_delay_ms = *ms;
                }
            }
            Command::StopTimes { output: Some(path) } => {
                config.output.stop_times_file = path.clone();
            }
            Command::Emissions { json: Some(path), .. } => {
                config.output.emissions_json = Some(path.clone());
            }
            _ => {}
        }
    }
}
