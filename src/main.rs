use clap::Parser;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use traffic_rl::config::Command;
use traffic_rl::core::emissions::{build_stop_records, load_stop_records, write_stop_records, EmissionsReport};
use traffic_rl::core::qtable::QTableSet;
use traffic_rl::core::runner::collect_stop_times;
use traffic_rl::core::{RunReport, Storage, TrafficSimulation};
use traffic_rl::utils::error::{ErrorSeverity, Result};
use traffic_rl::utils::{logger, validation::Validate};
use traffic_rl::{
    Backend, Baseline, CliConfig, Evaluator, FuzzyRunner, LocalStorage, QueueSimulation, SumoSimulation,
    TrafficConfig, Trainer,
};

#[tokio::main]
async fn main() {
    let cli = CliConfig::parse();

    // 初始化日誌
    if cli.log_json {
        logger::init_json_logger(cli.verbose);
    } else {
        logger::init_cli_logger(cli.verbose);
    }

    tracing::info!("🚦 Starting traffic-rl");
    if cli.verbose {
        tracing::debug!("CLI config: {:?}", cli);
    }

    let config = match cli.load_config().and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("❌ Configuration failed: {}", e);
            tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
            eprintln!("❌ {}", e.user_friendly_message());
            std::process::exit(1);
        }
    };
    tracing::info!("✅ Configuration loaded and validated successfully");

    // 顯示配置摘要
    println!("{}", config.summary());

    if let Command::Train { dry_run: true, .. } = cli.command {
        tracing::info!("🔍 DRY RUN MODE - No simulation will be started");
        println!("🔍 Dry run: configuration is valid, nothing was simulated");
        return;
    }

    if config.monitoring_enabled() {
        tracing::info!("🔍 System monitoring enabled");
    }

    if let Err(e) = dispatch(&cli, &config).await {
        tracing::error!(
            "❌ Command failed: {} (Category: {:?}, Severity: {:?})",
            e,
            e.category(),
            e.severity()
        );
        tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

        eprintln!("❌ {}", e.user_friendly_message());
        eprintln!("💡 建議: {}", e.recovery_suggestion());

        // 根據錯誤嚴重程度決定退出碼
        let exit_code = match e.severity() {
            ErrorSeverity::Low => 0,
            ErrorSeverity::Medium => 2,
            ErrorSeverity::High => 1,
            ErrorSeverity::Critical => 3,
        };
        if exit_code > 0 {
            std::process::exit(exit_code);
        }
    }
}

async fn dispatch(cli: &CliConfig, config: &TrafficConfig) -> Result<()> {
    match config.simulation.backend {
        Backend::Builtin => {
            let sim = QueueSimulation::new(config.simulation.builtin.clone())?;
            run_command(sim, cli, config).await
        }
        Backend::Sumo => {
            let sim = SumoSimulation::new(config.simulation.sumo.clone())?;
            run_command(sim, cli, config).await
        }
    }
}

async fn run_command<S: TrafficSimulation>(sim: S, cli: &CliConfig, config: &TrafficConfig) -> Result<()> {
    let storage = LocalStorage::new(config.output.dir.clone());

    match &cli.command {
        Command::Train { fresh, .. } => {
            let mut trainer = Trainer::new_with_monitoring(
                sim,
                storage,
                config.agent_settings(),
                config.training_settings(),
                config.monitoring_enabled(),
            )
            .fresh_start(*fresh);
            let report = trainer.run().await?;
            println!(
                "✅ Trained {} episodes, {} states saved to {}/{}",
                report.episodes.len(),
                report.state_count,
                config.output.dir,
                report.q_table_file
            );
            if let Some(eps) = report.final_epsilon() {
                println!("   final epsilon: {:.4}", eps);
            }
        }
        Command::Run { .. } => {
            let tables = QTableSet::load(&storage, &config.output.q_table_file).await?;
            let mut evaluator = Evaluator::new(sim, tables, config.agent_settings(), config.run_settings());
            print_report(&evaluator.run().await?);
        }
        Command::Baseline => {
            let mut baseline = Baseline::new(sim, config.run_settings());
            print_report(&baseline.run().await?);
        }
        Command::Fuzzy => {
            let mut runner = FuzzyRunner::new(sim, config.fuzzy_settings());
            print_report(&runner.run().await?);
        }
        Command::StopTimes { .. } => {
            let mut sim = sim;
            let times = collect_stop_times(&mut sim, &config.run_settings()).await?;
            let mut rng = ChaCha8Rng::seed_from_u64(config.analysis.seed);
            let records = build_stop_records(&times, &config.analysis.vehicle_mix, &mut rng);

            let mut buf = Vec::new();
            write_stop_records(&mut buf, &records)?;
            storage.write_file(&config.output.stop_times_file, &buf).await?;
            println!(
                "✅ Stop times for {} vehicles written to {}",
                records.len(),
                storage.full_path(&config.output.stop_times_file).display()
            );
        }
        Command::Emissions { input, vehicle, .. } => {
            let data = match input {
                Some(path) => std::fs::read(path)?,
                None => storage.read_file(&config.output.stop_times_file).await?,
            };
            let records = load_stop_records(data.as_slice())?;
            let mut rng = ChaCha8Rng::seed_from_u64(config.analysis.seed);
            let report = EmissionsReport::from_records(&records, &mut rng);

            match vehicle {
                Some(id) => {
                    let v = report.lookup(id)?;
                    println!("Vehicle {} (type {})", v.vehicle_id, v.vehicle_type);
                    println!("  Stopped: {:.2} minutes", v.stopped_minutes);
                    println!(
                        "  CO2: {:.2} g | CO: {:.4} g | NOx: {:.4} g",
                        v.emissions.co2, v.emissions.co, v.emissions.nox
                    );
                }
                None => print!("{}", report.render()),
            }

            if let Some(path) = &config.output.emissions_json {
                let json = serde_json::to_vec_pretty(&report)?;
                storage.write_file(path, &json).await?;
                tracing::info!("📝 Emissions report written to {}", path);
            }
        }
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("✅ {} control finished", report.controller);
    println!("   steps              : {}", report.steps);
    println!("   vehicles           : {}", report.vehicles);
    println!("   average wait       : {:.2} s", report.average_wait);
    println!("   total stopped time : {:.2} s", report.total_stopped_time);
}
