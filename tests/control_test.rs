use anyhow::Result;
use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;
use traffic_rl::core::agent::{AgentSettings, RewardKind};
use traffic_rl::core::emissions::{build_stop_records, read_stop_records, write_stop_records, EmissionsReport, VehicleMix};
use traffic_rl::core::fuzzy::FuzzySettings;
use traffic_rl::core::metrics::StopAccounting;
use traffic_rl::core::qtable::QTableSet;
use traffic_rl::core::runner::{collect_stop_times, RunSettings};
use traffic_rl::core::trainer::TrainingSettings;
use traffic_rl::core::{Storage, TrafficSimulation};
use traffic_rl::domain::model::{PhaseDef, TlsProgram};
use traffic_rl::{
    Baseline, Evaluator, FuzzyRunner, LocalStorage, QueueSimConfig, QueueSimulation, Trainer, TrafficError,
};

/// 固定回應的模擬器：一個號誌、兩條車道，指定步數後發生碰撞
struct ScriptedSimulation {
    step: usize,
    collide_at: Option<usize>,
    phase: usize,
    /// 2 = `Gr rG`，4 = 加上黃燈轉換時相
    n_phases: usize,
    /// 每次 set_phase 的 (模擬步數, 時相)
    phase_log: Vec<(usize, usize)>,
    set_phase_calls: usize,
    /// `-E0_0` 的等待時間每步增加的秒數
    wait_growth: f64,
    /// 車輛 v0 每 10 步停 5 步
    stop_and_go: bool,
    closed: usize,
}

impl ScriptedSimulation {
    fn new(collide_at: Option<usize>) -> Self {
        Self {
            step: 0,
            collide_at,
            phase: 0,
            n_phases: 2,
            phase_log: Vec::new(),
            set_phase_calls: 0,
            wait_growth: 0.0,
            stop_and_go: false,
            closed: 0,
        }
    }

    fn with_transition_phases(mut self) -> Self {
        self.n_phases = 4;
        self
    }

    fn with_wait_growth(mut self, seconds_per_step: f64) -> Self {
        self.wait_growth = seconds_per_step;
        self
    }

    fn with_stop_and_go(mut self) -> Self {
        self.stop_and_go = true;
        self
    }
}

#[async_trait]
impl TrafficSimulation for ScriptedSimulation {
    async fn start(&mut self) -> traffic_rl::Result<()> {
        self.step = 0;
        self.phase = 0;
        Ok(())
    }

    async fn close(&mut self) -> traffic_rl::Result<()> {
        self.closed += 1;
        Ok(())
    }

    async fn simulation_step(&mut self) -> traffic_rl::Result<()> {
        self.step += 1;
        Ok(())
    }

    async fn traffic_light_ids(&mut self) -> traffic_rl::Result<Vec<String>> {
        Ok(vec!["J".to_string()])
    }

    async fn controlled_lanes(&mut self, _tls_id: &str) -> traffic_rl::Result<Vec<String>> {
        Ok(vec!["-E0_0".to_string(), "E2_0".to_string()])
    }

    async fn program(&mut self, _tls_id: &str) -> traffic_rl::Result<TlsProgram> {
        Ok(TlsProgram {
            program_id: "0".to_string(),
            current_phase: self.phase,
            phases: if self.n_phases == 4 {
                vec![
                    PhaseDef::new(30.0, "Gr"),
                    PhaseDef::new(3.0, "yr"),
                    PhaseDef::new(30.0, "rG"),
                    PhaseDef::new(3.0, "ry"),
                ]
            } else {
                vec![PhaseDef::new(30.0, "Gr"), PhaseDef::new(30.0, "rG")]
            },
        })
    }

    async fn phase(&mut self, _tls_id: &str) -> traffic_rl::Result<usize> {
        Ok(self.phase)
    }

    async fn set_phase(&mut self, _tls_id: &str, phase: usize) -> traffic_rl::Result<()> {
        self.set_phase_calls += 1;
        self.phase_log.push((self.step, phase));
        self.phase = phase;
        Ok(())
    }

    async fn lane_halting_number(&mut self, lane_id: &str) -> traffic_rl::Result<u32> {
        Ok(if lane_id == "-E0_0" { 2 } else { 0 })
    }

    async fn lane_waiting_time(&mut self, lane_id: &str) -> traffic_rl::Result<f64> {
        Ok(if lane_id == "-E0_0" {
            self.wait_growth * self.step as f64
        } else {
            0.0
        })
    }

    async fn colliding_vehicles_number(&mut self) -> traffic_rl::Result<u32> {
        Ok(match self.collide_at {
            Some(at) if self.step >= at => 2,
            _ => 0,
        })
    }

    async fn vehicle_ids(&mut self) -> traffic_rl::Result<Vec<String>> {
        Ok(vec!["v0".to_string()])
    }

    async fn vehicle_speed(&mut self, _vehicle_id: &str) -> traffic_rl::Result<f64> {
        Ok(if self.stop_and_go && self.step % 10 >= 5 { 5.0 } else { 0.0 })
    }

    async fn vehicle_waiting_time(&mut self, _vehicle_id: &str) -> traffic_rl::Result<f64> {
        Ok(1.0)
    }

    async fn delta_t(&mut self) -> traffic_rl::Result<f64> {
        Ok(1.0)
    }

    async fn min_expected_number(&mut self) -> traffic_rl::Result<u32> {
        Ok(1)
    }
}

fn short_run(max_steps: usize) -> RunSettings {
    RunSettings {
        max_steps,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_collision_ends_episode_with_penalty() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let storage = LocalStorage::new(temp_dir.path().to_string_lossy().into_owned());
    let agent = AgentSettings {
        collision_penalty: Some(100.0),
        ..Default::default()
    };
    let settings = TrainingSettings {
        episodes: 1,
        max_steps: 100,
        warmup_steps: 0,
        alpha: 0.5,
        training_log: None,
        ..Default::default()
    };

    let mut trainer = Trainer::new(ScriptedSimulation::new(Some(12)), storage, agent, settings);
    let report = trainer.run().await?;

    let summary = &report.episodes[0];
    assert!(summary.collided);
    assert_eq!(summary.steps, 12);
    assert!(summary.total_reward < -99.0);

    let table = trainer.tables().table("J").expect("table for J");
    let lowest = table
        .states()
        .flat_map(|(_, row)| row.iter().copied())
        .fold(f64::INFINITY, f64::min);
    assert!(lowest <= -50.0 + 1e-9);

    let (sim, _, _) = trainer.into_parts();
    assert_eq!(sim.closed, 1);
    Ok(())
}

#[tokio::test]
async fn test_collisions_ignored_without_penalty() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let storage = LocalStorage::new(temp_dir.path().to_string_lossy().into_owned());
    let settings = TrainingSettings {
        episodes: 1,
        max_steps: 40,
        training_log: None,
        ..Default::default()
    };

    let mut trainer = Trainer::new(
        ScriptedSimulation::new(Some(3)),
        storage,
        AgentSettings::default(),
        settings,
    );
    let report = trainer.run().await?;
    assert!(!report.episodes[0].collided);
    assert_eq!(report.episodes[0].steps, 40);
    Ok(())
}

#[tokio::test]
async fn test_green_only_training_never_sends_transition_phases() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let storage = LocalStorage::new(temp_dir.path().to_string_lossy().into_owned());
    let agent = AgentSettings {
        green_phases_only: true,
        ..Default::default()
    };
    let settings = TrainingSettings {
        episodes: 1,
        max_steps: 100,
        warmup_steps: 0,
        training_log: None,
        ..Default::default()
    };

    let sim = ScriptedSimulation::new(None).with_transition_phases();
    let mut trainer = Trainer::new(sim, storage, agent, settings);
    trainer.run().await?;

    // 20 次決策都從 4 個動作中探索，奇數時相只學不送
    let table = trainer.tables().table("J").expect("table for J");
    assert_eq!(table.action_count(), Some(4));
    let (sim, _, _) = trainer.into_parts();
    assert!(sim.set_phase_calls > 0);
    assert!(sim.set_phase_calls < 20);
    assert!(sim.phase_log.iter().all(|(_, phase)| phase % 2 == 0));
    Ok(())
}

#[tokio::test]
async fn test_min_green_holds_phase_during_training() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let storage = LocalStorage::new(temp_dir.path().to_string_lossy().into_owned());
    let agent = AgentSettings {
        min_green: 15,
        ..Default::default()
    };
    let settings = TrainingSettings {
        episodes: 1,
        max_steps: 200,
        warmup_steps: 0,
        training_log: None,
        ..Default::default()
    };

    let sim = ScriptedSimulation::new(None).with_transition_phases();
    let mut trainer = Trainer::new(sim, storage, agent, settings);
    trainer.run().await?;
    let (sim, _, _) = trainer.into_parts();

    // 每次決策都會送出時相
    assert_eq!(sim.set_phase_calls, 40);
    let mut changes = Vec::new();
    let mut current = 0;
    for &(step, phase) in &sim.phase_log {
        if phase != current {
            changes.push(step);
            current = phase;
        }
    }
    assert!(!changes.is_empty());
    assert!(changes[0] >= 15);
    assert!(changes.windows(2).all(|w| w[1] - w[0] >= 15));
    Ok(())
}

#[tokio::test]
async fn test_wait_reduction_reward_updates_q_value() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let storage = LocalStorage::new(temp_dir.path().to_string_lossy().into_owned());
    let agent = AgentSettings {
        reward: RewardKind::WaitReduction,
        phase_change_penalty: 0.0,
        ..Default::default()
    };
    let settings = TrainingSettings {
        episodes: 1,
        max_steps: 5,
        decision_interval: 5,
        warmup_steps: 0,
        alpha: 0.5,
        gamma: 0.9,
        training_log: None,
        ..Default::default()
    };

    // -E0_0 的等待時間 5 步內從 0 增加到 10 秒
    let sim = ScriptedSimulation::new(None).with_wait_growth(2.0);
    let mut trainer = Trainer::new(sim, storage, agent, settings);
    let report = trainer.run().await?;
    assert!((report.episodes[0].total_reward + 10.0).abs() < 1e-9);

    // 下一狀態與目前狀態相同且全為 0：q = 0.5 * (-10 + 0.9 * 0)
    let table = trainer.tables().table("J").expect("table for J");
    let values: Vec<f64> = table.states().flat_map(|(_, row)| row.iter().copied()).collect();
    assert_eq!(values.iter().filter(|&&q| q != 0.0).count(), 1);
    let lowest = values.iter().copied().fold(f64::INFINITY, f64::min);
    assert!((lowest + 5.0).abs() < 1e-9);
    Ok(())
}

#[tokio::test]
async fn test_fuzzy_honours_stop_accounting() -> Result<()> {
    let cumulative = FuzzySettings {
        max_steps: 20,
        ..Default::default()
    };
    let first_stop = FuzzySettings {
        stop_accounting: StopAccounting::FirstStop,
        ..cumulative.clone()
    };

    // 停在第 1..4、10..14、20 步
    let mut fuzzy = FuzzyRunner::new(ScriptedSimulation::new(None).with_stop_and_go(), cumulative);
    assert_eq!(fuzzy.run().await?.total_stopped_time, 10.0);

    // 只計第一次停車：第 1 步登記，第 2..4 步累加
    let mut fuzzy = FuzzyRunner::new(ScriptedSimulation::new(None).with_stop_and_go(), first_stop);
    let report = fuzzy.run().await?;
    assert_eq!(report.total_stopped_time, 3.0);

    let mut baseline = Baseline::new(
        ScriptedSimulation::new(None).with_stop_and_go(),
        RunSettings {
            max_steps: 20,
            stop_accounting: StopAccounting::FirstStop,
            ..Default::default()
        },
    );
    assert_eq!(baseline.run().await?.total_stopped_time, report.total_stopped_time);
    Ok(())
}

#[tokio::test]
async fn test_evaluator_requires_matching_table() -> Result<()> {
    let mut evaluator = Evaluator::new(
        ScriptedSimulation::new(None),
        QTableSet::new(),
        AgentSettings::default(),
        short_run(20),
    );
    let err = evaluator.run().await.unwrap_err();
    assert!(matches!(err, TrafficError::QTableMismatch { .. }));
    // 失敗時仍然關閉模擬
    assert_eq!(evaluator.into_simulation().closed, 1);
    Ok(())
}

#[tokio::test]
async fn test_evaluator_sets_phase_every_decision() -> Result<()> {
    let mut tables = QTableSet::new();
    // 狀態 "2,0"：第一條車道 2 輛停等 -> bin 2
    let table = tables.table_mut("J");
    table.ensure_row("2,0", 2);
    table.update("2,0", 1, 5.0, "2,0", 1.0, 0.0)?;

    let mut evaluator = Evaluator::new(
        ScriptedSimulation::new(None),
        tables,
        AgentSettings::default(),
        short_run(20),
    );
    let report = evaluator.run().await?;
    assert_eq!(report.controller, "q-learning");
    assert_eq!(report.steps, 20);

    let sim = evaluator.into_simulation();
    assert_eq!(sim.set_phase_calls, 4);
    assert_eq!(sim.phase, 1);
    Ok(())
}

#[tokio::test]
async fn test_greedy_run_after_training_on_builtin() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let storage = LocalStorage::new(temp_dir.path().to_string_lossy().into_owned());
    let sim_config = QueueSimConfig {
        demand_end: 200.0,
        ..Default::default()
    };

    let settings = TrainingSettings {
        episodes: 2,
        max_steps: 300,
        ..Default::default()
    };
    let mut trainer = Trainer::new(
        QueueSimulation::new(sim_config.clone())?,
        storage.clone(),
        AgentSettings::default(),
        settings,
    );
    trainer.run().await?;

    let tables = QTableSet::load(&storage, "q_table.json").await?;
    let mut evaluator = Evaluator::new(
        QueueSimulation::new(sim_config)?,
        tables,
        AgentSettings::default(),
        short_run(300),
    );
    let report = evaluator.run().await?;
    assert_eq!(report.steps, 300);
    assert!(report.vehicles > 0);
    Ok(())
}

#[tokio::test]
async fn test_missing_qtable_file_is_reported() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let storage = LocalStorage::new(temp_dir.path().to_string_lossy().into_owned());
    let err = QTableSet::load(&storage, "q_table.json").await.unwrap_err();
    assert!(matches!(err, TrafficError::QTableNotFound { .. }));
    Ok(())
}

#[tokio::test]
async fn test_baseline_and_fuzzy_on_builtin() -> Result<()> {
    let mut baseline = Baseline::new(QueueSimulation::new(QueueSimConfig::default())?, short_run(400));
    let fixed = baseline.run().await?;
    assert_eq!(fixed.controller, "fixed-time");
    assert_eq!(fixed.steps, 400);
    assert!(fixed.vehicles > 0);
    assert!(fixed.total_stopped_time > 0.0);

    let settings = FuzzySettings {
        max_steps: 400,
        ..Default::default()
    };
    let mut fuzzy = FuzzyRunner::new(QueueSimulation::new(QueueSimConfig::default())?, settings);
    let report = fuzzy.run().await?;
    assert_eq!(report.controller, "fuzzy");
    assert_eq!(report.steps, 400);
    Ok(())
}

#[tokio::test]
async fn test_stop_times_feed_emissions_report() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let storage = LocalStorage::new(temp_dir.path().to_string_lossy().into_owned());
    let mut sim = QueueSimulation::new(QueueSimConfig {
        demand_end: 120.0,
        ..Default::default()
    })?;

    let times = collect_stop_times(&mut sim, &short_run(5000)).await?;
    assert!(!times.is_empty());
    assert!(times.iter().all(|(_, t)| *t > 0.0));
    // 所有車輛離開後才停止
    assert!(sim.current_step() < 5000);

    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let records = build_stop_records(&times, &VehicleMix::default(), &mut rng);
    let mut buf = Vec::new();
    write_stop_records(&mut buf, &records)?;
    storage.write_file("vehicle_stop_times.csv", &buf).await?;

    let data = storage.read_file("vehicle_stop_times.csv").await?;
    let loaded = read_stop_records(data.as_slice())?;
    assert_eq!(loaded.len(), records.len());
    assert_eq!(loaded[0].vehicle_id, times[0].0);

    let report = EmissionsReport::from_records(&loaded, &mut rng);
    assert_eq!(report.total_vehicles, loaded.len());
    assert!(report.longest_stop_minutes >= report.average_stop_minutes);
    assert!(report.lookup(&times[0].0).is_ok());
    assert!(report.render().contains("Total Vehicles"));
    Ok(())
}

#[test]
fn test_no_traffic_lights_is_reported() {
    struct Empty(ScriptedSimulation);

    #[async_trait]
    impl TrafficSimulation for Empty {
        async fn start(&mut self) -> traffic_rl::Result<()> {
            self.0.start().await
        }
        async fn close(&mut self) -> traffic_rl::Result<()> {
            self.0.close().await
        }
        async fn simulation_step(&mut self) -> traffic_rl::Result<()> {
            self.0.simulation_step().await
        }
        async fn traffic_light_ids(&mut self) -> traffic_rl::Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn controlled_lanes(&mut self, tls_id: &str) -> traffic_rl::Result<Vec<String>> {
            self.0.controlled_lanes(tls_id).await
        }
        async fn program(&mut self, tls_id: &str) -> traffic_rl::Result<TlsProgram> {
            self.0.program(tls_id).await
        }
        async fn phase(&mut self, tls_id: &str) -> traffic_rl::Result<usize> {
            self.0.phase(tls_id).await
        }
        async fn set_phase(&mut self, tls_id: &str, phase: usize) -> traffic_rl::Result<()> {
            self.0.set_phase(tls_id, phase).await
        }
        async fn lane_halting_number(&mut self, lane_id: &str) -> traffic_rl::Result<u32> {
            self.0.lane_halting_number(lane_id).await
        }
        async fn lane_waiting_time(&mut self, lane_id: &str) -> traffic_rl::Result<f64> {
            self.0.lane_waiting_time(lane_id).await
        }
        async fn colliding_vehicles_number(&mut self) -> traffic_rl::Result<u32> {
            self.0.colliding_vehicles_number().await
        }
        async fn vehicle_ids(&mut self) -> traffic_rl::Result<Vec<String>> {
            self.0.vehicle_ids().await
        }
        async fn vehicle_speed(&mut self, vehicle_id: &str) -> traffic_rl::Result<f64> {
            self.0.vehicle_speed(vehicle_id).await
        }
        async fn vehicle_waiting_time(&mut self, vehicle_id: &str) -> traffic_rl::Result<f64> {
            self.0.vehicle_waiting_time(vehicle_id).await
        }
        async fn delta_t(&mut self) -> traffic_rl::Result<f64> {
            self.0.delta_t().await
        }
        async fn min_expected_number(&mut self) -> traffic_rl::Result<u32> {
            self.0.min_expected_number().await
        }
    }

    let temp_dir = TempDir::new().unwrap();
    let storage = LocalStorage::new(temp_dir.path().to_string_lossy().into_owned());
    let mut trainer = Trainer::new(
        Empty(ScriptedSimulation::new(None)),
        storage,
        AgentSettings::default(),
        TrainingSettings {
            episodes: 1,
            training_log: None,
            ..Default::default()
        },
    );
    let err = tokio_test::block_on(trainer.run()).unwrap_err();
    assert!(matches!(err, TrafficError::NoTrafficLights));

    let (sim, _, _) = trainer.into_parts();
    assert_eq!(sim.0.closed, 1);
}
