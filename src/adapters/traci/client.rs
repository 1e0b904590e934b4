use super::codec::{
    encode_command, encode_message, get_variable_command, parse_ryg_definition, read_variable_response,
    set_variable_command, simulation_step_command, Reader, StatusResponse, TraciValue,
};
use super::constants::*;
use crate::domain::model::TlsProgram;
use crate::domain::ports::TrafficSimulation;
use crate::utils::error::{Result, TrafficError};
use crate::utils::validation::{validate_non_empty_string, validate_path, validate_range, Validate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

/// 單一回應訊息的上限
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// 長度欄位包含自己的 4 個位元組，回傳其餘內容的長度
fn body_length(total: i32) -> Result<usize> {
    usize::try_from(total)
        .ok()
        .filter(|&n| n <= MAX_MESSAGE_LEN)
        .and_then(|n| n.checked_sub(4))
        .ok_or_else(|| TrafficError::protocol(format!("invalid message length {}", total)))
}

/// 啟動 SUMO 的參數
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SumoConfig {
    /// `sumo` 或 `sumo-gui`
    pub binary: String,
    pub net_file: String,
    pub route_file: String,
    pub config_file: Option<String>,
    pub additional_files: Vec<String>,
    pub step_length: Option<f64>,
    pub host: String,
    /// 0 表示自動挑選空閒的埠
    pub port: u16,
    pub connect_retries: usize,
    pub quit_on_end: bool,
    pub extra_args: Vec<String>,
}

impl Default for SumoConfig {
    fn default() -> Self {
        Self {
            binary: "sumo".to_string(),
            net_file: "network.net.xml".to_string(),
            route_file: "routes.rou.xml".to_string(),
            config_file: None,
            additional_files: Vec::new(),
            step_length: None,
            host: "127.0.0.1".to_string(),
            port: 0,
            connect_retries: 10,
            quit_on_end: true,
            extra_args: Vec::new(),
        }
    }
}

impl SumoConfig {
    pub fn command_args(&self, port: u16) -> Vec<String> {
        let mut args = vec![
            "-n".to_string(),
            self.net_file.clone(),
            "-r".to_string(),
            self.route_file.clone(),
        ];
        if let Some(cfg) = &self.config_file {
            args.push("-c".to_string());
            args.push(cfg.clone());
        }
        if !self.additional_files.is_empty() {
            args.push("-a".to_string());
            args.push(self.additional_files.join(","));
        }
        if let Some(step) = self.step_length {
            args.push("--step-length".to_string());
            args.push(step.to_string());
        }
        args.push("--start".to_string());
        if self.quit_on_end {
            args.push("--quit-on-end".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push("--remote-port".to_string());
        args.push(port.to_string());
        args
    }
}

impl Validate for SumoConfig {
    fn validate(&self) -> Result<()> {
        validate_non_empty_string("simulation.sumo.binary", &self.binary)?;
        validate_path("simulation.sumo.net_file", &self.net_file)?;
        validate_path("simulation.sumo.route_file", &self.route_file)?;
        if let Some(cfg) = &self.config_file {
            validate_path("simulation.sumo.config_file", cfg)?;
        }
        if let Some(step) = self.step_length {
            validate_range("simulation.sumo.step_length", step, 0.001, 3600.0)?;
        }
        validate_non_empty_string("simulation.sumo.host", &self.host)?;
        Ok(())
    }
}

enum Mode {
    Launch(SumoConfig),
    /// 連到外部啟動的 SUMO，只能用一次
    Attach { addr: String, used: bool },
}

/// 透過 TraCI 驅動 SUMO
pub struct SumoSimulation {
    mode: Mode,
    stream: Option<TcpStream>,
    child: Option<Child>,
}

impl SumoSimulation {
    pub fn new(config: SumoConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            mode: Mode::Launch(config),
            stream: None,
            child: None,
        })
    }

    /// 連到已經以 `--remote-port` 啟動的伺服器
    pub async fn connect(addr: &str) -> Result<Self> {
        let mut sim = Self {
            mode: Mode::Attach {
                addr: addr.to_string(),
                used: false,
            },
            stream: None,
            child: None,
        };
        sim.stream = Some(open_stream(addr, 1).await?);
        sim.handshake().await?;
        Ok(sim)
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn launch(&mut self, config: &SumoConfig) -> Result<()> {
        let port = if config.port == 0 { free_port()? } else { config.port };
        let args = config.command_args(port);
        tracing::info!("🚀 Launching {} {}", config.binary, args.join(" "));

        let child = Command::new(&config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TrafficError::ConnectionError {
                message: format!("failed to launch '{}': {}", config.binary, e),
            })?;
        self.child = Some(child);

        let addr = format!("{}:{}", config.host, port);
        self.stream = Some(open_stream(&addr, config.connect_retries).await?);
        self.handshake().await
    }

    async fn handshake(&mut self) -> Result<()> {
        let response = self.exchange(&[encode_command(CMD_GETVERSION, &[])]).await?;
        let mut reader = Reader::new(&response);
        StatusResponse::read(&mut reader)?.check(CMD_GETVERSION)?;

        let (id, end) = reader.read_command_header()?;
        if id != CMD_GETVERSION {
            return Err(TrafficError::protocol(format!(
                "unexpected getVersion response 0x{:02x}",
                id
            )));
        }
        let api = reader.read_i32()?;
        let version = reader.read_string()?;
        reader.skip_to(end)?;
        tracing::info!("🔗 Connected to {} (TraCI API {})", version, api);
        Ok(())
    }

    /// 送出一則訊息並讀回完整回應（不含長度欄位）
    async fn exchange(&mut self, commands: &[Vec<u8>]) -> Result<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or_else(|| TrafficError::ConnectionError {
            message: "not connected to SUMO".to_string(),
        })?;
        stream.write_all(&encode_message(commands)).await?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let body_len = body_length(i32::from_be_bytes(len_buf))?;
        let mut body = vec![0u8; body_len];
        stream.read_exact(&mut body).await?;
        Ok(body)
    }

    async fn get(&mut self, domain: u8, variable: u8, object_id: &str) -> Result<TraciValue> {
        let response = self
            .exchange(&[get_variable_command(domain, variable, object_id)])
            .await?;
        let mut reader = Reader::new(&response);
        StatusResponse::read(&mut reader)?.check(domain)?;
        read_variable_response(&mut reader, domain, variable, object_id)
    }

    async fn set(&mut self, domain: u8, variable: u8, object_id: &str, value: TraciValue) -> Result<()> {
        let response = self
            .exchange(&[set_variable_command(domain, variable, object_id, &value)])
            .await?;
        StatusResponse::read(&mut Reader::new(&response))?.check(domain)
    }

    async fn shutdown_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => tracing::debug!("SUMO exited with {}", status),
                Ok(Err(e)) => tracing::warn!("⚠️ Failed to wait for SUMO: {}", e),
                Err(_) => {
                    tracing::warn!("⚠️ SUMO did not exit in time, killing it");
                    if let Err(e) = child.kill().await {
                        tracing::warn!("⚠️ Failed to kill SUMO: {}", e);
                    }
                }
            }
        }
    }
}

async fn open_stream(addr: &str, retries: usize) -> Result<TcpStream> {
    let attempts = retries.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!("connect attempt {}/{} to {} failed: {}", attempt, attempts, addr, e);
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
    Err(TrafficError::ConnectionError {
        message: format!(
            "could not connect to {} after {} attempts: {}",
            addr,
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ),
    })
}

fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[async_trait]
impl TrafficSimulation for SumoSimulation {
    async fn start(&mut self) -> Result<()> {
        match &mut self.mode {
            Mode::Launch(config) => {
                if self.stream.is_some() {
                    return Err(TrafficError::simulation("SUMO is already running, close it first"));
                }
                let config = config.clone();
                self.launch(&config).await
            }
            Mode::Attach { addr, used } => {
                if *used || self.stream.is_none() {
                    return Err(TrafficError::simulation(format!(
                        "the SUMO server at {} can only run one episode",
                        addr
                    )));
                }
                *used = true;
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.stream.is_none() {
            return Ok(());
        }
        let result = match self.exchange(&[encode_command(CMD_CLOSE, &[])]).await {
            Ok(response) => StatusResponse::read(&mut Reader::new(&response))
                .and_then(|status| status.check(CMD_CLOSE)),
            Err(e) => Err(e),
        };
        self.stream = None;
        self.shutdown_child().await;
        result
    }

    async fn simulation_step(&mut self) -> Result<()> {
        let response = self.exchange(&[simulation_step_command(0.0)]).await?;
        let mut reader = Reader::new(&response);
        StatusResponse::read(&mut reader)?.check(CMD_SIMSTEP)?;
        let subscriptions = reader.read_i32()?;
        if subscriptions != 0 {
            tracing::debug!("ignoring {} subscription results", subscriptions);
        }
        Ok(())
    }

    async fn traffic_light_ids(&mut self) -> Result<Vec<String>> {
        self.get(CMD_GET_TL_VARIABLE, ID_LIST, "").await?.into_string_list()
    }

    async fn controlled_lanes(&mut self, tls_id: &str) -> Result<Vec<String>> {
        self.get(CMD_GET_TL_VARIABLE, TL_CONTROLLED_LANES, tls_id)
            .await?
            .into_string_list()
    }

    async fn program(&mut self, tls_id: &str) -> Result<TlsProgram> {
        let value = self
            .get(CMD_GET_TL_VARIABLE, TL_COMPLETE_DEFINITION_RYG, tls_id)
            .await?;
        parse_ryg_definition(value)
    }

    async fn phase(&mut self, tls_id: &str) -> Result<usize> {
        Ok(self
            .get(CMD_GET_TL_VARIABLE, TL_CURRENT_PHASE, tls_id)
            .await?
            .as_count()? as usize)
    }

    async fn set_phase(&mut self, tls_id: &str, phase: usize) -> Result<()> {
        let index = i32::try_from(phase)
            .map_err(|_| TrafficError::simulation(format!("phase index {} is too large", phase)))?;
        self.set(CMD_SET_TL_VARIABLE, TL_PHASE_INDEX, tls_id, TraciValue::Int(index))
            .await
    }

    async fn lane_halting_number(&mut self, lane_id: &str) -> Result<u32> {
        self.get(CMD_GET_LANE_VARIABLE, LAST_STEP_VEHICLE_HALTING_NUMBER, lane_id)
            .await?
            .as_count()
    }

    async fn lane_waiting_time(&mut self, lane_id: &str) -> Result<f64> {
        self.get(CMD_GET_LANE_VARIABLE, VAR_WAITING_TIME, lane_id)
            .await?
            .as_f64()
    }

    async fn colliding_vehicles_number(&mut self) -> Result<u32> {
        self.get(CMD_GET_SIM_VARIABLE, VAR_COLLIDING_VEHICLES_NUMBER, "")
            .await?
            .as_count()
    }

    async fn vehicle_ids(&mut self) -> Result<Vec<String>> {
        self.get(CMD_GET_VEHICLE_VARIABLE, ID_LIST, "").await?.into_string_list()
    }

    async fn vehicle_speed(&mut self, vehicle_id: &str) -> Result<f64> {
        self.get(CMD_GET_VEHICLE_VARIABLE, VAR_SPEED, vehicle_id)
            .await?
            .as_f64()
    }

    async fn vehicle_waiting_time(&mut self, vehicle_id: &str) -> Result<f64> {
        self.get(CMD_GET_VEHICLE_VARIABLE, VAR_WAITING_TIME, vehicle_id)
            .await?
            .as_f64()
    }

    async fn delta_t(&mut self) -> Result<f64> {
        self.get(CMD_GET_SIM_VARIABLE, VAR_DELTA_T, "").await?.as_f64()
    }

    async fn min_expected_number(&mut self) -> Result<u32> {
        self.get(CMD_GET_SIM_VARIABLE, VAR_MIN_EXPECTED_VEHICLES, "")
            .await?
            .as_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_length_bounds() {
        assert_eq!(body_length(4).unwrap(), 0);
        assert_eq!(body_length(11).unwrap(), 7);
        assert!(matches!(body_length(3), Err(TrafficError::ProtocolError { .. })));
        assert!(matches!(body_length(-1), Err(TrafficError::ProtocolError { .. })));
        assert!(matches!(body_length(i32::MAX), Err(TrafficError::ProtocolError { .. })));
        assert!(body_length(MAX_MESSAGE_LEN as i32).is_ok());
        assert!(body_length(MAX_MESSAGE_LEN as i32 + 1).is_err());
    }

    #[test]
    fn test_command_args() {
        let config = SumoConfig {
            config_file: Some("map.sumocfg".to_string()),
            additional_files: vec!["a.add.xml".to_string(), "b.add.xml".to_string()],
            step_length: Some(0.5),
            ..Default::default()
        };
        let args = config.command_args(9000);
        assert_eq!(
            args,
            vec![
                "-n",
                "network.net.xml",
                "-r",
                "routes.rou.xml",
                "-c",
                "map.sumocfg",
                "-a",
                "a.add.xml,b.add.xml",
                "--step-length",
                "0.5",
                "--start",
                "--quit-on-end",
                "--remote-port",
                "9000"
            ]
        );
    }

    #[test]
    fn test_sumo_config_validation() {
        assert!(SumoConfig::default().validate().is_ok());
        let bad = SumoConfig {
            net_file: String::new(),
            ..Default::default()
        };
        assert!(SumoSimulation::new(bad).is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let port = free_port().unwrap();
        let result = SumoSimulation::connect(&format!("127.0.0.1:{}", port)).await;
        assert!(matches!(result, Err(TrafficError::ConnectionError { .. })));
    }

    #[tokio::test]
    async fn test_queries_without_connection_fail() {
        let mut sim = SumoSimulation::new(SumoConfig::default()).unwrap();
        assert!(!sim.is_connected());
        assert!(sim.simulation_step().await.is_err());
        // 尚未連線時關閉不做任何事
        assert!(sim.close().await.is_ok());
    }
}
