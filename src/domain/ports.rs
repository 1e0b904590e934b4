use crate::domain::model::TlsProgram;
use crate::utils::error::Result;
use async_trait::async_trait;

pub trait Storage: Send + Sync {
    fn exists(&self, path: &str) -> bool;
    fn read_file(&self, path: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// 交通模擬器的查詢與控制介面，命名對應 TraCI 的同名指令
#[async_trait]
pub trait TrafficSimulation: Send {
    /// 啟動（或重置）一個新的模擬回合
    async fn start(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
    async fn simulation_step(&mut self) -> Result<()>;

    async fn traffic_light_ids(&mut self) -> Result<Vec<String>>;
    /// 依連結索引排列，可能重複
    async fn controlled_lanes(&mut self, tls_id: &str) -> Result<Vec<String>>;
    async fn program(&mut self, tls_id: &str) -> Result<TlsProgram>;
    async fn phase(&mut self, tls_id: &str) -> Result<usize>;
    async fn set_phase(&mut self, tls_id: &str, phase: usize) -> Result<()>;

    async fn lane_halting_number(&mut self, lane_id: &str) -> Result<u32>;
    async fn lane_waiting_time(&mut self, lane_id: &str) -> Result<f64>;

    async fn colliding_vehicles_number(&mut self) -> Result<u32>;
    async fn vehicle_ids(&mut self) -> Result<Vec<String>>;
    async fn vehicle_speed(&mut self, vehicle_id: &str) -> Result<f64>;
    async fn vehicle_waiting_time(&mut self, vehicle_id: &str) -> Result<f64>;

    /// 每一步的秒數
    async fn delta_t(&mut self) -> Result<f64>;
    async fn min_expected_number(&mut self) -> Result<u32>;
}
