use serde::{Deserialize, Serialize};
use std::fmt;

/// 一個號誌時相：持續時間與每條連結的燈號字元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDef {
    pub duration: f64,
    pub state: String,
    pub min_duration: f64,
    pub max_duration: f64,
    pub name: String,
}

impl PhaseDef {
    pub fn new(duration: f64, state: impl Into<String>) -> Self {
        Self {
            duration,
            state: state.into(),
            min_duration: duration,
            max_duration: duration,
            name: String::new(),
        }
    }

    /// `G` (優先綠燈) 與 `g` (讓行綠燈) 都算綠燈
    pub fn is_green_for(&self, link_index: usize) -> bool {
        matches!(self.state.as_bytes().get(link_index), Some(b'G') | Some(b'g'))
    }
}

/// 號誌的完整紅黃綠定義（第一個 logic）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsProgram {
    pub program_id: String,
    pub current_phase: usize,
    pub phases: Vec<PhaseDef>,
}

impl TlsProgram {
    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::North,
        Direction::South,
        Direction::East,
        Direction::West,
    ];

    pub fn is_north_south(self) -> bool {
        matches!(self, Direction::North | Direction::South)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direction::North => "N",
            Direction::South => "S",
            Direction::East => "E",
            Direction::West => "W",
        };
        f.write_str(s)
    }
}

/// 車種編號沿用 CSV 的 `NewNumber` 欄位：1 柴油、2 汽油、3 電動
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VehicleType {
    Diesel,
    Gasoline,
    Electric,
}

impl VehicleType {
    pub fn code(self) -> u8 {
        match self {
            VehicleType::Diesel => 1,
            VehicleType::Gasoline => 2,
            VehicleType::Electric => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(VehicleType::Diesel),
            2 => Some(VehicleType::Gasoline),
            3 => Some(VehicleType::Electric),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            VehicleType::Diesel => "Diesel",
            VehicleType::Gasoline => "Gasoline",
            VehicleType::Electric => "Electric",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleStopRecord {
    #[serde(rename = "VehicleID")]
    pub vehicle_id: String,
    #[serde(rename = "StoppedTime(s)")]
    pub stopped_time: f64,
    #[serde(rename = "NewNumber")]
    pub vehicle_type: u8,
}

/// 一個回合的訓練結果，也是 training log CSV 的一列
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub episode: usize,
    pub total_reward: f64,
    pub epsilon: f64,
    pub steps: usize,
    pub avg_wait: f64,
    pub vehicles: usize,
    pub collided: bool,
}

/// 非學習模式（貪婪、固定時制、模糊控制）的評估結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub controller: String,
    pub steps: usize,
    pub vehicles: usize,
    pub average_wait: f64,
    pub total_stopped_time: f64,
}
