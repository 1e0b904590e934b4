use crate::domain::ports::Storage;
use crate::utils::error::{Result, TrafficError};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const QTABLE_FORMAT_VERSION: u32 = 1;

/// 表格式 Q 函數：狀態鍵 -> 每個動作的 Q 值
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QTable {
    rows: BTreeMap<String, Vec<f64>>,
}

impl QTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn states(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.rows.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn row(&self, key: &str) -> Option<&[f64]> {
        self.rows.get(key).map(Vec::as_slice)
    }

    pub fn ensure_row(&mut self, key: &str, n_actions: usize) {
        if !self.rows.contains_key(key) {
            self.rows.insert(key.to_string(), vec![0.0; n_actions]);
        }
    }

    /// epsilon-greedy；未見過的狀態一律隨機，最大值平手時隨機挑一個
    pub fn choose_action<R: Rng + ?Sized>(
        &self,
        key: &str,
        n_actions: usize,
        epsilon: f64,
        rng: &mut R,
    ) -> usize {
        if rng.gen::<f64>() < epsilon {
            return rng.gen_range(0..n_actions);
        }
        match self.rows.get(key) {
            Some(row) if !row.is_empty() => {
                let best = best_actions(row);
                best.choose(rng).copied().unwrap_or(0)
            }
            _ => rng.gen_range(0..n_actions),
        }
    }

    /// 評估用：第一個最大值
    pub fn greedy_action<R: Rng + ?Sized>(&self, key: &str, n_actions: usize, rng: &mut R) -> usize {
        match self.rows.get(key) {
            Some(row) if !row.is_empty() => best_actions(row).first().copied().unwrap_or(0),
            _ => rng.gen_range(0..n_actions),
        }
    }

    pub fn max_q(&self, key: &str) -> f64 {
        self.rows
            .get(key)
            .and_then(|row| row.iter().copied().reduce(f64::max))
            .unwrap_or(0.0)
    }

    pub fn update(
        &mut self,
        key: &str,
        action: usize,
        reward: f64,
        next_key: &str,
        alpha: f64,
        gamma: f64,
    ) -> Result<f64> {
        let next_max = self.max_q(next_key);
        let q = self.value_mut(key, action)?;
        *q += alpha * (reward + gamma * next_max - *q);
        Ok(*q)
    }

    /// 回合中止（例如碰撞）時沒有下一個狀態
    pub fn terminal_update(&mut self, key: &str, action: usize, reward: f64, alpha: f64) -> Result<f64> {
        let q = self.value_mut(key, action)?;
        *q += alpha * (reward - *q);
        Ok(*q)
    }

    fn value_mut(&mut self, key: &str, action: usize) -> Result<&mut f64> {
        self.rows
            .get_mut(key)
            .and_then(|row| row.get_mut(action))
            .ok_or_else(|| TrafficError::ProcessingError {
                message: format!("No Q-value for state '{}' action {}", key, action),
            })
    }

    /// 每一列的動作數；不一致時回傳 None
    pub fn action_count(&self) -> Option<usize> {
        let mut counts = self.rows.values().map(Vec::len);
        let first = counts.next()?;
        counts.all(|c| c == first).then_some(first)
    }
}

fn best_actions(row: &[f64]) -> Vec<usize> {
    let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    row.iter()
        .enumerate()
        .filter(|(_, &q)| q == max)
        .map(|(i, _)| i)
        .collect()
}

/// 多個代理人的 Q 表，依號誌 id（或聯合代理人名稱）索引
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QTableSet {
    pub version: u32,
    pub saved_at: Option<DateTime<Utc>>,
    pub episodes: usize,
    pub tables: BTreeMap<String, QTable>,
}

impl QTableSet {
    pub fn new() -> Self {
        Self {
            version: QTABLE_FORMAT_VERSION,
            ..Default::default()
        }
    }

    pub fn table(&self, name: &str) -> Option<&QTable> {
        self.tables.get(name)
    }

    pub fn table_mut(&mut self, name: &str) -> &mut QTable {
        self.tables.entry(name.to_string()).or_default()
    }

    pub fn state_count(&self) -> usize {
        self.tables.values().map(QTable::len).sum()
    }

    pub async fn load<S: Storage>(storage: &S, path: &str) -> Result<Self> {
        if !storage.exists(path) {
            return Err(TrafficError::QTableNotFound {
                path: path.to_string(),
            });
        }
        let data = storage.read_file(path).await?;
        let set: QTableSet = serde_json::from_slice(&data)?;
        if set.version != QTABLE_FORMAT_VERSION {
            return Err(TrafficError::QTableMismatch {
                table: path.to_string(),
                message: format!(
                    "unsupported format version {} (expected {})",
                    set.version, QTABLE_FORMAT_VERSION
                ),
            });
        }
        Ok(set)
    }

    /// 訓練用：檔案不存在就從空表開始
    pub async fn load_or_new<S: Storage>(storage: &S, path: &str) -> Result<Self> {
        match Self::load(storage, path).await {
            Ok(set) => {
                tracing::info!(
                    "📂 Loaded Q-tables from {} ({} tables, {} states)",
                    path,
                    set.tables.len(),
                    set.state_count()
                );
                Ok(set)
            }
            Err(TrafficError::QTableNotFound { .. }) => Ok(Self::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn save<S: Storage>(&mut self, storage: &S, path: &str) -> Result<()> {
        self.saved_at = Some(Utc::now());
        let data = serde_json::to_vec_pretty(self)?;
        storage.write_file(path, &data).await?;
        tracing::debug!("Saved Q-tables to {} ({} bytes)", path, data.len());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpsilonSchedule {
    pub start: f64,
    pub end: f64,
    pub decay: f64,
}

impl EpsilonSchedule {
    pub fn next(&self, epsilon: f64) -> f64 {
        (epsilon * self.decay).max(self.end)
    }
}

impl Default for EpsilonSchedule {
    fn default() -> Self {
        Self {
            start: 1.0,
            end: 0.05,
            decay: 0.995,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_update_formula() {
        let mut table = QTable::new();
        table.ensure_row("0,1", 2);
        table.ensure_row("1,1", 2);
        table.terminal_update("1,1", 1, 10.0, 1.0).unwrap();

        // 0 + 0.5 * (1 + 0.9 * 10 - 0) = 5
        let q = table.update("0,1", 0, 1.0, "1,1", 0.5, 0.9).unwrap();
        assert!((q - 5.0).abs() < 1e-9);
        assert_eq!(table.row("0,1").unwrap(), &[5.0, 0.0]);
    }

    #[test]
    fn test_terminal_update() {
        let mut table = QTable::new();
        table.ensure_row("s", 3);
        let q = table.terminal_update("s", 2, -50.0, 0.2).unwrap();
        assert!((q + 10.0).abs() < 1e-9);
        assert!(table.terminal_update("missing", 0, 1.0, 0.2).is_err());
    }

    #[test]
    fn test_ensure_row_keeps_existing_values() {
        let mut table = QTable::new();
        table.ensure_row("s", 2);
        table.terminal_update("s", 0, 4.0, 1.0).unwrap();
        table.ensure_row("s", 2);
        assert_eq!(table.row("s").unwrap(), &[4.0, 0.0]);
    }

    #[test]
    fn test_greedy_choice_and_ties() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut table = QTable::new();
        table.ensure_row("s", 4);
        table.terminal_update("s", 1, 3.0, 1.0).unwrap();
        table.terminal_update("s", 3, 3.0, 1.0).unwrap();

        assert_eq!(table.greedy_action("s", 4, &mut rng), 1);

        let mut picked = std::collections::HashSet::new();
        for _ in 0..100 {
            let a = table.choose_action("s", 4, 0.0, &mut rng);
            assert!(a == 1 || a == 3);
            picked.insert(a);
        }
        assert_eq!(picked.len(), 2, "ties should be broken randomly");
    }

    #[test]
    fn test_unknown_state_is_random_and_in_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let table = QTable::new();
        for _ in 0..50 {
            assert!(table.choose_action("nope", 3, 0.0, &mut rng) < 3);
            assert!(table.greedy_action("nope", 3, &mut rng) < 3);
        }
    }

    #[test]
    fn test_epsilon_schedule() {
        let schedule = EpsilonSchedule {
            start: 1.0,
            end: 0.05,
            decay: 0.5,
        };
        assert_eq!(schedule.next(1.0), 0.5);
        assert_eq!(schedule.next(0.06), 0.05);
        assert_eq!(schedule.next(schedule.next(1.0)), 0.25);
    }

    #[test]
    fn test_action_count() {
        let mut table = QTable::new();
        assert_eq!(table.action_count(), None);
        table.ensure_row("a", 4);
        table.ensure_row("b", 4);
        assert_eq!(table.action_count(), Some(4));
        table.ensure_row("c", 2);
        assert_eq!(table.action_count(), None);
    }
}
