use serde::{Deserialize, Serialize};

/// 停等車數的分箱門檻，例如 `[0, 1, 3]` 代表 0、1、2-3、4+
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBins(Vec<u32>);

impl StateBins {
    pub fn new(thresholds: Vec<u32>) -> Self {
        Self(thresholds)
    }

    pub fn thresholds(&self) -> &[u32] {
        &self.0
    }

    /// 第一個 `count <= t` 的門檻索引，超過全部門檻時為 `len`
    pub fn bin(&self, count: u32) -> usize {
        self.0
            .iter()
            .position(|&t| count <= t)
            .unwrap_or(self.0.len())
    }
}

impl Default for StateBins {
    fn default() -> Self {
        Self(vec![0, 1, 3])
    }
}

pub fn state_key(state: &[usize]) -> String {
    state
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bins() {
        let bins = StateBins::default();
        assert_eq!(bins.bin(0), 0);
        assert_eq!(bins.bin(1), 1);
        assert_eq!(bins.bin(2), 2);
        assert_eq!(bins.bin(3), 2);
        assert_eq!(bins.bin(4), 3);
        assert_eq!(bins.bin(250), 3);
    }

    #[test]
    fn test_granular_bins() {
        let bins = StateBins::new(vec![0, 2, 5, 10, 15]);
        assert_eq!(bins.bin(5), 2);
        assert_eq!(bins.bin(11), 4);
        assert_eq!(bins.bin(16), 5);
    }

    #[test]
    fn test_state_key() {
        assert_eq!(state_key(&[0, 2, 1]), "0,2,1");
        assert_eq!(state_key(&[]), "");
    }
}
