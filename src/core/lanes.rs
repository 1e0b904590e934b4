use crate::domain::model::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneOrder {
    /// 依號誌回報的連結順序
    #[default]
    Insertion,
    Sorted,
}

pub fn unique_lanes(lanes: &[String], order: LaneOrder) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut unique: Vec<String> = lanes
        .iter()
        .filter(|l| seen.insert(l.as_str()))
        .cloned()
        .collect();

    if order == LaneOrder::Sorted {
        unique.sort();
    }
    unique
}

/// 車道 id 的 edge 部分（最後一個 `_` 之前）
fn edge_id(lane_id: &str) -> &str {
    lane_id.rsplit_once('_').map(|(edge, _)| edge).unwrap_or(lane_id)
}

pub fn direction_of(lane_id: &str) -> Direction {
    let edge = edge_id(lane_id);
    if edge.starts_with('-') || edge.contains('0') {
        Direction::North
    } else if edge.contains('1') {
        Direction::South
    } else if edge.contains('2') {
        Direction::East
    } else {
        Direction::West
    }
}

/// 依方向分組，固定 N/S/E/W 順序，空組省略
pub fn group_lanes(lanes: &[String]) -> Vec<(Direction, Vec<String>)> {
    Direction::ALL
        .iter()
        .filter_map(|&dir| {
            let members: Vec<String> = lanes
                .iter()
                .filter(|l| direction_of(l) == dir)
                .cloned()
                .collect();
            (!members.is_empty()).then_some((dir, members))
        })
        .collect()
}

pub fn link_index(controlled: &[String], lane_id: &str) -> Option<usize> {
    controlled.iter().position(|l| l == lane_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lanes(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unique_lanes_preserves_first_seen_order() {
        let controlled = lanes(&["E2_0", "-E0_0", "E2_0", "E1_0", "-E0_0"]);
        assert_eq!(
            unique_lanes(&controlled, LaneOrder::Insertion),
            lanes(&["E2_0", "-E0_0", "E1_0"])
        );
        assert_eq!(
            unique_lanes(&controlled, LaneOrder::Sorted),
            lanes(&["-E0_0", "E1_0", "E2_0"])
        );
    }

    #[test]
    fn test_direction_heuristic_uses_edge_part() {
        assert_eq!(direction_of("-E0_0"), Direction::North);
        assert_eq!(direction_of("E0_1"), Direction::North);
        assert_eq!(direction_of("E1_0"), Direction::South);
        assert_eq!(direction_of("E2_0"), Direction::East);
        assert_eq!(direction_of("E3_0"), Direction::West);
        assert_eq!(direction_of("westbound"), Direction::West);
    }

    #[test]
    fn test_group_lanes_orders_groups() {
        let groups = group_lanes(&lanes(&["E3_0", "E1_0", "-E0_0", "E1_1"]));
        let dirs: Vec<Direction> = groups.iter().map(|(d, _)| *d).collect();
        assert_eq!(dirs, vec![Direction::North, Direction::South, Direction::West]);
        assert_eq!(groups[1].1, lanes(&["E1_0", "E1_1"]));
    }

    #[test]
    fn test_link_index() {
        let controlled = lanes(&["-E0_0", "-E0_0", "E1_0"]);
        assert_eq!(link_index(&controlled, "E1_0"), Some(2));
        assert_eq!(link_index(&controlled, "-E0_0"), Some(0));
        assert_eq!(link_index(&controlled, "E9_0"), None);
    }
}
