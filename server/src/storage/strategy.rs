//! Placement strategies.
//!
//! A strategy decides which back-end of a cache receives the next write.
//! Strategies are pure: the multiplexer snapshots per-back-end usage and
//! the strategy picks an index from the snapshot and its mutable state.
//! The state round-trips through the cache descriptor as JSON.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use displaydoc::Display;
use serde::{Deserialize, Serialize};

/// A placement strategy tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Rotate through the back-ends.
    RoundRobin,

    /// Always pick the first back-end that still has room.
    InOrder,

    /// Keep occupied bytes close to configured percentages.
    Split,

    /// Pick the back-end with the least occupied bytes.
    LeastUsed,
}

/// Mutable strategy state, persisted in the cache descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyState {
    /// Cursor of the round-robin strategy.
    #[serde(default)]
    pub index: usize,

    /// Target percentages of the split strategy, in back-end order.
    #[serde(default)]
    pub split: Vec<u64>,
}

/// Usage snapshot of one back-end.
#[derive(Debug, Clone, Copy)]
pub struct BackendUsage {
    pub used: u64,
    pub available: u64,
    pub full: bool,
}

/// A strategy failure.
#[derive(Debug, Display)]
pub enum StrategyError {
    /// All back-ends are full.
    AllFull,

    /// Split percentages do not cover every back-end.
    IncompleteSplit,
}

impl std::error::Error for StrategyError {}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::InOrder => "in-order",
            Self::Split => "split",
            Self::LeastUsed => "least-used",
        }
    }

    /// Picks the index of the back-end that receives the next write.
    pub fn pick(
        &self,
        usages: &[BackendUsage],
        state: &mut StrategyState,
    ) -> Result<usize, StrategyError> {
        match self {
            Self::RoundRobin => round_robin(usages, state),
            Self::InOrder => in_order(usages),
            Self::Split => split(usages, state),
            Self::LeastUsed => least_used(usages),
        }
    }
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "round-robin" => Ok(Self::RoundRobin),
            "in-order" => Ok(Self::InOrder),
            "split" => Ok(Self::Split),
            "least-used" => Ok(Self::LeastUsed),
            _ => Err(anyhow!("unknown storage strategy \"{}\"", s)),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn round_robin(
    usages: &[BackendUsage],
    state: &mut StrategyState,
) -> Result<usize, StrategyError> {
    let index = state.index % usages.len();
    state.index = index + 1;

    if usages[index].full {
        return in_order(usages);
    }

    Ok(index)
}

fn in_order(usages: &[BackendUsage]) -> Result<usize, StrategyError> {
    usages
        .iter()
        .position(|usage| !usage.full)
        .ok_or(StrategyError::AllFull)
}

fn split(usages: &[BackendUsage], state: &mut StrategyState) -> Result<usize, StrategyError> {
    if state.split.len() != usages.len() {
        return Err(StrategyError::IncompleteSplit);
    }

    let total_used: u64 = usages.iter().map(|usage| usage.used).sum();

    // Greatest deficit against the configured share wins. With nothing
    // written yet every normalized share is zero, so the largest target
    // percentage goes first.
    let mut best_delta = 0.0f64;
    let mut index = 0;

    for (i, usage) in usages.iter().enumerate() {
        let normalized = if total_used == 0 {
            0.0
        } else {
            usage.used as f64 / total_used as f64 * 100.0
        };

        let delta = state.split[i] as f64 - normalized;
        if delta > best_delta {
            best_delta = delta;
            index = i;
        }
    }

    if usages[index].full {
        return in_order(usages);
    }

    Ok(index)
}

fn least_used(usages: &[BackendUsage]) -> Result<usize, StrategyError> {
    let index = usages
        .iter()
        .enumerate()
        .min_by_key(|(_, usage)| usage.used)
        .map(|(i, _)| i)
        .expect("at least one back-end");

    if usages[index].full {
        return in_order(usages);
    }

    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(used: u64, full: bool) -> BackendUsage {
        BackendUsage {
            used,
            available: 1 << 30,
            full,
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let usages = vec![usage(0, false), usage(0, false), usage(0, false)];
        let mut state = StrategyState::default();

        let picks: Vec<usize> = (0..6)
            .map(|_| Strategy::RoundRobin.pick(&usages, &mut state).unwrap())
            .collect();

        assert_eq!(vec![0, 1, 2, 0, 1, 2], picks);
    }

    #[test]
    fn test_round_robin_full_falls_through_in_order() {
        let usages = vec![usage(0, true), usage(0, false)];
        let mut state = StrategyState::default();

        // Cursor points at the full back-end; the pick falls back to the
        // first non-full one.
        assert_eq!(1, Strategy::RoundRobin.pick(&usages, &mut state).unwrap());
        // Cursor still advanced past the full back-end.
        assert_eq!(1, Strategy::RoundRobin.pick(&usages, &mut state).unwrap());
    }

    #[test]
    fn test_in_order_all_full() {
        let usages = vec![usage(0, true), usage(0, true)];
        assert!(matches!(
            Strategy::InOrder.pick(&usages, &mut StrategyState::default()),
            Err(StrategyError::AllFull)
        ));
    }

    #[test]
    fn test_split_settles_on_shares() {
        // Two empty back-ends with a 70/30 split: ten 1 MB writes should
        // land 7 on the first and 3 on the second, give or take ordering.
        let mut used = vec![0u64, 0u64];
        let mut state = StrategyState {
            split: vec![70, 30],
            ..Default::default()
        };

        for _ in 0..10 {
            let usages: Vec<BackendUsage> = used.iter().map(|&u| usage(u, false)).collect();
            let index = Strategy::Split.pick(&usages, &mut state).unwrap();
            used[index] += 1 << 20;
        }

        let first = used[0] >> 20;
        assert!((6..=8).contains(&first), "first share was {}", first);
        assert_eq!(10, (used[0] + used[1]) >> 20);
    }

    #[test]
    fn test_split_requires_full_coverage() {
        let usages = vec![usage(0, false), usage(0, false)];
        let mut state = StrategyState {
            split: vec![100],
            ..Default::default()
        };

        assert!(matches!(
            Strategy::Split.pick(&usages, &mut state),
            Err(StrategyError::IncompleteSplit)
        ));
    }

    #[test]
    fn test_least_used() {
        let usages = vec![usage(500, false), usage(100, false), usage(300, false)];
        assert_eq!(
            1,
            Strategy::LeastUsed
                .pick(&usages, &mut StrategyState::default())
                .unwrap()
        );
    }

    #[test]
    fn test_serde_tags() {
        assert_eq!(
            Strategy::RoundRobin,
            serde_json::from_str::<Strategy>("\"round-robin\"").unwrap()
        );
        assert_eq!(
            "\"least-used\"",
            serde_json::to_string(&Strategy::LeastUsed).unwrap()
        );
    }
}
