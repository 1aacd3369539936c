//! Adapter selection strategies.

use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::types::AdapterId;

/// Picks one adapter among the live candidates registered for a key.
pub trait AdapterSelector: Send + Sync + std::fmt::Debug {
    fn select(&self, key: &str, candidates: &[AdapterId]) -> Option<AdapterId>;

    fn name(&self) -> &'static str;
}

/// Uniform random choice. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSelector;

impl AdapterSelector for RandomSelector {
    fn select(&self, _key: &str, candidates: &[AdapterId]) -> Option<AdapterId> {
        candidates.choose(&mut rand::thread_rng()).cloned()
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Cycles through candidates, one cursor per routing key.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    cursors: Mutex<HashMap<String, usize>>,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AdapterSelector for RoundRobinSelector {
    fn select(&self, key: &str, candidates: &[AdapterId]) -> Option<AdapterId> {
        if candidates.is_empty() {
            return None;
        }
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        let cursor = cursors.entry(key.to_string()).or_insert(0);
        let picked = candidates[*cursor % candidates.len()].clone();
        *cursor = cursor.wrapping_add(1);
        Some(picked)
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
