//! Pick the next eligible key given a scheduling strategy.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    config::{KeyDescriptor, ModelMapping, Resolution},
    ledger::Ledger,
    prelude::*,
};

/// The three scheduling strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastLoaded,
    Sequential,
}

/// Produces an ordered preference list of candidate keys for the Dispatcher
/// to try, given the current strategy.
///
/// The rotation cursor is the only piece of cross-request mutable state
/// besides the Ledger, so it gets the same rigor: a single `AtomicUsize`
/// advanced with `fetch_add`.
pub struct Selector {
    strategy: Strategy,
    cursor: AtomicUsize,
}

impl Selector {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Build the ordered candidate list for one request.
    ///
    /// `keys` must be in stable config order (provider order, then key order
    /// within a provider); the caller (normally [`crate::state::AppState`])
    /// is responsible for that ordering; the Selector only reorders it
    /// according to `self.strategy`.
    pub fn candidates(
        &self,
        keys: &[Arc<KeyDescriptor>],
        ledger: &Ledger,
        models: &ModelMapping,
        unified_model: &str,
        forced_provider: Option<&str>,
    ) -> Vec<Arc<KeyDescriptor>> {
        let filtered: Vec<Arc<KeyDescriptor>> = keys
            .iter()
            .filter(|key| key.provider.enabled)
            .filter(|key| match forced_provider {
                Some(provider) => key.provider.id == provider,
                None => true,
            })
            .filter(|key| {
                !matches!(
                    models.resolve(unified_model, &key.provider.id),
                    Resolution::NotSupported
                )
            })
            .cloned()
            .collect();

        match self.strategy {
            Strategy::Sequential => filtered,
            Strategy::RoundRobin => self.round_robin_order(filtered),
            Strategy::LeastLoaded => self.least_loaded_order(filtered, ledger),
        }
    }

    /// Advance the shared cursor by one and rotate `keys` to start there,
    /// wrapping around.
    fn round_robin_order(&self, keys: Vec<Arc<KeyDescriptor>>) -> Vec<Arc<KeyDescriptor>> {
        if keys.is_empty() {
            return keys;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % keys.len();
        let mut ordered = Vec::with_capacity(keys.len());
        ordered.extend_from_slice(&keys[start..]);
        ordered.extend_from_slice(&keys[..start]);
        ordered
    }

    /// Sort by `min(requests_remaining / RPM, tokens_remaining / TPM)`
    /// descending; ties broken by absolute `tokens_remaining` descending,
    /// then by config order (stable sort preserves the incoming order).
    fn least_loaded_order(
        &self,
        keys: Vec<Arc<KeyDescriptor>>,
        ledger: &Ledger,
    ) -> Vec<Arc<KeyDescriptor>> {
        let mut scored: Vec<(f64, u32, Arc<KeyDescriptor>)> = keys
            .into_iter()
            .map(|key| {
                let peek = ledger.peek(&key);
                let score = f64::min(
                    peek.requests_remaining as f64 / key.requests_per_minute as f64,
                    peek.tokens_remaining as f64 / key.tokens_per_minute as f64,
                );
                (score, peek.tokens_remaining, key)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.cmp(&a.1))
        });
        scored.into_iter().map(|(_, _, key)| key).collect()
    }
}
