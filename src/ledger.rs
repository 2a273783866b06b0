//! Single source of truth for per-key remaining capacity.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};

use crate::{config::KeyDescriptor, prelude::*};

/// 60-second accounting window.
const WINDOW: Duration = Duration::from_secs(60);

/// `window_reset_at` is tracked as a monotonic [`Instant`] internally, since
/// that's what the refill comparison needs and it can't be stepped backwards
/// by a clock adjustment. `/status` has to report a wall-clock instant
/// instead, so this converts the remaining duration into one, anchored to
/// the wall-clock time of the caller's own `Utc::now()`.
fn std_duration_to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_default()
}

/// Mutable runtime state co-located with a [`KeyDescriptor`].
#[derive(Debug, Clone, Copy)]
pub struct KeyState {
    pub requests_remaining: u32,
    pub tokens_remaining: u32,
    pub window_reset_at: Instant,
    pub cooldown_until: Instant,
}

impl KeyState {
    fn fresh(rpm: u32, tpm: u32, now: Instant) -> Self {
        Self {
            requests_remaining: rpm,
            tokens_remaining: tpm,
            window_reset_at: now + WINDOW,
            cooldown_until: now,
        }
    }

    /// `is_available` is derived: both counters positive, and not cooling
    /// down.
    pub fn is_available(&self, now: Instant) -> bool {
        self.requests_remaining > 0 && self.tokens_remaining > 0 && self.cooldown_until <= now
    }
}

/// Why a key is being penalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PenaltyReason {
    Http429,
    Http5xx,
    NetworkError,
}

/// Why [`Ledger::try_reserve`] failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsufficientCapacity;

/// An ephemeral debit against a [`KeyState`].
///
/// Dispatcher holds only these handles; the Ledger exclusively owns all
/// [`KeyState`] objects.
#[derive(Debug)]
pub struct Reservation {
    provider_id: String,
    key_name: String,
    pub requests_debited: u32,
    pub tokens_estimated: u32,
    settled: bool,
}

impl Reservation {
    pub fn key_identity(&self) -> (&str, &str) {
        (&self.provider_id, &self.key_name)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            // A reservation dropped mid-call without settle()/release() is
            // the cancellation path: the inbound client disconnected or
            // the Batch Coordinator gave up on this item. We cannot know how
            // many tokens the provider actually consumed, so the request and
            // the full token estimate stay debited, exactly what an
            // explicit `settle(estimate)` would have done. No counters need
            // adjusting here; this arm only exists to record that it happened.
            debug!(
                provider = %self.provider_id,
                key = %self.key_name,
                "reservation dropped uncompleted, treated as settled at estimate"
            );
        }
    }
}

/// A lightweight, read-only view of a key's current counters, used by the
/// Selector's `least_loaded` scoring and by `/status`.
#[derive(Debug, Clone, Copy)]
pub struct KeyPeek {
    pub requests_remaining: u32,
    pub tokens_remaining: u32,
}

/// Per-key status row returned by [`Ledger::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    pub provider: String,
    pub key_name: String,
    pub requests_remaining: u32,
    pub requests_limit: u32,
    pub tokens_remaining: u32,
    pub tokens_limit: u32,
    pub reset_at: DateTime<Utc>,
    pub is_available: bool,
}

struct Entry {
    rpm: u32,
    tpm: u32,
    state: Mutex<KeyState>,
}

/// Implements a mutex per [`KeyState`]
/// guarding refill+check+debit as one critical section, plus a shared
/// condition variable that wakes RESERVE waiters when any key gains
/// capacity.
pub struct Ledger {
    entries: Mutex<HashMap<(String, String), Arc<Entry>>>,
    waiters: Mutex<()>,
    notify: Condvar,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            waiters: Mutex::new(()),
            notify: Condvar::new(),
        }
    }

    /// Register every key this ledger will be asked about. Idempotent.
    pub fn ensure_registered(&self, key: &KeyDescriptor) {
        let id = Self::identity(key);
        let mut entries = self.entries.lock();
        entries.entry(id).or_insert_with(|| {
            Arc::new(Entry {
                rpm: key.requests_per_minute,
                tpm: key.tokens_per_minute,
                state: Mutex::new(KeyState::fresh(
                    key.requests_per_minute,
                    key.tokens_per_minute,
                    Instant::now(),
                )),
            })
        });
    }

    fn identity(key: &KeyDescriptor) -> (String, String) {
        (key.provider.id.clone(), key.name.clone())
    }

    fn entry(&self, key: &KeyDescriptor) -> Arc<Entry> {
        self.ensure_registered(key);
        self.entries.lock()[&Self::identity(key)].clone()
    }

    /// Idempotent; if `now >= window_reset_at`, reset counters to RPM/TPM and
    /// advance `window_reset_at` to `now + 60s`.
    fn refill_if_due(entry: &Entry, state: &mut KeyState, now: Instant) {
        if now >= state.window_reset_at {
            state.requests_remaining = entry.rpm;
            state.tokens_remaining = entry.tpm;
            state.window_reset_at = now + WINDOW;
        }
    }

    /// Atomic with respect to refill: refill, then require
    /// capacity, then debit, all under one lock.
    pub fn try_reserve(
        &self,
        key: &KeyDescriptor,
        estimated_tokens: u32,
    ) -> Result<Reservation, InsufficientCapacity> {
        let entry = self.entry(key);
        let now = Instant::now();
        let mut state = entry.state.lock();
        Self::refill_if_due(&entry, &mut state, now);

        if state.cooldown_until > now
            || state.requests_remaining < 1
            || state.tokens_remaining < estimated_tokens
        {
            return Err(InsufficientCapacity);
        }

        state.requests_remaining -= 1;
        state.tokens_remaining -= estimated_tokens;

        Ok(Reservation {
            provider_id: key.provider.id.clone(),
            key_name: key.name.clone(),
            requests_debited: 1,
            tokens_estimated: estimated_tokens,
            settled: false,
        })
    }

    /// Credit `(estimated - actual)` back to `tokens_remaining`, clamped into
    /// `[0, TPM]`. `requests_remaining` is not credited back.
    pub fn settle(&self, key: &KeyDescriptor, mut reservation: Reservation, actual_tokens: u32) {
        let entry = self.entry(key);
        {
            let mut state = entry.state.lock();
            let delta = reservation.tokens_estimated as i64 - actual_tokens as i64;
            let refunded = state.tokens_remaining as i64 + delta;
            state.tokens_remaining = refunded.clamp(0, entry.tpm as i64) as u32;
        }
        reservation.settled = true;
        self.wake_waiters();
    }

    /// Credit both the full estimate and the request back; used when
    /// the upstream call never left (e.g. model-unsupported short-circuit).
    pub fn release(&self, key: &KeyDescriptor, mut reservation: Reservation) {
        let entry = self.entry(key);
        {
            let mut state = entry.state.lock();
            state.tokens_remaining =
                (state.tokens_remaining + reservation.tokens_estimated).min(entry.tpm);
            state.requests_remaining = (state.requests_remaining + 1).min(entry.rpm);
        }
        reservation.settled = true;
        self.wake_waiters();
    }

    /// Put a key into cool-down. Reasons and default durations:
    /// `http_429` (server-advised `retry_after` if present, else 30s),
    /// `http_5xx` (`backoff_secs`, intended to escalate up to 60s on
    /// repeats), `network_error` (5s).
    pub fn penalize(&self, key: &KeyDescriptor, reason: PenaltyReason, duration: Duration) {
        let entry = self.entry(key);
        let now = Instant::now();
        let mut state = entry.state.lock();
        let until = now + duration;
        if until > state.cooldown_until {
            state.cooldown_until = until;
        }
        debug!(
            provider = %key.provider.id,
            key = %key.name,
            reason = ?reason,
            duration_secs = duration.as_secs_f64(),
            "key penalized"
        );
    }

    /// Read-only peek at a key's current counters, refilling first if due.
    /// Does not debit anything.
    pub fn peek(&self, key: &KeyDescriptor) -> KeyPeek {
        let entry = self.entry(key);
        let now = Instant::now();
        let mut state = entry.state.lock();
        Self::refill_if_due(&entry, &mut state, now);
        KeyPeek {
            requests_remaining: state.requests_remaining,
            tokens_remaining: state.tokens_remaining,
        }
    }

    /// Is this key currently available (refilling first if due)?
    pub fn is_available(&self, key: &KeyDescriptor) -> bool {
        let entry = self.entry(key);
        let now = Instant::now();
        let mut state = entry.state.lock();
        Self::refill_if_due(&entry, &mut state, now);
        state.is_available(now)
    }

    /// Block the calling thread until either `timeout` elapses or some key
    /// gains capacity (a settle, a refill, or a penalty expiry). A waiter
    /// blocked here must be woken within one second of capacity becoming
    /// available; in practice the wake comes directly from
    /// [`Ledger::settle`]/[`Ledger::release`]; the bounded wait below is the
    /// backstop for refills and cool-down expiries, which don't call back
    /// into the ledger on their own.
    pub fn wait_for_capacity(&self, timeout: Duration) {
        let mut guard = self.waiters.lock();
        self.notify.wait_for(&mut guard, timeout.min(Duration::from_secs(1)));
    }

    fn wake_waiters(&self) {
        let _guard = self.waiters.lock();
        self.notify.notify_all();
    }

    /// `/status` payload.
    pub fn snapshot(&self) -> Vec<KeyStatus> {
        let entries = self.entries.lock();
        let now = Instant::now();
        let wall_now = Utc::now();
        let mut rows: Vec<KeyStatus> = entries
            .iter()
            .map(|((provider, key_name), entry)| {
                let mut state = entry.state.lock();
                Self::refill_if_due(entry, &mut state, now);
                let until_reset = state.window_reset_at.saturating_duration_since(now);
                KeyStatus {
                    provider: provider.clone(),
                    key_name: key_name.clone(),
                    requests_remaining: state.requests_remaining,
                    requests_limit: entry.rpm,
                    tokens_remaining: state.tokens_remaining,
                    tokens_limit: entry.tpm,
                    reset_at: wall_now + std_duration_to_chrono(until_reset),
                    is_available: state.is_available(now),
                }
            })
            .collect();
        rows.sort_by(|a, b| (&a.provider, &a.key_name).cmp(&(&b.provider, &b.key_name)));
        rows
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderDescriptor;

    fn key(rpm: u32, tpm: u32) -> KeyDescriptor {
        KeyDescriptor {
            provider: Arc::new(ProviderDescriptor {
                id: "cerebras".to_string(),
                base_url: "https://example.test".to_string(),
                chat_path: "/chat/completions".to_string(),
                enabled: true,
            }),
            name: "k1".to_string(),
            api_key: "secret".to_string(),
            requests_per_minute: rpm,
            tokens_per_minute: tpm,
        }
    }

    #[test]
    fn snapshot_reports_reset_at_within_the_window() {
        let ledger = Ledger::new();
        let key = key(5, 500);
        ledger.ensure_registered(&key);
        let before = Utc::now();
        let rows = ledger.snapshot();
        let row = rows.iter().find(|r| r.key_name == "k1").unwrap();
        assert!(row.reset_at > before);
        assert!(row.reset_at <= before + chrono::Duration::seconds(61));
    }

    /// Non-negative accounting holds after any sequence of operations.
    #[test]
    fn non_negative_accounting_after_mixed_operations() {
        let ledger = Ledger::new();
        let key = key(5, 500);
        let mut reservations = Vec::new();
        for _ in 0..5 {
            reservations.push(ledger.try_reserve(&key, 100).unwrap());
        }
        assert!(ledger.try_reserve(&key, 1).is_err());
        for (i, reservation) in reservations.into_iter().enumerate() {
            ledger.settle(&key, reservation, if i % 2 == 0 { 120 } else { 50 });
        }
        let peek = ledger.peek(&key);
        assert!(peek.requests_remaining <= 5);
        assert!(peek.tokens_remaining <= 500);
    }

    /// Refill is idempotent within the window.
    #[test]
    fn refill_idempotent_within_window() {
        let ledger = Ledger::new();
        let key = key(5, 500);
        let reservation = ledger.try_reserve(&key, 10).unwrap();
        let after_reserve = ledger.peek(&key);
        ledger.release(&key, reservation);
        let after_release = ledger.peek(&key);
        assert_ne!(
            after_reserve.requests_remaining,
            after_release.requests_remaining
        );
        let again = ledger.peek(&key);
        assert_eq!(again.requests_remaining, after_release.requests_remaining);
        assert_eq!(again.tokens_remaining, after_release.tokens_remaining);
    }

    /// A release round-trip restores both counters exactly.
    #[test]
    fn release_round_trip_restores_counters() {
        let ledger = Ledger::new();
        let key = key(5, 500);
        let before = ledger.peek(&key);
        let reservation = ledger.try_reserve(&key, 42).unwrap();
        ledger.release(&key, reservation);
        let after = ledger.peek(&key);
        assert_eq!(before.requests_remaining, after.requests_remaining);
        assert_eq!(before.tokens_remaining, after.tokens_remaining);
    }

    /// Settling conserves the debited counters.
    #[test]
    fn settle_conserves_debited_counters() {
        let ledger = Ledger::new();
        let key = key(5, 500);
        let before = ledger.peek(&key);
        let reservation = ledger.try_reserve(&key, 100).unwrap();
        ledger.settle(&key, reservation, 60);
        let after = ledger.peek(&key);
        assert_eq!(after.tokens_remaining, before.tokens_remaining - 60);
        assert_eq!(after.requests_remaining, before.requests_remaining - 1);
    }

    #[test]
    fn settle_clamps_when_actual_exceeds_estimate() {
        let ledger = Ledger::new();
        let key = key(5, 100);
        let reservation = ledger.try_reserve(&key, 50).unwrap();
        // Actual usage came in higher than our estimate.
        ledger.settle(&key, reservation, 200);
        let after = ledger.peek(&key);
        assert_eq!(after.tokens_remaining, 0);
    }

    #[test]
    fn penalize_makes_key_unavailable() {
        let ledger = Ledger::new();
        let key = key(5, 500);
        assert!(ledger.is_available(&key));
        ledger.penalize(&key, PenaltyReason::Http429, Duration::from_millis(50));
        assert!(!ledger.is_available(&key));
        std::thread::sleep(Duration::from_millis(80));
        assert!(ledger.is_available(&key));
    }

    #[test]
    fn try_reserve_fails_when_tokens_insufficient() {
        let ledger = Ledger::new();
        let key = key(5, 10);
        assert!(ledger.try_reserve(&key, 11).is_err());
        assert!(ledger.try_reserve(&key, 10).is_ok());
    }

    #[test]
    fn wait_for_capacity_wakes_on_release() {
        use std::sync::Barrier;
        let ledger = Arc::new(Ledger::new());
        let key = key(1, 100);
        let reservation = ledger.try_reserve(&key, 10).unwrap();
        assert!(ledger.try_reserve(&key, 1).is_err());

        let barrier = Arc::new(Barrier::new(2));
        let ledger_clone = ledger.clone();
        let barrier_clone = barrier.clone();
        let waiter = std::thread::spawn(move || {
            barrier_clone.wait();
            ledger_clone.wait_for_capacity(Duration::from_secs(5));
        });

        barrier.wait();
        std::thread::sleep(Duration::from_millis(50));
        ledger.release(&key, reservation);
        waiter.join().unwrap();
        assert!(ledger.try_reserve(&key, 1).is_ok());
    }
}
