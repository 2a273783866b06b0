//! Fans N independent chat requests out over the [`Dispatcher`] with bounded
//! parallelism.

use std::time::Instant;

use futures::{StreamExt, stream};

use crate::{dispatcher::Dispatcher, prelude::*, types::ChatRequest};

/// One failed position in a [`BatchOutcome`].
#[derive(Debug, Clone, Serialize)]
pub struct FailedItem {
    pub index: usize,
    pub error_message: String,
}

/// Aggregated result of a batch dispatch.
#[derive(Debug, Serialize)]
pub struct BatchOutcome {
    /// Aligned with input order; `null` at positions that failed.
    pub responses: Vec<Option<Value>>,
    pub failed: Vec<FailedItem>,
    pub total_time_ms: u128,
}

/// Executes a batch against a [`Dispatcher`]; stateless beyond the
/// Dispatcher reference it's given.
pub struct BatchCoordinator<'a> {
    dispatcher: &'a Dispatcher,
}

impl<'a> BatchCoordinator<'a> {
    pub fn new(dispatcher: &'a Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Run `requests` concurrently, oversubscribing the key pool by 2x
    /// If `wait_for_all` is false, return as soon as a majority
    /// (>50%) of positions have completed; the remainder are cancelled by
    /// dropping their still-in-flight futures, which settles their
    /// reservations at the pre-call estimate (see [`crate::ledger::Reservation`]).
    #[instrument(level = "debug", skip_all, fields(count = requests.len(), wait_for_all))]
    pub async fn handle(&self, requests: Vec<ChatRequest>, wait_for_all: bool) -> BatchOutcome {
        let total = requests.len();
        let concurrency = (self.dispatcher.total_keys() * 2).max(1);
        let majority = total / 2 + 1;
        let start = Instant::now();

        let mut responses: Vec<Option<Value>> = vec![None; total];
        let mut failed = Vec::new();
        let mut completed = 0usize;

        let mut in_flight = stream::iter(requests.into_iter().enumerate().map(|(index, request)| {
            let dispatcher = self.dispatcher;
            async move { (index, dispatcher.handle(request).await) }
        }))
        .buffer_unordered(concurrency);

        while let Some((index, result)) = in_flight.next().await {
            completed += 1;
            match result {
                Ok(response) => responses[index] = Some(response.into_json()),
                Err(error) => failed.push(FailedItem {
                    index,
                    error_message: error.to_string(),
                }),
            }
            if !wait_for_all && total > 0 && completed >= majority {
                info!(completed, total, "batch returning early after majority completed");
                break;
            }
        }

        BatchOutcome {
            responses,
            failed,
            total_time_ms: start.elapsed().as_millis(),
        }
    }
}
