//! Wires [`Config`], the [`Ledger`] and the [`Dispatcher`] into the single
//! object shared across axum handlers via `State<Arc<AppState>>`.

use crate::{config::Config, dispatcher::Dispatcher, ledger::Ledger, prelude::*, registry::ModelRegistry};

pub struct AppState {
    pub dispatcher: Dispatcher,
}

impl AppState {
    /// Build the whole request-handling stack from a validated [`Config`].
    /// Every configured key is registered with the Ledger up front, so
    /// `/status` reports every key from the first request on, not just ones
    /// that have been dispatched to.
    pub fn new(config: Config) -> Self {
        let ledger = Arc::new(Ledger::new());
        let models = Arc::new(config.models);
        let dispatcher = Dispatcher::new(config.keys, ledger, models, &config.conductor);
        Self { dispatcher }
    }
}
