//! Symbol-keyed store of exit states

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::exit::ExitState;
use crate::params::ExitParams;
use crate::types::Symbol;

/// Owns the [`ExitState`] of every open position, one per symbol
#[derive(Debug, Default)]
pub struct ExitRegistry {
    states: HashMap<Symbol, ExitState>,
}

impl ExitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &Symbol) -> Option<&ExitState> {
        self.states.get(symbol)
    }

    /// Record the state of a newly opened position, replacing any stale one
    pub fn insert(&mut self, symbol: Symbol, state: ExitState) {
        self.states.insert(symbol, state);
    }

    /// State for an open position, rebuilt neutrally if none is known
    ///
    /// Used when the exchange reports a position this process did not open
    /// (for example after a restart).
    pub fn get_or_restore(
        &mut self,
        symbol: &Symbol,
        now: DateTime<Utc>,
        params: &ExitParams,
    ) -> &mut ExitState {
        self.states.entry(symbol.clone()).or_insert_with(|| {
            info!(symbol = %symbol, "No exit state for open position, restoring neutral state");
            ExitState::restore(now, params)
        })
    }

    pub fn remove(&mut self, symbol: &Symbol) -> Option<ExitState> {
        self.states.remove(symbol)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
