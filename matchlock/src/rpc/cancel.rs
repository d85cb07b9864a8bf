//! Per-request cancellation tokens, keyed by the request's numeric `id`.

use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct CancelTable {
    tokens: parking_lot::Mutex<HashMap<i64, CancellationToken>>,
}

impl CancelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a fresh token for a spawned request and registers it. The
    /// caller is responsible for calling `remove` once the request
    /// completes so the table doesn't grow unbounded across a long
    /// session.
    pub fn register(&self, id: i64) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().insert(id, token.clone());
        token
    }

    pub fn remove(&self, id: i64) {
        self.tokens.lock().remove(&id);
    }

    /// `cancel` method: invoked synchronously, never spawns a
    /// task. Returns whether a matching in-flight request was found --
    /// the RPC method itself always reports success regardless.
    pub fn cancel(&self, id: i64) -> bool {
        match self.tokens.lock().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Disconnect handling.
    pub fn cancel_all(&self) {
        for token in self.tokens.lock().values() {
            token.cancel();
        }
    }

    /// Disconnect handling for sessions where some in-flight ids must not
    /// be context-cancelled (TTY sessions see stdin EOF instead).
    pub fn cancel_all_except(&self, exclude: &std::collections::HashSet<i64>) {
        for (id, token) in self.tokens.lock().iter() {
            if !exclude.contains(id) {
                token.cancel();
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_invokes_the_registered_token() {
        let table = CancelTable::new();
        let token = table.register(1);
        assert!(!token.is_cancelled());
        assert!(table.cancel(1));
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_of_unknown_id_reports_not_found_but_does_not_panic() {
        let table = CancelTable::new();
        assert!(!table.cancel(42));
    }

    #[test]
    fn cancel_all_trips_every_outstanding_token() {
        let table = CancelTable::new();
        let a = table.register(1);
        let b = table.register(2);
        table.cancel_all();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }

    #[test]
    fn cancel_all_except_spares_the_excluded_ids() {
        let table = CancelTable::new();
        let pipe = table.register(1);
        let tty = table.register(2);
        let mut exclude = std::collections::HashSet::new();
        exclude.insert(2);
        table.cancel_all_except(&exclude);
        assert!(pipe.is_cancelled());
        assert!(!tty.is_cancelled());
    }

    #[test]
    fn remove_drops_the_token_from_the_table() {
        let table = CancelTable::new();
        table.register(1);
        table.remove(1);
        assert!(table.is_empty());
    }
}
