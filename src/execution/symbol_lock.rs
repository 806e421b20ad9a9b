//! Per-symbol mutual exclusion so the opportunity scan never opens two
//! trades on the same symbol concurrently. Locks are created on demand and
//! never removed — the symbol universe is small and bounded, so the map
//! never grows unbounded in practice.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::Symbol;

pub struct SymbolLockRegistry {
    locks: SyncMutex<HashMap<Symbol, Arc<Mutex<()>>>>,
}

impl SymbolLockRegistry {
    pub fn new() -> Self {
        Self { locks: SyncMutex::new(HashMap::new()) }
    }

    fn entry(&self, symbol: &Symbol) -> Arc<Mutex<()>> {
        self.locks.lock().entry(symbol.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Blocks until the symbol's lock is free, held for the lifetime of the
    /// returned guard (through persist + leg-1 placement per the ExecutionEngine).
    pub async fn lock(&self, symbol: &Symbol) -> OwnedMutexGuard<()> {
        self.entry(symbol).lock_owned().await
    }

    /// Non-blocking variant for the opportunity-scan hot path: skip a symbol
    /// already being opened rather than queueing behind it.
    pub fn try_lock(&self, symbol: &Symbol) -> Option<OwnedMutexGuard<()>> {
        self.entry(symbol).try_lock_owned().ok()
    }
}

impl Default for SymbolLockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_lock_attempts_serialize() {
        let registry = SymbolLockRegistry::new();
        let symbol = "ETH".to_string();
        let guard = registry.lock(&symbol).await;
        assert!(registry.try_lock(&symbol).is_none());
        drop(guard);
        assert!(registry.try_lock(&symbol).is_some());
    }
}
