use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};

use common::{Error, Result};

/// Advisory lock per symbol.
///
/// Scoped around sequences that must not interleave across instances acting
/// on the same symbol: strategy swap and per-symbol broker reconciliation.
/// Waiters queue FIFO (tokio mutex fairness); acquisition times out rather
/// than blocking forever.
#[derive(Default)]
pub struct SymbolLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SymbolLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `symbol`, waiting at most `timeout`.
    pub async fn acquire(
        &self,
        symbol: &str,
        timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(symbol.to_string()).or_default().clone()
        };
        tokio::time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                Error::Internal(format!(
                    "timed out after {timeout:?} acquiring symbol lock '{symbol}'"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_excludes_second_acquirer() {
        let locks = Arc::new(SymbolLocks::new());
        let guard = locks.acquire("SPY", Duration::from_secs(1)).await.unwrap();

        let second = locks.acquire("SPY", Duration::from_millis(50)).await;
        assert!(second.is_err(), "second acquire must time out while held");

        drop(guard);
        assert!(locks.acquire("SPY", Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn different_symbols_do_not_contend() {
        let locks = SymbolLocks::new();
        let _spy = locks.acquire("SPY", Duration::from_secs(1)).await.unwrap();
        let qqq = locks.acquire("QQQ", Duration::from_millis(50)).await;
        assert!(qqq.is_ok());
    }

    #[tokio::test]
    async fn waiters_are_served_in_fifo_order() {
        let locks = Arc::new(SymbolLocks::new());
        let guard = locks.acquire("SPY", Duration::from_secs(1)).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let locks = locks.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _g = locks.acquire("SPY", Duration::from_secs(5)).await.unwrap();
                order.lock().await.push(i);
            }));
            // Give each waiter time to enqueue before the next.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(guard);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }
}
