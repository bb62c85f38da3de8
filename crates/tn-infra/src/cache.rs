use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;

use crate::Result;
use crate::types::MachineAddress;

/// Process-wide memo of machine name → zone/addresses.
///
/// Each name gets its own cell, so concurrent callers for the same machine
/// share one in-flight lookup and nobody reads the entry before it is written.
/// A failed lookup leaves the cell empty for the next caller.
#[derive(Default)]
pub struct AddressCache {
    entries: Mutex<HashMap<String, Arc<OnceCell<MachineAddress>>>>,
}

impl AddressCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, name: &str) -> Arc<OnceCell<MachineAddress>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.entry(name.to_string()).or_default().clone()
    }

    /// Return the cached address or run `lookup` exactly once to fill it.
    pub async fn get_or_lookup<F, Fut>(&self, name: &str, lookup: F) -> Result<MachineAddress>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MachineAddress>>,
    {
        self.cell(name).get_or_try_init(lookup).await.cloned()
    }

    /// Record an address already known, e.g. returned by machine creation.
    pub fn seed(&self, address: MachineAddress) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            address.name.clone(),
            Arc::new(OnceCell::new_with(Some(address))),
        );
    }

    pub fn get(&self, name: &str) -> Option<MachineAddress> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(name).and_then(|cell| cell.get().cloned())
    }

    pub fn invalidate(&self, name: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::Error;

    fn addr(name: &str) -> MachineAddress {
        MachineAddress {
            name: name.into(),
            zone: "us-east1-b".into(),
            internal_ip: "10.0.0.2".into(),
            external_ip: Some("34.0.0.2".into()),
        }
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_lookup() {
        let cache = AddressCache::new();
        let counter = AtomicUsize::new(0);
        let lookups = &counter;

        let lookup = move || async move {
            lookups.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(addr("exp-manager"))
        };

        let (a, b, c) = tokio::join!(
            cache.get_or_lookup("exp-manager", lookup),
            cache.get_or_lookup("exp-manager", lookup),
            cache.get_or_lookup("exp-manager", lookup),
        );

        assert_eq!(a.unwrap(), addr("exp-manager"));
        assert!(b.is_ok() && c.is_ok());
        assert_eq!(lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_lookup_is_not_cached() {
        let cache = AddressCache::new();

        let err = cache
            .get_or_lookup("exp-worker-0", || async {
                Err(Error::NotFound("exp-worker-0".into()))
            })
            .await;
        assert!(err.is_err());

        let ok = cache
            .get_or_lookup("exp-worker-0", || async { Ok(addr("exp-worker-0")) })
            .await
            .unwrap();
        assert_eq!(ok.name, "exp-worker-0");
    }

    #[tokio::test]
    async fn seed_and_invalidate() {
        let cache = AddressCache::new();
        cache.seed(addr("exp-manager"));
        assert_eq!(cache.get("exp-manager"), Some(addr("exp-manager")));

        cache.invalidate("exp-manager");
        assert_eq!(cache.get("exp-manager"), None);
    }
}
