#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};

use medshare_storage::store::CareStore;

pub mod audit_worker;
pub mod auth_gate;
pub mod consent;
pub mod integrity;

/// Store handle shared by every runtime. A lock is taken per storage commit
/// and always released before the next `.await`.
pub type SharedStore = Arc<Mutex<CareStore>>;

pub fn shared_store(store: CareStore) -> SharedStore {
    Arc::new(Mutex::new(store))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLockPoisoned;

pub(crate) fn lock_store(store: &SharedStore) -> Result<MutexGuard<'_, CareStore>, StoreLockPoisoned> {
    store.lock().map_err(|_| StoreLockPoisoned)
}
