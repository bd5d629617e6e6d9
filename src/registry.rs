//! The process-wide registration table.
//!
//! Platform event workers reference registrations by raw id. Upgrading an id
//! to a strong reference happens atomically under the table lock, so a
//! delivery can never race the destruction of the state it targets.

use crate::state::ChangeState;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

type Table = Mutex<HashMap<usize, Arc<ChangeState>>>;

fn table() -> &'static Table {
    static REGISTRATIONS: OnceLock<Table> = OnceLock::new();
    REGISTRATIONS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Inserts a state and returns its registration id.
///
/// The id is the `Arc` data pointer at insertion time; it stays stable for the lifetime of the
/// entry and is stored back into the state for event attribution.
pub(crate) fn insert(state: Arc<ChangeState>) -> usize {
    let id = Arc::as_ptr(&state) as usize;
    state.set_regid(id);
    table()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(id, state);
    id
}

pub(crate) fn find(id: usize) -> Option<Arc<ChangeState>> {
    table()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(&id)
        .cloned()
}

pub(crate) fn remove(id: usize) -> Option<Arc<ChangeState>> {
    table()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&id)
}

pub(crate) fn contains(id: usize) -> bool {
    table()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .contains_key(&id)
}
