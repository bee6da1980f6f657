use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// In-process set of GPU ids held by launches that have not yet been
/// written back.
///
/// Claims are all-or-nothing: either every requested id is free and all of
/// them are taken, or nothing changes.
#[derive(Debug, Clone, Default)]
pub struct ReservationTable {
    inner: Arc<Mutex<HashSet<u32>>>,
}

impl ReservationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<u32>> {
        // The set stays consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically reserve all of `gpu_ids`. Returns false if any is held.
    pub fn reserve(&self, gpu_ids: &[u32]) -> bool {
        let mut held = self.lock();
        if gpu_ids.iter().any(|id| held.contains(id)) {
            return false;
        }
        held.extend(gpu_ids.iter().copied());
        true
    }

    pub fn release(&self, gpu_ids: &[u32]) {
        let mut held = self.lock();
        for id in gpu_ids {
            held.remove(id);
        }
    }

    /// Like [`reserve`](Self::reserve), but the returned guard releases the
    /// ids when dropped.
    pub fn claim(&self, gpu_ids: &[u32]) -> Option<Reservation> {
        self.reserve(gpu_ids).then(|| Reservation {
            table: self.clone(),
            gpu_ids: gpu_ids.to_vec(),
        })
    }

    pub fn is_reserved(&self, gpu_id: u32) -> bool {
        self.lock().contains(&gpu_id)
    }

    pub fn reserved(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.lock().iter().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Held GPUs, released on drop.
#[derive(Debug)]
pub struct Reservation {
    table: ReservationTable,
    gpu_ids: Vec<u32>,
}

impl Reservation {
    pub fn gpu_ids(&self) -> &[u32] {
        &self.gpu_ids
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.gpu_ids.is_empty() {
            tracing::debug!("Releasing GPU reservation {:?}", self.gpu_ids);
            self.table.release(&self.gpu_ids);
        }
    }
}
