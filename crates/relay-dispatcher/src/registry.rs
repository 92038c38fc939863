//! In-memory map of the background-worker versions registered on one
//! connection. Runs pinned to a version must execute against that exact
//! bundle; unpinned runs take the newest registered version so code updates
//! land without a client redeploy.

use relay_core::model::BackgroundWorker;
use std::cmp::Ordering;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<Uuid, BackgroundWorker>,
}

impl WorkerRegistry {
    pub fn insert(&mut self, worker: BackgroundWorker) {
        self.workers.insert(worker.id, worker);
    }

    pub fn get(&self, worker_id: Uuid) -> Option<&BackgroundWorker> {
        self.workers.get(&worker_id)
    }

    pub fn latest(&self) -> Option<&BackgroundWorker> {
        self.workers
            .values()
            .max_by(|a, b| compare_versions(&a.version, &b.version))
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Worker versions have the shape `YYYYMMDD.N`. Raw string order would put
/// `20240101.10` below `20240101.2`, so both segments are compared
/// numerically; unparseable versions fall back to string order.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_version(a), parse_version(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

fn parse_version(version: &str) -> Option<(u64, u64)> {
    let (date, sequence) = version.split_once('.')?;
    Some((date.parse().ok()?, sequence.parse().ok()?))
}
