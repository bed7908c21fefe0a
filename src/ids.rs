use std::sync::atomic::{AtomicU64, Ordering};

use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

use crate::protocol::{BatchId, JobId};

const BATCH_ID_LEN: usize = 10;

/// Source of job ids. Every call must return an id never returned before.
pub trait IdGenerator: Send + Sync {
    fn next_job_id(&self) -> JobId;
}

/// Random v4 UUIDs, hex-encoded without dashes.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIds;

impl IdGenerator for UuidIds {
    fn next_job_id(&self) -> JobId {
        JobId::new(Uuid::new_v4().simple().to_string())
    }
}

/// Deterministic ids `1, 2, 3, ...`.
#[derive(Debug)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl IdGenerator for SequentialIds {
    fn next_job_id(&self) -> JobId {
        JobId::new(self.next.fetch_add(1, Ordering::Relaxed).to_string())
    }
}

/// Random upper-case alphanumeric batch id.
pub fn random_batch_id() -> BatchId {
    let id: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(BATCH_ID_LEN)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect();
    BatchId::new(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn sequential_ids_count_up() {
        let ids = SequentialIds::default();
        assert_eq!(ids.next_job_id().as_str(), "1");
        assert_eq!(ids.next_job_id().as_str(), "2");
    }

    #[test]
    fn uuid_ids_are_unique() {
        let ids = UuidIds;
        let set: HashSet<_> = (0..100).map(|_| ids.next_job_id()).collect();
        assert_eq!(set.len(), 100);
        assert!(set.iter().all(|id| id.as_str().len() == 32));
    }

    #[test]
    fn batch_id_shape() {
        let id = random_batch_id();
        assert_eq!(id.as_str().len(), BATCH_ID_LEN);
        assert!(id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }
}
