//! Batch lease acquisition.
//!
//! Atomic per candidate, not across the batch: each candidate is written with
//! a compare-and-swap on its version, and a lost race simply drops that
//! candidate. Partial success is a normal outcome.

use std::sync::Arc;

use crate::domain::{BobbinError, FencingSeed, TaskRecord, TaskType};
use crate::ports::{Clock, TaskStore};

/// Result of one acquisition round.
#[derive(Debug, Clone, Default)]
pub struct LeaseBatch {
    pub leased: Vec<TaskRecord>,
    /// More eligible tasks may be waiting: either there were more candidates
    /// than `max_count` or some candidates were lost to other acquirers.
    pub has_more: bool,
}

pub struct LeaseAcquirer {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl LeaseAcquirer {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Lease up to `max_count` eligible tasks of `task_type`, oldest due first.
    ///
    /// Tokens are `seed.token(position)`, so every lease in the batch carries
    /// a distinct fencing token. The query looks one record past the page so
    /// that a page which exactly drains the backlog reports `has_more = false`.
    pub async fn acquire(
        &self,
        task_type: &TaskType,
        lease_duration_ms: i64,
        max_count: usize,
        seed: &FencingSeed,
    ) -> Result<LeaseBatch, BobbinError> {
        if max_count == 0 {
            return Ok(LeaseBatch::default());
        }

        let now = self.clock.now_ms();
        let mut candidates = self
            .store
            .query_eligible_for_lease(task_type, now, max_count + 1)
            .await?;
        let beyond_page = candidates.len() > max_count;
        candidates.truncate(max_count);
        let found = candidates.len();

        let mut leased = Vec::with_capacity(found);
        for (position, candidate) in candidates.into_iter().enumerate() {
            let Some(expected) = candidate.version.clone() else {
                continue;
            };
            let id = candidate.id;
            let draft = lease_candidate(candidate, now, lease_duration_ms, seed, position);

            match self.store.replace(draft, &expected).await {
                Ok(persisted) => leased.push(persisted),
                // another acquirer won, or the record went away
                Err(BobbinError::Conflict(_)) | Err(BobbinError::NotFound(_)) => {
                    tracing::debug!(task_id = %id, "lost lease race");
                }
                Err(err) if leased.is_empty() => return Err(err),
                Err(err) => {
                    // keep what we already hold; the caller requeries
                    tracing::warn!(task_id = %id, error = %err, "lease write failed mid-batch");
                    return Ok(LeaseBatch {
                        leased,
                        has_more: true,
                    });
                }
            }
        }

        let has_more = beyond_page || leased.len() < found;
        tracing::debug!(%task_type, found, leased = leased.len(), has_more, "acquired leases");
        Ok(LeaseBatch { leased, has_more })
    }
}

/// Lease fields for one candidate, including abandoned-lease accounting.
fn lease_candidate(
    mut record: TaskRecord,
    now: i64,
    lease_duration_ms: i64,
    seed: &FencingSeed,
    position: usize,
) -> TaskRecord {
    record.account_abandoned_lease(now);
    record.locked_until_time = now + lease_duration_ms;
    record.lease_token = Some(seed.token(position));
    if record.current_run_start_time.is_none() {
        record.current_run_start_time = Some(now);
    }
    record
}
