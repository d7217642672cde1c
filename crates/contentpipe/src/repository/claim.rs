//! The claim protocol: atomically hand exactly one eligible intent to a
//! single worker.
//!
//! Eligible means pending (or awaiting-retry) with `run_after` in the past,
//! or claimed with an expired lease (the recovery path after a worker
//! crash). Candidates are scanned FIFO by `(run_after, created_at, id)`, a
//! strictly deterministic order.
//!
//! SQLite: claims are optimistic. The scan runs unlocked and the claim
//! itself is a single guarded UPDATE keyed on the candidate's observed
//! `(status, attempt_count)`; losing the race costs one retry on the next
//! candidate. PostgreSQL: the scan takes row locks with
//! `FOR UPDATE SKIP LOCKED`, so contended rows are skipped instead of
//! blocking the claimer.

use std::time::Duration;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use crate::clock::sql_timestamp;
use crate::models::{Intent, IntentStatus};
use crate::on_backend;
use crate::schema::intents;

use super::records::IntentRecord;
use super::{IntentRepository, StoreError};

/// How many candidates one claim pass inspects before reporting no work.
const CANDIDATE_BATCH: i64 = 8;

impl IntentRepository {
    /// Claim the single oldest eligible intent for `worker_id`.
    ///
    /// Returns `None` when nothing is eligible or every candidate was lost
    /// to a concurrent claimer (the caller polls again later).
    pub async fn claim_one(
        &self,
        worker_id: &str,
        supported_names: &[String],
        queue: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Intent>, StoreError> {
        if supported_names.is_empty() {
            return Ok(None);
        }

        let lease = chrono::Duration::from_std(lease_ttl)
            .map_err(|e| StoreError::InvalidArgument(e.to_string()))?;
        let expires_at = now + lease;
        let now_s = sql_timestamp(now);
        let expires_s = sql_timestamp(expires_at);

        on_backend!(self.pool, {
            sqlite(conn) => {
                let candidates: Vec<IntentRecord> = intents::table
                    .filter(intents::queue.eq(queue))
                    .filter(intents::name.eq_any(supported_names))
                    .filter(
                        intents::status
                            .eq_any([
                                IntentStatus::Pending.as_str(),
                                IntentStatus::Failed.as_str(),
                            ])
                            .and(intents::run_after.le(&now_s))
                            .or(intents::status
                                .eq(IntentStatus::Claimed.as_str())
                                .and(intents::claim_expires_at.lt(&now_s))),
                    )
                    .order((
                        intents::run_after.asc(),
                        intents::created_at.asc(),
                        intents::id.asc(),
                    ))
                    .limit(CANDIDATE_BATCH)
                    .load(&mut conn)
                    .await?;

                for candidate in candidates {
                    let rows = diesel::update(
                        intents::table
                            .filter(intents::id.eq(&candidate.id))
                            .filter(intents::status.eq(&candidate.status))
                            .filter(intents::attempt_count.eq(candidate.attempt_count)),
                    )
                    .set((
                        intents::status.eq(IntentStatus::Claimed.as_str()),
                        intents::claimed_by.eq(Some(worker_id)),
                        intents::claim_expires_at.eq(Some(expires_s.clone())),
                        intents::attempt_count.eq(candidate.attempt_count + 1),
                        intents::updated_at.eq(&now_s),
                    ))
                    .execute(&mut conn)
                    .await?;

                    if rows == 1 {
                        return Ok(Some(claimed_view(candidate, worker_id, expires_at, now)));
                    }
                    // Lost the race on this row; the next candidate may still
                    // be free.
                }
                Ok(None)
            },
            postgres(conn) => {
                use diesel_async::scoped_futures::ScopedFutureExt;
                use diesel_async::AsyncConnection;

                let worker = worker_id.to_string();
                let queue = queue.to_string();
                let supported = supported_names.to_vec();
                let scan_now = now_s.clone();
                let scan_expiry = expires_s.clone();

                let claimed: Option<IntentRecord> = conn
                    .transaction::<_, diesel::result::Error, _>(|conn| {
                        async move {
                            let candidate: Option<IntentRecord> = intents::table
                                .filter(intents::queue.eq(&queue))
                                .filter(intents::name.eq_any(&supported))
                                .filter(
                                    intents::status
                                        .eq_any([
                                            IntentStatus::Pending.as_str(),
                                            IntentStatus::Failed.as_str(),
                                        ])
                                        .and(intents::run_after.le(&scan_now))
                                        .or(intents::status
                                            .eq(IntentStatus::Claimed.as_str())
                                            .and(intents::claim_expires_at.lt(&scan_now))),
                                )
                                .order((
                                    intents::run_after.asc(),
                                    intents::created_at.asc(),
                                    intents::id.asc(),
                                ))
                                .limit(1)
                                .for_update()
                                .skip_locked()
                                .first(conn)
                                .await
                                .optional()?;

                            let Some(candidate) = candidate else {
                                return Ok(None);
                            };

                            diesel::update(intents::table.filter(intents::id.eq(&candidate.id)))
                                .set((
                                    intents::status.eq(IntentStatus::Claimed.as_str()),
                                    intents::claimed_by.eq(Some(worker.as_str())),
                                    intents::claim_expires_at.eq(Some(scan_expiry.clone())),
                                    intents::attempt_count.eq(candidate.attempt_count + 1),
                                    intents::updated_at.eq(&scan_now),
                                ))
                                .execute(conn)
                                .await?;

                            Ok(Some(candidate))
                        }
                        .scope_boxed()
                    })
                    .await?;

                Ok(claimed.map(|c| claimed_view(c, worker_id, expires_at, now)))
            },
        })
    }
}

/// Build the post-claim view of a candidate row without re-reading it.
fn claimed_view(
    record: IntentRecord,
    worker_id: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Intent {
    let mut intent = Intent::from(record);
    intent.status = IntentStatus::Claimed;
    intent.claimed_by = Some(worker_id.to_string());
    intent.claim_expires_at = Some(expires_at);
    intent.attempt_count += 1;
    intent.updated_at = now;
    intent
}
