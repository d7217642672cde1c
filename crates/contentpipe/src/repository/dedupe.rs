//! Observability-only ledger of duplicate submissions.
//!
//! Counts how many times each source content id has been submitted. The
//! count is reported back to submitters and never gates execution.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use crate::clock::sql_timestamp;
use crate::on_backend;
use crate::schema::process_dedupe;

use super::pool::DbPool;
use super::records::NewDedupeRecord;
use super::StoreError;

#[derive(Clone)]
pub struct DedupeLedger {
    pool: DbPool,
}

impl DedupeLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Record a submission for `content_id` and return the new seen count.
    pub async fn record(
        &self,
        content_id: &str,
        job_name: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let now_s = sql_timestamp(now);
        let seen: i64 = on_backend!(self.pool, conn => {
            diesel::insert_into(process_dedupe::table)
                .values(NewDedupeRecord {
                    content_id,
                    job_name,
                    first_seen_at: &now_s,
                    last_seen_at: &now_s,
                    seen_count: 1,
                })
                .on_conflict(process_dedupe::content_id)
                .do_update()
                .set((
                    process_dedupe::last_seen_at.eq(&now_s),
                    process_dedupe::seen_count.eq(process_dedupe::seen_count + 1),
                    process_dedupe::job_name.eq(job_name),
                ))
                .returning(process_dedupe::seen_count)
                .get_result(&mut conn)
                .await?
        });
        Ok(seen)
    }

    /// Read the current seen count without touching it. Zero if never seen.
    pub async fn seen_count(&self, content_id: &str) -> Result<i64, StoreError> {
        let seen: Option<i64> = on_backend!(self.pool, conn => {
            process_dedupe::table
                .filter(process_dedupe::content_id.eq(content_id))
                .select(process_dedupe::seen_count)
                .first(&mut conn)
                .await
                .optional()?
        });
        Ok(seen.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::super::intents::tests::{t0, test_context};

    #[tokio::test]
    async fn seen_count_increments_per_submission() {
        let (ctx, _dir) = test_context().await;
        let ledger = ctx.dedupe();

        assert_eq!(ledger.seen_count("C1").await.unwrap(), 0);
        assert_eq!(ledger.record("C1", "thumbnail.v1", t0()).await.unwrap(), 1);
        assert_eq!(ledger.record("C1", "thumbnail.v1", t0()).await.unwrap(), 2);
        assert_eq!(ledger.record("C2", "ocr.v1", t0()).await.unwrap(), 1);
        assert_eq!(ledger.seen_count("C1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn last_job_name_wins() {
        let (ctx, _dir) = test_context().await;
        let ledger = ctx.dedupe();
        ledger.record("C1", "thumbnail.v1", t0()).await.unwrap();
        // Re-submission under another job updates the ledger row, count keeps
        // growing.
        assert_eq!(ledger.record("C1", "ocr.v1", t0()).await.unwrap(), 2);
    }
}
