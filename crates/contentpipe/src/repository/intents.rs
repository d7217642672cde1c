//! Intent CRUD and guarded state transitions.
//!
//! Every transition out of `claimed` re-checks ownership in the UPDATE's
//! WHERE clause. A worker whose lease lapsed and was reclaimed elsewhere gets
//! `StoreError::StaleLease` instead of silently clobbering the other
//! worker's claim.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use uuid::Uuid;

use crate::clock::sql_timestamp;
use crate::models::{truncate_error, Intent, IntentStatus, NewIntent};
use crate::on_backend;
use crate::schema::{intent_checkpoints, intents};

use super::pool::DbPool;
use super::records::{IntentRecord, NewCheckpointRecord, NewIntentRecord};
use super::StoreError;

/// The ownership guard shared by every transition out of `claimed`.
macro_rules! owned_by {
    ($id:expr, $worker_id:expr) => {
        intents::table
            .filter(intents::id.eq($id))
            .filter(intents::status.eq(IntentStatus::Claimed.as_str()))
            .filter(intents::claimed_by.eq($worker_id))
    };
}

/// Repository for the `intents` table and its checkpoint companion.
#[derive(Clone)]
pub struct IntentRepository {
    pub(crate) pool: DbPool,
}

impl IntentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a new intent in `pending` and return it.
    pub async fn insert(&self, new: NewIntent, now: DateTime<Utc>) -> Result<Intent, StoreError> {
        if new.max_attempts < 1 {
            return Err(StoreError::InvalidArgument(format!(
                "max_attempts must be at least 1, got {}",
                new.max_attempts
            )));
        }
        if new.name.is_empty() {
            return Err(StoreError::InvalidArgument(
                "intent name must not be empty".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let now_s = sql_timestamp(now);
        let run_after_s = sql_timestamp(new.run_after);

        on_backend!(self.pool, conn => {
            diesel::insert_into(intents::table)
                .values(NewIntentRecord {
                    id: &id,
                    queue: &new.queue,
                    name: &new.name,
                    payload: &new.payload,
                    status: IntentStatus::Pending.as_str(),
                    attempt_count: 0,
                    max_attempts: new.max_attempts as i32,
                    run_after: &run_after_s,
                    created_at: &now_s,
                    updated_at: &now_s,
                })
                .execute(&mut conn)
                .await?;
        });

        Ok(Intent {
            id,
            queue: new.queue,
            name: new.name,
            payload: new.payload,
            status: IntentStatus::Pending,
            attempt_count: 0,
            max_attempts: new.max_attempts,
            run_after: new.run_after,
            claimed_by: None,
            claim_expires_at: None,
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Fetch one intent by id.
    pub async fn get(&self, id: &str) -> Result<Option<Intent>, StoreError> {
        let record: Option<IntentRecord> = on_backend!(self.pool, conn => {
            intents::table
                .filter(intents::id.eq(id))
                .first(&mut conn)
                .await
                .optional()?
        });
        Ok(record.map(Intent::from))
    }

    /// Operator/observability read: oldest first.
    pub async fn list_by_status(
        &self,
        status: IntentStatus,
        limit: u32,
    ) -> Result<Vec<Intent>, StoreError> {
        let records: Vec<IntentRecord> = on_backend!(self.pool, conn => {
            intents::table
                .filter(intents::status.eq(status.as_str()))
                .order((intents::created_at.asc(), intents::id.asc()))
                .limit(limit as i64)
                .load(&mut conn)
                .await?
        });
        Ok(records.into_iter().map(Intent::from).collect())
    }

    /// Count intents in a given status.
    pub async fn count_status(&self, status: IntentStatus) -> Result<i64, StoreError> {
        use diesel::dsl::count_star;
        let count: i64 = on_backend!(self.pool, conn => {
            intents::table
                .filter(intents::status.eq(status.as_str()))
                .select(count_star())
                .first(&mut conn)
                .await?
        });
        Ok(count)
    }

    /// Transition `claimed → succeeded` and store the executor output.
    pub async fn complete(
        &self,
        id: &str,
        worker_id: &str,
        result: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let now_s = sql_timestamp(now);
        let rows = on_backend!(self.pool, conn => {
            diesel::update(owned_by!(id, worker_id))
                .set((
                    intents::status.eq(IntentStatus::Succeeded.as_str()),
                    intents::result.eq(Some(result.clone())),
                    intents::claimed_by.eq(None::<String>),
                    intents::claim_expires_at.eq(None::<String>),
                    intents::updated_at.eq(&now_s),
                ))
                .execute(&mut conn)
                .await?
        });
        if rows == 0 {
            return Err(self.ownership_error(id).await);
        }
        // Terminal: the checkpoint has served its purpose.
        self.clear_checkpoint(id).await?;
        Ok(())
    }

    /// Transition `claimed → failed`, scheduling the retry at `run_after`.
    pub async fn fail_retry(
        &self,
        id: &str,
        worker_id: &str,
        error: &str,
        run_after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let now_s = sql_timestamp(now);
        let run_after_s = sql_timestamp(run_after);
        let error = truncate_error(error);
        let rows = on_backend!(self.pool, conn => {
            diesel::update(owned_by!(id, worker_id))
                .set((
                    intents::status.eq(IntentStatus::Failed.as_str()),
                    intents::run_after.eq(&run_after_s),
                    intents::last_error.eq(Some(error.clone())),
                    intents::claimed_by.eq(None::<String>),
                    intents::claim_expires_at.eq(None::<String>),
                    intents::updated_at.eq(&now_s),
                ))
                .execute(&mut conn)
                .await?
        });
        if rows == 0 {
            return Err(self.ownership_error(id).await);
        }
        Ok(())
    }

    /// Transition `claimed → deadletter`.
    pub async fn fail_deadletter(
        &self,
        id: &str,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let now_s = sql_timestamp(now);
        let error = truncate_error(error);
        let rows = on_backend!(self.pool, conn => {
            diesel::update(owned_by!(id, worker_id))
                .set((
                    intents::status.eq(IntentStatus::Deadletter.as_str()),
                    intents::last_error.eq(Some(error.clone())),
                    intents::claimed_by.eq(None::<String>),
                    intents::claim_expires_at.eq(None::<String>),
                    intents::updated_at.eq(&now_s),
                ))
                .execute(&mut conn)
                .await?
        });
        if rows == 0 {
            return Err(self.ownership_error(id).await);
        }
        Ok(())
    }

    /// Push the lease deadline out by `lease_ttl` while still owned.
    pub async fn renew_lease(
        &self,
        id: &str,
        worker_id: &str,
        lease_ttl: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let expires_s = sql_timestamp(
            now + chrono::Duration::from_std(lease_ttl)
                .map_err(|e| StoreError::InvalidArgument(e.to_string()))?,
        );
        let now_s = sql_timestamp(now);
        let rows = on_backend!(self.pool, conn => {
            diesel::update(owned_by!(id, worker_id))
                .set((
                    intents::claim_expires_at.eq(Some(expires_s.clone())),
                    intents::updated_at.eq(&now_s),
                ))
                .execute(&mut conn)
                .await?
        });
        if rows == 0 {
            return Err(self.ownership_error(id).await);
        }
        Ok(())
    }

    /// Persist the latest checkpoint blob for an intent (latest wins).
    pub async fn save_checkpoint(
        &self,
        intent_id: &str,
        data: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let now_s = sql_timestamp(now);
        on_backend!(self.pool, {
            sqlite(conn) => {
                diesel::replace_into(intent_checkpoints::table)
                    .values(NewCheckpointRecord {
                        intent_id,
                        data,
                        updated_at: &now_s,
                    })
                    .execute(&mut conn)
                    .await?;
            },
            postgres(conn) => {
                diesel::insert_into(intent_checkpoints::table)
                    .values(NewCheckpointRecord {
                        intent_id,
                        data,
                        updated_at: &now_s,
                    })
                    .on_conflict(intent_checkpoints::intent_id)
                    .do_update()
                    .set((
                        intent_checkpoints::data.eq(data),
                        intent_checkpoints::updated_at.eq(&now_s),
                    ))
                    .execute(&mut conn)
                    .await?;
            },
        });
        Ok(())
    }

    /// Load the last checkpoint saved for an intent, if any.
    pub async fn load_checkpoint(&self, intent_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let data: Option<Vec<u8>> = on_backend!(self.pool, conn => {
            intent_checkpoints::table
                .filter(intent_checkpoints::intent_id.eq(intent_id))
                .select(intent_checkpoints::data)
                .first(&mut conn)
                .await
                .optional()?
        });
        Ok(data)
    }

    /// Drop a checkpoint row.
    pub async fn clear_checkpoint(&self, intent_id: &str) -> Result<(), StoreError> {
        on_backend!(self.pool, conn => {
            diesel::delete(
                intent_checkpoints::table.filter(intent_checkpoints::intent_id.eq(intent_id)),
            )
            .execute(&mut conn)
            .await?;
        });
        Ok(())
    }

    /// Distinguish "row gone" from "row owned by someone else" after a
    /// guarded update matched nothing.
    async fn ownership_error(&self, id: &str) -> StoreError {
        match self.get(id).await {
            Ok(None) => StoreError::NotFound(id.to_string()),
            _ => StoreError::StaleLease,
        }
    }
}
