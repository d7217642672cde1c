//! Row structs bridging diesel and the domain models.

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::clock::parse_sql_timestamp;
use crate::models::{Intent, IntentStatus};
use crate::schema::{intent_checkpoints, intents, process_dedupe};

/// Full intent row, field order matching `schema::intents`.
#[derive(Debug, Clone, Queryable)]
pub struct IntentRecord {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub payload: Vec<u8>,
    pub status: String,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub run_after: String,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<String>,
    pub last_error: Option<String>,
    pub result: Option<Vec<u8>>,
    pub created_at: String,
    pub updated_at: String,
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    parse_sql_timestamp(s).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl From<IntentRecord> for Intent {
    fn from(r: IntentRecord) -> Self {
        Intent {
            status: IntentStatus::from_str(&r.status).unwrap_or(IntentStatus::Pending),
            attempt_count: r.attempt_count.max(0) as u32,
            max_attempts: r.max_attempts.max(1) as u32,
            run_after: parse_ts(&r.run_after),
            claim_expires_at: r.claim_expires_at.as_deref().map(parse_ts),
            created_at: parse_ts(&r.created_at),
            updated_at: parse_ts(&r.updated_at),
            id: r.id,
            queue: r.queue,
            name: r.name,
            payload: r.payload,
            claimed_by: r.claimed_by,
            last_error: r.last_error,
            result: r.result,
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = intents)]
pub struct NewIntentRecord<'a> {
    pub id: &'a str,
    pub queue: &'a str,
    pub name: &'a str,
    pub payload: &'a [u8],
    pub status: &'a str,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub run_after: &'a str,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = intent_checkpoints)]
pub struct NewCheckpointRecord<'a> {
    pub intent_id: &'a str,
    pub data: &'a [u8],
    pub updated_at: &'a str,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = process_dedupe)]
pub struct NewDedupeRecord<'a> {
    pub content_id: &'a str,
    pub job_name: &'a str,
    pub first_seen_at: &'a str,
    pub last_seen_at: &'a str,
    pub seen_count: i64,
}
