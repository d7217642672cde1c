// Diesel table definitions for the intent store.
// Kept in sync with the SQL in migrations/.

diesel::table! {
    intents (id) {
        id -> Text,
        queue -> Text,
        name -> Text,
        payload -> Binary,
        status -> Text,
        attempt_count -> Integer,
        max_attempts -> Integer,
        run_after -> Text,
        claimed_by -> Nullable<Text>,
        claim_expires_at -> Nullable<Text>,
        last_error -> Nullable<Text>,
        result -> Nullable<Binary>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    intent_checkpoints (intent_id) {
        intent_id -> Text,
        data -> Binary,
        updated_at -> Text,
    }
}

diesel::table! {
    process_dedupe (content_id) {
        content_id -> Text,
        job_name -> Text,
        first_seen_at -> Text,
        last_seen_at -> Text,
        seen_count -> BigInt,
    }
}

diesel::allow_tables_to_appear_in_same_query!(intents, intent_checkpoints, process_dedupe);
