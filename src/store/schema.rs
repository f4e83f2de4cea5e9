//! Diesel table definitions for the relational store.

diesel::table! {
    use diesel::sql_types::*;

    webhooks (id) {
        id -> Uuid,
        tenant_scope -> Nullable<Text>,
        url -> Text,
        signing_key -> Bytea,
        event_types -> Array<Text>,
        enabled -> Bool,
        consecutive_failures -> Int4,
        disabled_reason -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    webhook_jobs (id) {
        id -> Uuid,
        queue -> Text,
        state -> Text,
        subscription_id -> Uuid,
        event_type -> Text,
        event_timestamp -> Int8,
        args_json -> Jsonb,
        unique_key -> Text,
        attempt -> Int4,
        max_attempts -> Int4,
        scheduled_at -> Timestamptz,
        leased_until -> Nullable<Timestamptz>,
        last_error -> Nullable<Text>,
        created_at -> Timestamptz,
        finalized_at -> Nullable<Timestamptz>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(webhooks, webhook_jobs,);
