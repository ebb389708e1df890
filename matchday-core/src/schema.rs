use diesel::{allow_tables_to_appear_in_same_query, table};

table! {
    conversations (id) {
        id -> BigInt,
        name -> Nullable<Text>,
        is_group -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    conversation_participants (id) {
        id -> BigInt,
        conversation_id -> BigInt,
        user_id -> BigInt,
        joined_at -> Timestamptz,
        left_at -> Nullable<Timestamptz>,
        is_admin -> Bool,
    }
}

table! {
    messages (id) {
        id -> BigInt,
        conversation_id -> BigInt,
        sender_id -> BigInt,
        content -> Text,
        media_url -> Nullable<Text>,
        is_read -> Bool,
        created_at -> Timestamptz,
    }
}

table! {
    message_reads (id) {
        id -> BigInt,
        message_id -> BigInt,
        user_id -> BigInt,
        read_at -> Timestamptz,
    }
}

table! {
    device_tokens (id) {
        id -> BigInt,
        user_id -> BigInt,
        token -> Text,
        platform -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    notifications (id) {
        id -> BigInt,
        user_id -> BigInt,
        kind -> Text,
        title -> Text,
        body -> Text,
        data -> Nullable<Jsonb>,
        redirect_url -> Nullable<Text>,
        event_id -> Nullable<BigInt>,
        is_read -> Bool,
        created_at -> Timestamptz,
    }
}

table! {
    outbox_events (id) {
        id -> BigInt,
        channel -> Text,
        event_name -> Text,
        payload -> Jsonb,
        created_at -> Timestamptz,
        processed_at -> Nullable<Timestamptz>,
        retry_count -> Integer,
        error_message -> Nullable<Text>,
    }
}

// Owned by the surrounding application; this subsystem only reads them.

table! {
    users (id) {
        id -> BigInt,
        display_name -> Text,
        avatar_url -> Nullable<Text>,
    }
}

table! {
    events (id) {
        id -> BigInt,
        title -> Text,
    }
}

table! {
    event_participants (id) {
        id -> BigInt,
        event_id -> BigInt,
        user_id -> BigInt,
    }
}

allow_tables_to_appear_in_same_query!(
    conversations,
    conversation_participants,
    messages,
    message_reads,
    device_tokens,
    notifications,
    outbox_events,
    users,
    events,
    event_participants,
);
