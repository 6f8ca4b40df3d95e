//! Diesel table definitions for the tables named in spec §6. Enum and JSON
//! columns are modeled as `Text`/`Jsonb` and converted at the `pg` boundary,
//! the same shape `storage_controller` uses for its diesel models.

diesel::table! {
    providers (id) {
        id -> BigInt,
        name -> Text,
        provider_type -> Text,
        uuid -> Text,
        hostname -> Nullable<Text>,
        endpoint -> Text,
        ssh_port -> Int4,
        username -> Text,
        password -> Nullable<Text>,
        ssh_private_key -> Nullable<Text>,
        api_token -> Nullable<Text>,
        api_token_id -> Nullable<Text>,
        cert_path -> Nullable<Text>,
        key_path -> Nullable<Text>,
        cert_content -> Nullable<Text>,
        key_content -> Nullable<Text>,
        network_type -> Text,
        execution_rule -> Text,
        container_enabled -> Bool,
        vm_enabled -> Bool,
        container_budget -> Jsonb,
        vm_budget -> Jsonb,
        container_defaults -> Jsonb,
        status -> Text,
        is_frozen -> Bool,
        expires_at -> Nullable<Timestamptz>,
        last_health_result -> Nullable<Text>,
        enable_traffic_control -> Bool,
        max_traffic_mb -> Double,
        traffic_count_mode -> Text,
        traffic_multiplier -> Double,
        traffic_limited -> Bool,
        traffic_reset_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    instances (id) {
        id -> BigInt,
        name -> Text,
        provider_id -> BigInt,
        user_id -> BigInt,
        kind -> Text,
        status -> Text,
        image -> Text,
        cpu -> Int4,
        memory_mb -> BigInt,
        disk_mb -> BigInt,
        private_ip -> Nullable<Text>,
        public_ip -> Nullable<Text>,
        ipv6_address -> Nullable<Text>,
        max_traffic_mb -> Double,
        traffic_limited -> Bool,
        traffic_limit_reason -> Nullable<Text>,
        password -> Nullable<Text>,
        deleted_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    ports (id) {
        id -> BigInt,
        instance_id -> BigInt,
        host_port -> Int4,
        guest_port -> Int4,
        protocol -> Text,
        mapping_method -> Text,
        is_ssh -> Bool,
        active -> Bool,
    }
}

diesel::table! {
    tasks (id) {
        id -> BigInt,
        user_id -> BigInt,
        provider_id -> BigInt,
        instance_id -> Nullable<BigInt>,
        task_type -> Text,
        status -> Text,
        progress -> Int2,
        status_message -> Text,
        task_data -> Jsonb,
        timeout_seconds -> BigInt,
        is_force_stoppable -> Bool,
        can_force_stop -> Bool,
        created_at -> Timestamptz,
        started_at -> Nullable<Timestamptz>,
        finished_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    pmacct_traffic_records (instance_id, timestamp) {
        instance_id -> BigInt,
        provider_id -> BigInt,
        user_id -> BigInt,
        timestamp -> Timestamptz,
        year -> Int4,
        month -> Int4,
        day -> Int4,
        hour -> Int4,
        minute -> Int4,
        rx_bytes -> BigInt,
        tx_bytes -> BigInt,
        total_bytes -> BigInt,
    }
}

diesel::table! {
    users (id) {
        id -> BigInt,
        level -> Int4,
        total_traffic_mb -> Double,
        used_traffic_mb -> Double,
        traffic_limited -> Bool,
        traffic_reset_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    config_settings (scope, key) {
        scope -> Text,
        key -> Text,
        value_json -> Jsonb,
    }
}

diesel::table! {
    instance_traffic_histories (instance_id, year, month, day, hour) {
        instance_id -> BigInt,
        year -> Int4,
        month -> Int4,
        day -> Int4,
        hour -> Int4,
        traffic_in_mb -> Double,
        traffic_out_mb -> Double,
        total_mb -> Double,
        record_time -> Timestamptz,
    }
}

diesel::table! {
    provider_traffic_histories (provider_id, year, month, day, hour) {
        provider_id -> BigInt,
        year -> Int4,
        month -> Int4,
        day -> Int4,
        hour -> Int4,
        traffic_in_mb -> Double,
        traffic_out_mb -> Double,
        total_mb -> Double,
        record_time -> Timestamptz,
    }
}

diesel::table! {
    user_traffic_histories (user_id, year, month, day, hour) {
        user_id -> BigInt,
        year -> Int4,
        month -> Int4,
        day -> Int4,
        hour -> Int4,
        traffic_in_mb -> Double,
        traffic_out_mb -> Double,
        total_mb -> Double,
        record_time -> Timestamptz,
    }
}
