// Diesel table definitions for the pipeline schema.
// Kept in sync by hand with repository::context::init_schema.

diesel::table! {
    articulums (id) {
        id -> Int8,
        articulum -> Text,
        state -> Text,
        state_updated_at -> Timestamptz,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    proxies (id) {
        id -> Int8,
        host -> Text,
        port -> Int4,
        username -> Nullable<Text>,
        password -> Nullable<Text>,
        is_blocked -> Bool,
        is_in_use -> Bool,
        worker_id -> Nullable<Text>,
        consecutive_errors -> Int4,
        last_error_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    catalog_tasks (id) {
        id -> Int8,
        articulum_id -> Int8,
        status -> Text,
        checkpoint_page -> Int4,
        worker_id -> Nullable<Text>,
        heartbeat_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    object_tasks (id) {
        id -> Int8,
        articulum_id -> Int8,
        avito_item_id -> Text,
        status -> Text,
        worker_id -> Nullable<Text>,
        heartbeat_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    catalog_listings (id) {
        id -> Int8,
        articulum_id -> Int8,
        avito_item_id -> Text,
        title -> Text,
        price -> Nullable<Float8>,
        snippet_text -> Nullable<Text>,
        seller_name -> Nullable<Text>,
        seller_id -> Nullable<Text>,
        seller_rating -> Nullable<Float8>,
        seller_reviews -> Nullable<Int4>,
        image_urls -> Nullable<Array<Text>>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    object_data (id) {
        id -> Int8,
        articulum_id -> Int8,
        avito_item_id -> Text,
        title -> Nullable<Text>,
        price -> Nullable<Float8>,
        seller_name -> Nullable<Text>,
        published_at -> Nullable<Timestamptz>,
        description -> Nullable<Text>,
        location_name -> Nullable<Text>,
        characteristics -> Nullable<Jsonb>,
        views_total -> Nullable<Int4>,
        raw_html -> Nullable<Text>,
        parsed_at -> Timestamptz,
    }
}

diesel::table! {
    validation_results (id) {
        id -> Int8,
        articulum_id -> Int8,
        avito_item_id -> Text,
        stage -> Text,
        passed -> Bool,
        rejection_reason -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    reparse_filter_items (avito_item_id) {
        avito_item_id -> Text,
    }
}

diesel::table! {
    reparse_filter_articulums (articulum) {
        articulum -> Text,
    }
}

diesel::joinable!(catalog_tasks -> articulums (articulum_id));
diesel::joinable!(object_tasks -> articulums (articulum_id));
diesel::joinable!(catalog_listings -> articulums (articulum_id));
diesel::joinable!(object_data -> articulums (articulum_id));
diesel::joinable!(validation_results -> articulums (articulum_id));

diesel::allow_tables_to_appear_in_same_query!(
    articulums,
    proxies,
    catalog_tasks,
    object_tasks,
    catalog_listings,
    object_data,
    validation_results,
    reparse_filter_items,
    reparse_filter_articulums,
);
