diesel::table! {
    items (id) {
        id -> Int8,
        title -> Varchar,
        description -> Text,
        stock -> Int4,
    }
}

diesel::table! {
    orders (id) {
        id -> Int8,
        buyer_id -> Int8,
        item_id -> Int8,
        status -> Varchar,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(orders -> items (item_id));

diesel::allow_tables_to_appear_in_same_query!(
    items,
    orders,
);
