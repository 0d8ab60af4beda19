// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

diesel::table! {
    items (iid) {
        iid -> Text,
        inherit_resolved -> Bool,
        from_index -> Bool,
        from_require -> Bool,
        install_status -> Integer,
        ignore -> Bool,
    }
}

diesel::table! {
    details (id) {
        id -> Integer,
        original_iid -> Text,
        owner_iid -> Text,
        os_id -> Text,
        detail_name -> Text,
        detail_value -> Text,
        generation -> Integer,
        tag -> Nullable<Text>,
        os_is_active -> Bool,
    }
}

diesel::joinable!(details -> items (owner_iid));
diesel::allow_tables_to_appear_in_same_query!(items, details);
