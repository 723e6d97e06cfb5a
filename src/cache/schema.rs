use crate::core::{Column, DataType, Result, Schema};
use crate::store::MemoryStore;

pub const CLIENTS: &str = "clients";
pub const EXTERNAL_REFS: &str = "external_refs";
pub const RES_GROUPS: &str = "res_groups";
pub const RES_GROUP_CLIENTS: &str = "res_group_clients";

pub fn clients() -> Schema {
    Schema::new(
        CLIENTS,
        vec![
            Column::new("cl_pk", DataType::Integer).primary_key(),
            Column::new("cl_ac_id", DataType::Text).identifier(),
            Column::new("cl_sf_id", DataType::Text).identifier(),
            Column::new("cl_sh_id", DataType::Text).identifier(),
            Column::new("cl_name", DataType::Text),
            Column::new("cl_email", DataType::Text),
            Column::new("cl_phone", DataType::Text),
            Column::new("cl_is_owner", DataType::Boolean),
            Column::new("cl_products", DataType::Text),
        ],
    )
}

pub fn external_refs() -> Schema {
    Schema::new(
        EXTERNAL_REFS,
        vec![
            Column::new("er_pk", DataType::Integer).primary_key(),
            Column::new("er_cl_fk", DataType::Integer).not_null(),
            Column::new("er_type", DataType::Text).not_null(),
            Column::new("er_id", DataType::Text).not_null(),
        ],
    )
}

pub fn res_groups() -> Schema {
    Schema::new(
        RES_GROUPS,
        vec![
            Column::new("rgr_pk", DataType::Integer).primary_key(),
            Column::new("rgr_ho_fk", DataType::Text).not_null(),
            Column::new("rgr_res_id", DataType::Text),
            Column::new("rgr_sub_id", DataType::Text),
            Column::new("rgr_gds_no", DataType::Text),
            Column::new("rgr_sf_id", DataType::Text),
            Column::new("rgr_obj_id", DataType::Text),
            Column::new("rgr_arrival", DataType::Date),
            Column::new("rgr_departure", DataType::Date),
            Column::new("rgr_status", DataType::Text),
            Column::new("rgr_mkt_segment", DataType::Text),
            Column::new("rgr_order_cl_fk", DataType::Integer),
            Column::new("rgr_room_id", DataType::Text),
            Column::new("rgr_time_in", DataType::Timestamp),
            Column::new("rgr_time_out", DataType::Timestamp),
            Column::new("rgr_last_change", DataType::Timestamp),
            Column::new("rgr_last_sync", DataType::Timestamp),
            Column::new("rgr_room_last_change", DataType::Timestamp),
            Column::new("rgr_room_last_sync", DataType::Timestamp),
        ],
    )
}

pub fn res_group_clients() -> Schema {
    Schema::new(
        RES_GROUP_CLIENTS,
        vec![
            Column::new("rgc_pk", DataType::Integer).primary_key(),
            Column::new("rgc_rgr_fk", DataType::Integer).not_null(),
            Column::new("rgc_room_seq", DataType::Integer).not_null(),
            Column::new("rgc_pers_seq", DataType::Integer).not_null(),
            Column::new("rgc_cl_fk", DataType::Integer),
            Column::new("rgc_surname", DataType::Text),
            Column::new("rgc_firstname", DataType::Text),
            Column::new("rgc_arrival", DataType::Date),
            Column::new("rgc_departure", DataType::Date),
            Column::new("rgc_room_id", DataType::Text),
        ],
    )
}

pub fn cache_schema() -> Vec<Schema> {
    vec![clients(), external_refs(), res_groups(), res_group_clients()]
}

/// Empty in-memory cache store with all cache tables.
pub fn memory_store() -> Result<MemoryStore> {
    MemoryStore::new(cache_schema())
}
