/// Upsert engine tests
///
/// Match, lock and transaction behavior of upserts on the cache tables
/// Run with: cargo test --test upsert_tests

use cachesync::cache::memory_store;
use cachesync::cache::schema::{CLIENTS, RES_GROUPS};
use cachesync::core::ColumnValues;
use cachesync::store::{Predicate, Select};
use cachesync::upsert::{UpsertAction, upsert};
use cachesync::{CacheStore, ErrorKind, Upsert, Value};

fn cols(pairs: &[(&str, &str)]) -> ColumnValues {
    pairs.iter().map(|(k, v)| (k.to_string(), Value::from(*v))).collect()
}

#[tokio::test]
async fn test_identifier_columns_form_default_match() {
    let store = memory_store().unwrap();
    let mut conn = store.connect().await.unwrap();

    let first = Upsert::new(CLIENTS, cols(&[("cl_sh_id", "77"), ("cl_name", "Miller")]))
        .returning("cl_pk")
        .execute(conn.as_mut())
        .await
        .unwrap();
    assert_eq!(first.action, UpsertAction::Inserted);

    let second = Upsert::new(CLIENTS, cols(&[("cl_sh_id", "77"), ("cl_email", "m@x.com")]))
        .returning("cl_pk")
        .execute(conn.as_mut())
        .await
        .unwrap();
    assert_eq!(second.action, UpsertAction::Updated);
    assert_eq!(second.key, first.key);

    let rows = conn.select(&Select::from(CLIENTS)).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["cl_name"], Value::from("Miller"));
    assert_eq!(rows[0]["cl_email"], Value::from("m@x.com"));
}

#[tokio::test]
async fn test_blank_values_never_match() {
    let store = memory_store().unwrap();
    let mut conn = store.connect().await.unwrap();
    let err = Upsert::new(CLIENTS, cols(&[("cl_ac_id", "  "), ("cl_name", "Nobody")]))
        .execute(conn.as_mut())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(store.row_count(CLIENTS).unwrap(), 0);
}

#[tokio::test]
async fn test_crm_id_is_locked_once_stored() {
    let store = memory_store().unwrap();
    let mut conn = store.connect().await.unwrap();
    let key = cols(&[("rgr_ho_fk", "1"), ("rgr_res_id", "R1"), ("rgr_sub_id", "1")]);
    let write = |sf_id: &str| {
        let mut values = key.clone();
        values.insert("rgr_sf_id".into(), Value::from(sf_id));
        upsert_res(values, key.clone())
    };

    write("").execute(conn.as_mut()).await.unwrap();
    write("a0B000000000001AAA").execute(conn.as_mut()).await.unwrap();
    write("a0B000000000002AAA").execute(conn.as_mut()).await.unwrap();

    let rows = conn.select(&Select::from(RES_GROUPS)).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["rgr_sf_id"], Value::from("a0B000000000001AAA"));
}

fn upsert_res(values: ColumnValues, key: ColumnValues) -> Upsert {
    Upsert::new(RES_GROUPS, values).matching(key).locked(["rgr_sf_id"])
}

#[tokio::test]
async fn test_rollback_discards_every_upsert_of_the_transaction() {
    let store = memory_store().unwrap();
    let mut conn = store.connect().await.unwrap();
    upsert(conn.as_mut(), CLIENTS, cols(&[("cl_ac_id", "E1"), ("cl_name", "Kept")]), None, &[], None)
        .await
        .unwrap();

    conn.begin().await.unwrap();
    upsert(conn.as_mut(), CLIENTS, cols(&[("cl_ac_id", "E1"), ("cl_name", "Changed")]), None, &[], None)
        .await
        .unwrap();
    upsert(conn.as_mut(), CLIENTS, cols(&[("cl_ac_id", "E2")]), None, &[], None).await.unwrap();
    conn.rollback().await.unwrap();

    let rows = conn.select(&Select::from(CLIENTS).filter(Predicate::eq("cl_ac_id", "E1"))).await.unwrap();
    assert_eq!(rows[0]["cl_name"], Value::from("Kept"));
    assert_eq!(store.row_count(CLIENTS).unwrap(), 1);
}

#[tokio::test]
async fn test_dropped_connection_rolls_back_open_transaction() {
    let store = memory_store().unwrap();
    {
        let mut conn = store.connect().await.unwrap();
        conn.begin().await.unwrap();
        upsert(conn.as_mut(), CLIENTS, cols(&[("cl_ac_id", "E1")]), None, &[], None).await.unwrap();
    }
    assert_eq!(store.row_count(CLIENTS).unwrap(), 0);
}
