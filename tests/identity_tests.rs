/// Identity resolution tests
///
/// Client notifications from the hotel system merged into cache clients
/// Run with: cargo test --test identity_tests

use std::sync::Arc;

use cachesync::cache::schema::CLIENTS;
use cachesync::cache::{ClientIdentity, load_client, memory_store};
use cachesync::fields::ExtRefs;
use cachesync::identity::MatchKey;
use cachesync::protocol::{Request, RequestBody, RequestShape};
use cachesync::{CacheStore, IdentityResolver, NamedLocks, System};

fn notification(email: &str, ext_refs: &str) -> ClientIdentity {
    let doc = format!(
        "<SIHOT-Document><OC>GUEST-CHANGE</OC><GUEST><MATCHCODE>E4711</MATCHCODE><NAME-1>Miller</NAME-1>\
         <NAME-2>Ann</NAME-2><EMAIL-1>{}</EMAIL-1><EXT-REFS>{}</EXT-REFS></GUEST></SIHOT-Document>",
        email, ext_refs
    );
    let RequestBody::Guest(rec) = Request::parse(&doc, RequestShape::Guest).unwrap().body else {
        panic!("guest body expected")
    };
    ClientIdentity::from_record(&rec).unwrap()
}

#[tokio::test]
async fn test_same_erp_id_with_different_email_is_one_client() {
    let store = memory_store().unwrap();
    let mut conn = store.connect().await.unwrap();
    let resolver = IdentityResolver::new(Arc::new(NamedLocks::new()));

    let first = resolver.resolve(conn.as_mut(), &notification("ann@mail.com", "RCI=1")).await.unwrap();
    let second = resolver
        .resolve(conn.as_mut(), &notification("ann.miller@mail.com", "RCI=2,KEYS=7"))
        .await
        .unwrap();

    assert!(first.created);
    assert_eq!(second.ass_id, first.ass_id);
    assert_eq!(second.matched_by, Some(MatchKey::Id(System::Acu)));
    assert_eq!(store.row_count(CLIENTS).unwrap(), 1);

    let discrepancies: Vec<_> = first.discrepancies.iter().chain(&second.discrepancies).collect();
    assert_eq!(discrepancies.len(), 1);
    assert_eq!(discrepancies[0].column, "cl_email");
    assert_eq!(discrepancies[0].existing, "ann@mail.com");
    assert_eq!(discrepancies[0].incoming, "ann.miller@mail.com");

    let cached = load_client(conn.as_mut(), first.ass_id).await.unwrap().unwrap();
    assert_eq!(cached.email.as_deref(), Some("ann@mail.com"));
    assert_eq!(cached.name.as_deref(), Some("Ann Miller"));
    assert_eq!(cached.ext_refs, ExtRefs::parse("RCI=1,RCI=2,KEYS=7").unwrap());
}

#[tokio::test]
async fn test_repeated_notification_changes_nothing() {
    let store = memory_store().unwrap();
    let mut conn = store.connect().await.unwrap();
    let resolver = IdentityResolver::new(Arc::new(NamedLocks::new()));
    let incoming = notification("ann@mail.com", "RCI=1");

    let first = resolver.resolve(conn.as_mut(), &incoming).await.unwrap();
    let again = resolver.resolve(conn.as_mut(), &incoming).await.unwrap();
    assert_eq!(again.ass_id, first.ass_id);
    assert!(again.discrepancies.is_empty());
    assert_eq!(again.identity, first.identity);
}

#[tokio::test]
async fn test_known_ass_id_wins_over_erp_id() {
    let store = memory_store().unwrap();
    let mut conn = store.connect().await.unwrap();
    let resolver = IdentityResolver::new(Arc::new(NamedLocks::new()));

    let erp = resolver.resolve(conn.as_mut(), &notification("ann@mail.com", "")).await.unwrap();
    let other = resolver
        .resolve(conn.as_mut(), &ClientIdentity { sh_id: Some("900".into()), ..Default::default() })
        .await
        .unwrap();
    assert_ne!(erp.ass_id, other.ass_id);

    let incoming = ClientIdentity { ass_id: Some(other.ass_id), ..notification("ann@mail.com", "") };
    let resolution = resolver.resolve(conn.as_mut(), &incoming).await.unwrap();
    assert_eq!(resolution.ass_id, other.ass_id);
    assert_eq!(resolution.matched_by, Some(MatchKey::AssId));
    // the cached client had no ERP id yet and gets the incoming one
    assert_eq!(resolution.identity.acu_id.as_deref(), Some("E4711"));
}

#[tokio::test]
async fn test_malformed_ext_ref_keeps_client_and_valid_refs() {
    let store = memory_store().unwrap();
    let mut conn = store.connect().await.unwrap();
    let resolver = IdentityResolver::new(Arc::new(NamedLocks::new()));

    let resolution = resolver.resolve(conn.as_mut(), &notification("ann@mail.com", "RCI=5,KEYS=")).await.unwrap();
    assert!(resolution.created);
    let cached = load_client(conn.as_mut(), resolution.ass_id).await.unwrap().unwrap();
    assert_eq!(cached.ext_refs, ExtRefs::parse("RCI=5").unwrap());
}
