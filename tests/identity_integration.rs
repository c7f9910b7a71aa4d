//! Device identity migration against the mock server.

mod common;

use chrono::{TimeZone, Utc};
use common::MockServer;
use screendeck_player::identity::IdentityResolver;
use screendeck_player::model::DeviceIdentity;
use screendeck_player::store::Store;
use std::sync::Arc;

#[tokio::test]
async fn test_first_start_migrates_identity() {
    let server = MockServer::start().await;
    server.add_device("dev-1", "LOBBY-01", "area-7");

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path(), 100).unwrap());
    let resolver = IdentityResolver::new(store.clone(), server.client());

    let identity = resolver.resolve(Some("dev-1")).await.unwrap();
    assert_eq!(identity.device_code, "LOBBY-01");
    assert_eq!(identity.area_id, "area-7");
    assert_eq!(
        identity.registered_at,
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    );
    assert_eq!(store.load_identity().await.unwrap(), Some(identity.clone()));

    // later starts need neither the server nor the supplied id
    server.set_online(false);
    let resolver = IdentityResolver::new(store, server.client());
    assert_eq!(resolver.resolve(None).await, Some(identity));
}

#[tokio::test]
async fn test_supplied_id_overrides_persisted_identity() {
    let server = MockServer::start().await;
    server.add_device("dev-2", "HALL-02", "area-9");

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path(), 100).unwrap());
    store
        .save_identity(&DeviceIdentity {
            device_id: "dev-1".into(),
            device_code: "LOBBY-01".into(),
            area_id: "area-7".into(),
            registered_at: Utc::now(),
        })
        .await
        .unwrap();

    let resolver = IdentityResolver::new(store.clone(), server.client());
    let identity = resolver.resolve(Some("dev-2")).await.unwrap();
    assert_eq!(identity.device_id, "dev-2");
    assert_eq!(store.load_identity().await.unwrap().unwrap().area_id, "area-9");
}

#[tokio::test]
async fn test_unknown_device_leaves_no_identity() {
    let server = MockServer::start().await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path(), 100).unwrap());
    let resolver = IdentityResolver::new(store.clone(), server.client());

    assert!(resolver.resolve(Some("ghost")).await.is_none());
    assert!(resolver.refresh("ghost").await.is_err());
    assert!(store.load_identity().await.unwrap().is_none());
}
