use std::sync::Arc;
use std::time::Duration;

use firestore_sync::remote::{Datastore, FakeDatastore};
use firestore_sync::{start_multi_tab_durable_persistence, Firestore};

#[tokio::test(flavor = "multi_thread")]
async fn second_tab_stays_secondary_until_the_primary_releases() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.json");

    let datastore_a = Arc::new(FakeDatastore::new());
    let firestore_a = Firestore::new();
    let tab_a = start_multi_tab_durable_persistence(
        &firestore_a,
        datastore_a.clone() as Arc<dyn Datastore>,
        &path,
    )
    .await
    .expect("start first tab");
    assert!(tab_a.is_primary().await);
    assert!(tab_a.is_network_enabled().await);

    let datastore_b = Arc::new(FakeDatastore::new());
    let firestore_b = Firestore::new();
    let tab_b = start_multi_tab_durable_persistence(
        &firestore_b,
        datastore_b.clone() as Arc<dyn Datastore>,
        &path,
    )
    .await
    .expect("start second tab");
    assert!(!tab_b.is_primary().await);
    assert!(!tab_b.is_network_enabled().await);

    tab_a.terminate().await.expect("terminate first tab");

    // The released lease is picked up on the next heartbeat tick.
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(tab_b.is_primary().await);
    assert!(tab_b.is_network_enabled().await);

    tab_b.terminate().await.expect("terminate second tab");
}

#[tokio::test(flavor = "multi_thread")]
async fn durable_queue_survives_restart() {
    use firestore_sync::value::{FirestoreValue, MapValue};
    use firestore_sync::{start_durable_persistence, SetOptions};
    use std::collections::BTreeMap;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");

    {
        let datastore = Arc::new(FakeDatastore::new());
        let firestore = Firestore::new();
        let client =
            start_durable_persistence(&firestore, datastore.clone() as Arc<dyn Datastore>, &path)
                .await
                .expect("start client");
        client.disable_network().await.unwrap();
        let reference = client.doc("cities/sf").unwrap();
        let mut fields = BTreeMap::new();
        fields.insert("population".to_string(), FirestoreValue::from_integer(1));
        let _ack = client
            .set_document(&reference, MapValue::new(fields), SetOptions::overwrite())
            .await
            .expect("stage write");
        assert_eq!(datastore.commit_count().await, 0);
        client.terminate().await.expect("terminate");
    }

    // A fresh client over the same file pushes the queued batch on start.
    let datastore = Arc::new(FakeDatastore::new());
    let firestore = Firestore::new();
    let client =
        start_durable_persistence(&firestore, datastore.clone() as Arc<dyn Datastore>, &path)
            .await
            .expect("restart client");
    client
        .wait_for_pending_writes()
        .await
        .expect("queue drained");
    assert_eq!(datastore.commit_count().await, 1);
    client.terminate().await.expect("terminate");
}
