//! Integration tests for the reconciliation flow.
//!
//! These tests drive the catalog, pool and reconciler together against an
//! in-memory version source and real `sh` processes:
//! 1. Catalog partitions tags and picks the latest version
//! 2. Reconciler creates and destroys instances to match
//! 3. Failed instances are re-created on the next pass

use std::sync::Arc;
use std::time::Duration;

use bisq_controller::{
    Catalog, ControllerError, InstancePool, MockSource, Reconciler, VersionEvent,
};
use bisq_reconcile::{Action, LifecycleState};
use proptest::prelude::*;
use tokio::sync::watch;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    _workspace: tempfile::TempDir,
    source: Arc<MockSource>,
    reconciler: Arc<Reconciler>,
}

async fn harness(tags: &[&str], preview: bool, commands: &[&str]) -> Harness {
    let workspace = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::new(tags.iter().copied()));
    let catalog = Arc::new(Catalog::new(source.clone(), preview));
    catalog.init().await.unwrap();

    let reconciler = Arc::new(Reconciler::new(
        catalog,
        Arc::new(InstancePool::new()),
        source.clone(),
        "echo-app",
        commands.iter().map(|c| c.to_string()).collect(),
        workspace.path(),
    ));
    Harness {
        _workspace: workspace,
        source,
        reconciler,
    }
}

async fn pooled(reconciler: &Reconciler) -> Vec<(String, LifecycleState)> {
    reconciler
        .pool()
        .snapshot()
        .await
        .iter()
        .map(|i| (i.key().to_string(), i.state()))
        .collect()
}

async fn wait_until_pooled(reconciler: &Reconciler, expected: &[(&str, LifecycleState)]) {
    let expected: Vec<_> = expected.iter().map(|(k, s)| (k.to_string(), *s)).collect();
    timeout(WAIT, async {
        while pooled(reconciler).await != expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_latest_and_preview_are_created() {
    let h = harness(&["@v1.0.0", "@v1.1.0", "@preview/feat-x"], true, &["sleep 30"]).await;

    let snapshot = h.reconciler.catalog().snapshot().await;
    assert_eq!(snapshot.latest.as_ref().unwrap().name, "v1.1.0");
    assert_eq!(snapshot.standard.len(), 2);
    assert_eq!(snapshot.previews.len(), 1);

    let report = h.reconciler.reconcile().await;
    assert_eq!(
        report.created,
        vec!["preview/feat-x".to_string(), "v1.1.0".to_string()]
    );
    assert!(report.failed.is_empty());

    assert_eq!(
        pooled(&h.reconciler).await,
        vec![
            ("preview/feat-x".to_string(), LifecycleState::Running),
            ("v1.1.0".to_string(), LifecycleState::Running),
        ]
    );
    assert_eq!(
        h.source.materialized(),
        vec!["@preview/feat-x".to_string(), "@v1.1.0".to_string()]
    );

    h.reconciler.stop_all().await;
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let h = harness(&["@v1.0.0", "@preview/feat-x"], true, &["sleep 30"]).await;
    h.reconciler.reconcile().await;

    let actions = h.reconciler.plan().await;
    assert!(actions.iter().all(|a| a.action == Action::NoOp));
    assert!(h.reconciler.reconcile().await.is_empty());

    h.reconciler.stop_all().await;
}

#[tokio::test]
async fn test_failed_instance_is_recreated() {
    let h = harness(&["@v1.0.0"], false, &["exit 7"]).await;
    h.reconciler.reconcile().await;

    let first = h.reconciler.pool().get("v1.0.0").await.unwrap();
    let outcome = timeout(WAIT, first.take_completion().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Err(ControllerError::CommandFailed { .. })));
    assert_eq!(first.state(), LifecycleState::Stopped);

    let report = h.reconciler.reconcile().await;
    assert_eq!(report.created, vec!["v1.0.0".to_string()]);

    let second = h.reconciler.pool().get("v1.0.0").await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(h.reconciler.pool().len().await, 1);
}

#[tokio::test]
async fn test_removed_preview_is_destroyed() {
    let h = harness(&["@v1.0.0", "@preview/feat-x"], true, &["sleep 30"]).await;
    h.reconciler.reconcile().await;
    let preview = h.reconciler.pool().get("preview/feat-x").await.unwrap();

    h.source.set_tags(["@v1.0.0"]);
    let report = h.reconciler.refresh_and_reconcile().await.unwrap();

    assert_eq!(report.destroyed, vec!["preview/feat-x".to_string()]);
    assert_eq!(preview.state(), LifecycleState::Stopped);
    assert!(h.reconciler.pool().get("preview/feat-x").await.is_none());

    h.reconciler.stop_all().await;
}

#[tokio::test]
async fn test_unreachable_source_keeps_instances() {
    let h = harness(&["@v1.0.0"], false, &["sleep 30"]).await;
    h.reconciler.reconcile().await;

    h.source.set_unavailable(true);
    let report = h.reconciler.refresh_and_reconcile().await.unwrap();
    assert!(report.is_empty());
    assert_eq!(
        pooled(&h.reconciler).await,
        vec![("v1.0.0".to_string(), LifecycleState::Running)]
    );

    h.reconciler.stop_all().await;
}

#[tokio::test]
async fn test_loop_reacts_to_catalog_events() {
    let h = harness(&["@v1.0.0"], false, &["sleep 30"]).await;
    h.reconciler.reconcile().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let events = h.reconciler.catalog().subscribe();
    let handle = tokio::spawn(Arc::clone(&h.reconciler).run(
        events,
        shutdown_rx,
        Duration::from_secs(3600),
    ));

    // A refresh from outside the loop publishes `VersionUpdated`.
    let mut probe = h.reconciler.catalog().subscribe();
    h.source.push_tag("@v2.0.0");
    h.reconciler.catalog().refresh().await.unwrap();
    assert_eq!(
        probe.recv().await.unwrap(),
        VersionEvent::VersionUpdated {
            tag: "v2.0.0".to_string()
        }
    );

    wait_until_pooled(&h.reconciler, &[("v2.0.0", LifecycleState::Running)]).await;

    shutdown_tx.send(true).unwrap();
    timeout(WAIT, handle).await.unwrap().unwrap();
    h.reconciler.stop_all().await;
}

#[tokio::test]
async fn test_admin_refresh_alongside_loop_keeps_old_latest_serving() {
    let h = harness(&["@v1.1.0"], false, &["sleep 30"]).await;
    h.reconciler.reconcile().await;
    let old = h.reconciler.pool().get("v1.1.0").await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(Arc::clone(&h.reconciler).run(
        h.reconciler.catalog().subscribe(),
        shutdown_rx,
        Duration::from_secs(3600),
    ));

    // The refresh publishes `VersionUpdated`, so the loop starts its own
    // pass while this one is still pulling v1.2.0.
    h.source.delay_materialize("@v1.2.0", Duration::from_millis(1500));
    h.source.push_tag("@v1.2.0");
    let refresh = tokio::spawn({
        let reconciler = Arc::clone(&h.reconciler);
        async move { reconciler.refresh_and_reconcile().await }
    });

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(old.state(), LifecycleState::Running);
    assert_eq!(
        pooled(&h.reconciler).await,
        vec![
            ("v1.1.0".to_string(), LifecycleState::Running),
            ("v1.2.0".to_string(), LifecycleState::Pulling),
        ]
    );

    timeout(WAIT, refresh).await.unwrap().unwrap().unwrap();
    wait_until_pooled(&h.reconciler, &[("v1.2.0", LifecycleState::Running)]).await;
    assert_eq!(old.state(), LifecycleState::Stopped);

    shutdown_tx.send(true).unwrap();
    timeout(WAIT, handle).await.unwrap().unwrap();
    h.reconciler.stop_all().await;
}

#[tokio::test]
async fn test_preview_and_standard_sharing_a_name_both_run() {
    let h = harness(&["@v1.0.0", "@hotfix", "@preview/hotfix"], true, &["sleep 30"]).await;

    let report = h.reconciler.reconcile().await;
    assert_eq!(
        report.created,
        vec!["preview/hotfix".to_string(), "v1.0.0".to_string()]
    );

    // Make the standard tag of the same name the latest.
    h.source.set_tags(["@hotfix", "@preview/hotfix"]);
    h.reconciler.refresh_and_reconcile().await.unwrap();
    let mut running = pooled(&h.reconciler).await;
    running.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        running,
        vec![
            ("hotfix".to_string(), LifecycleState::Running),
            ("preview/hotfix".to_string(), LifecycleState::Running),
        ]
    );
    let preview = h.reconciler.pool().get("preview/hotfix").await.unwrap();
    assert_eq!(preview.name(), "hotfix");

    h.reconciler.stop_all().await;
}

fn tag_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(
        prop_oneof![
            (0u8..4, 0u8..4).prop_map(|(major, minor)| format!("@v{major}.{minor}.0")),
            "[a-c]{1,2}".prop_map(|name| format!("@preview/{name}")),
            "[a-z]{1,4}",
        ],
        0..6,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_second_pass_is_noop(tags in tag_strategy(), preview in any::<bool>()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let refs: Vec<&str> = tags.iter().map(String::as_str).collect();
            let h = harness(&refs, preview, &["sleep 30"]).await;

            let first = h.reconciler.reconcile().await;
            let running = h.reconciler.pool().len().await;
            let second = h.reconciler.reconcile().await;
            h.reconciler.stop_all().await;

            prop_assert!(first.failed.is_empty());
            prop_assert_eq!(first.created.len(), running);
            prop_assert!(second.is_empty());
            Ok(())
        })?;
    }
}
