//! Reconciliation loop for converging running instances to the catalog.
//!
//! The reconciler:
//! - Computes the desired state of every catalogued or pooled version
//! - Diffs it against the pool with `bisq_reconcile::plan`
//! - Creates missing instances before destroying unwanted ones
//! - Re-runs on a refresh interval and on catalog change events
//!
//! Passes may overlap (the loop and an admin refresh). Slots are claimed
//! atomically, and a running standard instance is only destroyed once no
//! desired standard replacement is still pulling.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bisq_reconcile::{Action, DesiredState, LifecycleState, PlannedAction};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, CatalogSnapshot, VersionEvent};
use crate::error::Result;
use crate::instance::{AppInstance, InstanceSpec};
use crate::pool::InstancePool;
use crate::port::PortAllocator;
use crate::source::VersionSource;
use crate::version::Version;

/// What a single `apply` did, by version key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub created: Vec<String>,
    pub destroyed: Vec<String>,
    pub failed: Vec<String>,
    /// Destroys held back while a replacement is still pulling.
    pub deferred: Vec<String>,
}

impl ApplyReport {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.destroyed.is_empty()
            && self.failed.is_empty()
            && self.deferred.is_empty()
    }
}

pub struct Reconciler {
    catalog: Arc<Catalog>,
    pool: Arc<InstancePool>,
    ports: PortAllocator,
    source: Arc<dyn VersionSource>,
    app: String,
    run_commands: Vec<String>,
    workspace_dir: PathBuf,
}

impl Reconciler {
    pub fn new(
        catalog: Arc<Catalog>,
        pool: Arc<InstancePool>,
        source: Arc<dyn VersionSource>,
        app: impl Into<String>,
        run_commands: Vec<String>,
        workspace_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            catalog,
            pool,
            ports: PortAllocator::new(),
            source,
            app: app.into(),
            run_commands,
            workspace_dir: workspace_dir.into(),
        }
    }

    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.pool
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Desired state for every catalogued version, by version key.
    ///
    /// Only the latest standard version, plus catalogued previews when
    /// previews are enabled, should be running.
    fn desired(&self, snapshot: &CatalogSnapshot) -> BTreeMap<String, DesiredState> {
        let latest = snapshot.latest.as_ref().map(Version::key);
        let previews = self.catalog.preview_enabled();

        let mut desired = BTreeMap::new();
        for v in &snapshot.standard {
            let state = if Some(v.key()) == latest {
                DesiredState::Running
            } else {
                DesiredState::Stopped
            };
            desired.insert(v.key().to_string(), state);
        }
        for v in &snapshot.previews {
            let state = if previews {
                DesiredState::Running
            } else {
                DesiredState::Stopped
            };
            desired.insert(v.key().to_string(), state);
        }
        desired
    }

    /// Compute the actions for one pass without applying them.
    pub async fn plan(&self) -> Vec<PlannedAction<String>> {
        let snapshot = self.catalog.snapshot().await;
        let desired = self.desired(&snapshot);
        let observed = self.pool.observed().await;
        bisq_reconcile::plan(&desired, &observed)
    }

    /// Run one reconciliation pass.
    pub async fn reconcile(&self) -> ApplyReport {
        let actions = self.plan().await;
        for a in &actions {
            debug!(
                version = %a.key,
                desired = ?a.desired,
                current = ?a.current,
                action = ?a.action,
                "Planned action"
            );
        }

        let report = self.apply(&actions).await;
        if !report.is_empty() {
            info!(
                created = ?report.created,
                destroyed = ?report.destroyed,
                failed = ?report.failed,
                deferred = ?report.deferred,
                "Reconciliation pass applied"
            );
        }
        report
    }

    /// Apply a plan. Creates run before destroys so traffic always has a target.
    pub async fn apply(&self, actions: &[PlannedAction<String>]) -> ApplyReport {
        let mut report = ApplyReport::default();
        let snapshot = self.catalog.snapshot().await;

        for a in actions.iter().filter(|a| a.action == Action::Create) {
            let Some(version) = snapshot.find(&a.key).cloned() else {
                warn!(version = %a.key, "Version vanished from the catalog, skipping create");
                report.failed.push(a.key.clone());
                continue;
            };
            match self.create(version).await {
                Ok(true) => report.created.push(a.key.clone()),
                Ok(false) => debug!(version = %a.key, "Instance already claimed, skipping"),
                Err(e) => {
                    error!(
                        version = %a.key,
                        error = %e,
                        code = e.code(),
                        "Failed to create instance"
                    );
                    report.failed.push(a.key.clone());
                }
            }
        }

        let pending = self.pending_replacement(actions).await;
        for a in actions.iter().filter(|a| a.action == Action::Destroy) {
            if let Some(replacement) = &pending {
                let serving = self.pool.get(&a.key).await.is_some_and(|i| {
                    !i.version().is_preview() && i.state() == LifecycleState::Running
                });
                if serving {
                    info!(
                        version = %a.key,
                        replacement = %replacement,
                        "Replacement still pulling, keeping instance"
                    );
                    report.deferred.push(a.key.clone());
                    continue;
                }
            }

            if let Some(instance) = self.pool.remove(&a.key).await {
                info!(version = %a.key, state = %instance.state(), "Destroying instance");
                instance.stop();
                report.destroyed.push(a.key.clone());
            }
        }

        report
    }

    /// Key of a standard version that should run but is still pulling,
    /// typically being created by an overlapping pass.
    async fn pending_replacement(&self, actions: &[PlannedAction<String>]) -> Option<String> {
        for a in actions.iter().filter(|a| a.desired == DesiredState::Running) {
            if let Some(instance) = self.pool.get(&a.key).await {
                if !instance.version().is_preview() && instance.state() == LifecycleState::Pulling
                {
                    return Some(a.key.clone());
                }
            }
        }
        None
    }

    /// Start a new instance for `version`. Returns `Ok(false)` if another
    /// pass already holds the slot.
    async fn create(&self, version: Version) -> Result<bool> {
        let port = self.ports.acquire().await?;
        let spec = InstanceSpec {
            app: self.app.clone(),
            work_dir: self.workspace_dir.join(version.dir_name()),
            version,
            port,
            run_commands: self.run_commands.clone(),
        };
        let instance = AppInstance::new(spec, Arc::clone(&self.source));

        if !self.pool.claim(Arc::clone(&instance)).await {
            return Ok(false);
        }

        info!(
            app = %self.app,
            version = %instance.name(),
            key = %instance.key(),
            port,
            "Creating instance"
        );
        if let Err(e) = instance.start().await {
            self.pool.release(&instance).await;
            return Err(e);
        }
        Ok(true)
    }

    /// Refresh the catalog and reconcile.
    pub async fn refresh_and_reconcile(&self) -> Result<ApplyReport> {
        self.catalog.refresh().await?;
        Ok(self.reconcile().await)
    }

    /// One timer-driven pass. The first one prepares the source and loads
    /// the catalog.
    async fn scheduled_pass(&self, first: bool) {
        if first {
            if let Err(e) = self.catalog.init().await {
                warn!(
                    error = %e,
                    code = e.code(),
                    "Initial catalog load failed, retrying on the next refresh"
                );
            }
            self.reconcile().await;
        } else if let Err(e) = self.refresh_and_reconcile().await {
            error!(error = %e, code = e.code(), "Periodic refresh failed");
        }
    }

    /// Run the reconciliation loop until shutdown.
    ///
    /// The first tick fires immediately and performs the initial catalog
    /// load, so callers can serve traffic while it runs.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<VersionEvent>,
        mut shutdown: watch::Receiver<bool>,
        refresh_interval: Duration,
    ) {
        info!(
            refresh_interval_secs = refresh_interval.as_secs(),
            "Starting reconciliation loop"
        );

        let mut ticker = tokio::time::interval(refresh_interval);
        let mut first = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pass = self.scheduled_pass(first);
                    first = false;
                    // A hung source call must not hold up shutdown.
                    tokio::select! {
                        _ = pass => {}
                        _ = shutdown.wait_for(|stop| *stop) => {
                            info!("Reconciler shutting down during a pass");
                            break;
                        }
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        let coalesced = drain_pending(&mut events);
                        debug!(event = ?event, coalesced, "Catalog changed");
                        self.reconcile().await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        drain_pending(&mut events);
                        warn!(skipped, "Missed catalog events, reconciling");
                        self.reconcile().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Catalog event channel closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    // A dropped sender also means shut down.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Stop and forget every pooled instance.
    pub async fn stop_all(&self) -> usize {
        let instances = self.pool.drain().await;
        for instance in &instances {
            instance.stop();
        }
        instances.len()
    }
}

/// Discard events already queued; the pass about to run covers them.
/// Returns how many were dropped.
fn drain_pending(events: &mut broadcast::Receiver<VersionEvent>) -> u64 {
    let mut drained = 0;
    loop {
        match events.try_recv() {
            Ok(_) => drained += 1,
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => drained += skipped,
            Err(_) => return drained,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockSource;

    struct Fixture {
        _dir: tempfile::TempDir,
        source: Arc<MockSource>,
        reconciler: Reconciler,
    }

    async fn fixture(tags: &[&str], preview: bool, commands: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MockSource::new(tags.iter().copied()));
        let catalog = Arc::new(Catalog::new(source.clone(), preview));
        catalog.init().await.unwrap();
        let reconciler = Reconciler::new(
            catalog,
            Arc::new(InstancePool::new()),
            source.clone(),
            "echo-app",
            commands.iter().map(|c| c.to_string()).collect(),
            dir.path(),
        );
        Fixture {
            _dir: dir,
            source,
            reconciler,
        }
    }

    fn creates(actions: &[PlannedAction<String>]) -> Vec<&str> {
        actions
            .iter()
            .filter(|a| a.action == Action::Create)
            .map(|a| a.key.as_str())
            .collect()
    }

    #[tokio::test]
    async fn test_plan_creates_latest_and_previews() {
        let f = fixture(&["@v1.0.0", "@v1.1.0", "@preview/feat-x"], true, &["sleep 30"]).await;
        let actions = f.reconciler.plan().await;
        assert_eq!(creates(&actions), vec!["preview/feat-x", "v1.1.0"]);
    }

    #[tokio::test]
    async fn test_preview_sharing_a_standard_name_is_created() {
        let f = fixture(&["@v1.0.0", "@hotfix", "@preview/hotfix"], true, &["sleep 30"]).await;

        let report = f.reconciler.reconcile().await;
        assert_eq!(
            report.created,
            vec!["preview/hotfix".to_string(), "v1.0.0".to_string()]
        );
        assert_eq!(
            f.source.materialized(),
            vec!["@preview/hotfix".to_string(), "@v1.0.0".to_string()]
        );
        assert!(f.reconciler.pool().get("hotfix").await.is_none());
        f.reconciler.stop_all().await;
    }

    #[tokio::test]
    async fn test_plan_ignores_previews_when_disabled() {
        let f = fixture(&["@v1.0.0", "@preview/feat-x"], false, &["sleep 30"]).await;
        let actions = f.reconciler.plan().await;
        assert_eq!(creates(&actions), vec!["v1.0.0"]);
    }

    #[tokio::test]
    async fn test_second_pass_is_noop() {
        let f = fixture(&["@v1.0.0", "@v1.1.0"], true, &["sleep 30"]).await;

        let first = f.reconciler.reconcile().await;
        assert_eq!(first.created, vec!["v1.1.0".to_string()]);

        assert!(bisq_reconcile::is_converged(&f.reconciler.plan().await));
        assert!(f.reconciler.reconcile().await.is_empty());
        f.reconciler.stop_all().await;
    }

    #[tokio::test]
    async fn test_materialization_failure_releases_slot() {
        let f = fixture(&["@v1.0.0"], false, &["sleep 30"]).await;
        f.source.fail_materialize("@v1.0.0");

        let report = f.reconciler.reconcile().await;
        assert_eq!(report.failed, vec!["v1.0.0".to_string()]);
        assert!(f.reconciler.pool().is_empty().await);
    }

    #[tokio::test]
    async fn test_new_latest_replaces_old() {
        let f = fixture(&["@v1.0.0"], false, &["sleep 30"]).await;
        f.reconciler.reconcile().await;
        let old = f.reconciler.pool().get("v1.0.0").await.unwrap();

        f.source.push_tag("@v1.2.0");
        let report = f.reconciler.refresh_and_reconcile().await.unwrap();

        assert_eq!(report.created, vec!["v1.2.0".to_string()]);
        assert_eq!(report.destroyed, vec!["v1.0.0".to_string()]);
        assert_eq!(old.state(), LifecycleState::Stopped);
        let new = f.reconciler.pool().get("v1.2.0").await.unwrap();
        assert_eq!(new.state(), LifecycleState::Running);
        f.reconciler.stop_all().await;
    }

    #[tokio::test]
    async fn test_destroy_waits_for_pulling_replacement() {
        let f = fixture(&["@v1.0.0"], false, &["sleep 30"]).await;
        f.reconciler.reconcile().await;
        let old = f.reconciler.pool().get("v1.0.0").await.unwrap();

        f.source.delay_materialize("@v1.2.0", Duration::from_millis(500));
        f.source.push_tag("@v1.2.0");
        f.reconciler.catalog().refresh().await.unwrap();

        // The second pass starts while the first is still pulling v1.2.0.
        let (first, (second, old_state)) = tokio::join!(f.reconciler.reconcile(), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let report = f.reconciler.reconcile().await;
            (report, old.state())
        });

        assert_eq!(second.deferred, vec!["v1.0.0".to_string()]);
        assert!(second.destroyed.is_empty());
        assert_eq!(old_state, LifecycleState::Running);

        assert_eq!(first.created, vec!["v1.2.0".to_string()]);
        assert_eq!(first.destroyed, vec!["v1.0.0".to_string()]);
        assert_eq!(old.state(), LifecycleState::Stopped);
        f.reconciler.stop_all().await;
    }

    #[tokio::test]
    async fn test_drain_pending_coalesces_events() {
        let f = fixture(&[], true, &["sleep 30"]).await;
        let mut events = f.reconciler.catalog().subscribe();

        f.source.set_tags(["@v1.0.0", "@preview/a", "@preview/b"]);
        f.reconciler.catalog().refresh().await.unwrap();

        assert!(events.recv().await.is_ok());
        assert_eq!(drain_pending(&mut events), 2);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_all_empties_pool() {
        let f = fixture(&["@v1.0.0", "@preview/a"], true, &["sleep 30"]).await;
        f.reconciler.reconcile().await;
        assert_eq!(f.reconciler.stop_all().await, 2);
        assert!(f.reconciler.pool().is_empty().await);
    }
}
