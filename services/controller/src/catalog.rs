//! Version catalog.
//!
//! Caches the tags reported by the version source, split into standard and
//! preview versions, and tracks the latest standard version. Each refresh
//! replaces the cached lists wholesale and publishes typed change events.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::error::{ControllerError, Result};
use crate::source::VersionSource;
use crate::version::{self, Version};

/// Capacity of the change event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Change notification published by [`Catalog::refresh`]. `tag` carries the
/// version key (see [`Version::key`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionEvent {
    /// The latest standard version changed.
    VersionUpdated { tag: String },
    /// A preview appeared.
    PreviewAdded { tag: String },
    /// A version disappeared from the source.
    VersionRemoved { tag: String },
}

/// Immutable view of the catalog at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogSnapshot {
    pub standard: Vec<Version>,
    pub previews: Vec<Version>,
    pub latest: Option<Version>,
}

impl CatalogSnapshot {
    fn from_tags(tags: &[String]) -> Self {
        let (standard, previews) = version::classify(tags);
        let latest = version::latest(&standard).cloned();
        Self {
            standard,
            previews,
            latest,
        }
    }

    fn keys(&self) -> BTreeSet<&str> {
        self.standard
            .iter()
            .chain(&self.previews)
            .map(Version::key)
            .collect()
    }

    /// Look up a version by key or raw tag.
    pub fn find(&self, key: &str) -> Option<&Version> {
        self.standard
            .iter()
            .chain(&self.previews)
            .find(|v| v.key() == key || v.tag == key)
    }
}

pub struct Catalog {
    source: Arc<dyn VersionSource>,
    preview_enabled: bool,
    state: RwLock<CatalogSnapshot>,
    events: broadcast::Sender<VersionEvent>,
}

impl Catalog {
    pub fn new(source: Arc<dyn VersionSource>, preview_enabled: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            source,
            preview_enabled,
            state: RwLock::new(CatalogSnapshot::default()),
            events,
        }
    }

    /// Prepare the source and load the initial tag list.
    pub async fn init(&self) -> Result<()> {
        self.source.prepare().await?;
        self.refresh().await?;
        Ok(())
    }

    /// Reload tags from the source.
    ///
    /// Returns whether the latest standard version changed. An unreachable
    /// source is not an error: the cached lists stay in place.
    pub async fn refresh(&self) -> Result<bool> {
        let tags = match self.source.list_tags().await {
            Ok(tags) => tags,
            Err(ControllerError::SourceUnavailable(reason)) => {
                warn!(reason = %reason, "Version source unavailable, keeping cached tags");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let next = CatalogSnapshot::from_tags(&tags);
        for v in next.standard.iter().chain(&next.previews) {
            debug!(tag = %v.tag, preview = v.is_preview(), "Detected version");
        }

        let (events, changed) = {
            let mut state = self.state.write().await;
            let events = diff(&state, &next);
            let changed = state.latest.as_ref().map(|v| &v.name)
                != next.latest.as_ref().map(|v| &v.name);
            *state = next;
            (events, changed)
        };

        info!(
            changed,
            event_count = events.len(),
            "Catalog refreshed"
        );

        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        Ok(changed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VersionEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> CatalogSnapshot {
        self.state.read().await.clone()
    }

    pub async fn latest(&self) -> Option<Version> {
        self.state.read().await.latest.clone()
    }

    /// Look up a version by key or raw tag.
    pub async fn find_version(&self, key: &str) -> Result<Version> {
        self.state
            .read()
            .await
            .find(key)
            .cloned()
            .ok_or_else(|| ControllerError::VersionNotFound(key.to_string()))
    }

    pub fn preview_enabled(&self) -> bool {
        self.preview_enabled
    }
}

/// Events describing the move from `prev` to `next`.
fn diff(prev: &CatalogSnapshot, next: &CatalogSnapshot) -> Vec<VersionEvent> {
    let mut events = Vec::new();

    let prev_latest = prev.latest.as_ref().map(|v| v.name.as_str());
    if let Some(latest) = &next.latest {
        if prev_latest != Some(latest.name.as_str()) {
            info!(latest = %latest.name, previous = ?prev_latest, "Latest version updated");
            events.push(VersionEvent::VersionUpdated {
                tag: latest.name.clone(),
            });
        }
    }

    let prev_previews: BTreeSet<&str> = prev.previews.iter().map(Version::key).collect();
    for preview in &next.previews {
        if !prev_previews.contains(preview.key()) {
            info!(preview = %preview.name, "Detected new preview version");
            events.push(VersionEvent::PreviewAdded {
                tag: preview.key().to_string(),
            });
        }
    }

    let next_keys = next.keys();
    for key in prev.keys().difference(&next_keys) {
        info!(tag = %key, "Version removed");
        events.push(VersionEvent::VersionRemoved {
            tag: (*key).to_string(),
        });
    }

    events
}
