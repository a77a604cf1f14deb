//! # ConfigMap References
//!
//! Maps a changed ConfigMap to the distributions that read it.
//!
//! The primary path is an in-memory index kept current from the
//! distribution watch. While the index is still syncing, or when it has no
//! entry for the ConfigMap, every distribution is scanned instead. If that
//! scan fails the change is treated as affecting all distributions, so a
//! missed update never goes unreconciled.

use async_trait::async_trait;
use kube::api::ListParams;
use kube::{Api, ResourceExt};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

use crate::crd::LlamaStackDistribution;

/// Namespace and name
type Key = (String, String);

/// ConfigMaps (namespace, name) a distribution reads
#[must_use]
pub fn referenced_config_maps(dist: &LlamaStackDistribution) -> Vec<Key> {
    let own_namespace = dist.namespace().unwrap_or_default();
    let mut refs = Vec::new();
    if let Some(name) = dist
        .spec
        .server
        .user_config
        .as_ref()
        .and_then(|c| c.config_map_name.as_ref())
    {
        let namespace = dist
            .spec
            .server
            .user_config
            .as_ref()
            .and_then(|c| c.config_map_namespace.clone())
            .unwrap_or_else(|| own_namespace.clone());
        refs.push((namespace, name.clone()));
    }
    if let Some(ca) = dist
        .spec
        .server
        .tls_config
        .as_ref()
        .and_then(|t| t.ca_bundle.as_ref())
    {
        let namespace = ca
            .config_map_namespace
            .clone()
            .unwrap_or_else(|| own_namespace.clone());
        refs.push((namespace, ca.config_map_name.clone()));
    }
    refs
}

/// Result of one lookup strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    Found(Vec<ObjectRef<LlamaStackDistribution>>),
    /// The strategy cannot answer right now
    Unsupported,
    Failed(String),
}

/// Which distributions a ConfigMap change affects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Affected {
    Some(Vec<ObjectRef<LlamaStackDistribution>>),
    All,
}

#[derive(Debug, Default)]
struct IndexState {
    by_config_map: HashMap<Key, BTreeSet<Key>>,
    by_distribution: HashMap<Key, Vec<Key>>,
    synced: bool,
}

/// ConfigMap to distribution index
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    state: Arc<RwLock<IndexState>>,
}

impl ReferenceIndex {
    pub fn update(&self, dist: &LlamaStackDistribution) {
        let key = (dist.namespace().unwrap_or_default(), dist.name_any());
        let refs = referenced_config_maps(dist);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        Self::unlink(&mut state, &key);
        for config_map in &refs {
            state
                .by_config_map
                .entry(config_map.clone())
                .or_default()
                .insert(key.clone());
        }
        state.by_distribution.insert(key, refs);
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        let key = (namespace.to_string(), name.to_string());
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        Self::unlink(&mut state, &key);
        state.by_distribution.remove(&key);
    }

    fn unlink(state: &mut IndexState, key: &Key) {
        let Some(previous) = state.by_distribution.get(key).cloned() else {
            return;
        };
        for config_map in previous {
            if let Some(owners) = state.by_config_map.get_mut(&config_map) {
                owners.remove(key);
                if owners.is_empty() {
                    state.by_config_map.remove(&config_map);
                }
            }
        }
    }

    pub fn set_synced(&self, synced: bool) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .synced = synced;
    }

    /// Keep the index in step with the distribution watch
    pub fn apply_event(&self, event: &watcher::Event<LlamaStackDistribution>) {
        match event {
            watcher::Event::Init => {
                let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
                *state = IndexState::default();
            }
            watcher::Event::InitApply(dist) | watcher::Event::Apply(dist) => self.update(dist),
            watcher::Event::InitDone => self.set_synced(true),
            watcher::Event::Delete(dist) => {
                self.remove(&dist.namespace().unwrap_or_default(), &dist.name_any());
            }
        }
    }

    #[must_use]
    pub fn lookup(&self, namespace: &str, name: &str) -> LookupResult {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if !state.synced {
            return LookupResult::Unsupported;
        }
        let owners = state
            .by_config_map
            .get(&(namespace.to_string(), name.to_string()))
            .map(|owners| {
                owners
                    .iter()
                    .map(|(ns, n)| ObjectRef::new(n).within(ns))
                    .collect()
            })
            .unwrap_or_default();
        LookupResult::Found(owners)
    }
}

/// Source of every distribution, for the full scan
#[async_trait]
pub trait DistributionLister: Send + Sync {
    async fn list(&self) -> Result<Vec<LlamaStackDistribution>, String>;
}

#[async_trait]
impl DistributionLister for Api<LlamaStackDistribution> {
    async fn list(&self) -> Result<Vec<LlamaStackDistribution>, String> {
        Api::list(self, &ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| e.to_string())
    }
}

/// Scan every distribution for a reference
pub async fn full_scan(lister: &dyn DistributionLister, namespace: &str, name: &str) -> LookupResult {
    match lister.list().await {
        Ok(distributions) => LookupResult::Found(
            distributions
                .iter()
                .filter(|dist| {
                    referenced_config_maps(dist)
                        .iter()
                        .any(|(ns, n)| ns == namespace && n == name)
                })
                .map(ObjectRef::from_obj)
                .collect(),
        ),
        Err(e) => LookupResult::Failed(e),
    }
}

/// Index first, scan as fallback, everything when both fail
#[derive(Clone)]
pub struct ReferenceResolver {
    index: ReferenceIndex,
    lister: Arc<dyn DistributionLister>,
}

impl ReferenceResolver {
    #[must_use]
    pub fn new(index: ReferenceIndex, lister: Arc<dyn DistributionLister>) -> Self {
        Self { index, lister }
    }

    pub async fn affected_by(&self, namespace: &str, name: &str) -> Affected {
        match self.index.lookup(namespace, name) {
            LookupResult::Found(owners) if !owners.is_empty() => return Affected::Some(owners),
            LookupResult::Found(_) | LookupResult::Unsupported => {}
            LookupResult::Failed(e) => debug!(error = %e, "Reference index lookup failed"),
        }
        match full_scan(self.lister.as_ref(), namespace, name).await {
            LookupResult::Found(owners) => Affected::Some(owners),
            LookupResult::Unsupported => Affected::All,
            LookupResult::Failed(e) => {
                warn!(
                    configmap = %format!("{namespace}/{name}"),
                    error = %e,
                    "Could not scan distributions, treating ConfigMap as referenced by all"
                );
                Affected::All
            }
        }
    }
}
