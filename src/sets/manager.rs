//! Loads persisted set definitions, owns the working-sets map and schedules
//! per-set storage maintenance.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, info};

use super::asset::AssetState;
use super::set::Set;
use crate::config::EngineConfig;
use crate::core::{EngineError, EngineResult};
use crate::models::SetSettings;

pub struct SetManager {
    config: Arc<EngineConfig>,
    sets: RwLock<HashMap<String, Arc<Set>>>,
}

impl SetManager {
    /// Read `_sets.json` (creating it when absent) and open every declared
    /// set.
    pub async fn load(config: Arc<EngineConfig>) -> EngineResult<Arc<SetManager>> {
        config.ensure_directories()?;
        let manager = Arc::new(SetManager {
            config: Arc::clone(&config),
            sets: RwLock::new(HashMap::new()),
        });

        let path = config.sets_file_path();
        let list: Vec<SetSettings> = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            manager.persist_list(&[])?;
            Vec::new()
        };

        for set_settings in list {
            manager.add(set_settings, false).await?;
        }
        let count = manager.sets.read().expect("sets lock").len();
        info!(path = %path.display(), sets = count, "sets registry loaded");
        Ok(manager)
    }

    fn persist_list(&self, list: &[SetSettings]) -> EngineResult<()> {
        let json = serde_json::to_string_pretty(list)?;
        std::fs::write(self.config.sets_file_path(), json)?;
        Ok(())
    }

    fn read_list(&self) -> EngineResult<Vec<SetSettings>> {
        let path = self.config.sets_file_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(&path)?)?)
    }

    /// Open and register a set. `first_time` additionally persists the
    /// declaration into the registry file. Re-adding an active id is a
    /// no-op.
    pub async fn add(
        self: &Arc<Self>,
        set_settings: SetSettings,
        first_time: bool,
    ) -> EngineResult<Option<Arc<Set>>> {
        let id = set_settings.id_string();
        if id.is_empty() {
            return Err(EngineError::Validation("set id is empty".to_string()));
        }
        if self.sets.read().expect("sets lock").contains_key(&id) {
            return Ok(None);
        }

        if first_time {
            let mut list = self.read_list()?;
            if !list.iter().any(|s| s.id_string() == id) {
                list.push(set_settings.clone());
                self.persist_list(&list)?;
            }
        }

        let set = Set::open(set_settings, Arc::clone(&self.config)).await?;
        self.sets
            .write()
            .expect("sets lock")
            .insert(id, Arc::clone(&set));

        // Indicator assets hold non-owning address references; resolve them
        // now that the owning set is registered.
        for asset in set.assets() {
            if asset.is_indicator() {
                let deps = self.resolve_dependencies(&asset)?;
                asset.cache_dependencies(deps);
            }
        }
        Ok(Some(set))
    }

    pub fn find(&self, id: &str) -> Option<Arc<Set>> {
        self.sets.read().expect("sets lock").get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Set>> {
        let mut sets: Vec<Arc<Set>> = self
            .sets
            .read()
            .expect("sets lock")
            .values()
            .cloned()
            .collect();
        sets.sort_by(|a, b| a.id().cmp(b.id()));
        sets
    }

    /// Administrative removal: drop the set from the active map and the
    /// registry file. The store closes once the last reference drops.
    pub fn remove(&self, id: &str) -> EngineResult<()> {
        self.sets.write().expect("sets lock").remove(id);
        let list: Vec<SetSettings> = self
            .read_list()?
            .into_iter()
            .filter(|s| s.id_string() != id)
            .collect();
        self.persist_list(&list)
    }

    /// Resolve an indicator's dependency addresses to owning references
    /// through the active sets.
    pub fn resolve_dependencies(
        &self,
        asset: &Arc<AssetState>,
    ) -> EngineResult<Vec<Arc<AssetState>>> {
        let mut deps = Vec::new();
        for dep in &asset.parsed().dependencies {
            let parsed = dep.parse()?;
            let set = self
                .find(&parsed.set_id)
                .ok_or_else(|| EngineError::not_found("set", parsed.set_id.clone()))?;
            let state = set
                .find_asset(dep)
                .ok_or_else(|| EngineError::not_found("asset", dep.as_str()))?;
            deps.push(state);
        }
        Ok(deps)
    }

    /// Cached dependency vector, resolving on first use.
    pub fn dependencies_of(
        &self,
        asset: &Arc<AssetState>,
    ) -> EngineResult<Vec<Arc<AssetState>>> {
        if let Some(deps) = asset.dependencies() {
            return Ok(deps);
        }
        let deps = self.resolve_dependencies(asset)?;
        asset.cache_dependencies(deps.clone());
        Ok(deps)
    }

    /// Hourly storage maintenance over every set.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3_600));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                for set in manager.list() {
                    if let Err(e) = set.run_gc() {
                        error!(set = %set.id(), error = %e, "storage maintenance failed");
                    }
                }
            }
        })
    }
}
