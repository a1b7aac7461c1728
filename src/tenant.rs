use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::effects::{self, Collaborators};
use crate::engine::Engine;
use crate::limits::*;
use crate::reaper;

/// Background cadence shared by every tenant.
#[derive(Debug, Clone, Copy)]
pub struct TenantSettings {
    pub compact_threshold: u64,
    pub completion_sweep: Duration,
}

/// One engine, WAL, side-effect worker and set of sweepers per tenant.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    settings: TenantSettings,
    collaborators: Collaborators,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: TenantSettings, collaborators: Collaborators) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            settings,
            collaborators,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }

        // The tenant name is the WAL file name, so it must be usable as-is.
        if tenant.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }
        if !tenant
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name may only contain letters, digits, '_' and '-'",
            ));
        }

        // Hold the entry so two first connections can't open the same WAL twice.
        let tenant_count = self.engines.len();
        match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                if tenant_count >= MAX_TENANTS {
                    return Err(std::io::Error::other("too many tenants"));
                }
                let engine = self.start_engine(tenant)?;
                slot.insert(engine.clone());
                metrics::gauge!(crate::observability::TENANTS_ACTIVE)
                    .set((tenant_count + 1) as f64);
                tracing::info!("tenant {tenant} loaded");
                Ok(engine)
            }
        }
    }

    fn start_engine(&self, name: &str) -> std::io::Result<Arc<Engine>> {
        let wal_path = self.data_dir.join(format!("{name}.wal"));
        let (effects_tx, effects_rx) = effects::channel();
        let engine = Arc::new(Engine::new(wal_path, effects_tx)?);

        tokio::spawn(effects::run_effects(
            engine.clone(),
            effects_rx,
            self.collaborators.clone(),
        ));
        tokio::spawn(reaper::run_completer(
            engine.clone(),
            self.settings.completion_sweep,
        ));
        tokio::spawn(reaper::run_compactor(
            engine.clone(),
            self.settings.compact_threshold,
        ));
        Ok(engine)
    }
}
