//! Backups taken before an update, and their restoration.
//!
//! For every running instance an update touches, the plan keeps an
//! instance record that redeploys what is running now, plus a copy of the
//! chart that produced it. Restoring puts the charts back; the caller then
//! publishes and applies the backup records once.

use tracing::info;

use apphc_catalog::{CatalogResult, ChartBackup, ChartStore};
use apphc_core::{AppInstanceData, NextAction, annotations};

/// Instance record that redeploys the running version of `running`.
///
/// The versions swap: the backup's requested version is what runs now.
/// Instance storage is kept so a rollback never drops data.
pub fn backup_from_running(running: &AppInstanceData, recreate_policy: bool) -> AppInstanceData {
    let next_action = if recreate_policy || running.requested_version == running.current_version {
        NextAction::Recreate
    } else {
        NextAction::Upgrade
    };
    AppInstanceData {
        instance_name: running.instance_name.clone(),
        state: running
            .annotations
            .get(annotations::STATE)
            .and_then(|s| s.parse().ok())
            .unwrap_or(running.state),
        target_namespace: running.target_namespace.clone(),
        description: running.description.clone(),
        current_version: running.requested_version.clone(),
        requested_version: running.current_version.clone(),
        next_action,
        template_available: true,
        annotations: running.annotations.clone(),
        labels: running.labels.clone(),
        image: running.image.clone(),
        instance_storage_size: running
            .annotations
            .get(annotations::VOLUME_SIZE)
            .and_then(|s| s.parse().ok())
            .or(running.instance_storage_size),
        delete_instance_storage: false,
        schedule: running.schedule.clone(),
        ..Default::default()
    }
}

pub struct RollbackPlan {
    store: ChartStore,
    charts: ChartBackup,
    recreate_policy: bool,
    backups: Vec<AppInstanceData>,
}

impl RollbackPlan {
    pub fn new(store: &ChartStore, recreate_policy: bool) -> CatalogResult<Self> {
        Ok(Self {
            store: store.clone(),
            charts: store.begin_backup()?,
            recreate_policy,
            backups: Vec::new(),
        })
    }

    /// Record `running` before its chart is overwritten.
    pub fn record(&mut self, running: &AppInstanceData) -> CatalogResult<()> {
        let backup = backup_from_running(running, self.recreate_policy);
        let (app, template, version) = (
            backup.app_name(),
            backup.template_name(),
            backup.requested_version.as_str(),
        );
        if self.store.chart_dir(app, template, version).is_dir() {
            self.charts.save(app, template, version)?;
        }
        self.backups.push(backup);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.backups.is_empty()
    }

    pub fn backups(&self) -> &[AppInstanceData] {
        &self.backups
    }

    /// Put every saved chart back into the catalog working copy.
    pub fn restore_charts(&self) -> CatalogResult<()> {
        for backup in &self.backups {
            let (app, template, version) = (
                backup.app_name(),
                backup.template_name(),
                backup.requested_version.as_str(),
            );
            if self.charts.contains(template, version) {
                self.charts.restore(app, template, version)?;
            }
        }
        info!(instances = self.backups.len(), "charts restored from backup");
        Ok(())
    }
}
