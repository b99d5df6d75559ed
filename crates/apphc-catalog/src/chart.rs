//! Chart directories inside the catalog working copies.
//!
//! Layout under the cache directory:
//!
//! ```text
//! <cache>/<templates>/<cycle>/...                  base chart per cycle
//! <cache>/<apps>/<app>/<template>/<version>/       one chart per instance version
//!     Chart.yaml
//!     values.yaml
//!     resources/configs/*
//!     resources/secrets/*
//! <cache>/backup-<uuid>/<template>/<version>/      transient backups
//! ```

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use semver::Version;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use apphc_core::{AppInstanceData, Cycle};

use crate::error::{CatalogError, CatalogResult};
use crate::values::ChartValues;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta<'a> {
    api_version: &'static str,
    name: &'a str,
    version: &'a str,
    description: &'a str,
    engine: &'static str,
    keywords: [&'static str; 2],
}

fn keywords(cycle: Cycle) -> [&'static str; 2] {
    match cycle {
        Cycle::Periodic => ["periodic", "cron"],
        Cycle::Daemon => ["daemon", "deployment"],
        Cycle::RunOnce => ["run_once", "job"],
    }
}

/// Copy a directory tree, creating `dst` as needed.
pub fn copy_tree(src: &Path, dst: &Path) -> CatalogResult<()> {
    if !src.is_dir() {
        return Err(CatalogError::ChartNotFound(src.to_path_buf()));
    }
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| CatalogError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| CatalogError::Io(std::io::Error::other(e)))?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ChartStore {
    cache_dir: PathBuf,
    templates_catalog: String,
    apps_catalog: String,
}

impl ChartStore {
    pub fn new(cache_dir: impl Into<PathBuf>, templates_catalog: &str, apps_catalog: &str) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            templates_catalog: templates_catalog.to_string(),
            apps_catalog: apps_catalog.to_string(),
        }
    }

    pub fn templates_root(&self) -> PathBuf {
        self.cache_dir.join(&self.templates_catalog)
    }

    pub fn apps_root(&self) -> PathBuf {
        self.cache_dir.join(&self.apps_catalog)
    }

    pub fn base_chart(&self, cycle: Cycle) -> PathBuf {
        self.templates_root().join(cycle.as_str())
    }

    pub fn app_dir(&self, app_name: &str) -> PathBuf {
        self.apps_root().join(app_name)
    }

    pub fn template_dir(&self, app_name: &str, template: &str) -> PathBuf {
        self.app_dir(app_name).join(template)
    }

    pub fn chart_dir(&self, app_name: &str, template: &str, version: &str) -> PathBuf {
        self.template_dir(app_name, template).join(version)
    }

    /// Chart directory of the version recorded in the instance annotations.
    pub fn instance_chart_dir(&self, data: &AppInstanceData) -> PathBuf {
        let version = data
            .version_annotation()
            .unwrap_or(&data.requested_version);
        self.chart_dir(data.app_name(), data.template_name(), version)
    }

    /// Write a chart for the instance's requested version.
    ///
    /// The base chart of the instance's cycle is copied first when present;
    /// `Chart.yaml`, `values.yaml`, configs and secrets are always rendered.
    pub fn create_chart(&self, data: &AppInstanceData) -> CatalogResult<PathBuf> {
        let cycle = data.cycle().unwrap_or(Cycle::Daemon);
        let target = self.instance_chart_dir(data);
        info!(
            instance = %data.instance_name,
            version = %data.requested_version,
            chart = %target.display(),
            "creating chart"
        );

        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        let base = self.base_chart(cycle);
        if base.is_dir() {
            copy_tree(&base, &target)?;
        } else {
            debug!(base = %base.display(), "no base chart, rendering metadata only");
            fs::create_dir_all(&target)?;
        }

        let version = data
            .version_annotation()
            .unwrap_or(&data.requested_version);
        let default_description = format!("Application {} , version {}", data.instance_name, version);
        let meta = ChartMeta {
            api_version: "v1",
            name: data.template_name(),
            version,
            description: if data.description.is_empty() {
                &default_description
            } else {
                &data.description
            },
            engine: "gotpl",
            keywords: keywords(cycle),
        };
        let chart_yaml = serde_yaml::to_string(&meta).map_err(crate::error::ValuesError::from)?;
        fs::write(target.join("Chart.yaml"), chart_yaml)?;

        let values = ChartValues::from_instance(data).to_yaml()?;
        fs::write(target.join("values.yaml"), values)?;

        write_files(&target.join("resources/configs"), &data.app_configs)?;
        write_files(&target.join("resources/secrets"), &data.secrets)?;
        Ok(target)
    }

    /// Remove one version of a template, or every version when `version` is `None`.
    pub fn delete_chart(&self, app_name: &str, template: &str, version: Option<&str>) -> CatalogResult<()> {
        let path = match version {
            Some(v) => self.chart_dir(app_name, template, v),
            None => self.template_dir(app_name, template),
        };
        info!(%template, version = version.unwrap_or("all"), chart = %path.display(), "deleting chart");
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        Ok(())
    }

    /// Remove the application's chart root when no template is left in it.
    pub fn prune_app_dir(&self, app_name: &str) -> CatalogResult<bool> {
        let dir = self.app_dir(app_name);
        if !dir.exists() {
            return Ok(false);
        }
        if fs::read_dir(&dir)?.next().is_none() {
            fs::remove_dir(&dir)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn load_values(&self, app_name: &str, template: &str, version: &str) -> CatalogResult<ChartValues> {
        let path = self.chart_dir(app_name, template, version).join("values.yaml");
        if !path.exists() {
            return Err(CatalogError::ChartNotFound(path));
        }
        Ok(ChartValues::load(&path)?)
    }

    /// Template directories of an application, sorted.
    pub fn templates(&self, app_name: &str) -> CatalogResult<Vec<String>> {
        let dir = self.app_dir(app_name);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut templates = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                templates.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        templates.sort();
        Ok(templates)
    }

    /// Versions with a chart directory for a template, in ascending semver
    /// order. Names that are not valid semver sort after the valid ones.
    pub fn chart_versions(&self, app_name: &str, template: &str) -> CatalogResult<Vec<String>> {
        let dir = self.template_dir(app_name, template);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                versions.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        versions.sort_by(|a, b| compare_versions(a, b));
        Ok(versions)
    }

    /// Start a backup set in a fresh `backup-<uuid>` directory.
    pub fn begin_backup(&self) -> CatalogResult<ChartBackup> {
        let root = self.cache_dir.join(format!("backup-{}", Uuid::new_v4()));
        fs::create_dir_all(&root)?;
        debug!(backup = %root.display(), "backup directory created");
        Ok(ChartBackup {
            root,
            store: self.clone(),
        })
    }
}

fn write_files(dir: &Path, files: &apphc_core::StringMap) -> CatalogResult<()> {
    fs::create_dir_all(dir)?;
    for (name, content) in files {
        fs::write(dir.join(name), content)?;
    }
    Ok(())
}

/// Saved copies of chart directories, removed when dropped.
#[derive(Debug)]
pub struct ChartBackup {
    root: PathBuf,
    store: ChartStore,
}

impl ChartBackup {
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn slot(&self, template: &str, version: &str) -> PathBuf {
        self.root.join(template).join(version)
    }

    /// Copy the chart of `version` into the backup set.
    pub fn save(&self, app_name: &str, template: &str, version: &str) -> CatalogResult<()> {
        let src = self.store.chart_dir(app_name, template, version);
        let dst = self.slot(template, version);
        info!(%template, %version, src = %src.display(), "backing up chart");
        copy_tree(&src, &dst)
    }

    pub fn contains(&self, template: &str, version: &str) -> bool {
        self.slot(template, version).is_dir()
    }

    /// Put a saved chart back in the catalog working copy.
    pub fn restore(&self, app_name: &str, template: &str, version: &str) -> CatalogResult<()> {
        let src = self.slot(template, version);
        let dst = self.store.chart_dir(app_name, template, version);
        info!(%template, %version, dst = %dst.display(), "restoring chart");
        if dst.exists() {
            fs::remove_dir_all(&dst)?;
        }
        copy_tree(&src, &dst)
    }
}

impl Drop for ChartBackup {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.root) {
            warn!(backup = %self.root.display(), error = %e, "failed to remove backup directory");
        }
    }
}

fn compare_versions(a: &str, b: &str) -> Ordering {
    match (Version::parse(a), Version::parse(b)) {
        (Ok(va), Ok(vb)) => va.cmp(&vb),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apphc_core::annotations;

    fn store(dir: &Path) -> ChartStore {
        ChartStore::new(dir, "templates", "apps")
    }

    fn instance() -> AppInstanceData {
        let mut data = AppInstanceData {
            instance_name: "foo-g1".into(),
            target_namespace: "foo".into(),
            requested_version: "1.0.0".into(),
            ..Default::default()
        };
        data.image.repository = "registry.local/foo".into();
        data.image.tag = "1.0.0".into();
        data.annotations.insert(annotations::BASENAME.into(), "foo".into());
        data.annotations.insert(annotations::CYCLE.into(), "daemon".into());
        data.annotations.insert(annotations::TEMPLATE_NAME.into(), "foo-g1".into());
        data.annotations.insert(annotations::VERSION.into(), "1.0.0".into());
        data.app_configs.insert("app.conf".into(), "level=debug".into());
        data.secrets.insert("token".into(), "abc".into());
        data
    }

    #[test]
    fn create_chart_renders_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let base = store.base_chart(Cycle::Daemon).join("templates");
        fs::create_dir_all(&base).unwrap();
        fs::write(base.join("deployment.yaml"), "kind: Deployment").unwrap();

        let path = store.create_chart(&instance()).unwrap();
        assert_eq!(path, dir.path().join("apps/foo/foo-g1/1.0.0"));
        assert!(path.join("templates/deployment.yaml").exists());
        assert_eq!(
            fs::read_to_string(path.join("resources/configs/app.conf")).unwrap(),
            "level=debug"
        );
        assert!(path.join("resources/secrets/token").exists());

        let chart = fs::read_to_string(path.join("Chart.yaml")).unwrap();
        assert!(chart.contains("name: foo-g1"));
        assert!(chart.contains("- deployment"));

        let values = store.load_values("foo", "foo-g1", "1.0.0").unwrap();
        assert_eq!(values.image.tag, "1.0.0");
        assert_eq!(store.chart_versions("foo", "foo-g1").unwrap(), vec!["1.0.0"]);
    }

    #[test]
    fn chart_versions_sorted_by_semver() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        for v in ["1.10.0", "1.2.0", "latest", "1.9.3"] {
            fs::create_dir_all(store.template_dir("foo", "foo-g1").join(v)).unwrap();
        }
        assert_eq!(
            store.chart_versions("foo", "foo-g1").unwrap(),
            vec!["1.2.0", "1.9.3", "1.10.0", "latest"]
        );
    }

    #[test]
    fn delete_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.create_chart(&instance()).unwrap();

        store.delete_chart("foo", "foo-g1", Some("1.0.0")).unwrap();
        assert!(store.chart_versions("foo", "foo-g1").unwrap().is_empty());
        assert!(!store.prune_app_dir("foo").unwrap());

        store.delete_chart("foo", "foo-g1", None).unwrap();
        assert!(store.prune_app_dir("foo").unwrap());
        assert!(!store.app_dir("foo").exists());
    }

    #[test]
    fn backup_restores_previous_chart() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let data = instance();
        store.create_chart(&data).unwrap();

        let backup_root;
        {
            let backup = store.begin_backup().unwrap();
            backup_root = backup.root().to_path_buf();
            backup.save("foo", "foo-g1", "1.0.0").unwrap();
            assert!(backup.contains("foo-g1", "1.0.0"));

            let mut changed = data.clone();
            changed.image.tag = "broken".into();
            store.create_chart(&changed).unwrap();
            assert_eq!(store.load_values("foo", "foo-g1", "1.0.0").unwrap().image.tag, "broken");

            backup.restore("foo", "foo-g1", "1.0.0").unwrap();
            assert_eq!(store.load_values("foo", "foo-g1", "1.0.0").unwrap().image.tag, "1.0.0");
        }
        assert!(!backup_root.exists());
    }

    #[test]
    fn missing_values_is_chart_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = store(dir.path()).load_values("foo", "foo-g1", "9.9.9").unwrap_err();
        assert!(matches!(err, CatalogError::ChartNotFound(_)));
    }
}
