//! Merge request content (and optionally the last deployed chart) into
//! instance data before a chart is rendered.

use std::fs;
use std::path::Path;

use apphc_catalog::{CatalogResult, ChartStore, ChartValues, ValuesError};
use apphc_core::{AppInstanceData, AppRequest, Cycle, ImageRef, NextAction, Port, StringMap, annotations, env, labels, naming};

/// Annotation and label keys that identify an instance and are never
/// copied from another instance's chart.
const IDENTITY_KEYS: &[&str] = &[
    annotations::BASENAME,
    annotations::GROUP_ID,
    annotations::ROOT_GROUP_ID,
    annotations::ID,
    annotations::TEMPLATE_NAME,
    labels::GROUP_ID,
    labels::ROOT_GROUP_ID,
];

/// Chart content of a previously deployed version.
#[derive(Debug, Clone)]
pub struct ReusedChart {
    pub values: ChartValues,
    pub configs: StringMap,
    pub secrets: StringMap,
}

impl ReusedChart {
    pub fn load(store: &ChartStore, app_name: &str, template: &str, version: &str) -> CatalogResult<Self> {
        let values = store.load_values(app_name, template, version)?;
        let resources = store.chart_dir(app_name, template, version).join("resources");
        let configs = if values.configs.enabled {
            read_files(&resources.join("configs"))?
        } else {
            StringMap::new()
        };
        let secrets = if values.secrets.enabled {
            read_files(&resources.join("secrets"))?
        } else {
            StringMap::new()
        };
        Ok(Self {
            values,
            configs,
            secrets,
        })
    }

    /// Override the recorded state, e.g. with the live state of the source instance.
    pub fn with_state(mut self, state: &str) -> Self {
        self.values
            .annotations
            .insert(annotations::STATE.into(), state.into());
        self
    }
}

fn read_files(dir: &Path) -> std::io::Result<StringMap> {
    let mut files = StringMap::new();
    if !dir.is_dir() {
        return Ok(files);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.insert(
                entry.file_name().to_string_lossy().into_owned(),
                fs::read_to_string(entry.path())?,
            );
        }
    }
    Ok(files)
}

/// Merge `req` (over `reused`, when given) into `data`.
///
/// Controller-owned annotations in the request are ignored. A storage size
/// change on an existing instance forces a recreate that also drops the old
/// volume. When reusing, a request without storage keeps the reused size.
pub fn merge_request(data: &mut AppInstanceData, req: &AppRequest, reused: Option<&ReusedChart>) -> Result<(), ValuesError> {
    if let Some(reused) = reused {
        merge_reused(data, reused)?;
    }

    merge_unreserved(&mut data.annotations, &req.annotations);
    data.annotations
        .insert(annotations::VERSION.into(), data.requested_version.clone());
    merge_unreserved(&mut data.labels, &req.labels);
    let app_name = data.app_name().to_string();
    data.labels.insert(labels::MONITORING.into(), app_name.clone());

    data.app_configs
        .extend(req.configs.iter().map(|(k, v)| (k.clone(), v.clone())));
    data.env_vars
        .extend(req.env_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
    data.secrets
        .extend(req.secrets.iter().map(|(k, v)| (k.clone(), v.clone())));

    if data.cycle() == Some(Cycle::Periodic) {
        if let Some(schedule) = req.schedule.as_ref().filter(|s| !s.is_empty()) {
            data.schedule = Some(schedule.clone());
        }
        if let Some(schedule) = &data.schedule {
            data.annotations
                .insert(annotations::SCHEDULE.into(), schedule.clone());
        }
    }

    if !req.description.is_empty() {
        data.description = req.description.clone();
    }
    if !req.image.repo.is_empty() {
        data.image.repository = req.image.repo.clone();
        data.annotations
            .insert(annotations::IMAGE_REPO.into(), req.image.repo.clone());
    }
    if !req.image.tag.is_empty() {
        data.image.tag = req.image.tag.clone();
        data.annotations
            .insert(annotations::IMAGE_TAG.into(), req.image.tag.clone());
    }
    if !data.image.name.is_empty() {
        data.annotations
            .insert(annotations::IMAGE_NAME.into(), data.image.name.clone());
    }

    if !req.ports.is_empty() {
        data.ports = req
            .ports
            .iter()
            .map(|p| Port {
                name: if p.name.is_empty() {
                    naming::kube_name(&req.name)
                } else {
                    naming::kube_name(&p.name)
                },
                number: p.number,
                protocol: p.protocol.clone(),
            })
            .collect();
    }

    apply_storage_size(data, req.persistent_storage, reused.is_some());
    if req.shared_storage > 0 {
        data.shared_storage_enabled = true;
    }

    data.annotations.insert(
        annotations::VOLUME_SIZE.into(),
        data.instance_storage_size.unwrap_or(0).to_string(),
    );
    data.annotations
        .insert(annotations::STATE.into(), data.state.as_str().into());
    inject_env(data);
    Ok(())
}

fn merge_unreserved(target: &mut StringMap, source: &StringMap) {
    for (key, value) in source {
        if !annotations::RESERVED.contains(&key.as_str()) {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Fill `target` from `source` where a key is missing or empty.
fn fill_missing(target: &mut StringMap, source: &StringMap) {
    for (key, value) in source {
        if IDENTITY_KEYS.contains(&key.as_str()) {
            continue;
        }
        if target.get(key).is_none_or(|v| v.is_empty()) {
            target.insert(key.clone(), value.clone());
        }
    }
}

fn merge_reused(data: &mut AppInstanceData, reused: &ReusedChart) -> Result<(), ValuesError> {
    let values = &reused.values;
    data.image = ImageRef {
        repository: values.image.repository.clone(),
        name: values.image.name.clone(),
        tag: values.image.tag.clone(),
    };

    if data.requested_version.is_empty() {
        if let Some(version) = values.annotations.get(annotations::VERSION) {
            data.requested_version = version.clone();
        }
    }
    fill_missing(&mut data.annotations, &values.annotations);
    fill_missing(&mut data.labels, &values.labels);
    if let Some(state) = values.annotations.get(annotations::STATE) {
        if let Ok(state) = state.parse() {
            data.state = state;
        }
    }

    data.env_vars
        .extend(values.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    if let Some(size) = values.instance_size_gib()? {
        data.instance_storage_size = Some(size);
    }
    if values.persistence.shared.enabled {
        data.shared_storage_enabled = true;
    }
    data.ports = values
        .ports
        .iter()
        .map(|p| Port {
            name: p.name.clone(),
            number: p.internal_port,
            protocol: p.protocol.clone(),
        })
        .collect();
    if values.schedule.is_some() {
        data.schedule = values.schedule.clone();
    }
    data.app_configs = reused.configs.clone();
    data.secrets = reused.secrets.clone();
    Ok(())
}

fn apply_storage_size(data: &mut AppInstanceData, requested: u32, reusing: bool) {
    let existing = data.instance_storage_size;
    let size = if reusing && requested == 0 {
        existing.unwrap_or(0)
    } else {
        requested
    };

    let deployed = matches!(data.next_action, NextAction::Upgrade | NextAction::Recreate);
    if deployed && existing.is_some_and(|current| current != size) {
        data.next_action = NextAction::Recreate;
        data.delete_instance_storage = true;
    }
    data.instance_storage_size = Some(size);
}

fn inject_env(data: &mut AppInstanceData) {
    let mut vars = vec![
        (env::APP_NAME, data.app_name().to_string()),
        (env::INSTANCE_NAME, data.instance_name.clone()),
        (env::INSTANCE_ID, data.instance_id().unwrap_or_default().to_string()),
        (env::GROUP_ID, data.group_id().unwrap_or_default().to_string()),
        (env::VERSION, data.requested_version.clone()),
    ];
    if let Some(root) = data.root_group_id() {
        vars.push((env::ROOT_GROUP_ID, root.to_string()));
    }
    for (key, value) in vars {
        data.env_vars.insert(key.to_string(), value);
    }
}
