//! Instance state aggregation.
//!
//! Builds the desired instance set from a request, reads what the backend
//! reports as running, and assigns every desired instance exactly one
//! [`NextAction`].

use std::collections::HashSet;

use tracing::debug;

use apphc_backend::{AppObject, BackendResult, ClusterBackend, ExternalId};
use apphc_core::{
    AppFilter, AppInstanceData, AppRequest, AppsData, ImageRef, NextAction, StringMap, annotations, labels,
    naming,
};

// ── Desired instances ──────────────────────────────────────────

/// One desired instance per distinct, non-empty group id of the request.
pub fn build_desired(req: &AppRequest) -> Vec<AppInstanceData> {
    let root = req.root_group();
    let mut seen = HashSet::new();
    req.group_ids
        .iter()
        .filter(|gid| !gid.is_empty())
        .filter(|gid| seen.insert(gid.as_str()))
        .map(|gid| desired_instance(req, root, gid))
        .collect()
}

fn desired_instance(req: &AppRequest, root: Option<&str>, group_id: &str) -> AppInstanceData {
    let instance_name = naming::instance_name(&req.name, root, group_id);
    let instance_id = naming::instance_id(&req.name, root, group_id);
    let cycle = req.cycle.as_str();

    let mut ann = StringMap::new();
    ann.insert(annotations::BASENAME.into(), req.name.clone());
    ann.insert(annotations::CYCLE.into(), cycle.into());
    ann.insert(annotations::GROUP_ID.into(), group_id.into());
    ann.insert(annotations::VERSION.into(), req.version.clone());
    ann.insert(annotations::ID.into(), instance_id.clone());
    ann.insert(annotations::TEMPLATE_NAME.into(), instance_name.clone());

    let mut lbl = StringMap::new();
    lbl.insert(labels::CYCLE.into(), cycle.into());
    lbl.insert(labels::GROUP_ID.into(), group_id.into());

    if let Some(root) = root {
        ann.insert(annotations::ROOT_GROUP_ID.into(), root.into());
        lbl.insert(labels::ROOT_GROUP_ID.into(), root.into());
    }

    let description = if req.description.is_empty() {
        format!("Application {}, instance ID {instance_id}", req.name)
    } else {
        req.description.clone()
    };

    AppInstanceData {
        instance_name,
        state: req.state,
        target_namespace: naming::target_namespace(&req.name),
        description,
        requested_version: req.version.clone(),
        next_action: NextAction::Create,
        annotations: ann,
        labels: lbl,
        ..Default::default()
    }
}

// ── Running instances ──────────────────────────────────────────

/// Rebuild instance data from a backend application object.
pub fn instance_from_app(app: &AppObject) -> AppInstanceData {
    let annotation = |key: &str| app.annotations.get(key).cloned();

    let current_version = app
        .external_id
        .parse::<ExternalId>()
        .ok()
        .map(|id| id.version)
        .filter(|v| !v.is_empty())
        .or_else(|| annotation(annotations::VERSION))
        .unwrap_or_default();

    AppInstanceData {
        instance_name: app.name.clone(),
        state: annotation(annotations::STATE)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default(),
        target_namespace: app.namespace.clone(),
        description: app.description.clone(),
        requested_version: current_version.clone(),
        current_version,
        template_available: true,
        annotations: app.annotations.clone(),
        labels: app.labels.clone(),
        image: ImageRef {
            repository: annotation(annotations::IMAGE_REPO).unwrap_or_default(),
            name: annotation(annotations::IMAGE_NAME).unwrap_or_default(),
            tag: annotation(annotations::IMAGE_TAG).unwrap_or_default(),
        },
        instance_storage_size: annotation(annotations::VOLUME_SIZE).and_then(|s| s.parse().ok()),
        schedule: annotation(annotations::SCHEDULE),
        ..Default::default()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Application-level match: name, cycle, root group, and version.
///
/// Instances without a group id are never matched.
pub fn matches_app(data: &AppInstanceData, filter: &AppFilter) -> bool {
    if data.group_id().is_none() {
        return false;
    }
    if let Some(name) = non_empty(&filter.name) {
        if data.app_name() != name {
            return false;
        }
    }
    if let Some(cycle) = filter.cycle {
        if data.cycle() != Some(cycle) {
            return false;
        }
    }
    if let Some(root) = non_empty(&filter.root_group_id) {
        if data.root_group_id() != Some(root) {
            return false;
        }
    }
    if let Some(version) = non_empty(&filter.version) {
        if data.version_annotation() != Some(version) {
            return false;
        }
    }
    true
}

fn matches_groups(data: &AppInstanceData, filter: &AppFilter) -> bool {
    filter.group_ids.is_empty()
        || data
            .group_id()
            .is_some_and(|gid| filter.group_ids.iter().any(|g| g == gid))
}

/// Running instances matching `filter`, grouped by application.
///
/// `select` decides the next action of each matched instance. The first
/// application-level match becomes the sample instance, even when its group
/// is filtered out.
async fn collect_running(
    backend: &dyn ClusterBackend,
    filter: &AppFilter,
    mut select: impl FnMut(&mut AppInstanceData),
) -> BackendResult<AppsData> {
    let mut apps = AppsData::default();
    for app in backend.list_apps(&StringMap::new()).await? {
        if !app.annotations.contains_key(annotations::BASENAME) {
            continue;
        }
        let mut data = instance_from_app(&app);
        if !matches_app(&data, filter) {
            continue;
        }
        if apps.sample_instance.is_none() {
            apps.sample_instance = Some(data.clone());
        }
        if !matches_groups(&data, filter) {
            continue;
        }
        select(&mut data);
        apps.running
            .entry(data.app_name().to_string())
            .or_default()
            .push(data);
    }
    for instances in apps.running.values_mut() {
        instances.sort_by(|a, b| a.instance_name.cmp(&b.instance_name));
    }
    debug!(running = apps.running_count(), "running instances loaded");
    Ok(apps)
}

/// Running instances to update toward `requested_version`.
///
/// A missing or equal version means recreate at the current version;
/// anything else is an upgrade.
pub async fn load_running(
    backend: &dyn ClusterBackend,
    filter: &AppFilter,
    requested_version: Option<&str>,
) -> BackendResult<AppsData> {
    let requested = requested_version.filter(|v| !v.is_empty());
    collect_running(backend, filter, |data| match requested {
        Some(version) if version != data.current_version => {
            data.requested_version = version.to_string();
            data.next_action = NextAction::Upgrade;
        }
        _ => {
            data.requested_version = data.current_version.clone();
            data.next_action = NextAction::Recreate;
        }
    })
    .await
}

/// Running instances to delete.
///
/// The requested version is the filter's version, so a purge removes only
/// that chart version.
pub async fn load_for_delete(backend: &dyn ClusterBackend, filter: &AppFilter) -> BackendResult<AppsData> {
    let version = non_empty(&filter.version).map(str::to_string);
    collect_running(backend, filter, |data| {
        data.requested_version = version.clone().unwrap_or_default();
        data.next_action = NextAction::Delete;
        data.delete_instance_storage = true;
    })
    .await
}

// ── Reconciliation ─────────────────────────────────────────────

/// Assign the next action of every desired instance of `app_name`.
///
/// With no desired instances the running ones are adopted as-is. Otherwise
/// an instance absent from the backend is created, and a running one is
/// recreated when the policy asks for it or its version does not change,
/// and upgraded when it does.
pub fn reconcile(apps: &mut AppsData, app_name: &str, recreate_policy: bool) {
    let AppsData {
        new_instances,
        running,
        ..
    } = apps;
    let running = running.get(app_name).map(Vec::as_slice).unwrap_or_default();

    if new_instances.is_empty() {
        *new_instances = running.to_vec();
        if recreate_policy {
            for data in new_instances.iter_mut() {
                data.next_action = NextAction::Recreate;
            }
        }
        return;
    }

    for desired in new_instances.iter_mut() {
        match running.iter().find(|r| r.instance_name == desired.instance_name) {
            None => desired.next_action = NextAction::Create,
            Some(current) => {
                desired.current_version = current.current_version.clone();
                if desired.requested_version.is_empty() {
                    desired.requested_version = current.current_version.clone();
                }
                desired.next_action = if recreate_policy || desired.requested_version == current.current_version {
                    NextAction::Recreate
                } else {
                    NextAction::Upgrade
                };
                desired.instance_storage_size = current.instance_storage_size;
                desired.template_available = true;
            }
        }
    }
}

/// Mark desired instances that already run as needing no action.
///
/// Returns the number of instances still to create.
pub fn skip_running(apps: &mut AppsData, app_name: &str) -> usize {
    let AppsData {
        new_instances,
        running,
        ..
    } = apps;
    let running = running.get(app_name).map(Vec::as_slice).unwrap_or_default();
    let mut pending = 0;
    for desired in new_instances.iter_mut() {
        if running.iter().any(|r| r.instance_name == desired.instance_name) {
            desired.next_action = NextAction::None;
            desired.template_available = true;
        } else {
            pending += 1;
        }
    }
    pending
}
