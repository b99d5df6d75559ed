//! Deterministic instance naming.
//!
//! Backend object names are limited in length, so each component is
//! truncated before the parts are joined.

/// Maximum characters kept from the application name.
pub const APP_NAME_MAX: usize = 14;
/// Maximum characters kept from the root group id.
pub const ROOT_GROUP_ID_MAX: usize = 19;
/// Maximum characters kept from the group id (taken from its end).
pub const GROUP_ID_MAX: usize = 14;

/// Upper bound on the length of any generated instance name.
pub const INSTANCE_NAME_MAX: usize = APP_NAME_MAX + ROOT_GROUP_ID_MAX + GROUP_ID_MAX + 2;

fn prefix(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn suffix(s: &str, max: usize) -> String {
    let count = s.chars().count();
    s.chars().skip(count.saturating_sub(max)).collect()
}

/// Lower-case and replace underscores, as required for backend names.
pub fn kube_name(s: &str) -> String {
    s.to_lowercase().replace('_', "-")
}

/// Cluster-unique instance name for (app, root group, group).
pub fn instance_name(app_name: &str, root_group_id: Option<&str>, group_id: &str) -> String {
    let mut parts = vec![prefix(app_name, APP_NAME_MAX)];
    if let Some(root) = root_group_id.filter(|r| !r.is_empty()) {
        parts.push(prefix(root, ROOT_GROUP_ID_MAX));
    }
    parts.push(suffix(group_id, GROUP_ID_MAX));
    kube_name(&parts.join("-"))
}

/// Untruncated instance identifier recorded in the `id` annotation.
pub fn instance_id(app_name: &str, root_group_id: Option<&str>, group_id: &str) -> String {
    match root_group_id.filter(|r| !r.is_empty()) {
        Some(root) => format!("{app_name}-{root}-{group_id}"),
        None => format!("{app_name}-{group_id}"),
    }
}

/// Namespace that hosts every instance of an application.
pub fn target_namespace(app_name: &str) -> String {
    kube_name(app_name)
}

pub fn instance_volume_name(instance_name: &str) -> String {
    format!("{instance_name}-pv")
}

pub fn instance_claim_name(instance_name: &str) -> String {
    format!("{instance_name}-pvc")
}

pub fn shared_volume_name(app_name: &str) -> String {
    format!("{}-shared-pv", kube_name(app_name))
}

pub fn shared_claim_name(app_name: &str) -> String {
    format!("{}-shared-pvc", kube_name(app_name))
}
