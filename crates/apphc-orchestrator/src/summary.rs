//! Response bodies describing instances and templates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use apphc_core::{AppInstanceData, Cycle, InstanceState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub name: String,
    pub id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_group_id: Option<String>,
    pub group_id: String,
    pub state: InstanceState,
    pub namespace: String,
}

impl From<&AppInstanceData> for InstanceSummary {
    fn from(data: &AppInstanceData) -> Self {
        let version = if data.requested_version.is_empty() {
            data.version_annotation().unwrap_or(&data.current_version)
        } else {
            &data.requested_version
        };
        Self {
            name: data.instance_name.clone(),
            id: data.instance_id().unwrap_or_default().to_string(),
            version: version.to_string(),
            root_group_id: data.root_group_id().map(str::to_string),
            group_id: data.group_id().unwrap_or_default().to_string(),
            state: data.state,
            namespace: data.target_namespace.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSummary {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<Cycle>,
    pub instances: Vec<InstanceSummary>,
}

impl AppSummary {
    pub fn new(name: &str, instances: &[AppInstanceData]) -> Self {
        Self {
            name: name.to_string(),
            cycle: instances.iter().find_map(AppInstanceData::cycle),
            instances: instances.iter().map(InstanceSummary::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppsSummary {
    pub apps: Vec<AppSummary>,
}

impl AppsSummary {
    /// Group instances by application name, sorted by name.
    pub fn from_instances(instances: &[AppInstanceData]) -> Self {
        let mut grouped: BTreeMap<&str, Vec<AppInstanceData>> = BTreeMap::new();
        for data in instances {
            grouped.entry(data.app_name()).or_default().push(data.clone());
        }
        Self {
            apps: grouped
                .into_iter()
                .map(|(name, instances)| AppSummary::new(name, &instances))
                .collect(),
        }
    }

    pub fn instance_count(&self) -> usize {
        self.apps.iter().map(|a| a.instances.len()).sum()
    }
}

/// Template versions removed from the application catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSummary {
    pub name: String,
    pub catalog: String,
    pub versions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use apphc_core::annotations;

    fn instance(app: &str, name: &str) -> AppInstanceData {
        let mut data = AppInstanceData {
            instance_name: name.into(),
            current_version: "1.0.0".into(),
            ..Default::default()
        };
        data.annotations.insert(annotations::BASENAME.into(), app.into());
        data.annotations.insert(annotations::GROUP_ID.into(), "g1".into());
        data.annotations.insert(annotations::CYCLE.into(), "daemon".into());
        data
    }

    #[test]
    fn groups_by_app_name() {
        let summary = AppsSummary::from_instances(&[
            instance("foo", "foo-g1"),
            instance("bar", "bar-g1"),
            instance("foo", "foo-g2"),
        ]);
        let names: Vec<&str> = summary.apps.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["bar", "foo"]);
        assert_eq!(summary.apps[1].instances.len(), 2);
        assert_eq!(summary.apps[1].cycle, Some(Cycle::Daemon));
        assert_eq!(summary.instance_count(), 3);
    }

    #[test]
    fn version_falls_back_to_current() {
        let summary = InstanceSummary::from(&instance("foo", "foo-g1"));
        assert_eq!(summary.version, "1.0.0");
        assert_eq!(summary.group_id, "g1");
        assert!(summary.root_group_id.is_none());
    }
}
