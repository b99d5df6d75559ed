//! Typed schema of a chart's `values.yaml`.
//!
//! The same struct is rendered when a chart is created and parsed back when
//! an update reuses the last deployed configuration, so a field written by
//! one side is always understood by the other.

use std::path::Path;

use serde::{Deserialize, Serialize};

use apphc_core::{AppInstanceData, Cycle, StringMap, annotations};

use crate::error::ValuesError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartValues {
    pub namespace: String,
    #[serde(default = "default_pull_policy")]
    pub pull_policy: String,
    #[serde(default = "default_replicas")]
    pub replica_count: u32,
    #[serde(default)]
    pub node_selector: StringMap,
    #[serde(default)]
    pub affinity: StringMap,
    #[serde(default)]
    pub liveness: Probe,
    #[serde(default)]
    pub readiness: Probe,
    #[serde(default)]
    pub ingress: Toggle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_jobs_history_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_jobs_history_limit: Option<u32>,
    #[serde(default)]
    pub labels: StringMap,
    #[serde(default)]
    pub annotations: StringMap,
    pub image: ChartImage,
    #[serde(default)]
    pub env: StringMap,
    pub service: Service,
    #[serde(default)]
    pub ports: Vec<ChartPort>,
    pub persistence: Persistence,
    #[serde(default)]
    pub configs: Toggle,
    #[serde(default)]
    pub secrets: Toggle,
    #[serde(default)]
    pub resources: StringMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    pub initial_delay_seconds: u32,
    pub period_seconds: u32,
    pub enabled: bool,
}

impl Default for Probe {
    fn default() -> Self {
        Self {
            initial_delay_seconds: 60,
            period_seconds: 10,
            enabled: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Toggle {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartImage {
    pub repository: String,
    #[serde(default)]
    pub name: String,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartPort {
    pub name: String,
    pub internal_port: u32,
    pub protocol: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Persistence {
    pub instance: InstanceVolume,
    #[serde(default)]
    pub shared: Toggle,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceVolume {
    pub enabled: bool,
    /// Kubernetes quantity, always `<N>Gi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_replicas() -> u32 {
    1
}

impl ChartValues {
    /// Render the values for an instance.
    pub fn from_instance(data: &AppInstanceData) -> Self {
        let cycle = data.cycle().unwrap_or(Cycle::Daemon);
        let (schedule, concurrency_policy, restart_policy, failed_limit, success_limit) = match cycle {
            Cycle::Periodic => (
                Some(data.schedule.clone().unwrap_or_default()),
                Some("Forbid".to_string()),
                Some("OnFailure".to_string()),
                Some(1),
                Some(3),
            ),
            Cycle::RunOnce => (None, None, Some("OnFailure".to_string()), None, None),
            Cycle::Daemon => (None, None, None, None, None),
        };

        let size = data.instance_storage_size.filter(|s| *s > 0);

        Self {
            namespace: data.target_namespace.clone(),
            pull_policy: default_pull_policy(),
            replica_count: default_replicas(),
            node_selector: StringMap::new(),
            affinity: StringMap::new(),
            liveness: Probe::default(),
            readiness: Probe::default(),
            ingress: Toggle::default(),
            schedule,
            concurrency_policy,
            restart_policy,
            failed_jobs_history_limit: failed_limit,
            successful_jobs_history_limit: success_limit,
            labels: data.labels.clone(),
            annotations: data.annotations.clone(),
            image: ChartImage {
                repository: data.image.repository.clone(),
                name: data.image.name.clone(),
                tag: data.image.tag.clone(),
            },
            env: data.env_vars.clone(),
            service: Service {
                kind: "ClusterIP".to_string(),
                name: data.instance_name.clone(),
            },
            ports: data
                .ports
                .iter()
                .map(|p| ChartPort {
                    name: p.name.clone(),
                    internal_port: p.number,
                    protocol: p.protocol.clone(),
                })
                .collect(),
            persistence: Persistence {
                instance: InstanceVolume {
                    enabled: size.is_some(),
                    size: size.map(|s| format!("{s}Gi")),
                },
                shared: Toggle {
                    enabled: data.shared_storage_enabled,
                },
            },
            configs: Toggle {
                enabled: !data.app_configs.is_empty(),
            },
            secrets: Toggle {
                enabled: !data.secrets.is_empty(),
            },
            resources: StringMap::new(),
        }
    }

    pub fn parse(yaml: &str) -> Result<Self, ValuesError> {
        let values: ChartValues = serde_yaml::from_str(yaml)?;
        values.validate()?;
        Ok(values)
    }

    pub fn load(path: &Path) -> Result<Self, ValuesError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn to_yaml(&self) -> Result<String, ValuesError> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn validate(&self) -> Result<(), ValuesError> {
        if self.image.repository.is_empty() {
            return Err(ValuesError::Invalid {
                field: "image.repository",
                reason: "must not be empty".into(),
            });
        }
        if self.persistence.instance.enabled {
            self.instance_size_gib()?;
        }
        if let Some(state) = self.annotations.get(annotations::STATE) {
            if state.parse::<apphc_core::InstanceState>().is_err() {
                return Err(ValuesError::Invalid {
                    field: "annotations.state",
                    reason: format!("unknown state {state:?}"),
                });
            }
        }
        Ok(())
    }

    /// Instance volume size in GiB, `None` when instance storage is disabled.
    pub fn instance_size_gib(&self) -> Result<Option<u32>, ValuesError> {
        if !self.persistence.instance.enabled {
            return Ok(None);
        }
        let raw = self.persistence.instance.size.as_deref().unwrap_or_default();
        raw.strip_suffix("Gi")
            .and_then(|n| n.parse::<u32>().ok())
            .map(Some)
            .ok_or_else(|| ValuesError::Invalid {
                field: "persistence.instance.size",
                reason: format!("expected <N>Gi, got {raw:?}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apphc_core::{ImageRef, Port};

    fn instance(cycle: &str) -> AppInstanceData {
        let mut data = AppInstanceData {
            instance_name: "foo-g1".into(),
            target_namespace: "foo".into(),
            image: ImageRef {
                repository: "registry.local/foo".into(),
                name: String::new(),
                tag: "1.0.0".into(),
            },
            ports: vec![Port {
                name: "http".into(),
                number: 8080,
                protocol: "TCP".into(),
            }],
            instance_storage_size: Some(2),
            schedule: Some("*/5 * * * *".into()),
            ..Default::default()
        };
        data.annotations.insert(annotations::CYCLE.into(), cycle.into());
        data.annotations.insert(annotations::STATE.into(), "enabled".into());
        data.app_configs.insert("app.conf".into(), "x=1".into());
        data
    }

    #[test]
    fn rendered_values_parse_back() {
        let values = ChartValues::from_instance(&instance("daemon"));
        let yaml = values.to_yaml().unwrap();
        assert!(yaml.contains("pullPolicy: IfNotPresent"));
        assert!(yaml.contains("internalPort: 8080"));
        assert!(!yaml.contains("schedule"));

        let parsed = ChartValues::parse(&yaml).unwrap();
        assert_eq!(parsed, values);
        assert_eq!(parsed.instance_size_gib().unwrap(), Some(2));
        assert!(parsed.configs.enabled);
        assert!(!parsed.secrets.enabled);
    }

    #[test]
    fn periodic_values_carry_job_settings() {
        let values = ChartValues::from_instance(&instance("periodic"));
        assert_eq!(values.schedule.as_deref(), Some("*/5 * * * *"));
        assert_eq!(values.concurrency_policy.as_deref(), Some("Forbid"));
        assert_eq!(values.successful_jobs_history_limit, Some(3));

        let values = ChartValues::from_instance(&instance("run_once"));
        assert_eq!(values.restart_policy.as_deref(), Some("OnFailure"));
        assert!(values.schedule.is_none());
    }

    #[test]
    fn missing_sections_are_reported() {
        let err = ChartValues::parse("namespace: foo\n").unwrap_err();
        assert!(matches!(err, ValuesError::Parse(_)));
    }

    #[test]
    fn malformed_size_is_a_validation_error() {
        let mut values = ChartValues::from_instance(&instance("daemon"));
        values.persistence.instance.size = Some("two".into());
        let yaml = serde_yaml::to_string(&values).unwrap();
        let err = ChartValues::parse(&yaml).unwrap_err();
        assert!(matches!(
            err,
            ValuesError::Invalid {
                field: "persistence.instance.size",
                ..
            }
        ));
    }

    #[test]
    fn empty_repository_is_rejected() {
        let mut values = ChartValues::from_instance(&instance("daemon"));
        values.image.repository.clear();
        let yaml = serde_yaml::to_string(&values).unwrap();
        assert!(ChartValues::parse(&yaml).is_err());
    }

    #[test]
    fn disabled_storage_has_no_size() {
        let mut data = instance("daemon");
        data.instance_storage_size = Some(0);
        let values = ChartValues::from_instance(&data);
        assert!(!values.persistence.instance.enabled);
        assert_eq!(values.instance_size_gib().unwrap(), None);
    }
}
