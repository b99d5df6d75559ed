//! Outcome of the last cluster upgrade, stored as JSON on a namespace
//! annotation. Field names are PascalCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeStatus {
    #[default]
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Component {
    pub name: String,
    pub status: UpgradeStatus,
    #[serde(default)]
    pub error_message: String,
}

impl Component {
    pub fn ok(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: UpgradeStatus::Ok,
            error_message: String::new(),
        }
    }

    pub fn failed(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: UpgradeStatus::Error,
            error_message: message.into(),
        }
    }

    pub fn is_failed(&self) -> bool {
        !self.error_message.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Upgrade {
    pub last_upgrade: Option<DateTime<Utc>>,
    pub status: UpgradeStatus,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub components: Vec<Component>,
}

impl Upgrade {
    /// Mark the upgrade as failed with `message`.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = UpgradeStatus::Error;
        self.error_message = message.into();
    }

    /// Stamp the completion time and derive the overall status from the
    /// components unless a failure was already recorded.
    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.last_upgrade = Some(at);
        if self.status == UpgradeStatus::Ok && self.components.iter().any(Component::is_failed) {
            self.fail("AppHoster upgrade failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_pascal_case() {
        let mut upgrade = Upgrade {
            components: vec![Component::ok("registry"), Component::failed("proxy", "exit 3")],
            ..Default::default()
        };
        upgrade.finish(DateTime::from_timestamp(0, 0).unwrap());

        let json = serde_json::to_value(&upgrade).unwrap();
        assert_eq!(json["Status"], "ERROR");
        assert_eq!(json["ErrorMessage"], "AppHoster upgrade failed");
        assert_eq!(json["Components"][0]["Name"], "registry");
        assert_eq!(json["Components"][0]["Status"], "OK");
        assert_eq!(json["Components"][1]["ErrorMessage"], "exit 3");
        assert_eq!(json["LastUpgrade"], "1970-01-01T00:00:00Z");
    }

    #[test]
    fn earlier_failure_is_kept() {
        let mut upgrade = Upgrade::default();
        upgrade.fail("prepare failed");
        upgrade.components.push(Component::failed("proxy", "boom"));
        upgrade.finish(Utc::now());
        assert_eq!(upgrade.error_message, "prepare failed");
    }

    #[test]
    fn clean_run_stays_ok() {
        let mut upgrade = Upgrade {
            components: vec![Component::ok("controller")],
            ..Default::default()
        };
        upgrade.finish(Utc::now());
        assert_eq!(upgrade.status, UpgradeStatus::Ok);
        assert!(upgrade.error_message.is_empty());
    }
}
