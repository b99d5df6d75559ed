//! Catalog external reference codec.
//!
//! Application objects point at their chart with a URL of the form
//! `catalog://?catalog=<id>&template=<name>&version=<version>`.

use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::error::BackendError;

const SCHEME: &str = "catalog";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalId {
    pub catalog: String,
    pub template: String,
    pub version: String,
}

impl ExternalId {
    pub fn new(catalog: &str, template: &str, version: &str) -> Self {
        Self {
            catalog: catalog.to_string(),
            template: template.to_string(),
            version: version.to_string(),
        }
    }

    /// Same reference pointing at another version.
    pub fn with_version(&self, version: &str) -> Self {
        Self {
            version: version.to_string(),
            ..self.clone()
        }
    }
}

impl FromStr for ExternalId {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|e| BackendError::InvalidExternalId(format!("{s}: {e}")))?;
        if url.scheme() != SCHEME {
            return Err(BackendError::InvalidExternalId(s.to_string()));
        }

        let (mut catalog, mut template, mut version) = (None, None, None);
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "catalog" => catalog = Some(value.into_owned()),
                "template" => template = Some(value.into_owned()),
                "version" => version = Some(value.into_owned()),
                _ => {}
            }
        }

        match (catalog, template, version) {
            (Some(catalog), Some(template), Some(version)) => Ok(Self {
                catalog,
                template,
                version,
            }),
            _ => Err(BackendError::InvalidExternalId(s.to_string())),
        }
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("catalog", &self.catalog)
            .append_pair("template", &self.template)
            .append_pair("version", &self.version)
            .finish();
        write!(f, "{SCHEME}://?{query}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_reference() {
        let id: ExternalId = "catalog://?catalog=apps&template=foo-g1&version=1.2.0"
            .parse()
            .unwrap();
        assert_eq!(id, ExternalId::new("apps", "foo-g1", "1.2.0"));
    }

    #[test]
    fn display_is_parseable() {
        let id = ExternalId::new("apps", "foo-g1", "1.0.0+build 7");
        let parsed: ExternalId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn missing_version_is_rejected() {
        let err = "catalog://?catalog=apps&template=foo".parse::<ExternalId>();
        assert!(matches!(err, Err(BackendError::InvalidExternalId(_))));
        assert!("https://example.com/?catalog=a&template=b&version=c"
            .parse::<ExternalId>()
            .is_err());
    }

    #[test]
    fn with_version_swaps_only_version() {
        let id = ExternalId::new("apps", "foo-g1", "1.0.0").with_version("2.0.0");
        assert_eq!(id.template, "foo-g1");
        assert_eq!(id.version, "2.0.0");
    }
}
