//! Client settings.
//!
//! Layered the usual way: built-in defaults, then an optional settings file,
//! then `REBAC_*` environment variables (`REBAC_DEBUG=true`,
//! `REBAC_SCHEMA_PATH=/etc/rebac/schema.zed`).

use crate::error::{AuthzError, Result};
use crate::policy;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "REBAC";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthzSettings {
    /// Request debug information on every call.
    pub debug: bool,
    /// Schema file pushed at initialization. The built-in platform schema is
    /// used when unset.
    pub schema_path: Option<PathBuf>,
    /// Address of the permission service, for whoever builds the transport.
    pub endpoint: Option<String>,
}

impl AuthzSettings {
    /// Loads `path` (if given and present) and applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Schema text to push: the configured file, or the platform schema.
    pub fn schema_text(&self) -> Result<String> {
        match self.schema_path {
            Some(ref path) => std::fs::read_to_string(path).map_err(AuthzError::Schema),
            None => Ok(policy::SCHEMA.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_settings_use_builtin_schema() {
        let settings = AuthzSettings::from_toml_str("").unwrap();
        assert_eq!(settings, AuthzSettings::default());
        assert_eq!(settings.schema_text().unwrap(), policy::SCHEMA);
    }

    #[test]
    fn parses_toml() {
        let settings = AuthzSettings::from_toml_str(
            r#"
            debug = true
            endpoint = "spicedb.internal:50051"
            "#,
        )
        .unwrap();
        assert!(settings.debug);
        assert_eq!(settings.endpoint.as_deref(), Some("spicedb.internal:50051"));
        assert_eq!(settings.schema_path, None);
    }

    #[test]
    fn rejects_wrong_types() {
        let err = AuthzSettings::from_toml_str("debug = \"sometimes\"").unwrap_err();
        assert!(matches!(err, AuthzError::Config(_)));
    }

    #[test]
    fn missing_file_is_optional() {
        let settings = AuthzSettings::load(Some(Path::new("/nonexistent/rebac.toml"))).unwrap();
        assert_eq!(settings.schema_path, None);
    }

    #[test]
    fn unreadable_schema_path_is_an_error() {
        let settings = AuthzSettings {
            schema_path: Some(PathBuf::from("/nonexistent/schema.zed")),
            ..Default::default()
        };
        assert!(matches!(settings.schema_text(), Err(AuthzError::Schema(_))));
    }
}
