//! Per-process configuration (§6), loaded from JSON. `NodeConfig` and
//! `CaConfig` are immutable once loaded — neither process mutates its own
//! configuration at runtime.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Json {
        path: path.display().to_string(),
        source,
    })
}

/// Node-agent configuration (§6). Wire format is kebab-case JSON keys
/// (`ca-cert`, `data-directory`, ...), matching the original Go source's
/// struct tags.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    /// Path to the trusted CA root certificate.
    pub ca_cert: PathBuf,
    /// Path to the shared provisioning certificate chain.
    pub provisioning_cert: PathBuf,
    /// Path to the shared provisioning private key.
    pub provisioning_key: PathBuf,
    /// Directory holding `node.cert.pem` / `node.key.pem`.
    pub data_directory: PathBuf,
    /// MQTT broker address, e.g. `mqtts://broker.example.com:8883`.
    pub mqtt_server: String,
    /// Explicit node name; defaults to the local hostname when absent.
    #[serde(default)]
    pub node_name: Option<String>,
    /// `argv` for the upgrade executor; upgrade commands are logged and
    /// ignored when this is absent.
    #[serde(default)]
    pub upgrade_argv: Option<Vec<String>>,
    /// Override for the renewal safety margin (R5); defaults to
    /// `min(7 days, 10% of validity)` when absent.
    #[serde(default)]
    pub renewal_safety_margin_days: Option<u32>,
}

impl NodeConfig {
    /// Load and parse a node configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        read_json(path)
    }

    /// `<data_directory>/node.cert.pem` and `<data_directory>/node.key.pem` (§6).
    pub fn credential_paths(&self) -> crate::types::NodeCredentialPaths {
        crate::types::NodeCredentialPaths {
            cert: self.data_directory.join("node.cert.pem"),
            key: self.data_directory.join("node.key.pem"),
        }
    }
}

/// Certificate-authority configuration (§6). Same kebab-case wire format
/// as `NodeConfig`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CaConfig {
    /// Path to the trusted CA root certificate (the same root nodes trust).
    pub ca_cert: PathBuf,
    /// Directory holding the serial counter file.
    pub data_directory: PathBuf,
    /// TLS certificate the authority presents to the broker.
    pub tls_cert: PathBuf,
    /// TLS private key matching `tls_cert`.
    pub tls_key: PathBuf,
    /// Certificate used to sign issued node certificates.
    pub sign_cert: PathBuf,
    /// Private key matching `sign_cert`.
    pub sign_key: PathBuf,
    /// MQTT broker address.
    pub mqtt_server: String,
}

impl CaConfig {
    /// Load and parse an authority configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        read_json(path)
    }

    /// `<data_directory>/serial` (§6).
    pub fn serial_path(&self) -> PathBuf {
        self.data_directory.join("serial")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn node_config_rejects_malformed_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = NodeConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Json { .. }));
    }

    #[test]
    fn node_config_parses_minimal_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "ca-cert": "/etc/joonos/ca.pem",
                "provisioning-cert": "/etc/joonos/provisioning.cert.pem",
                "provisioning-key": "/etc/joonos/provisioning.key.pem",
                "data-directory": "/var/lib/joonos",
                "mqtt-server": "mqtts://broker:8883"
            }}"#
        )
        .unwrap();
        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.mqtt_server, "mqtts://broker:8883");
        assert!(config.node_name.is_none());
        assert!(config.upgrade_argv.is_none());
    }
}
