//! Node state store (§3 NodeState) and top-level event loop (§4.7).
//!
//! `NodeState` is the single owned record the re-architecture notes call
//! for: no process-wide mutable state, just one struct threaded through the
//! event loop below.

use crate::codec;
use crate::config::NodeConfig;
use crate::csr;
use crate::error::{CodecError, ConfigError, Error};
use crate::installer;
use crate::mqtt::{self, SessionParams};
use crate::scheduler;
use crate::telemetry;
use crate::types::{Certificate, Credential, NodeCredentialPaths, NodeName, PendingCsrKey, PrivateKey};
use crate::upgrade;
use chrono::Utc;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

/// The node's mutable singleton state (§3).
pub struct NodeState {
    /// Loaded configuration, immutable for the life of the process.
    pub config: NodeConfig,
    /// Trust anchor both credential chains are verified against.
    pub ca_root: Certificate,
    /// Shared, short-validity credential used until a node credential
    /// exists. `None` when the provisioning cert/key failed to load; the
    /// node can still run on an existing, unexpired node credential.
    pub provisioning_credential: Option<Credential>,
    /// This device's name: explicit config, else the local hostname.
    pub node_name: NodeName,
    /// Per-device credential, once one has been installed.
    pub node_credential: Option<Credential>,
    /// Set when a previously installed node credential failed to load; the
    /// node falls back to the provisioning credential rather than refusing
    /// to start (§7: "the node never self-destroys a working credential").
    pub load_error: Option<String>,
    /// (I2) Non-null iff a CSR has been published with no accepted
    /// certificate yet.
    pub pending_csr_key: Option<PendingCsrKey>,
}

impl NodeState {
    /// Load the CA root, provisioning credential, and any existing node
    /// credential from `config`'s paths (§3, §6).
    pub fn load(config: NodeConfig) -> Result<Self, Error> {
        let ca_root = codec::load_one(&config.ca_cert)?;

        let provisioning_credential =
            match load_credential(&config.provisioning_cert, &config.provisioning_key) {
                Ok(cred) => Some(cred),
                Err(e) => {
                    warn!(error = %e, "provisioning credential failed to load");
                    None
                }
            };

        let node_name = match &config.node_name {
            Some(name) => NodeName(name.clone()),
            None => NodeName(local_hostname()),
        };

        let paths = config.credential_paths();
        let (node_credential, load_error) = match load_node_credential(&paths) {
            Ok(existing) => (existing, None),
            Err(e) => {
                warn!(
                    error = %e,
                    "existing node credential failed to load, falling back to provisioning identity"
                );
                (None, Some(e.to_string()))
            }
        };

        let has_usable_node_credential = node_credential
            .as_ref()
            .is_some_and(|cred| !cred.is_expired(Utc::now()).unwrap_or(true));
        if provisioning_credential.is_none() && !has_usable_node_credential {
            return Err(Error::Config(ConfigError::NoCredentialAvailable));
        }

        Ok(Self {
            config,
            ca_root,
            provisioning_credential,
            node_name,
            node_credential,
            load_error,
            pending_csr_key: None,
        })
    }

    /// (I1) The credential currently in force: the node credential if
    /// present and unexpired, else the shared provisioning credential.
    /// `None` only in the fleeting window where a node credential has
    /// expired and no provisioning credential was available to fall back
    /// to. `load` refuses to construct a `NodeState` in that state at
    /// startup, but a credential can still expire later in the run.
    pub fn active_credential(&self) -> Option<&Credential> {
        match &self.node_credential {
            Some(cred) if !cred.is_expired(Utc::now()).unwrap_or(true) => Some(cred),
            _ => self.provisioning_credential.as_ref(),
        }
    }

    /// Common Name of whichever credential is active right now, or the
    /// unprovisioned placeholder when none is.
    pub fn active_common_name(&self) -> NodeName {
        self.active_credential()
            .and_then(|cred| cred.common_name().ok())
            .map(NodeName)
            .unwrap_or_else(|| NodeName(NodeName::UNPROVISIONED.to_string()))
    }

    /// Build MQTT session parameters (CN, broker, mutual-TLS config) from
    /// the currently active credential.
    pub fn session_params(&self) -> Result<SessionParams, Error> {
        let credential = self
            .active_credential()
            .ok_or(Error::Config(ConfigError::NoCredentialAvailable))?;
        let tls_config = mqtt::build_tls_config(&self.ca_root, credential)?;
        Ok(SessionParams {
            cn: self.active_common_name(),
            broker: self.config.mqtt_server.clone(),
            tls_config,
        })
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| NodeName::UNPROVISIONED.to_string())
}

fn load_credential(cert_path: &Path, key_path: &Path) -> Result<Credential, Error> {
    let bytes = std::fs::read(cert_path).map_err(|source| CodecError::Read {
        path: cert_path.display().to_string(),
        source,
    })?;
    let chain = codec::decode_pem(&bytes)?;
    if chain.is_empty() {
        return Err(Error::Config(ConfigError::MissingField(format!(
            "{} contains no certificates",
            cert_path.display()
        ))));
    }
    let key_pem = std::fs::read_to_string(key_path).map_err(|source| CodecError::Read {
        path: key_path.display().to_string(),
        source,
    })?;
    let key = PrivateKey::from_pkcs8_pem(&key_pem)?;
    Ok(Credential { chain, key })
}

fn load_node_credential(paths: &NodeCredentialPaths) -> Result<Option<Credential>, Error> {
    if !paths.cert.exists() || !paths.key.exists() {
        return Ok(None);
    }
    Ok(Some(load_credential(&paths.cert, &paths.key)?))
}

/// Run the node event loop (§4.7) until the process is killed. Drives the
/// MQTT supervisor, the renewal scheduler, the CSR/cert cycle, periodic
/// telemetry, and one-shot upgrade commands.
pub async fn run(config: NodeConfig) -> Result<(), Error> {
    let mut state = NodeState::load(config)?;
    let upgrade_client = reqwest::Client::new();

    let mut supervisor = mqtt::spawn(state.session_params()?);
    let mut renew_at = scheduler::renew_at(
        state.node_credential.as_ref().map(Credential::leaf),
        state.config.renewal_safety_margin_days,
        Utc::now(),
    )?;
    let mut stat_tick = tokio::time::interval(Duration::from_secs(60));

    loop {
        let until_renew = (renew_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            biased;

            Some(connect) = supervisor.did_connect.recv() => {
                if !connect.is_provisioning {
                    let _ = supervisor.sysdesc.send(telemetry::read_sysdesc()).await;
                }
                renew_at = scheduler::renew_at(
                    state.node_credential.as_ref().map(Credential::leaf),
                    state.config.renewal_safety_margin_days,
                    Utc::now(),
                )?;
                if renew_at - Utc::now() > chrono::Duration::seconds(1) {
                    let _ = supervisor.csrs.send(Vec::new()).await;
                    state.pending_csr_key = None;
                }
            }

            Some(line) = supervisor.messages.recv() => {
                info!(message = %line, "mqtt session event");
            }

            _ = tokio::time::sleep(until_renew) => {
                match csr::generate(&state.node_name) {
                    Ok(generated) => {
                        state.pending_csr_key = Some(PendingCsrKey {
                            key: generated.key,
                            csr_der: generated.csr_der.clone(),
                        });
                        let _ = supervisor.csrs.send(generated.csr_der).await;
                    }
                    Err(e) => error!(error = %e, "CSR generation failed"),
                }
                renew_at = Utc::now() + scheduler::RETRY_HORIZON;
            }

            Some(received) = supervisor.certs.recv() => {
                let pending = state.pending_csr_key.clone();
                let paths = state.config.credential_paths();
                match installer::install(&received, &state.ca_root, pending, &paths).await {
                    Ok(credential) => {
                        state.node_credential = Some(credential);
                        state.pending_csr_key = None;
                        let _ = supervisor.csrs.send(Vec::new()).await;
                        match state.session_params() {
                            Ok(params) => { let _ = supervisor.params.send(params).await; }
                            Err(e) => error!(error = %e, "failed to rebuild session params after rotation"),
                        }
                        renew_at = scheduler::renew_at(
                            state.node_credential.as_ref().map(Credential::leaf),
                            state.config.renewal_safety_margin_days,
                            Utc::now(),
                        )?;
                    }
                    Err(e) => {
                        warn!(error = %e, "certificate installation rejected, keeping previous credential");
                    }
                }
            }

            Some(cmd) = supervisor.upgcmds.recv() => {
                match state.config.upgrade_argv.clone() {
                    Some(argv) => {
                        let local_node = state.node_name.clone();
                        let client = upgrade_client.clone();
                        tokio::spawn(async move {
                            if let Err(e) = upgrade::execute(&argv, &cmd, &local_node, &client).await {
                                error!(error = %e, "upgrade execution failed");
                            }
                        });
                    }
                    None => info!("upgrade command received but no upgrade tool configured"),
                }
            }

            _ = stat_tick.tick() => {
                if !state.active_common_name().is_provisioning() {
                    let _ = supervisor.sysstat.send(telemetry::read_sysstat()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_hostname_never_panics() {
        let _ = local_hostname();
    }
}
