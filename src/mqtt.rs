//! MQTT supervisor (§4.5, node side): owns the broker session for the
//! currently active credential, reconnects automatically, and tears down
//! and rebuilds the session when the loop rotates identity.
//!
//! The session lifecycle below mirrors the teacher's certificate lifecycle
//! state machine: `can_transition_to` is the single place that encodes
//! which moves are legal, the same role the teacher's state machine gives
//! its own transition guard.

use crate::error::TransportError;
use crate::types::{Certificate, Credential, NodeName, SysDesc, SysStat, UpgradeCommand};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Session lifecycle (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session exists yet.
    Idle,
    /// Dialing the broker with the current params.
    Connecting,
    /// Connected, subscribed, and relaying messages.
    Running,
    /// The loop asked for new params; the old session is being torn down.
    RestartRequested,
    /// Shut down for good.
    Stopped,
}

impl SessionState {
    /// Is a restart (identity switch) or initial connect currently legal?
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, target),
            (Idle, Connecting)
                | (Connecting, Running)
                | (Running, RestartRequested)
                | (RestartRequested, Connecting)
                | (Running, Stopped)
                | (Connecting, Stopped)
                | (Idle, Stopped)
        )
    }
}

/// Session parameters: the active credential's Common Name, the broker
/// address, and the mutual-TLS config built from that credential — i.e.
/// everything that changes on a rotation (§4.5: the session is rebuilt, not
/// mutated, when identity changes).
#[derive(Clone)]
pub struct SessionParams {
    /// Common Name of the currently active credential; used to derive topics.
    pub cn: NodeName,
    /// Broker address, e.g. `mqtts://broker.example.com:8883`.
    pub broker: String,
    /// Client-auth TLS config built from the active credential and the
    /// local CA root (§6: "TLS with mutual auth").
    pub tls_config: Arc<ClientConfig>,
}

impl SessionParams {
    fn topic(&self, suffix: &str) -> String {
        format!("joonos/{}/{}", self.cn.0, suffix)
    }
}

/// Build the mutual-TLS client config for a session: the active
/// `credential`'s chain and key for client auth, `ca_root` as the sole
/// trust anchor for the server certificate.
pub fn build_tls_config(
    ca_root: &Certificate,
    credential: &Credential,
) -> Result<Arc<ClientConfig>, TransportError> {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(ca_root.0.clone()))
        .map_err(|e| TransportError::Tls(format!("invalid CA root: {e}")))?;

    let chain: Vec<CertificateDer<'static>> = credential
        .chain
        .iter()
        .map(|cert| CertificateDer::from(cert.0.clone()))
        .collect();
    let key_der = credential
        .key
        .to_pkcs8_der()
        .map_err(|e| TransportError::Tls(format!("client key encoding failed: {e}")))?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der));

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| TransportError::Tls(format!("client auth cert rejected: {e}")))?;

    Ok(Arc::new(config))
}

/// One successful (re)connection, tagged with whether the session is still
/// on the provisioning credential.
#[derive(Debug, Clone)]
pub struct DidConnect {
    /// True while the active credential is the shared provisioning one.
    pub is_provisioning: bool,
}

/// Channels exposed to the node event loop (§4.5).
pub struct SupervisorHandle {
    /// broker -> loop: one message per successful (re)connection.
    pub did_connect: mpsc::Receiver<DidConnect>,
    /// broker -> loop: human-readable session log lines.
    pub messages: mpsc::Receiver<String>,
    /// loop -> broker: publish (or clear, with an empty payload) the CSR.
    pub csrs: mpsc::Sender<Vec<u8>>,
    /// broker -> loop: parsed certificate chains from `joonos/<cn>/cert`.
    pub certs: mpsc::Receiver<Vec<Certificate>>,
    /// loop -> broker: periodic sysdesc/sysstat publication.
    pub sysdesc: mpsc::Sender<SysDesc>,
    /// loop -> broker: periodic sysdesc/sysstat publication.
    pub sysstat: mpsc::Sender<SysStat>,
    /// broker -> loop: upgrade commands from `joonos/<cn>/upgrade`.
    pub upgcmds: mpsc::Receiver<UpgradeCommand>,
    /// loop -> supervisor: request a session restart with new params.
    pub params: mpsc::Sender<SessionParams>,
    /// loop -> supervisor: graceful shutdown.
    pub stop: mpsc::Sender<()>,
}

/// Spawn the MQTT supervisor task and return its channel handle. The
/// supervisor owns `state` internally; callers interact only through the
/// returned channels.
pub fn spawn(initial: SessionParams) -> SupervisorHandle {
    let (did_connect_tx, did_connect_rx) = mpsc::channel(8);
    let (messages_tx, messages_rx) = mpsc::channel(64);
    let (csrs_tx, csrs_rx) = mpsc::channel(8);
    let (certs_tx, certs_rx) = mpsc::channel(8);
    let (sysdesc_tx, sysdesc_rx) = mpsc::channel(4);
    let (sysstat_tx, sysstat_rx) = mpsc::channel(4);
    let (upgcmds_tx, upgcmds_rx) = mpsc::channel(8);
    let (params_tx, params_rx) = mpsc::channel(4);
    let (stop_tx, stop_rx) = mpsc::channel(1);

    tokio::spawn(run_supervisor(
        initial,
        did_connect_tx,
        messages_tx,
        csrs_rx,
        certs_tx,
        sysdesc_rx,
        sysstat_rx,
        upgcmds_tx,
        params_rx,
        stop_rx,
    ));

    SupervisorHandle {
        did_connect: did_connect_rx,
        messages: messages_rx,
        csrs: csrs_tx,
        certs: certs_rx,
        sysdesc: sysdesc_tx,
        sysstat: sysstat_tx,
        upgcmds: upgcmds_rx,
        params: params_tx,
        stop: stop_tx,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_supervisor(
    mut params: SessionParams,
    did_connect: mpsc::Sender<DidConnect>,
    messages: mpsc::Sender<String>,
    mut csrs: mpsc::Receiver<Vec<u8>>,
    certs: mpsc::Sender<Vec<Certificate>>,
    mut sysdesc: mpsc::Receiver<SysDesc>,
    mut sysstat: mpsc::Receiver<SysStat>,
    upgcmds: mpsc::Sender<UpgradeCommand>,
    mut new_params: mpsc::Receiver<SessionParams>,
    mut stop: mpsc::Receiver<()>,
) {
    let mut state = SessionState::Idle;

    'session: loop {
        if !state.can_transition_to(SessionState::Connecting) && state != SessionState::Idle {
            warn!(?state, "supervisor asked to connect from an unexpected state");
        }
        state = SessionState::Connecting;

        let (client, mut eventloop) = new_client(&params);

        if let Err(e) = subscribe_all(&client, &params).await {
            let _ = messages.send(format!("subscribe failed: {e}")).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue 'session;
        }

        state = SessionState::Running;
        let _ = did_connect
            .send(DidConnect {
                is_provisioning: params.cn.is_provisioning(),
            })
            .await;
        info!(cn = %params.cn, "mqtt session running");

        loop {
            tokio::select! {
                biased;

                _ = stop.recv() => {
                    let _ = client.disconnect().await;
                    state = SessionState::Stopped;
                    return;
                }

                Some(next) = new_params.recv() => {
                    state = SessionState::RestartRequested;
                    let _ = client.disconnect().await;
                    params = next;
                    continue 'session;
                }

                Some(csr) = csrs.recv() => {
                    let topic = params.topic("csr");
                    if let Err(e) = client.publish(topic, QoS::AtLeastOnce, true, csr).await {
                        let _ = messages.send(format!("csr publish failed: {e}")).await;
                    }
                }

                Some(desc) = sysdesc.recv() => {
                    if let Ok(payload) = serde_json::to_vec(&desc) {
                        let topic = params.topic("status/description");
                        let _ = client.publish(topic, QoS::AtLeastOnce, true, payload).await;
                    }
                }

                Some(stat) = sysstat.recv() => {
                    if !params.cn.is_provisioning() {
                        if let Ok(payload) = serde_json::to_vec(&stat) {
                            let topic = params.topic("status/stat");
                            let _ = client.publish(topic, QoS::AtLeastOnce, false, payload).await;
                        }
                    }
                }

                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            if publish.topic == params.topic("cert") {
                                if let Ok(parsed) = crate::codec::decode_pem(&publish.payload) {
                                    let _ = certs.send(parsed).await;
                                } else {
                                    let _ = certs.send(split_concatenated_der(&publish.payload)).await;
                                }
                            } else if publish.topic == params.topic("upgrade") {
                                match serde_json::from_slice::<UpgradeCommand>(&publish.payload) {
                                    Ok(cmd) => { let _ = upgcmds.send(cmd).await; }
                                    Err(e) => { let _ = messages.send(format!("malformed upgrade command: {e}")).await; }
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            let _ = messages.send(format!("connection error: {e}")).await;
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue 'session;
                        }
                    }
                }
            }
        }
    }
}

fn new_client(params: &SessionParams) -> (AsyncClient, rumqttc::EventLoop) {
    let client_id = params.cn.0.clone();
    let mut options = MqttOptions::new(client_id, broker_host(&params.broker), broker_port(&params.broker));
    options.set_keep_alive(Duration::from_secs(30));
    options.set_transport(Transport::Tls(TlsConfiguration::Rustls(params.tls_config.clone())));
    AsyncClient::new(options, 64)
}

fn broker_host(server: &str) -> String {
    server
        .rsplit_once(':')
        .map(|(host, _)| host.trim_start_matches("mqtts://").trim_start_matches("mqtt://").to_string())
        .unwrap_or_else(|| server.to_string())
}

fn broker_port(server: &str) -> u16 {
    server
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .unwrap_or(8883)
}

async fn subscribe_all(client: &AsyncClient, params: &SessionParams) -> Result<(), TransportError> {
    client.subscribe(params.topic("cert"), QoS::AtLeastOnce).await?;
    client.subscribe(params.topic("upgrade"), QoS::AtLeastOnce).await?;
    debug!(cn = %params.cn, "subscribed to cert and upgrade topics");
    Ok(())
}

/// Fallback parse for the wire form in §6: concatenated DER (leaf || CA
/// issuer) rather than PEM. Each DER certificate's own length prefix lets
/// `x509-parser` delimit them in sequence.
fn split_concatenated_der(payload: &[u8]) -> Vec<Certificate> {
    let mut certs = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        match x509_parser::parse_x509_certificate(rest) {
            Ok((remaining, _cert)) => {
                let consumed = rest.len() - remaining.len();
                certs.push(Certificate(rest[..consumed].to_vec()));
                rest = remaining;
            }
            Err(_) => break,
        }
    }
    certs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_can_only_move_to_connecting_or_stopped() {
        let idle = SessionState::Idle;
        assert!(idle.can_transition_to(SessionState::Connecting));
        assert!(idle.can_transition_to(SessionState::Stopped));
        assert!(!idle.can_transition_to(SessionState::Running));
    }

    #[test]
    fn broker_host_and_port_parse() {
        assert_eq!(broker_host("mqtts://broker.example.com:8883"), "broker.example.com");
        assert_eq!(broker_port("mqtts://broker.example.com:8883"), 8883);
    }
}
