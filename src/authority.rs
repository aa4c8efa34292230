//! Authority state machine (§4.8): CSR intake, serial allocation, signing,
//! chain publication.
//!
//! Resolves REDESIGN FLAG R2 (was Q2): the authority enforces
//! `CSR.subject.common_name == sender`, where `sender` is the CN segment of
//! the `joonos/<sender>/csr` topic the CSR arrived on, rather than trusting
//! the CSR's self-declared CN outright. Broker ACLs remain a second line of
//! defense, not the sole gate.

use crate::codec;
use crate::config::CaConfig;
use crate::error::{CryptoError, Error, ProtocolError, TransportError};
use crate::mqtt;
use crate::serial::SerialAllocator;
use crate::types::{Certificate, Credential, NodeName, PrivateKey};
use rcgen::{Certificate as RcgenCertificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use std::time::Duration;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::{info, warn};

/// 30-day validity for every issued node certificate (§4.8).
const CERT_VALIDITY_DAYS: i64 = 30;

/// The authority's signing identity and serial allocator (§3: CaState).
pub struct CaState {
    /// Signing certificate, reconstructed as an `rcgen::Certificate` so it
    /// can be passed as the issuer to `rcgen::Certificate::generate`, the
    /// same pattern the codec's chain-building code uses for intermediates.
    issuer: RcgenCertificate,
    serials: SerialAllocator,
}

impl CaState {
    /// Load the signing credential and serial allocator from `config`.
    pub async fn load(config: &CaConfig) -> Result<Self, Error> {
        let signing_cert_pem = std::fs::read_to_string(&config.sign_cert).map_err(|source| {
            crate::error::CodecError::Read {
                path: config.sign_cert.display().to_string(),
                source,
            }
        })?;
        let signing_key_pem = std::fs::read_to_string(&config.sign_key).map_err(|source| {
            crate::error::CodecError::Read {
                path: config.sign_key.display().to_string(),
                source,
            }
        })?;
        let key_pair = KeyPair::from_pem(&signing_key_pem).map_err(CryptoError::CertGen)?;

        let mut params = CertificateParams::from_ca_cert_pem(&signing_cert_pem)
            .map_err(CryptoError::CertGen)?;
        params.key_pair = Some(key_pair);
        let issuer = RcgenCertificate::generate_self_signed(params).map_err(CryptoError::CertGen)?;

        let serials = SerialAllocator::load(config.serial_path()).await;
        Ok(Self { issuer, serials })
    }

    /// Process one incoming CSR (§4.8 steps 1-7). `sender` is the CN parsed
    /// from the topic `joonos/<sender>/csr`.
    pub async fn sign_csr(&mut self, sender: &str, csr_der: &[u8]) -> Result<Vec<u8>, AuthorityError> {
        let (csr_cn, subject_spki) = parse_csr(csr_der)?;
        if csr_cn != sender {
            return Err(AuthorityError::Protocol(ProtocolError::SenderMismatch {
                csr_cn,
                sender: sender.to_string(),
            }));
        }

        let serial = self.serials.next().await?;

        let subject_keypair = KeyPair::from_public_key_der(&rcgen::PKCS_RSA_SHA256, &subject_spki)
            .map_err(CryptoError::CertGen)?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, sender);

        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(CryptoError::CertGen)?;
        params.distinguished_name = dn;
        params.key_pair = Some(subject_keypair);
        params.is_ca = IsCa::NoCa;
        params.serial_number = Some(rcgen::SerialNumber::from_slice(&serial.to_le_bytes()));
        let not_before = OffsetDateTime::now_utc();
        params.not_before = not_before;
        params.not_after = not_before + TimeDuration::days(CERT_VALIDITY_DAYS);

        let cert = RcgenCertificate::generate(params, &self.issuer).map_err(CryptoError::CertGen)?;
        let signed_der = cert
            .serialize_der_with_signer(&self.issuer)
            .map_err(CryptoError::CertGen)?;

        let issued = Certificate(signed_der);
        verify_issued_matches_request(&issued, &subject_spki)?;

        info!(cn = sender, serial = %serial, "issued certificate");

        let issuer_der = self.issuer.serialize_der().map_err(CryptoError::CertGen)?;
        let mut published = issued.0;
        published.extend_from_slice(&issuer_der);
        Ok(published)
    }
}

/// Re-parse the signed DER and confirm the public key matches the CSR's,
/// guarding against signer bugs (§4.8 step 6).
fn verify_issued_matches_request(issued: &Certificate, csr_spki: &[u8]) -> Result<(), AuthorityError> {
    let issued_spki = issued.public_key_der().map_err(AuthorityError::Codec)?;
    if issued_spki != csr_spki {
        warn!("signer produced a certificate whose public key does not match the CSR");
        return Err(AuthorityError::Crypto(CryptoError::RsaEncoding(
            "issued public key does not match CSR".to_string(),
        )));
    }
    Ok(())
}

/// Parse a DER CSR's subject CommonName and raw SubjectPublicKeyInfo.
fn parse_csr(csr_der: &[u8]) -> Result<(String, Vec<u8>), AuthorityError> {
    let (_, csr) = x509_parser::certification_request::X509CertificationRequest::from_der(csr_der)
        .map_err(|e| AuthorityError::Crypto(CryptoError::RsaEncoding(e.to_string())))?;
    let cn = csr
        .certification_request_info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| {
            AuthorityError::Protocol(ProtocolError::MalformedTopic(
                "CSR has no subject CommonName".to_string(),
            ))
        })?;
    let spki = csr.certification_request_info.subject_pki.raw.to_vec();
    Ok((cn, spki))
}

/// Authority-side errors. Every variant is logged and the CSR is skipped;
/// the retained CSR on the broker remains for a future retry (§4.8 failure
/// handling).
#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Codec(#[from] crate::error::CodecError),
}

/// Run the authority's MQTT loop (§4.8, §5): a single subscriber to
/// `joonos/+/csr` feeding a single signer, matching the "two cooperating
/// tasks" scheduling model — one task (the eventloop poll below) receives
/// CSR messages, the other (`CaState::sign_csr`) serially signs and
/// persists the next serial before publishing.
pub async fn run(config: CaConfig) -> Result<(), Error> {
    let mut ca_state = CaState::load(&config).await?;
    let ca_root = codec::load_one(&config.ca_cert)?;
    let tls_credential = load_tls_credential(&config)?;
    let tls_config = mqtt::build_tls_config(&ca_root, &tls_credential)?;

    let mut options = MqttOptions::new("joonos-ca", broker_host(&config.mqtt_server), broker_port(&config.mqtt_server));
    options.set_keep_alive(Duration::from_secs(30));
    options.set_transport(Transport::Tls(TlsConfiguration::Rustls(tls_config)));
    let (client, mut eventloop) = AsyncClient::new(options, 64);

    client.subscribe("joonos/+/csr", QoS::AtLeastOnce).await.map_err(TransportError::Mqtt)?;
    info!("authority subscribed to joonos/+/csr");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if publish.payload.is_empty() {
                    continue; // a cleared CSR, nothing to sign
                }
                let Some(sender) = sender_from_topic(&publish.topic) else {
                    warn!(topic = %publish.topic, "malformed CSR topic, skipping");
                    continue;
                };
                match ca_state.sign_csr(&sender, &publish.payload).await {
                    Ok(published) => {
                        let topic = format!("joonos/{sender}/cert");
                        if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, published).await {
                            warn!(error = %e, sender = %sender, "failed to publish issued certificate");
                        }
                    }
                    Err(e) => warn!(error = %e, sender = %sender, "CSR processing failed, skipping"),
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "authority connection error, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

fn sender_from_topic(topic: &str) -> Option<NodeName> {
    let mut parts = topic.split('/');
    if parts.next()? != "joonos" {
        return None;
    }
    let sender = parts.next()?;
    if parts.next()? != "csr" || parts.next().is_some() {
        return None;
    }
    Some(NodeName(sender.to_string()))
}

fn load_tls_credential(config: &CaConfig) -> Result<Credential, Error> {
    let bytes = std::fs::read(&config.tls_cert).map_err(|source| crate::error::CodecError::Read {
        path: config.tls_cert.display().to_string(),
        source,
    })?;
    let chain = codec::decode_pem(&bytes)?;
    let key_pem = std::fs::read_to_string(&config.tls_key).map_err(|source| crate::error::CodecError::Read {
        path: config.tls_key.display().to_string(),
        source,
    })?;
    let key = PrivateKey::from_pkcs8_pem(&key_pem)?;
    Ok(Credential { chain, key })
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr;

    #[test]
    fn sender_from_topic_parses_csr_topic() {
        assert_eq!(sender_from_topic("joonos/edge-07/csr"), Some(NodeName("edge-07".to_string())));
    }

    #[test]
    fn sender_from_topic_rejects_malformed() {
        assert_eq!(sender_from_topic("joonos/edge-07/cert"), None);
        assert_eq!(sender_from_topic("joonos/edge-07/csr/extra"), None);
    }

    /// A fresh self-signed CA, used as the signing issuer and plugged
    /// directly into `CaState`'s private fields (same module, so the
    /// struct literal is visible here).
    async fn test_ca_state(dir: &std::path::Path) -> CaState {
        let key_pair = KeyPair::generate().expect("ca key");
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "test-ca");
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_pair = Some(key_pair);
        let issuer = RcgenCertificate::generate_self_signed(params).expect("self-signed ca");
        let serials = SerialAllocator::load(dir.join("serial")).await;
        CaState { issuer, serials }
    }

    #[tokio::test]
    async fn sign_csr_issues_a_certificate_matching_the_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut ca_state = test_ca_state(dir.path()).await;

        let generated = csr::generate(&NodeName("edge-07".to_string())).unwrap();
        let published = ca_state.sign_csr("edge-07", &generated.csr_der).await.unwrap();

        let (remaining, _leaf_cert) = x509_parser::parse_x509_certificate(&published).unwrap();
        let leaf_der_len = published.len() - remaining.len();
        let leaf = Certificate(published[..leaf_der_len].to_vec());

        assert_eq!(leaf.common_name().unwrap(), "edge-07");
        assert_eq!(leaf.public_key_der().unwrap(), generated.key.public_key_der().unwrap());
    }

    #[tokio::test]
    async fn sign_csr_rejects_a_sender_that_does_not_match_the_csr_cn() {
        let dir = tempfile::tempdir().unwrap();
        let mut ca_state = test_ca_state(dir.path()).await;

        let generated = csr::generate(&NodeName("edge-07".to_string())).unwrap();
        let err = ca_state.sign_csr("someone-else", &generated.csr_der).await.unwrap_err();

        assert!(matches!(
            err,
            AuthorityError::Protocol(ProtocolError::SenderMismatch { .. })
        ));
    }
}
