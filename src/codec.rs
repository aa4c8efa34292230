//! Certificate codec and chain verifier (§4.1): PEM<->DER, a single-root
//! chain verification against the platform TLS verifier, and RSA key-match
//! proof-of-possession. Shared, read-only, by both the node and the
//! authority.

use crate::error::CodecError;
use crate::types::Certificate;
use std::path::Path;
use std::time::SystemTime;
use tracing::debug;

const CERTIFICATE_TAG: &str = "CERTIFICATE";
const PRIVATE_KEY_TAG: &str = "PRIVATE KEY";

/// Decode a buffer of PEM blocks into an ordered sequence of certificates.
/// An empty input yields an empty sequence; any block whose tag isn't
/// `CERTIFICATE` is an error (§4.1).
pub fn decode_pem(bytes: &[u8]) -> Result<Vec<Certificate>, CodecError> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Vec::new());
    }
    let blocks = pem::parse_many(bytes)?;
    blocks
        .into_iter()
        .map(|block| {
            if block.tag() != CERTIFICATE_TAG {
                return Err(CodecError::UnexpectedBlockType {
                    found: block.tag().to_string(),
                });
            }
            Ok(Certificate(block.into_contents()))
        })
        .collect()
}

/// Encode a sequence of certificates back to concatenated PEM, in order.
pub fn encode_pem(certs: &[Certificate]) -> String {
    certs
        .iter()
        .map(|cert| pem::encode(&pem::Pem::new(CERTIFICATE_TAG, cert.0.clone())))
        .collect::<Vec<_>>()
        .join("")
}

/// Load a file that must contain exactly one PEM certificate block.
pub fn load_one(path: &Path) -> Result<Certificate, CodecError> {
    let bytes = std::fs::read(path).map_err(|source| CodecError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let mut certs = decode_pem(&bytes)?;
    if certs.len() != 1 {
        return Err(CodecError::NotExactlyOne(certs.len()));
    }
    certs.pop().ok_or(CodecError::NotExactlyOne(0))
}

/// Reject a set of intermediates that can't form an unambiguous path: two
/// certificates claiming the same Subject CommonName leave the verifier
/// free to pick either as the next link, which this codec treats as a
/// rejection rather than a coin flip (§4.1).
fn reject_ambiguous_intermediates(intermediates: &[Certificate]) -> Result<(), CodecError> {
    let mut seen = std::collections::HashSet::new();
    for cert in intermediates {
        if !seen.insert(cert.common_name()?) {
            return Err(CodecError::AmbiguousChain);
        }
    }
    Ok(())
}

/// Build and verify `[leaf, intermediates…, root]` against the platform TLS
/// verifier. Every certificate this codec verifies is used as a TLS
/// **client** certificate for mutual-auth MQTT, never a server cert, so
/// verification goes through the client-auth trust path. Fails if the
/// assembled chain's length is wrong, if the verifier rejects the leaf, or
/// if the intermediates are ambiguous (see `reject_ambiguous_intermediates`).
pub fn verify_chain(
    leaf: &Certificate,
    intermediates: &[Certificate],
    root: &Certificate,
) -> Result<Vec<Certificate>, CodecError> {
    let expected_len = intermediates.len() + 2;

    reject_ambiguous_intermediates(intermediates)?;

    let anchor = webpki::TrustAnchor::try_from_cert_der(&root.0)
        .map_err(|e| CodecError::ChainRejected(e.to_string()))?;
    let anchors = webpki::TlsClientTrustAnchors(std::slice::from_ref(&anchor));

    let end_entity = webpki::EndEntityCert::try_from(leaf.0.as_slice())
        .map_err(|e| CodecError::ChainRejected(e.to_string()))?;

    let intermediate_der: Vec<&[u8]> = intermediates.iter().map(|c| c.0.as_slice()).collect();

    let now = webpki::Time::try_from(SystemTime::now())
        .map_err(|e| CodecError::ChainRejected(e.to_string()))?;

    end_entity
        .verify_is_valid_tls_client_cert(
            webpki::ALL_SIGALGS,
            &anchors,
            &intermediate_der,
            now,
        )
        .map_err(|e| CodecError::ChainRejected(e.to_string()))?;

    let mut chain = Vec::with_capacity(expected_len);
    chain.push(leaf.clone());
    chain.extend(intermediates.iter().cloned());
    chain.push(root.clone());

    if chain.len() != expected_len {
        return Err(CodecError::ChainLengthMismatch {
            built: chain.len(),
            expected: expected_len,
        });
    }

    debug!(chain_len = chain.len(), "chain verified against local root");
    Ok(chain)
}

/// Proof-of-possession: does this certificate's public key match this
/// private key? Only RSA is supported.
pub fn key_match(cert: &Certificate, key: &crate::types::PrivateKey) -> Result<bool, CodecError> {
    let cert_spki = cert.public_key_der()?;
    let key_spki = key
        .public_key_der()
        .map_err(|_| CodecError::UnsupportedKeyAlgorithm)?;
    Ok(cert_spki == key_spki)
}

/// Write a certificate chain to disk as concatenated PEM blocks,
/// truncate-replacing any existing file.
pub fn write_chain(path: &Path, certs: &[Certificate]) -> Result<(), CodecError> {
    let pem = encode_pem(certs);
    std::fs::write(path, pem).map_err(|source| CodecError::Write {
        path: path.display().to_string(),
        source,
    })
}

/// Write a private key to disk as a PEM "PRIVATE KEY" block, mode 0600.
pub fn write_key(path: &Path, key: &crate::types::PrivateKey) -> Result<(), CodecError> {
    let der = key
        .to_pkcs8_der()
        .map_err(|_| CodecError::UnsupportedKeyAlgorithm)?;
    let pem = pem::encode(&pem::Pem::new(PRIVATE_KEY_TAG, der));
    std::fs::write(path, pem).map_err(|source| CodecError::Write {
        path: path.display().to_string(),
        source,
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(path).map_err(|source| CodecError::Write {
            path: path.display().to_string(),
            source,
        })?;
        let mut perms = metadata.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(path, perms).map_err(|source| CodecError::Write {
            path: path.display().to_string(),
            source,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrivateKey;
    use rcgen::{Certificate as RcgenCertificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
    use time::{Duration as TimeDuration, OffsetDateTime};

    #[test]
    fn decode_pem_empty_input_is_empty_sequence() {
        let certs = decode_pem(b"").unwrap();
        assert!(certs.is_empty());
    }

    #[test]
    fn decode_pem_rejects_non_certificate_block() {
        let pem_text = pem::encode(&pem::Pem::new(PRIVATE_KEY_TAG, vec![1, 2, 3]));
        let err = decode_pem(pem_text.as_bytes()).unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedBlockType { .. }));
    }

    #[test]
    fn round_trip_encode_decode() {
        let certs = vec![Certificate(vec![9, 8, 7]), Certificate(vec![1, 2, 3])];
        let encoded = encode_pem(&certs);
        let decoded = decode_pem(encoded.as_bytes()).unwrap();
        assert_eq!(certs, decoded);
    }

    /// Self-signed CA plus one leaf issued and signed by it, used by every
    /// test below that needs a chain that webpki will actually accept.
    fn generate_root_and_leaf(cn: &str) -> (Certificate, Certificate, PrivateKey) {
        let root_key = KeyPair::generate().expect("root key");
        let mut root_dn = DistinguishedName::new();
        root_dn.push(DnType::CommonName, "test-root");
        let mut root_params = CertificateParams::new(Vec::<String>::new()).expect("root params");
        root_params.distinguished_name = root_dn;
        root_params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        root_params.key_pair = Some(root_key);
        let not_before = OffsetDateTime::now_utc();
        root_params.not_before = not_before;
        root_params.not_after = not_before + TimeDuration::days(3650);
        let root = RcgenCertificate::generate_self_signed(root_params).expect("self-signed root");
        let root_der = root.serialize_der().expect("serialize root");

        let key = PrivateKey::generate_rsa2048(&mut rand::rngs::OsRng).expect("leaf key");
        let rcgen_key = key.to_rcgen_keypair().expect("leaf rcgen key");
        let mut leaf_dn = DistinguishedName::new();
        leaf_dn.push(DnType::CommonName, cn);
        let mut leaf_params = CertificateParams::new(Vec::<String>::new()).expect("leaf params");
        leaf_params.distinguished_name = leaf_dn;
        leaf_params.key_pair = Some(rcgen_key);
        leaf_params.is_ca = IsCa::NoCa;
        leaf_params.not_before = not_before;
        leaf_params.not_after = not_before + TimeDuration::days(30);
        let leaf = RcgenCertificate::generate(leaf_params, &root).expect("generate leaf");
        let leaf_der = leaf.serialize_der_with_signer(&root).expect("sign leaf");

        (Certificate(root_der), Certificate(leaf_der), key)
    }

    #[test]
    fn verify_chain_accepts_a_freshly_issued_leaf() {
        let (root, leaf, _key) = generate_root_and_leaf("node-a");
        let chain = verify_chain(&leaf, &[], &root).unwrap();
        assert_eq!(chain, vec![leaf, root]);
    }

    #[test]
    fn verify_chain_rejects_a_leaf_from_an_unrelated_root() {
        let (_own_root, leaf, _key) = generate_root_and_leaf("node-a");
        let (other_root, _other_leaf, _other_key) = generate_root_and_leaf("node-b");
        let err = verify_chain(&leaf, &[], &other_root).unwrap_err();
        assert!(matches!(err, CodecError::ChainRejected(_)));
    }

    #[test]
    fn verify_chain_rejects_intermediates_with_duplicate_subjects() {
        let (root, leaf, _key) = generate_root_and_leaf("node-a");
        let (_r1, dup1, _k1) = generate_root_and_leaf("shared-name");
        let (_r2, dup2, _k2) = generate_root_and_leaf("shared-name");
        let err = verify_chain(&leaf, &[dup1, dup2], &root).unwrap_err();
        assert!(matches!(err, CodecError::AmbiguousChain));
    }

    #[test]
    fn key_match_true_for_the_leafs_own_key_false_for_another() {
        let (_root, leaf, key) = generate_root_and_leaf("node-a");
        assert!(key_match(&leaf, &key).unwrap());

        let other_key = PrivateKey::generate_rsa2048(&mut rand::rngs::OsRng).unwrap();
        assert!(!key_match(&leaf, &other_key).unwrap());
    }
}
