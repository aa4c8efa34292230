//! CSR producer (§4.3, node side): generates a fresh RSA-2048 keypair and a
//! CSR bound to the node's Common Name. Stateless except for the key and
//! CSR bytes it hands back to the caller; the caller stashes them into
//! `pending_csr_key` (I2).

use crate::error::CryptoError;
use crate::types::{NodeName, PrivateKey};
use rcgen::{CertificateParams, DistinguishedName, DnType};
use tracing::info;

/// Result of a CSR-generation attempt: the private key and the DER-encoded
/// CSR built from it.
pub struct GeneratedCsr {
    /// Freshly generated RSA-2048 key; the caller owns its lifetime.
    pub key: PrivateKey,
    /// DER-encoded PKCS#10 CSR, ready to publish on `joonos/<cn>/csr`.
    pub csr_der: Vec<u8>,
}

/// Generate a fresh keypair and a CSR with `Subject.CommonName = node_name`.
/// No SANs, no extensions beyond what `rcgen` adds by default. On failure,
/// nothing is returned and no state is mutated by the caller.
pub fn generate(node_name: &NodeName) -> Result<GeneratedCsr, CryptoError> {
    let mut rng = rand::rngs::OsRng;
    let key = PrivateKey::generate_rsa2048(&mut rng)?;
    let rcgen_key = key.to_rcgen_keypair()?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, node_name.0.clone());

    let mut params = CertificateParams::new(Vec::<String>::new()).map_err(CryptoError::CertGen)?;
    params.distinguished_name = dn;

    let csr_der = params
        .serialize_request(&rcgen_key)
        .map_err(CryptoError::CertGen)?
        .der()
        .to_vec();

    info!(node_name = %node_name, "generated CSR");
    Ok(GeneratedCsr { key, csr_der })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_csr_is_nonempty_der() {
        let name = NodeName("node-under-test".to_string());
        let generated = generate(&name).unwrap();
        assert!(!generated.csr_der.is_empty());
        assert!(generated.key.public_key_der().is_ok());
    }
}
