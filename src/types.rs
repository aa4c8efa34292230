//! Core domain types shared by the node agent and the authority: credential
//! roles, the private-key tagged variant, certificates, and the serial
//! number newtype.

use crate::error::{CodecError, CryptoError};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;

/// Common Name of a node, used as both the MQTT topic segment and the
/// certificate subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct NodeName(pub String);

impl NodeName {
    /// The Common Name shared by every unbootstrapped device.
    pub const UNPROVISIONED: &'static str = "unprovisioned";

    /// True if this is the shared provisioning identity, not a per-device one.
    pub fn is_provisioning(&self) -> bool {
        self.0 == Self::UNPROVISIONED
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::ops::Deref for NodeName {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

/// A private key. Closed to RSA for now (per REDESIGN FLAG in the node
/// re-architecture notes): the source kept an untyped "any key" field tested
/// for RSA at runtime, which this tagged variant replaces with a named,
/// checkable policy.
#[derive(Clone)]
pub enum PrivateKey {
    /// RSA private key, PKCS#8.
    Rsa(rsa::RsaPrivateKey),
}

impl PrivateKey {
    /// Generate a fresh RSA-2048 key, the only algorithm the protocol issues
    /// CSRs with (§4.3).
    pub fn generate_rsa2048<R: rand::CryptoRng + rand::RngCore>(
        rng: &mut R,
    ) -> Result<Self, CryptoError> {
        let key = rsa::RsaPrivateKey::new(rng, 2048)
            .map_err(|e| CryptoError::RsaKeyGen(e.to_string()))?;
        Ok(Self::Rsa(key))
    }

    /// PKCS#8 DER encoding, the form `rcgen::KeyPair::from_der` accepts.
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, CryptoError> {
        use rsa::pkcs8::EncodePrivateKey;
        let PrivateKey::Rsa(key) = self;
        key.to_pkcs8_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| CryptoError::RsaEncoding(e.to_string()))
    }

    /// PEM "PRIVATE KEY" encoding for on-disk storage (§6).
    pub fn to_pkcs8_pem(&self) -> Result<String, CryptoError> {
        use rsa::pkcs8::EncodePrivateKey;
        let PrivateKey::Rsa(key) = self;
        key.to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .map(|zstr| zstr.to_string())
            .map_err(|e| CryptoError::RsaEncoding(e.to_string()))
    }

    /// Load an RSA private key from a PEM "PRIVATE KEY" block, the inverse
    /// of [`PrivateKey::to_pkcs8_pem`]. Used to load the provisioning key
    /// and a previously installed node key from disk at startup.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, CryptoError> {
        use rsa::pkcs8::DecodePrivateKey;
        rsa::RsaPrivateKey::from_pkcs8_pem(pem)
            .map(Self::Rsa)
            .map_err(|e| CryptoError::RsaEncoding(e.to_string()))
    }

    /// Convert into an `rcgen` keypair for CSR/certificate construction.
    pub fn to_rcgen_keypair(&self) -> Result<rcgen::KeyPair, CryptoError> {
        let der = self.to_pkcs8_der()?;
        rcgen::KeyPair::from_der(&der).map_err(CryptoError::CertGen)
    }

    /// DER encoding of the public half, used by `key_match`.
    pub fn public_key_der(&self) -> Result<Vec<u8>, CryptoError> {
        use rsa::pkcs8::EncodePublicKey;
        let PrivateKey::Rsa(key) = self;
        key.to_public_key()
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| CryptoError::RsaEncoding(e.to_string()))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey::Rsa(<redacted>)")
    }
}

/// A single X.509 certificate, held as DER bytes. Subject, validity, and
/// public key are parsed on demand with `x509-parser` rather than cached,
/// since the parsed view borrows from the DER it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate(pub Vec<u8>);

impl Certificate {
    /// Parse a throwaway view for field access. Kept private: callers use
    /// the accessor methods below instead of holding onto the parsed form.
    fn parsed(&self) -> Result<x509_parser::certificate::X509Certificate<'_>, CodecError> {
        let (_, cert) = x509_parser::parse_x509_certificate(&self.0)
            .map_err(|e| CodecError::X509(e.to_string()))?;
        Ok(cert)
    }

    /// Subject Common Name, e.g. the node name or `"unprovisioned"`.
    pub fn common_name(&self) -> Result<String, CodecError> {
        let cert = self.parsed()?;
        cert.subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| CodecError::X509("certificate has no CommonName".to_string()))
    }

    /// `not_after`, used by the renewal scheduler (§4.6).
    pub fn not_after(&self) -> Result<DateTime<Utc>, CodecError> {
        let cert = self.parsed()?;
        DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .ok_or_else(|| CodecError::X509("not_after out of range".to_string()))
    }

    /// `not_before`, used to compute total validity for the safety margin (R5).
    pub fn not_before(&self) -> Result<DateTime<Utc>, CodecError> {
        let cert = self.parsed()?;
        DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
            .ok_or_else(|| CodecError::X509("not_before out of range".to_string()))
    }

    /// Serial number as decimal string, for display (`cert-show`).
    pub fn serial_display(&self) -> Result<String, CodecError> {
        let cert = self.parsed()?;
        Ok(cert.raw_serial_as_string())
    }

    /// DER encoding of the subject public key, for `key_match`.
    pub fn public_key_der(&self) -> Result<Vec<u8>, CodecError> {
        let cert = self.parsed()?;
        Ok(cert.public_key().raw.to_vec())
    }
}

/// Certificate chain plus the private key for its leaf: `(chain, key)`, the
/// credential shape named in §3.
pub struct Credential {
    /// `[leaf, intermediates...]`, leaf first.
    pub chain: Vec<Certificate>,
    /// Private key matching the leaf's public key.
    pub key: PrivateKey,
}

impl Credential {
    /// The leaf certificate: the credential's own identity.
    pub fn leaf(&self) -> &Certificate {
        &self.chain[0]
    }

    /// Convenience: the leaf's Common Name.
    pub fn common_name(&self) -> Result<String, CodecError> {
        self.leaf().common_name()
    }

    /// True when this credential's validity window has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> Result<bool, CodecError> {
        Ok(self.leaf().not_after()? <= now)
    }
}

/// A CSR published but not yet answered: the private key that produced it,
/// staged until a matching certificate arrives or a newer renewal supersedes
/// it (I2).
#[derive(Clone)]
pub struct PendingCsrKey {
    /// The key whose public half is bound into the outstanding CSR.
    pub key: PrivateKey,
    /// DER-encoded CSR, re-publishable if the broker connection resets.
    pub csr_der: Vec<u8>,
}

/// Monotonically increasing certificate serial number (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SerialNumber(pub u64);

impl SerialNumber {
    /// The value assigned to the very first certificate this authority issues.
    pub const FIRST: SerialNumber = SerialNumber(1);

    /// Little-endian 8-byte on-disk encoding (§6).
    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Decode the on-disk form; callers treat a parse failure as "absent"
    /// per §4.2, not as a hard error.
    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }

    /// The next serial after this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// On-disk paths for a node's active identity (§6).
#[derive(Debug, Clone)]
pub struct NodeCredentialPaths {
    /// `<datadir>/node.cert.pem`
    pub cert: PathBuf,
    /// `<datadir>/node.key.pem`
    pub key: PathBuf,
}

/// A device status-description record, published retained on
/// `joonos/<cn>/status/description` (§4.5/§10.5).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SysDesc {
    /// `uname -s`-style kernel name.
    pub kernel: String,
    /// `uname -r`.
    pub kernel_release: String,
    /// `/etc/os-release` `PRETTY_NAME`, when readable.
    pub os_pretty_name: Option<String>,
    /// `uname -m`.
    pub arch: String,
    /// Total memory in kilobytes, from `/proc/meminfo`.
    pub mem_total_kb: Option<u64>,
}

/// A periodic device status record, published (not retained) on
/// `joonos/<cn>/status/stat` (§4.5/§4.7).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SysStat {
    /// 1-minute load average, from `/proc/loadavg`.
    pub load1: Option<f32>,
    /// Free memory in kilobytes, from `/proc/meminfo`.
    pub mem_free_kb: Option<u64>,
    /// Timestamp this sample was taken.
    pub sampled_at: DateTime<Utc>,
}

/// Upgrade command payload received on `joonos/<cn>/upgrade` (§4.9/§6).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UpgradeCommand {
    /// Where to fetch the upgrade image.
    pub url: String,
    /// Expected sha256 hex digest of the image body, checked before piping (R4).
    #[serde(default)]
    pub sha256sum: Option<String>,
    /// If non-empty, only these node names act on the command.
    #[serde(default)]
    pub nodes: Vec<String>,
}
