//! Error types, one concrete sum type per subsystem (config, codec, crypto,
//! transport, protocol), composed into a single top-level [`Error`].

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error, one variant per subsystem.
#[derive(Error, Debug)]
pub enum Error {
    /// Config-file / CLI / on-disk-path errors.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// PEM/DER codec and chain-verification errors.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Key generation, signing, and CSR errors.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// MQTT broker / transport errors.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Protocol-level rejects: wrong CN, wrong key, no pending CSR, etc.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Configuration and on-disk path errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("no active credential at startup and provisioning credential is also missing")]
    NoCredentialAvailable,
}

/// PEM/DER decode and certificate-chain verification errors.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("PEM block has unexpected type {found}, expected CERTIFICATE")]
    UnexpectedBlockType { found: String },

    #[error("PEM parse error: {0}")]
    Pem(#[from] pem::PemError),

    #[error("expected exactly one PEM block, found {0}")]
    NotExactlyOne(usize),

    #[error("X.509 parse error: {0}")]
    X509(String),

    #[error("chain length mismatch: built {built}, expected {expected}")]
    ChainLengthMismatch { built: usize, expected: usize },

    #[error("chain verification rejected by platform verifier: {0}")]
    ChainRejected(String),

    #[error("ambiguous trust chain: more than one candidate path found")]
    AmbiguousChain,

    #[error("key-match failed: certificate public key does not match the supplied private key")]
    KeyMismatch,

    #[error("only RSA keys are supported")]
    UnsupportedKeyAlgorithm,

    #[error("I/O error writing {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Key generation, CSR construction, and signing errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("RSA key generation failed: {0}")]
    RsaKeyGen(String),

    #[error("certificate/CSR generation failed: {0}")]
    CertGen(#[from] rcgen::Error),

    #[error("RSA key encoding error: {0}")]
    RsaEncoding(String),
}

/// MQTT broker / transport errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("supervisor channel closed unexpectedly")]
    ChannelClosed,
}

/// Protocol-level rejections.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("received certificate but no pending CSR key is staged")]
    NoPendingKey,

    #[error("CSR subject CommonName {csr_cn} does not match sender {sender}")]
    SenderMismatch { csr_cn: String, sender: String },

    #[error("malformed topic: {0}")]
    MalformedTopic(String),

    #[error("malformed upgrade command payload: {0}")]
    MalformedUpgradeCommand(String),

    #[error("downloaded upgrade image failed sha256 verification")]
    UpgradeChecksumMismatch,

    #[error("upgrade image size mismatch: piped {piped}, expected {expected}")]
    UpgradeSizeMismatch { piped: u64, expected: u64 },
}
