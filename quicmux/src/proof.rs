//! Handshake proof signing and verification.
//!
//! An engine asks the shard to sign its server config (and, on newer
//! versions, the client hello hash) with the server's private key. A client
//! checks that signature with a [`ProofVerifier`] holding the server's
//! public key. Signers
//! are registered once at startup in a [`SignerRegistry`], the one handle
//! table that is read from outside a shard: `request_proof` signs on the
//! tokio blocking pool and posts the result back to the shard's proof queue.

use crate::handle_table::{Handle, SharedHandleTable};
use crate::telemetry::{record_metric, MetricsEvent, MetricsTimer};
use boring::hash::MessageDigest;
use boring::pkey::{HasPublic, Id, PKey, Private, Public};
use boring::rsa::Padding;
use boring::sign::{RsaPssSaltlen, Signer, Verifier};
use boring::x509::X509;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Label for versions that bind the client hello hash into the proof.
pub const PROOF_LABEL_CHLO: &[u8] = b"QUIC CHLO and server config signature\0";
/// Label for older versions.
pub const PROOF_LABEL_LEGACY: &[u8] = b"QUIC server config signature\0";
/// Last version that uses [`PROOF_LABEL_LEGACY`].
pub const LAST_LEGACY_PROOF_VERSION: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProofError {
    #[error("no proof signer configured")]
    Insecure,

    #[error("unsupported private key type {0}")]
    UnsupportedKey(i32),

    #[error("signer {0} is not registered")]
    UnknownSigner(Handle),

    #[error("signing failed: {0}")]
    Crypto(String),

    #[error("proof signature does not match the server key")]
    BadSignature,
}

impl From<boring::error::ErrorStack> for ProofError {
    fn from(e: boring::error::ErrorStack) -> Self {
        ProofError::Crypto(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProofError>;

/// Produces proof signatures over engine-supplied bytes.
pub trait ProofSigner: Send + Sync {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>>;
}

pub type SignerRegistry = SharedHandleTable<Arc<dyn ProofSigner>>;

/// Bytes an engine signs for a proof.
pub fn proof_payload(quic_version: u32, server_config: &[u8], chlo_hash: &[u8]) -> Vec<u8> {
    if quic_version > LAST_LEGACY_PROOF_VERSION {
        let mut payload =
            Vec::with_capacity(PROOF_LABEL_CHLO.len() + 4 + chlo_hash.len() + server_config.len());
        payload.extend_from_slice(PROOF_LABEL_CHLO);
        payload.extend_from_slice(&(chlo_hash.len() as u32).to_le_bytes());
        payload.extend_from_slice(chlo_hash);
        payload.extend_from_slice(server_config);
        payload
    } else {
        let mut payload = Vec::with_capacity(PROOF_LABEL_LEGACY.len() + server_config.len());
        payload.extend_from_slice(PROOF_LABEL_LEGACY);
        payload.extend_from_slice(server_config);
        payload
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyKind {
    Rsa,
    Ecdsa,
}

fn key_kind(id: Id) -> Result<KeyKind> {
    if id == Id::RSA {
        Ok(KeyKind::Rsa)
    } else if id == Id::EC {
        Ok(KeyKind::Ecdsa)
    } else {
        Err(ProofError::UnsupportedKey(id.as_raw()))
    }
}

/// SHA-256 signer over an RSA (PSS) or ECDSA private key.
pub struct ProofSource {
    key: PKey<Private>,
    kind: KeyKind,
}

impl ProofSource {
    pub fn from_key(key: PKey<Private>) -> Result<Self> {
        let kind = key_kind(key.id())?;
        Ok(Self { key, kind })
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        Self::from_key(PKey::private_key_from_pem(pem)?)
    }

    pub fn from_pem_file(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let pem = std::fs::read(path)
            .with_context(|| format!("reading private key {}", path.display()))?;
        Self::from_pem(&pem).with_context(|| format!("loading private key {}", path.display()))
    }
}

impl ProofSigner for ProofSource {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.key)?;
        if self.kind == KeyKind::Rsa {
            signer.set_rsa_padding(Padding::PKCS1_PSS)?;
            signer.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
        }
        signer.update(payload)?;
        Ok(signer.sign_to_vec()?)
    }
}

impl std::fmt::Debug for ProofSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofSource").field("kind", &self.kind).finish()
    }
}

/// Checks proof signatures against a pinned server public key.
///
/// Certificate chains are not walked: whoever configures the verifier
/// decides which key to trust.
pub struct ProofVerifier {
    key: PKey<Public>,
    kind: KeyKind,
}

impl ProofVerifier {
    pub fn from_key<T: HasPublic>(key: &PKey<T>) -> Result<Self> {
        let kind = key_kind(key.id())?;
        let key = PKey::public_key_from_der(&key.public_key_to_der()?)?;
        Ok(Self { key, kind })
    }

    /// Accepts a PEM public key or a PEM certificate.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        match X509::from_pem(pem) {
            Ok(cert) => Self::from_key(&cert.public_key()?),
            Err(_) => Self::from_key(&PKey::public_key_from_pem(pem)?),
        }
    }

    pub fn from_pem_file(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let pem = std::fs::read(path)
            .with_context(|| format!("reading server key {}", path.display()))?;
        Self::from_pem(&pem).with_context(|| format!("loading server key {}", path.display()))
    }

    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<()> {
        let mut verifier = Verifier::new(MessageDigest::sha256(), &self.key)?;
        if self.kind == KeyKind::Rsa {
            verifier.set_rsa_padding(Padding::PKCS1_PSS)?;
            verifier.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
        }
        verifier.update(payload)?;
        // Malformed signatures surface as an error stack rather than `false`.
        match verifier.verify(signature) {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(ProofError::BadSignature),
        }
    }

    /// Rebuild the signed payload and check `signature` over it.
    pub fn verify_proof(
        &self,
        quic_version: u32,
        server_config: &[u8],
        chlo_hash: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        self.verify(&proof_payload(quic_version, server_config, chlo_hash), signature)
    }
}

impl std::fmt::Debug for ProofVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofVerifier").field("kind", &self.kind).finish()
    }
}

/// Result of an asynchronous proof request.
#[derive(Debug, Clone)]
pub struct ProofCompletion {
    pub request_id: u64,
    pub result: Result<Vec<u8>>,
}

fn sign_with(registry: &SignerRegistry, signer: Option<Handle>, payload: &[u8]) -> Result<Vec<u8>> {
    let handle = signer.ok_or(ProofError::Insecure)?;
    let signer = registry
        .get(handle)
        .map_err(|_| ProofError::UnknownSigner(handle))?;

    let timer = MetricsTimer::start();
    match signer.sign(payload) {
        Ok(signature) => {
            record_metric(MetricsEvent::ProofSigned {
                duration_us: timer.elapsed_us(),
            });
            Ok(signature)
        }
        Err(e) => {
            record_metric(MetricsEvent::ProofFailed);
            Err(e)
        }
    }
}

/// A shard's access to its proof signer.
pub struct ProofService {
    registry: SignerRegistry,
    signer: Option<Handle>,
    completions: mpsc::Sender<ProofCompletion>,
    runtime: Option<tokio::runtime::Handle>,
    next_request: u64,
}

impl ProofService {
    /// `signer` is `None` for an insecure server. Without a `runtime`,
    /// asynchronous requests are signed inline.
    pub fn new(
        registry: SignerRegistry,
        signer: Option<Handle>,
        completions: mpsc::Sender<ProofCompletion>,
        runtime: Option<tokio::runtime::Handle>,
    ) -> Self {
        Self {
            registry,
            signer,
            completions,
            runtime,
            next_request: 1,
        }
    }

    pub fn is_secure(&self) -> bool {
        self.signer.is_some()
    }

    /// Sign on the calling thread.
    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        sign_with(&self.registry, self.signer, payload)
    }

    /// Sign off the shard thread. The result arrives as a
    /// [`ProofCompletion`] carrying the returned request id.
    pub fn request(&mut self, payload: Vec<u8>) -> u64 {
        let request_id = self.next_request;
        self.next_request += 1;

        let registry = self.registry.clone();
        let signer = self.signer;
        let completions = self.completions.clone();

        match &self.runtime {
            Some(runtime) => {
                runtime.spawn_blocking(move || {
                    let result = sign_with(&registry, signer, &payload);
                    if completions
                        .blocking_send(ProofCompletion { request_id, result })
                        .is_err()
                    {
                        debug!(request_id, "Proof completion dropped, shard gone");
                    }
                });
            }
            None => {
                let result = sign_with(&registry, signer, &payload);
                if let Err(e) = completions.try_send(ProofCompletion { request_id, result }) {
                    warn!(request_id, error = %e, "Proof completion queue rejected result");
                }
            }
        }
        request_id
    }
}

impl std::fmt::Debug for ProofService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofService")
            .field("signer", &self.signer)
            .field("async", &self.runtime.is_some())
            .finish()
    }
}
