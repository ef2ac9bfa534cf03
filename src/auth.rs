use crate::error::PmxError;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pss::BlindedSigningKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use sha2::Sha256;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Signed header set for one request.
///
/// Attach as `access-key`, `access-timestamp`, and `access-signature`.
/// Values are single-use: the exchange rejects stale timestamps, so headers
/// are rebuilt for every request rather than cached.
#[derive(Debug, Clone)]
pub struct PmxAuthHeaders {
    pub key: String,
    pub timestamp_ms: String,
    pub signature: String,
}

/// API credentials: key id plus RSA private key.
///
/// The exchange authenticates each request with an RSA-PSS (SHA-256)
/// signature over `timestamp + method + path`. Load your key with
/// [`PmxAuth::from_pem_file`] or [`PmxAuth::from_pem_str`]; both PKCS#8
/// (`BEGIN PRIVATE KEY`) and PKCS#1 (`BEGIN RSA PRIVATE KEY`) PEM blocks are
/// accepted, without a passphrase.
///
/// Cloning is cheap (the key is shared behind an `Arc`), so one `PmxAuth`
/// can back a REST client and a WebSocket client at the same time.
#[derive(Clone)]
pub struct PmxAuth {
    key_id: String,
    private_key: Arc<RsaPrivateKey>,
}

impl fmt::Debug for PmxAuth {
    // Key material stays out of logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PmxAuth")
            .field("key_id", &self.key_id)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl PmxAuth {
    /// Wrap an already-loaded private key.
    pub fn new(key_id: impl Into<String>, private_key: RsaPrivateKey) -> Self {
        Self {
            key_id: key_id.into(),
            private_key: Arc::new(private_key),
        }
    }

    /// Parse a PEM-encoded RSA private key (PKCS#8 or PKCS#1, no passphrase).
    pub fn from_pem_str(key_id: impl Into<String>, pem: &str) -> Result<Self, PmxError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| PmxError::Signing(format!("invalid private key PEM: {e}")))?;
        Ok(Self::new(key_id, private_key))
    }

    /// Read and parse a PEM key file from disk.
    pub fn from_pem_file(
        key_id: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> Result<Self, PmxError> {
        let path = path.as_ref();
        let pem = std::fs::read_to_string(path).map_err(|e| {
            PmxError::Signing(format!("cannot read key file {}: {e}", path.display()))
        })?;
        Self::from_pem_str(key_id, &pem)
    }

    /// Key identifier sent in the `access-key` header.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Sign one request at the current wall-clock time.
    ///
    /// `path` must exclude any query string; the server signs only
    /// method + path. Each call reads the clock anew, which keeps timestamps
    /// monotonically non-decreasing across requests from the same client.
    pub fn build_headers(&self, method: &str, path: &str) -> Result<PmxAuthHeaders, PmxError> {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| PmxError::Signing(format!("system clock before epoch: {e}")))?
            .as_millis() as u64;
        self.build_headers_at(method, path, timestamp_ms)
    }

    /// Sign with an explicit timestamp. Exposed for deterministic tests.
    pub fn build_headers_at(
        &self,
        method: &str,
        path: &str,
        timestamp_ms: u64,
    ) -> Result<PmxAuthHeaders, PmxError> {
        let timestamp_ms = timestamp_ms.to_string();
        let message = format!("{timestamp_ms}{method}{path}");

        let signing_key = BlindedSigningKey::<Sha256>::new(self.private_key.as_ref().clone());
        let signature = signing_key
            .try_sign_with_rng(&mut rand::thread_rng(), message.as_bytes())
            .map_err(|e| PmxError::Signing(format!("RSA-PSS signing failed: {e}")))?;

        Ok(PmxAuthHeaders {
            key: self.key_id.clone(),
            timestamp_ms,
            signature: BASE64.encode(signature.to_bytes()),
        })
    }
}
