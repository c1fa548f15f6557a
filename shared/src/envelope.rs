//! Optional encrypted envelope exchanged with upstream peers
//!
//! Wire shape: `{ "from": string, "cipher": base64, "sig": base64 }`, sent
//! either as JSON text or as base64 of that JSON. `cipher` decodes to
//! `iv(12) || ciphertext || tag(16)` under AES-256-GCM with
//! `key = SHA-256(master_key)`. `sig` is an RSA PKCS#1 v1.5 SHA-256 signature
//! over the decoded cipher block.
//!
//! Signature checking is lenient: an empty `sig`, or no configured peer
//! public key, is accepted as valid. That is a compatibility compromise with
//! existing peers, not an integrity guarantee; only the GCM tag authenticates
//! such frames.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{RelayError, Result};

/// AES-GCM nonce length
pub const IV_LEN: usize = 12;
/// AES-GCM authentication tag length
pub const TAG_LEN: usize = 16;

/// The encrypted wrapper as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub cipher: String,
    pub sig: String,
}

/// How an encoded envelope is framed as text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Json,
    Base64,
}

/// Key material for the envelope layer
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EnvelopeKeys {
    aes_key: [u8; 32],
    #[zeroize(skip)]
    peer_public: Option<RsaPublicKey>,
    #[zeroize(skip)]
    signing: Option<RsaPrivateKey>,
}

impl std::fmt::Debug for EnvelopeKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeKeys")
            .field("aes_key", &"<redacted>")
            .field("peer_public", &self.peer_public.is_some())
            .field("signing", &self.signing.is_some())
            .finish()
    }
}

impl EnvelopeKeys {
    /// Derive the AES key from the shared master secret
    pub fn new(master_key: &str) -> Self {
        let aes_key: [u8; 32] = Sha256::digest(master_key.as_bytes()).into();
        Self {
            aes_key,
            peer_public: None,
            signing: None,
        }
    }

    /// Build keys from optional config strings. A missing or blank master key
    /// means frames are plain JSON and yields `Ok(None)`.
    pub fn from_config(
        master_key: Option<&str>,
        signing_private_pem: Option<&str>,
        peer_public_pem: Option<&str>,
    ) -> Result<Option<Self>> {
        let master = match master_key {
            Some(m) if !m.trim().is_empty() => m,
            _ => return Ok(None),
        };
        let mut keys = EnvelopeKeys::new(master);
        if let Some(pem) = peer_public_pem.filter(|p| !p.trim().is_empty()) {
            keys = keys.with_peer_public_pem(pem)?;
        }
        if let Some(pem) = signing_private_pem.filter(|p| !p.trim().is_empty()) {
            keys = keys.with_signing_private_pem(pem)?;
        }
        Ok(Some(keys))
    }

    /// Accepts SPKI (`BEGIN PUBLIC KEY`) or PKCS#1 (`BEGIN RSA PUBLIC KEY`)
    pub fn with_peer_public_pem(mut self, pem: &str) -> Result<Self> {
        let pem = pem.trim();
        let key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| RelayError::InvalidKey(format!("peer public key: {e}")))?;
        self.peer_public = Some(key);
        Ok(self)
    }

    /// Accepts PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1 (`BEGIN RSA PRIVATE KEY`)
    pub fn with_signing_private_pem(mut self, pem: &str) -> Result<Self> {
        let pem = pem.trim();
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| RelayError::InvalidKey(format!("signing private key: {e}")))?;
        self.signing = Some(key);
        Ok(self)
    }

    pub fn with_peer_public_key(mut self, key: RsaPublicKey) -> Self {
        self.peer_public = Some(key);
        self
    }

    pub fn with_signing_key(mut self, key: RsaPrivateKey) -> Self {
        self.signing = Some(key);
        self
    }

    pub fn has_peer_public_key(&self) -> bool {
        self.peer_public.is_some()
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.aes_key))
    }

    /// Lenient verification: no signature or no peer key counts as valid.
    fn verify_block(&self, block: &[u8], sig: &[u8]) -> Result<()> {
        let Some(public_key) = &self.peer_public else {
            return Ok(());
        };
        if sig.is_empty() {
            return Ok(());
        }
        let signature = Signature::try_from(sig).map_err(|_| RelayError::InvalidSignature)?;
        VerifyingKey::<Sha256>::new(public_key.clone())
            .verify(block, &signature)
            .map_err(|_| RelayError::InvalidSignature)
    }

    fn sign_block(&self, block: &[u8]) -> Vec<u8> {
        match &self.signing {
            Some(private_key) => SigningKey::<Sha256>::new(private_key.clone())
                .sign(block)
                .to_vec(),
            None => Vec::new(),
        }
    }
}

/// Where a decoded value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeSource {
    /// No master key configured; text parsed as JSON
    Plain,
    /// Opened from an envelope found in the named framing
    Envelope(Framing),
    /// Keys configured but no candidate opened; raw text parsed as JSON
    Fallback,
}

/// Result of [`decode`], carrying the reasons any candidate was rejected
#[derive(Debug, Clone)]
pub struct Decoded {
    pub value: Option<Value>,
    pub source: DecodeSource,
    pub rejected: Vec<RelayError>,
}

/// Decoding strategy: text in, candidate value out
pub type Strategy = fn(&str) -> Option<Value>;

/// Framings tried, in order, when looking for an envelope
pub const ENVELOPE_FRAMINGS: [(Framing, Strategy); 2] = [
    (Framing::Json, parse_json),
    (Framing::Base64, parse_base64_json),
];

/// Applies `attempt` to each strategy in order and returns the first `Some`
pub fn first_success<S, T, F>(strategies: impl IntoIterator<Item = S>, attempt: F) -> Option<T>
where
    F: FnMut(S) -> Option<T>,
{
    strategies.into_iter().find_map(attempt)
}

pub fn parse_json(text: &str) -> Option<Value> {
    serde_json::from_str(text).ok()
}

pub fn parse_base64_json(text: &str) -> Option<Value> {
    let bytes = decode_b64(text.trim())?;
    let decoded = String::from_utf8(bytes).ok()?;
    parse_json(&decoded)
}

fn decode_b64(text: &str) -> Option<Vec<u8>> {
    STANDARD
        .decode(text)
        .or_else(|_| STANDARD_NO_PAD.decode(text.trim_end_matches('=')))
        .ok()
}

/// Interpret a JSON value as an envelope (all three fields must be strings)
pub fn as_envelope(value: &Value) -> Option<Envelope> {
    let obj = value.as_object()?;
    let field = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);
    Some(Envelope {
        from: field("from")?,
        cipher: field("cipher")?,
        sig: field("sig")?,
    })
}

/// Verify and decrypt one envelope into its inner JSON object
pub fn open_envelope(envelope: &Envelope, keys: &EnvelopeKeys) -> Result<Value> {
    let block = decode_b64(&envelope.cipher)
        .ok_or_else(|| RelayError::MalformedEnvelope("cipher is not base64".into()))?;
    if block.len() <= IV_LEN + TAG_LEN {
        return Err(RelayError::MalformedEnvelope(format!(
            "cipher block too short: {} bytes",
            block.len()
        )));
    }

    let sig = if envelope.sig.is_empty() {
        Vec::new()
    } else {
        decode_b64(&envelope.sig)
            .ok_or_else(|| RelayError::MalformedEnvelope("sig is not base64".into()))?
    };
    keys.verify_block(&block, &sig)?;

    let (iv, sealed) = block.split_at(IV_LEN);
    let plain = keys
        .cipher()
        .decrypt(Nonce::from_slice(iv), sealed)
        .map_err(|e| RelayError::EncryptionError(e.to_string()))?;

    let inner: Value = serde_json::from_slice(&plain)?;
    if !inner.is_object() {
        return Err(RelayError::MalformedEnvelope("inner payload is not an object".into()));
    }
    Ok(inner)
}

/// Decode a frame received from an upstream hub.
///
/// Without keys the text is parsed as plain JSON. With keys, each framing in
/// [`ENVELOPE_FRAMINGS`] is tried and the first envelope that verifies and
/// decrypts wins; if none does, the raw text is parsed as plain JSON so a
/// foreign or corrupted frame never fails the read path.
pub fn decode(raw: &str, keys: Option<&EnvelopeKeys>) -> Decoded {
    let Some(keys) = keys else {
        return Decoded {
            value: parse_json(raw),
            source: DecodeSource::Plain,
            rejected: Vec::new(),
        };
    };

    let mut rejected = Vec::new();
    let opened = first_success(ENVELOPE_FRAMINGS, |(framing, strategy)| {
        let envelope = strategy(raw).as_ref().and_then(as_envelope)?;
        match open_envelope(&envelope, keys) {
            Ok(inner) => Some((inner, framing)),
            Err(err) => {
                rejected.push(err);
                None
            }
        }
    });

    match opened {
        Some((inner, framing)) => Decoded {
            value: Some(inner),
            source: DecodeSource::Envelope(framing),
            rejected,
        },
        None => Decoded {
            value: parse_json(raw),
            source: DecodeSource::Fallback,
            rejected,
        },
    }
}

/// Convenience wrapper over [`decode`] returning only the value
pub fn decode_server_payload(raw: &str, keys: Option<&EnvelopeKeys>) -> Option<Value> {
    decode(raw, keys).value
}

/// Seal `inner` into an envelope with a fresh random IV, signing the cipher
/// block when a signing key is configured.
pub fn seal_envelope(from: &str, inner: &Value, keys: &EnvelopeKeys) -> Result<Envelope> {
    let plain = serde_json::to_vec(inner)?;
    let iv: [u8; IV_LEN] = rand::random();
    let sealed = keys
        .cipher()
        .encrypt(Nonce::from_slice(&iv), plain.as_slice())
        .map_err(|e| RelayError::EncryptionError(e.to_string()))?;

    let mut block = Vec::with_capacity(IV_LEN + sealed.len());
    block.extend_from_slice(&iv);
    block.extend_from_slice(&sealed);

    let sig = keys.sign_block(&block);
    Ok(Envelope {
        from: from.to_string(),
        cipher: STANDARD.encode(&block),
        sig: STANDARD.encode(sig),
    })
}

/// Seal and frame as text ready for a WebSocket text frame
pub fn encode_envelope(
    from: &str,
    inner: &Value,
    keys: &EnvelopeKeys,
    framing: Framing,
) -> Result<String> {
    let envelope = seal_envelope(from, inner, keys)?;
    let json = serde_json::to_string(&envelope)?;
    Ok(match framing {
        Framing::Json => json,
        Framing::Base64 => STANDARD.encode(json),
    })
}
