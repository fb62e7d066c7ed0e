//! Node identity and the Ed25519 signer/verifier pair (`spec.md` §4.5).
//!
//! On first run a node mints an Ed25519 key-pair and a self-signed
//! certificate whose common name is the node's identifier; the cert's
//! embedded public key is that same Ed25519 key, so a peer fetching the
//! certificate via `GET /whois/{id}` can verify actions signed by it
//! without a separate key-distribution step.

pub mod cert;

use base64::Engine;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::PropolisError;

/// Keys and certificate minted for one node. `handle`/`bio` are free-form
/// metadata the data model names but the core never interprets.
pub struct NodeIdentity {
    pub node_id: String,
    pub signing_key: SigningKey,
    pub cert_der: Vec<u8>,
    pub handle: Option<String>,
    pub bio: Option<String>,
}

impl NodeIdentity {
    /// Generates a fresh key-pair and mints the accompanying self-signed
    /// certificate. Callers persist `cert_der` and the signing key bytes
    /// (`signing_key.to_bytes()`) so subsequent runs can reload via
    /// [`NodeIdentity::from_parts`].
    pub fn generate(node_id: impl Into<String>) -> anyhow::Result<Self> {
        let node_id = node_id.into();
        let signing_key = SigningKey::generate(&mut OsRng);
        let cert_der = mint_self_signed_cert(&node_id, &signing_key)?;
        Ok(Self { node_id, signing_key, cert_der, handle: None, bio: None })
    }

    /// Reconstructs a node's identity from previously persisted bytes.
    pub fn from_parts(node_id: impl Into<String>, signing_key_bytes: [u8; 32], cert_der: Vec<u8>) -> Self {
        Self {
            node_id: node_id.into(),
            signing_key: SigningKey::from_bytes(&signing_key_bytes),
            cert_der,
            handle: None,
            bio: None,
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn signer(&self) -> Signer<'_> {
        Signer { key: &self.signing_key, buf: Vec::new() }
    }
}

fn mint_self_signed_cert(node_id: &str, signing_key: &SigningKey) -> anyhow::Result<Vec<u8>> {
    let pkcs8 = signing_key.to_pkcs8_der()?;
    let key_pair = rcgen::KeyPair::from_der(pkcs8.as_bytes())?;

    let mut params = rcgen::CertificateParams::new(vec![node_id.to_string()])?;
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, node_id);
    params.distinguished_name = dn;

    let cert = params.self_signed(&key_pair)?;
    Ok(cert.der().to_vec())
}

/// Accumulates bytes, then produces a base64 Ed25519 signature over them.
pub struct Signer<'a> {
    key: &'a SigningKey,
    buf: Vec<u8>,
}

impl<'a> Signer<'a> {
    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn finalize(self) -> String {
        let sig: Signature = self.key.sign(&self.buf);
        base64::engine::general_purpose::STANDARD.encode(sig.to_bytes())
    }
}

/// Accumulates bytes, then verifies them against a signature and a known
/// (already-resolved) verifying key.
pub struct Verifier {
    key: VerifyingKey,
    buf: Vec<u8>,
}

impl Verifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self { key, buf: Vec::new() }
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn finalize(self, signature_b64: &str) -> Result<(), PropolisError> {
        let sig_bytes = base64::engine::general_purpose::STANDARD
            .decode(signature_b64)
            .map_err(|_| PropolisError::BadSignature)?;
        let sig = Signature::from_slice(&sig_bytes).map_err(|_| PropolisError::BadSignature)?;
        self.key.verify(&self.buf, &sig).map_err(|_| PropolisError::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let identity = NodeIdentity::generate("node-a").unwrap();
        let mut signer = identity.signer();
        signer.update(b"hello ").update(b"world");
        let sig = signer.finalize();

        let mut verifier = Verifier::new(identity.verifying_key());
        verifier.update(b"hello ").update(b"world");
        assert!(verifier.finalize(&sig).is_ok());
    }

    #[test]
    fn tampered_body_fails_verification() {
        let identity = NodeIdentity::generate("node-a").unwrap();
        let mut signer = identity.signer();
        signer.update(b"original");
        let sig = signer.finalize();

        let mut verifier = Verifier::new(identity.verifying_key());
        verifier.update(b"tampered");
        assert!(matches!(verifier.finalize(&sig), Err(PropolisError::BadSignature)));
    }

    #[test]
    fn cert_embeds_matching_public_key() {
        let identity = NodeIdentity::generate("node-a").unwrap();
        let recovered = cert::extract_verifying_key(&identity.cert_der).unwrap();
        assert_eq!(recovered, identity.verifying_key());
    }
}
