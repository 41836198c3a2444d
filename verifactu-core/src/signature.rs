//! XAdES baseline signatures over XML documents.
//!
//! Signing runs in two phases so the private key can live outside the
//! process: [`CanonicalSigner::compute_digest`] assembles the signature
//! skeleton and returns the canonical `SignedInfo` bytes, and
//! [`CanonicalSigner::finalize`] rebuilds the same skeleton and embeds the
//! signature value produced elsewhere. [`CanonicalSigner::sign`] runs both
//! phases around a local [`SigningCapability`].

mod constants;
pub mod key;
pub mod policy;
pub mod verify;
mod xml;

use std::fmt;
use std::str::FromStr;

use base64ct::{Base64, Encoding};
use chrono::{DateTime, SubsecRound, Utc};
use libxml::tree::c14n;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use constants::{
    C14N_11, C14N_EXCLUSIVE, C14N_INCLUSIVE, DIGEST_SHA1, DIGEST_SHA256, DIGEST_SHA384,
    DIGEST_SHA512, ECDSA_SHA1, ECDSA_SHA256, ECDSA_SHA384, ECDSA_SHA512, RSA_SHA1, RSA_SHA256,
    RSA_SHA384, RSA_SHA512,
};
use xml::SignatureAssembly;

pub use key::{
    CertificateChain, KeyMaterialProvider, KeyRing, LocalSigner, PrivateKey, SigningCapability,
};
pub use policy::{PolicyDescriptor, PolicyError, SignaturePolicy, bind};
pub use verify::{VerificationReport, VerifiedReference, verify};

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("document '{name}' is not well-formed XML: {message}")]
    DocumentParse { name: String, message: String },
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("no signing key available")]
    NoSigningKey,
    #[error("key material error: {0}")]
    KeyMaterial(String),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("XML processing error: {0}")]
    Xml(String),
    #[error("signature creation failed: {0}")]
    Signing(String),
    #[error("digest mismatch for reference '{uri}'")]
    DigestMismatch { uri: String },
    #[error("transform '{transform}' does not match canonicalization method '{method}'")]
    CanonicalizationMismatch { method: String, transform: String },
    #[error("signature verification failed: {0}")]
    Verification(String),
}

/// How the signature relates to the signed payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Packaging {
    /// Signature appended inside the payload root.
    #[default]
    Enveloped,
    /// Payload moved into a `ds:Object` of the signature.
    Enveloping,
    /// Standalone signature referencing the payload by name.
    Detached,
}

impl Packaging {
    pub fn as_str(&self) -> &'static str {
        match self {
            Packaging::Enveloped => "enveloped",
            Packaging::Enveloping => "enveloping",
            Packaging::Detached => "detached",
        }
    }
}

impl fmt::Display for Packaging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Packaging {
    type Err = SigningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enveloped" => Ok(Packaging::Enveloped),
            "enveloping" => Ok(Packaging::Enveloping),
            "detached" => Ok(Packaging::Detached),
            other => Err(SigningError::UnsupportedAlgorithm(format!(
                "packaging '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha1,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub(crate) const ALL: [DigestAlgorithm; 4] = [
        DigestAlgorithm::Sha1,
        DigestAlgorithm::Sha256,
        DigestAlgorithm::Sha384,
        DigestAlgorithm::Sha512,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "SHA-1",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha384 => "SHA-384",
            DigestAlgorithm::Sha512 => "SHA-512",
        }
    }

    /// XML-DSig `DigestMethod` identifier.
    pub fn uri(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => DIGEST_SHA1,
            DigestAlgorithm::Sha256 => DIGEST_SHA256,
            DigestAlgorithm::Sha384 => DIGEST_SHA384,
            DigestAlgorithm::Sha512 => DIGEST_SHA512,
        }
    }

    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            DigestAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            DigestAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts `SHA-256`, `sha256`, `SHA_256` and the `DigestMethod` URIs.
impl FromStr for DigestAlgorithm {
    type Err = SigningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let normalized: String = trimmed
            .chars()
            .filter(|c| !matches!(c, '-' | '_'))
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "sha1" => Ok(DigestAlgorithm::Sha1),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha384" => Ok(DigestAlgorithm::Sha384),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            _ => match trimmed {
                DIGEST_SHA1 => Ok(DigestAlgorithm::Sha1),
                DIGEST_SHA256 => Ok(DigestAlgorithm::Sha256),
                DIGEST_SHA384 => Ok(DigestAlgorithm::Sha384),
                DIGEST_SHA512 => Ok(DigestAlgorithm::Sha512),
                other => Err(SigningError::UnsupportedAlgorithm(format!(
                    "digest '{other}'"
                ))),
            },
        }
    }
}

/// Public key algorithm of the signing certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    /// RSA with PKCS#1 v1.5 padding.
    Rsa,
    /// ECDSA over secp256k1.
    Ecdsa,
}

impl KeyAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Rsa => "RSA",
            KeyAlgorithm::Ecdsa => "ECDSA",
        }
    }

    /// `SignatureMethod` identifier for this key type with `digest`.
    pub fn signature_method_uri(&self, digest: DigestAlgorithm) -> &'static str {
        match (self, digest) {
            (KeyAlgorithm::Rsa, DigestAlgorithm::Sha1) => RSA_SHA1,
            (KeyAlgorithm::Rsa, DigestAlgorithm::Sha256) => RSA_SHA256,
            (KeyAlgorithm::Rsa, DigestAlgorithm::Sha384) => RSA_SHA384,
            (KeyAlgorithm::Rsa, DigestAlgorithm::Sha512) => RSA_SHA512,
            (KeyAlgorithm::Ecdsa, DigestAlgorithm::Sha1) => ECDSA_SHA1,
            (KeyAlgorithm::Ecdsa, DigestAlgorithm::Sha256) => ECDSA_SHA256,
            (KeyAlgorithm::Ecdsa, DigestAlgorithm::Sha384) => ECDSA_SHA384,
            (KeyAlgorithm::Ecdsa, DigestAlgorithm::Sha512) => ECDSA_SHA512,
        }
    }

    /// Splits a `SignatureMethod` identifier into key and digest algorithm.
    pub fn from_signature_method_uri(
        uri: &str,
    ) -> Result<(KeyAlgorithm, DigestAlgorithm), SigningError> {
        [KeyAlgorithm::Rsa, KeyAlgorithm::Ecdsa]
            .into_iter()
            .flat_map(|key| DigestAlgorithm::ALL.into_iter().map(move |digest| (key, digest)))
            .find(|(key, digest)| key.signature_method_uri(*digest) == uri)
            .ok_or_else(|| SigningError::UnsupportedAlgorithm(format!("signature method '{uri}'")))
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonicalization used by `CanonicalizationMethod` and by every
/// canonicalization transform of the signature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CanonicalizationAlgorithm {
    /// Canonical XML 1.0 without comments.
    Inclusive,
    /// Exclusive XML Canonicalization 1.0 without comments.
    #[default]
    Exclusive,
    /// Canonical XML 1.1 without comments.
    Inclusive11,
}

impl CanonicalizationAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            CanonicalizationAlgorithm::Inclusive => C14N_INCLUSIVE,
            CanonicalizationAlgorithm::Exclusive => C14N_EXCLUSIVE,
            CanonicalizationAlgorithm::Inclusive11 => C14N_11,
        }
    }

    pub(crate) fn options(&self) -> c14n::CanonicalizationOptions {
        let mode = match self {
            CanonicalizationAlgorithm::Inclusive => c14n::CanonicalizationMode::Canonical1_0,
            CanonicalizationAlgorithm::Exclusive => {
                c14n::CanonicalizationMode::ExclusiveCanonical1_0
            }
            CanonicalizationAlgorithm::Inclusive11 => c14n::CanonicalizationMode::Canonical1_1,
        };
        c14n::CanonicalizationOptions {
            mode,
            inclusive_ns_prefixes: vec![],
            with_comments: false,
        }
    }
}

impl fmt::Display for CanonicalizationAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri())
    }
}

impl FromStr for CanonicalizationAlgorithm {
    type Err = SigningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed {
            C14N_INCLUSIVE => return Ok(CanonicalizationAlgorithm::Inclusive),
            C14N_EXCLUSIVE => return Ok(CanonicalizationAlgorithm::Exclusive),
            C14N_11 => return Ok(CanonicalizationAlgorithm::Inclusive11),
            _ => {}
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "inclusive" | "c14n" | "c14n10" => Ok(CanonicalizationAlgorithm::Inclusive),
            "exclusive" | "exc-c14n" | "exc_c14n" => Ok(CanonicalizationAlgorithm::Exclusive),
            "inclusive11" | "c14n11" | "c14n-1.1" => Ok(CanonicalizationAlgorithm::Inclusive11),
            _ => Err(SigningError::UnsupportedAlgorithm(format!(
                "canonicalization '{trimmed}'"
            ))),
        }
    }
}

/// Bytes handed to the signer together with their logical name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentToSign {
    name: String,
    content: Vec<u8>,
}

impl DocumentToSign {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Logical name; the reference URI of detached signatures.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }
}

#[derive(Debug, Clone)]
pub struct SigningParameters {
    packaging: Packaging,
    digest_algorithm: DigestAlgorithm,
    canonicalization: CanonicalizationAlgorithm,
    policy: Option<SignaturePolicy>,
    signing_time: DateTime<Utc>,
    certificate_chain: Option<CertificateChain>,
}

impl Default for SigningParameters {
    fn default() -> Self {
        Self::new()
    }
}

impl SigningParameters {
    /// Defaults with the signing time fixed to now.
    pub fn new() -> Self {
        Self {
            packaging: Packaging::default(),
            digest_algorithm: DigestAlgorithm::default(),
            canonicalization: CanonicalizationAlgorithm::default(),
            policy: None,
            signing_time: Utc::now().trunc_subsecs(0),
            certificate_chain: None,
        }
    }

    /// Parameters from configuration, with the configured policy bound.
    pub fn from_config(config: &Config) -> Result<Self, SigningError> {
        let params = Self::new()
            .with_packaging(config.packaging())
            .with_digest_algorithm(config.digest_algorithm())
            .with_canonicalization(config.canonicalization());
        bind(params, config.policy())
    }

    pub fn with_packaging(mut self, packaging: Packaging) -> Self {
        self.packaging = packaging;
        self
    }

    pub fn with_digest_algorithm(mut self, digest_algorithm: DigestAlgorithm) -> Self {
        self.digest_algorithm = digest_algorithm;
        self
    }

    pub fn with_canonicalization(mut self, canonicalization: CanonicalizationAlgorithm) -> Self {
        self.canonicalization = canonicalization;
        self
    }

    /// Sub-second precision is dropped; `SigningTime` has second resolution.
    pub fn with_signing_time(mut self, signing_time: DateTime<Utc>) -> Self {
        self.signing_time = signing_time.trunc_subsecs(0);
        self
    }

    pub fn with_certificate_chain(mut self, chain: CertificateChain) -> Self {
        self.certificate_chain = Some(chain);
        self
    }

    pub(crate) fn with_policy(mut self, policy: Option<SignaturePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn packaging(&self) -> Packaging {
        self.packaging
    }

    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        self.digest_algorithm
    }

    pub fn canonicalization(&self) -> CanonicalizationAlgorithm {
        self.canonicalization
    }

    pub fn policy(&self) -> Option<&SignaturePolicy> {
        self.policy.as_ref()
    }

    pub fn signing_time(&self) -> DateTime<Utc> {
        self.signing_time
    }

    pub fn certificate_chain(&self) -> Option<&CertificateChain> {
        self.certificate_chain.as_ref()
    }

    pub(crate) fn signing_time_text(&self) -> String {
        self.signing_time.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }
}

/// Canonical `SignedInfo` bytes awaiting a signature value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataToSign {
    bytes: Vec<u8>,
    digest_algorithm: DigestAlgorithm,
}

impl DataToSign {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        self.digest_algorithm
    }

    /// Pre-hashed form for signers that only accept digests.
    pub fn digest(&self) -> Vec<u8> {
        self.digest_algorithm.digest(&self.bytes)
    }
}

/// Raw signature bytes: `r || s` for ECDSA, the PKCS#1 v1.5 block for RSA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureValue(Vec<u8>);

impl SignatureValue {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        Base64::encode_string(&self.0)
    }
}

impl From<Vec<u8>> for SignatureValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDocument {
    name: String,
    packaging: Packaging,
    bytes: Vec<u8>,
}

impl SignedDocument {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn packaging(&self) -> Packaging {
        self.packaging
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CanonicalSigner;

impl CanonicalSigner {
    pub fn new() -> Self {
        crate::init();
        Self
    }

    /// Phase one: the canonical `SignedInfo` the signature value covers.
    pub fn compute_digest(
        &self,
        document: &DocumentToSign,
        params: &SigningParameters,
    ) -> Result<DataToSign, SigningError> {
        let assembly =
            SignatureAssembly::build(document, params, certified_algorithm(params)?)?;
        let bytes = assembly.signed_info()?;
        debug!(
            document = document.name(),
            packaging = %params.packaging(),
            digest = %params.digest_algorithm(),
            "computed data to sign"
        );
        Ok(DataToSign {
            bytes,
            digest_algorithm: params.digest_algorithm(),
        })
    }

    /// Phase two: embed a signature value computed over the phase one bytes.
    pub fn finalize(
        &self,
        document: &DocumentToSign,
        params: &SigningParameters,
        value: &SignatureValue,
    ) -> Result<SignedDocument, SigningError> {
        if value.as_bytes().is_empty() {
            return Err(SigningError::Signing("empty signature value".into()));
        }
        let mut assembly =
            SignatureAssembly::build(document, params, certified_algorithm(params)?)?;
        assembly.set_signature_value(value)?;
        debug!(document = document.name(), "finalized signature");
        Ok(SignedDocument {
            name: document.name().to_string(),
            packaging: params.packaging(),
            bytes: assembly.into_bytes(),
        })
    }

    /// Both phases around `key`. The key's chain is used when `params`
    /// carries none; a chain in `params` must start with the key's leaf.
    pub fn sign(
        &self,
        document: &DocumentToSign,
        params: &SigningParameters,
        key: Option<&dyn SigningCapability>,
    ) -> Result<SignedDocument, SigningError> {
        let key = key.ok_or(SigningError::NoSigningKey)?;
        let key_chain = key.certificate_chain()?;
        let params = match params.certificate_chain() {
            Some(chain) if !chain.same_signer(&key_chain)? => {
                return Err(SigningError::KeyMaterial(
                    "certificate chain does not belong to the signing key".into(),
                ));
            }
            Some(_) => params.clone(),
            None => params.clone().with_certificate_chain(key_chain),
        };
        let key_algorithm = key.key_algorithm();
        if certified_algorithm(&params)? != key_algorithm {
            return Err(SigningError::KeyMaterial(format!(
                "{key_algorithm} key with a certificate for another key type"
            )));
        }

        let mut assembly = SignatureAssembly::build(document, &params, key_algorithm)?;
        let data = DataToSign {
            bytes: assembly.signed_info()?,
            digest_algorithm: params.digest_algorithm(),
        };
        let value = key.sign(&data)?;
        if value.as_bytes().is_empty() {
            return Err(SigningError::Signing("empty signature value".into()));
        }
        assembly.set_signature_value(&value)?;
        debug!(
            document = document.name(),
            packaging = %params.packaging(),
            "signed document"
        );
        Ok(SignedDocument {
            name: document.name().to_string(),
            packaging: params.packaging(),
            bytes: assembly.into_bytes(),
        })
    }
}

fn certified_algorithm(params: &SigningParameters) -> Result<KeyAlgorithm, SigningError> {
    params
        .certificate_chain()
        .ok_or_else(|| {
            SigningError::KeyMaterial("no certificate chain bound to the signing parameters".into())
        })?
        .key_algorithm()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_algorithm_parses_names_and_uris() {
        assert_eq!(
            "SHA-256".parse::<DigestAlgorithm>().unwrap(),
            DigestAlgorithm::Sha256
        );
        assert_eq!(
            "sha512".parse::<DigestAlgorithm>().unwrap(),
            DigestAlgorithm::Sha512
        );
        assert_eq!(
            DIGEST_SHA384.parse::<DigestAlgorithm>().unwrap(),
            DigestAlgorithm::Sha384
        );
        assert!(matches!(
            "md5".parse::<DigestAlgorithm>(),
            Err(SigningError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn digest_lengths_match_output() {
        for alg in [
            DigestAlgorithm::Sha1,
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha384,
            DigestAlgorithm::Sha512,
        ] {
            assert_eq!(alg.digest(b"abc").len(), alg.output_len());
        }
    }

    #[test]
    fn signature_method_names_key_and_digest() {
        assert_eq!(
            KeyAlgorithm::Rsa.signature_method_uri(DigestAlgorithm::Sha256),
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"
        );
        assert_eq!(
            KeyAlgorithm::Rsa.signature_method_uri(DigestAlgorithm::Sha1),
            "http://www.w3.org/2000/09/xmldsig#rsa-sha1"
        );
        for key in [KeyAlgorithm::Rsa, KeyAlgorithm::Ecdsa] {
            for digest in DigestAlgorithm::ALL {
                assert_eq!(
                    KeyAlgorithm::from_signature_method_uri(key.signature_method_uri(digest))
                        .unwrap(),
                    (key, digest)
                );
            }
        }
        assert!(matches!(
            KeyAlgorithm::from_signature_method_uri("http://www.w3.org/2000/09/xmldsig#dsa-sha1"),
            Err(SigningError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn canonicalization_defaults_to_exclusive() {
        assert_eq!(
            CanonicalizationAlgorithm::default().uri(),
            "http://www.w3.org/2001/10/xml-exc-c14n#"
        );
        assert_eq!(
            "c14n11".parse::<CanonicalizationAlgorithm>().unwrap(),
            CanonicalizationAlgorithm::Inclusive11
        );
        assert!(
            "http://www.w3.org/TR/2001/REC-xml-c14n-20010315#WithComments"
                .parse::<CanonicalizationAlgorithm>()
                .is_err()
        );
    }

    #[test]
    fn packaging_parses_case_insensitively() {
        assert_eq!(
            "Enveloping".parse::<Packaging>().unwrap(),
            Packaging::Enveloping
        );
        assert!("wrapped".parse::<Packaging>().is_err());
    }

    #[test]
    fn signing_time_drops_subseconds() {
        let time = DateTime::parse_from_rfc3339("2024-03-01T10:20:30.987Z")
            .unwrap()
            .with_timezone(&Utc);
        let params = SigningParameters::new().with_signing_time(time);
        assert_eq!(params.signing_time_text(), "2024-03-01T10:20:30Z");
    }

    #[test]
    fn sign_without_key_fails() {
        let document = DocumentToSign::new("doc.xml", b"<a/>".to_vec());
        let err = CanonicalSigner::new()
            .sign(&document, &SigningParameters::new(), None)
            .unwrap_err();
        assert!(matches!(err, SigningError::NoSigningKey));
    }

    #[test]
    fn compute_digest_requires_certificate_chain() {
        let document = DocumentToSign::new("doc.xml", b"<a/>".to_vec());
        let err = CanonicalSigner::new()
            .compute_digest(&document, &SigningParameters::new())
            .unwrap_err();
        assert!(matches!(err, SigningError::KeyMaterial(_)));
    }
}
