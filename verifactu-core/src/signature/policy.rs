//! Explicit signature policy binding (XAdES-EPES `SignaturePolicyIdentifier`).

use base64ct::{Base64, Encoding};
use thiserror::Error;
use tracing::debug;

use super::{DigestAlgorithm, SigningError, SigningParameters};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("incomplete signature policy, missing: {}", .missing.join(", "))]
    Incomplete { missing: Vec<&'static str> },
    #[error("policy hash must be {expected} bytes for {algorithm}, got {actual}")]
    HashLength {
        algorithm: DigestAlgorithm,
        expected: usize,
        actual: usize,
    },
    #[error("policy digest {policy} does not match signature digest {signature}")]
    DigestMismatch {
        policy: DigestAlgorithm,
        signature: DigestAlgorithm,
    },
}

impl PolicyError {
    /// True for both the missing-field and the wrong-hash-length cases.
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            PolicyError::Incomplete { .. } | PolicyError::HashLength { .. }
        )
    }
}

/// Policy fields as supplied by configuration or a caller.
///
/// Blank strings and empty hashes count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyDescriptor {
    pub id: Option<String>,
    pub url: Option<String>,
    pub digest_algorithm: Option<String>,
    pub hash: Option<Vec<u8>>,
}

impl PolicyDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_digest_algorithm(mut self, digest_algorithm: impl Into<String>) -> Self {
        self.digest_algorithm = Some(digest_algorithm.into());
        self
    }

    pub fn with_hash(mut self, hash: impl Into<Vec<u8>>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    /// Hash given as standard base64.
    pub fn with_hash_base64(self, hash: &str) -> Result<Self, base64ct::Error> {
        let bytes = Base64::decode_vec(hash.trim())?;
        Ok(self.with_hash(bytes))
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = vec![];
        if present(&self.id).is_none() {
            missing.push("id");
        }
        if present(&self.url).is_none() {
            missing.push("url");
        }
        if present(&self.digest_algorithm).is_none() {
            missing.push("digestAlgorithm");
        }
        if self.hash.as_ref().is_none_or(Vec::is_empty) {
            missing.push("hash");
        }
        missing
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// A validated explicit policy. Only [`bind`] creates one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignaturePolicy {
    id: String,
    url: String,
    digest_algorithm: DigestAlgorithm,
    hash: Vec<u8>,
}

impl SignaturePolicy {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        self.digest_algorithm
    }

    pub fn hash(&self) -> &[u8] {
        &self.hash
    }

    pub fn hash_base64(&self) -> String {
        Base64::encode_string(&self.hash)
    }

    pub(crate) fn ensure_digest(&self, signature: DigestAlgorithm) -> Result<(), PolicyError> {
        if self.digest_algorithm != signature {
            return Err(PolicyError::DigestMismatch {
                policy: self.digest_algorithm,
                signature,
            });
        }
        Ok(())
    }
}

/// Merges an optional policy descriptor into `params`.
///
/// No descriptor, or one with every field blank, yields an implicit policy.
/// A partial descriptor is an error; no placeholder hash is ever used.
pub fn bind(
    params: SigningParameters,
    descriptor: Option<&PolicyDescriptor>,
) -> Result<SigningParameters, SigningError> {
    let Some(descriptor) = descriptor else {
        return Ok(params.with_policy(None));
    };

    let fields = (
        present(&descriptor.id),
        present(&descriptor.url),
        present(&descriptor.digest_algorithm),
        descriptor.hash.as_deref().filter(|h| !h.is_empty()),
    );
    let (id, url, digest_name, hash) = match fields {
        (None, None, None, None) => {
            debug!("empty policy descriptor, signing with implicit policy");
            return Ok(params.with_policy(None));
        }
        (Some(id), Some(url), Some(digest_name), Some(hash)) => (id, url, digest_name, hash),
        _ => {
            return Err(PolicyError::Incomplete {
                missing: descriptor.missing_fields(),
            }
            .into());
        }
    };

    let digest_algorithm: DigestAlgorithm = digest_name.parse()?;
    if hash.len() != digest_algorithm.output_len() {
        return Err(PolicyError::HashLength {
            algorithm: digest_algorithm,
            expected: digest_algorithm.output_len(),
            actual: hash.len(),
        }
        .into());
    }

    let policy = SignaturePolicy {
        id: id.to_string(),
        url: url.to_string(),
        digest_algorithm,
        hash: hash.to_vec(),
    };
    policy.ensure_digest(params.digest_algorithm())?;
    debug!(policy = policy.id(), "bound explicit signature policy");
    Ok(params.with_policy(Some(policy)))
}
