//! Signing and ledger configuration.
//!
//! Built in code with the `with_*` methods or read from a Java-style
//! `.properties` file:
//!
//! ```properties
//! signature.packaging=enveloped
//! signature.digest=SHA-256
//! signature.canonicalization=exclusive
//! policy.id=urn:oid:2.16.724.1.3.1.1.2.1.9
//! policy.url=https://sede.example.es/politica_de_firma.pdf
//! policy.digest=SHA-256
//! policy.hash=<base64>
//! ledger.default.series=A
//! ledger.default.fiscal_year=current
//! ```
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use java_properties::read;
use thiserror::Error;
use tracing::debug;

use crate::ledger::{FiscalYearDefault, LedgerDefaults};
use crate::signature::{CanonicalizationAlgorithm, DigestAlgorithm, Packaging, PolicyDescriptor};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open config file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse properties from '{path}': {source}")]
    PropertiesRead {
        path: PathBuf,
        source: java_properties::PropertiesError,
    },

    #[error("invalid value '{value}' for '{key}': {message}")]
    InvalidValue {
        key: String,
        value: String,
        message: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    packaging: Packaging,
    digest_algorithm: DigestAlgorithm,
    canonicalization: CanonicalizationAlgorithm,
    policy: Option<PolicyDescriptor>,
    ledger_defaults: LedgerDefaults,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_properties_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let properties = read(BufReader::new(file)).map_err(|e| ConfigError::PropertiesRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = Self::from_properties(&properties)?;
        debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Unknown keys are ignored; absent keys keep their defaults.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            properties
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };
        let invalid = |key: &str, value: &str, message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            message,
        };

        let mut config = Config::new();
        if let Some(value) = get("signature.packaging") {
            config.packaging = value
                .parse()
                .map_err(|e: crate::signature::SigningError| {
                    invalid("signature.packaging", value, e.to_string())
                })?;
        }
        if let Some(value) = get("signature.digest") {
            config.digest_algorithm = value
                .parse()
                .map_err(|e: crate::signature::SigningError| {
                    invalid("signature.digest", value, e.to_string())
                })?;
        }
        if let Some(value) = get("signature.canonicalization") {
            config.canonicalization = value
                .parse()
                .map_err(|e: crate::signature::SigningError| {
                    invalid("signature.canonicalization", value, e.to_string())
                })?;
        }

        let mut policy = PolicyDescriptor::new();
        policy.id = get("policy.id").map(str::to_string);
        policy.url = get("policy.url").map(str::to_string);
        policy.digest_algorithm = get("policy.digest").map(str::to_string);
        if let Some(value) = get("policy.hash") {
            policy = policy
                .with_hash_base64(value)
                .map_err(|e| invalid("policy.hash", value, format!("not base64: {e}")))?;
        }
        if policy != PolicyDescriptor::default() {
            config.policy = Some(policy);
        }

        let mut defaults = LedgerDefaults::new();
        if let Some(value) = get("ledger.default.series") {
            defaults = defaults
                .with_series(value)
                .map_err(|e| invalid("ledger.default.series", value, e.to_string()))?;
        }
        if let Some(value) = get("ledger.default.fiscal_year") {
            let fiscal_year = if value.eq_ignore_ascii_case("current") {
                FiscalYearDefault::Current
            } else {
                FiscalYearDefault::Fixed(value.parse().map_err(|_| {
                    invalid(
                        "ledger.default.fiscal_year",
                        value,
                        "expected a year or 'current'".into(),
                    )
                })?)
            };
            defaults = defaults.with_fiscal_year(fiscal_year);
        }
        config.ledger_defaults = defaults;

        Ok(config)
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

    pub fn with_policy(mut self, policy: PolicyDescriptor) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_ledger_defaults(mut self, ledger_defaults: LedgerDefaults) -> Self {
        self.ledger_defaults = ledger_defaults;
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

    pub fn policy(&self) -> Option<&PolicyDescriptor> {
        self.policy.as_ref()
    }

    pub fn ledger_defaults(&self) -> &LedgerDefaults {
        &self.ledger_defaults
    }
}
