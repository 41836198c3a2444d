//! Hash-chained invoice registration, one chain per (series, fiscal year).
//!
//! Each registration takes the next sequence number of its chain and a
//! fingerprint over the invoice fields and the previous fingerprint:
//!
//! ```text
//! canonical_n   = issuerTaxId|recipientTaxId|series|sequence|fiscalYear|issueDate|totalAmount
//! fingerprint_n = base64url(SHA-256(canonical_n | fingerprint_{n-1}))
//! fingerprint_0 = INIT
//! ```

mod fields;
pub mod payload;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, info};

pub use fields::{InvoiceFields, InvoiceFieldsError};
pub use payload::{PayloadError, VerificationPayload};

/// Previous fingerprint of the first registration in a chain.
pub const SENTINEL_FINGERPRINT: &str = "INIT";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invoice has no {field} and no default is configured")]
    MissingField { field: &'static str },
    #[error("invalid chain key '{0}', expected 'series:fiscalYear'")]
    InvalidChainKey(String),
    #[error("invalid ledger default: {0}")]
    InvalidDefault(String),
    #[error("chain {key} was left inconsistent by a failed registration")]
    ConcurrentModification { key: ChainKey },
    #[error("chain {key} has no sequence numbers left")]
    SequenceExhausted { key: ChainKey },
    #[error("invalid ledger snapshot for chain {key}: {message}")]
    InvalidSnapshot { key: String, message: String },
    #[error("chain {key} broken at sequence {sequence}: {message}")]
    ChainBroken {
        key: ChainKey,
        sequence: u64,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ChainKey {
    series: String,
    fiscal_year: i32,
}

impl ChainKey {
    pub fn new(series: impl Into<String>, fiscal_year: i32) -> Self {
        Self {
            series: series.into(),
            fiscal_year,
        }
    }

    pub fn series(&self) -> &str {
        &self.series
    }

    pub fn fiscal_year(&self) -> i32 {
        self.fiscal_year
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.series, self.fiscal_year)
    }
}

impl FromStr for ChainKey {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (series, year) = s
            .rsplit_once(':')
            .ok_or_else(|| LedgerError::InvalidChainKey(s.to_string()))?;
        let fiscal_year = year
            .parse()
            .map_err(|_| LedgerError::InvalidChainKey(s.to_string()))?;
        if series.trim().is_empty() {
            return Err(LedgerError::InvalidChainKey(s.to_string()));
        }
        Ok(Self::new(series, fiscal_year))
    }
}

impl From<ChainKey> for String {
    fn from(key: ChainKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for ChainKey {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Unpadded base64url SHA-256 digest, or the `INIT` sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn sentinel() -> Self {
        Self(SENTINEL_FINGERPRINT.to_string())
    }

    pub fn is_sentinel(&self) -> bool {
        self.0 == SENTINEL_FINGERPRINT
    }

    /// Wraps fingerprint text read back from a payload or snapshot.
    pub fn from_encoded(text: &str) -> Self {
        Self(text.to_string())
    }

    pub fn compute(canonical: &str, previous: &Fingerprint) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hasher.update(b"|");
        hasher.update(previous.0.as_bytes());
        Self(Base64UrlUnpadded::encode_string(&hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainState {
    last_sequence: u64,
    last_fingerprint: Fingerprint,
}

impl Default for ChainState {
    fn default() -> Self {
        Self {
            last_sequence: 0,
            last_fingerprint: Fingerprint::sentinel(),
        }
    }
}

impl ChainState {
    pub fn new(last_sequence: u64, last_fingerprint: Fingerprint) -> Self {
        Self {
            last_sequence,
            last_fingerprint,
        }
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn last_fingerprint(&self) -> &Fingerprint {
        &self.last_fingerprint
    }

    fn validate(&self) -> Result<(), String> {
        match (self.last_sequence, self.last_fingerprint.is_sentinel()) {
            (0, true) => Ok(()),
            (0, false) => Err("sequence 0 must carry the INIT fingerprint".into()),
            (_, true) => Err("registered chain cannot carry the INIT fingerprint".into()),
            _ if self.last_fingerprint.as_str().is_empty() => {
                Err("empty fingerprint".into())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRecord {
    key: ChainKey,
    sequence: u64,
    fingerprint: Fingerprint,
    previous_fingerprint: Fingerprint,
}

impl RegistrationRecord {
    pub fn key(&self) -> &ChainKey {
        &self.key
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn previous_fingerprint(&self) -> &Fingerprint {
        &self.previous_fingerprint
    }
}

/// Full ledger state, keyed by `series:fiscalYear` when serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerSnapshot {
    chains: BTreeMap<ChainKey, ChainState>,
}

impl LedgerSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chain(mut self, key: ChainKey, state: ChainState) -> Self {
        self.chains.insert(key, state);
        self
    }

    pub fn get(&self, key: &ChainKey) -> Option<&ChainState> {
        self.chains.get(key)
    }

    pub fn chains(&self) -> impl Iterator<Item = (&ChainKey, &ChainState)> {
        self.chains.iter()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiscalYearDefault {
    Fixed(i32),
    /// The calendar year (UTC) at registration time.
    Current,
}

impl FiscalYearDefault {
    fn resolve(&self) -> i32 {
        match self {
            FiscalYearDefault::Fixed(year) => *year,
            FiscalYearDefault::Current => Utc::now().year(),
        }
    }
}

/// Series and fiscal year used when an invoice leaves them out. Without a
/// default the field is required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerDefaults {
    series: Option<String>,
    fiscal_year: Option<FiscalYearDefault>,
}

impl LedgerDefaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(mut self, series: impl Into<String>) -> Result<Self, LedgerError> {
        let series = series.into();
        if series.trim().is_empty()
            || series.contains([';', '|', ':'])
            || series.chars().any(char::is_control)
        {
            return Err(LedgerError::InvalidDefault(format!(
                "series '{series}' must be non-empty without ';', '|' or ':'"
            )));
        }
        self.series = Some(series);
        Ok(self)
    }

    pub fn with_fiscal_year(mut self, fiscal_year: FiscalYearDefault) -> Self {
        self.fiscal_year = Some(fiscal_year);
        self
    }

    pub fn series(&self) -> Option<&str> {
        self.series.as_deref()
    }

    pub fn fiscal_year(&self) -> Option<FiscalYearDefault> {
        self.fiscal_year
    }
}

/// `issuerTaxId|recipientTaxId|series|sequence|fiscalYear|issueDate|totalAmount`
pub fn canonical_fields(fields: &InvoiceFields, key: &ChainKey, sequence: u64) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{}",
        fields.issuer_tax_id(),
        fields.recipient_tax_id(),
        key.series(),
        sequence,
        key.fiscal_year(),
        fields.issue_date(),
        fields.total_amount()
    )
}

/// In-memory registration ledger.
///
/// The outer lock is only held to find or create a chain; registrations on
/// one chain are serialized by that chain's own mutex.
#[derive(Debug, Default)]
pub struct InvoiceChainLedger {
    chains: RwLock<HashMap<ChainKey, Arc<Mutex<ChainState>>>>,
    defaults: LedgerDefaults,
}

impl InvoiceChainLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(defaults: LedgerDefaults) -> Self {
        Self {
            chains: RwLock::default(),
            defaults,
        }
    }

    pub fn defaults(&self) -> &LedgerDefaults {
        &self.defaults
    }

    pub fn resolve_key(&self, fields: &InvoiceFields) -> Result<ChainKey, LedgerError> {
        let series = fields
            .series()
            .or(self.defaults.series())
            .ok_or(LedgerError::MissingField { field: "series" })?;
        let fiscal_year = fields
            .fiscal_year()
            .or_else(|| self.defaults.fiscal_year().map(|d| d.resolve()))
            .ok_or(LedgerError::MissingField {
                field: "fiscalYear",
            })?;
        Ok(ChainKey::new(series, fiscal_year))
    }

    pub fn register_invoice(
        &self,
        fields: &InvoiceFields,
    ) -> Result<RegistrationRecord, LedgerError> {
        let key = self.resolve_key(fields)?;
        let chain = self.chain(&key);
        let mut state = lock_chain(&chain, &key)?;

        let sequence = state
            .last_sequence
            .checked_add(1)
            .ok_or_else(|| LedgerError::SequenceExhausted { key: key.clone() })?;
        let previous_fingerprint = state.last_fingerprint.clone();
        let fingerprint = Fingerprint::compute(
            &canonical_fields(fields, &key, sequence),
            &previous_fingerprint,
        );
        *state = ChainState {
            last_sequence: sequence,
            last_fingerprint: fingerprint.clone(),
        };
        drop(state);

        info!(chain = %key, sequence, "invoice registered");
        Ok(RegistrationRecord {
            key,
            sequence,
            fingerprint,
            previous_fingerprint,
        })
    }

    /// Current state of one chain; `None` before its first registration.
    pub fn state(&self, key: &ChainKey) -> Result<Option<ChainState>, LedgerError> {
        let chain = {
            let chains = self.chains.read().unwrap_or_else(PoisonError::into_inner);
            chains.get(key).map(Arc::clone)
        };
        match chain {
            Some(chain) => Ok(Some(lock_chain(&chain, key)?.clone())),
            None => Ok(None),
        }
    }

    /// Copy of every chain's state. Each chain is read atomically, the
    /// snapshot as a whole is not.
    pub fn snapshot(&self) -> Result<LedgerSnapshot, LedgerError> {
        let handles: Vec<(ChainKey, Arc<Mutex<ChainState>>)> = {
            let chains = self.chains.read().unwrap_or_else(PoisonError::into_inner);
            chains
                .iter()
                .map(|(key, chain)| (key.clone(), Arc::clone(chain)))
                .collect()
        };
        let mut snapshot = LedgerSnapshot::new();
        for (key, chain) in handles {
            let state = lock_chain(&chain, &key)?.clone();
            snapshot.chains.insert(key, state);
        }
        Ok(snapshot)
    }

    /// Replaces the ledger state with `snapshot`.
    ///
    /// Every state is validated before anything changes. Chains absent from
    /// the snapshot go back to their initial state.
    pub fn restore(&self, snapshot: LedgerSnapshot) -> Result<(), LedgerError> {
        for (key, state) in snapshot.chains() {
            state
                .validate()
                .map_err(|message| LedgerError::InvalidSnapshot {
                    key: key.to_string(),
                    message,
                })?;
        }

        let updates: Vec<(ChainKey, Arc<Mutex<ChainState>>, ChainState)> = {
            let mut chains = self.chains.write().unwrap_or_else(PoisonError::into_inner);
            let mut updates: Vec<_> = chains
                .iter()
                .filter(|(key, _)| snapshot.get(key).is_none())
                .map(|(key, chain)| (key.clone(), Arc::clone(chain), ChainState::default()))
                .collect();
            for (key, state) in snapshot.chains {
                let chain = Arc::clone(chains.entry(key.clone()).or_default());
                updates.push((key, chain, state));
            }
            updates
        };

        let restored = updates.len();
        for (key, chain, state) in updates {
            *lock_chain(&chain, &key)? = state;
        }
        debug!(chains = restored, "ledger restored");
        Ok(())
    }

    fn chain(&self, key: &ChainKey) -> Arc<Mutex<ChainState>> {
        // Map operations cannot leave it half-updated, so a poisoned outer
        // lock is still safe to use.
        {
            let chains = self.chains.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(chain) = chains.get(key) {
                return Arc::clone(chain);
            }
        }
        let mut chains = self.chains.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(chains.entry(key.clone()).or_insert_with(|| {
            debug!(chain = %key, "chain created");
            Arc::new(Mutex::new(ChainState::default()))
        }))
    }
}

fn lock_chain<'a>(
    chain: &'a Mutex<ChainState>,
    key: &ChainKey,
) -> Result<MutexGuard<'a, ChainState>, LedgerError> {
    chain.lock().map_err(|_| {
        error!(chain = %key, "chain mutex poisoned, refusing to continue the chain");
        LedgerError::ConcurrentModification { key: key.clone() }
    })
}

/// Recomputes chains from their registrations, in order, starting at
/// sequence 1. Entries of different chains may be interleaved.
pub fn verify_chain(entries: &[(InvoiceFields, RegistrationRecord)]) -> Result<(), LedgerError> {
    let mut heads: HashMap<ChainKey, ChainState> = HashMap::new();
    for (fields, record) in entries {
        let key = record.key();
        let broken = |message: &str| LedgerError::ChainBroken {
            key: key.clone(),
            sequence: record.sequence(),
            message: message.to_string(),
        };

        if fields.series().is_some_and(|series| series != key.series())
            || fields.fiscal_year().is_some_and(|year| year != key.fiscal_year())
        {
            return Err(broken("invoice fields belong to a different chain"));
        }

        let head = heads.entry(key.clone()).or_default();
        if Some(record.sequence()) != head.last_sequence.checked_add(1) {
            return Err(broken(&format!(
                "expected sequence {}",
                head.last_sequence.saturating_add(1)
            )));
        }
        if record.previous_fingerprint() != &head.last_fingerprint {
            return Err(broken("previous fingerprint does not match the chain"));
        }
        let expected = Fingerprint::compute(
            &canonical_fields(fields, key, record.sequence()),
            &head.last_fingerprint,
        );
        if &expected != record.fingerprint() {
            return Err(broken("fingerprint does not match the invoice fields"));
        }
        *head = ChainState {
            last_sequence: record.sequence(),
            last_fingerprint: expected,
        };
    }
    Ok(())
}
