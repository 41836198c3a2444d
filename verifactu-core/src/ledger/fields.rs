use serde::{Deserialize, Serialize};
use thiserror::Error;
use verifactu_derive::Validate;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid invoice fields: {0}")]
pub struct InvoiceFieldsError(String);

impl From<String> for InvoiceFieldsError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// Invoice attributes that feed the fingerprint and the verification
/// payload.
///
/// Values are opaque text taken literally; only delimiter and control
/// characters are rejected at construction. A missing series or fiscal
/// year is filled from the ledger defaults at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Validate)]
#[validate_error(InvoiceFieldsError)]
#[validate(no_delimiter, no_control_chars)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceFields {
    #[validate(non_empty, no_delimiter, no_control_chars)]
    series: Option<String>,
    #[validate(skip)]
    fiscal_year: Option<i32>,
    issuer_tax_id: String,
    recipient_tax_id: String,
    issue_date: String,
    total_amount: String,
}

impl InvoiceFields {
    pub fn series(&self) -> Option<&str> {
        self.series.as_deref()
    }

    pub fn fiscal_year(&self) -> Option<i32> {
        self.fiscal_year
    }

    pub fn issuer_tax_id(&self) -> &str {
        &self.issuer_tax_id
    }

    pub fn recipient_tax_id(&self) -> &str {
        &self.recipient_tax_id
    }

    pub fn issue_date(&self) -> &str {
        &self.issue_date
    }

    pub fn total_amount(&self) -> &str {
        &self.total_amount
    }
}

/// Wire form accepting both the English names and the Spanish ones used by
/// fiscal integrations. Absent recipient and issue date read as empty text.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInvoiceFields {
    #[serde(default, alias = "serie")]
    series: Option<String>,
    #[serde(default, alias = "ejercicio")]
    fiscal_year: Option<i32>,
    #[serde(alias = "emisorNif")]
    issuer_tax_id: String,
    #[serde(default, alias = "receptorNif")]
    recipient_tax_id: String,
    #[serde(default, alias = "fecha")]
    issue_date: String,
    #[serde(alias = "total")]
    total_amount: String,
}

impl<'de> Deserialize<'de> for InvoiceFields {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawInvoiceFields::deserialize(deserializer)?;
        InvoiceFields::new(
            raw.series,
            raw.fiscal_year,
            raw.issuer_tax_id,
            raw.recipient_tax_id,
            raw.issue_date,
            raw.total_amount,
        )
        .map_err(serde::de::Error::custom)
    }
}
