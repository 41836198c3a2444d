//! Verification payload: the text a QR code carries so a tax authority can
//! check a registration.
//!
//! `VERIFACTU;{issuerTaxId};{series};{sequence};{fiscalYear};{issueDate};{totalAmount};{fingerprint}`

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use super::{Fingerprint, InvoiceFields, RegistrationRecord};

pub const PAYLOAD_PREFIX: &str = "VERIFACTU";
pub const PAYLOAD_DELIMITER: char = ';';
const FIELD_COUNT: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload must start with 'VERIFACTU'")]
    Prefix,
    #[error("payload has {actual} fields, expected 8")]
    FieldCount { actual: usize },
    #[error("payload field {field} is not a number: '{value}'")]
    InvalidNumber { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationPayload {
    issuer_tax_id: String,
    series: String,
    sequence: u64,
    fiscal_year: i32,
    issue_date: String,
    total_amount: String,
    fingerprint: Fingerprint,
}

impl VerificationPayload {
    /// Series and fiscal year come from the record's resolved chain key,
    /// so defaults applied at registration show up in the payload.
    pub fn new(fields: &InvoiceFields, record: &RegistrationRecord) -> Self {
        Self {
            issuer_tax_id: fields.issuer_tax_id().to_string(),
            series: record.key().series().to_string(),
            sequence: record.sequence(),
            fiscal_year: record.key().fiscal_year(),
            issue_date: fields.issue_date().to_string(),
            total_amount: fields.total_amount().to_string(),
            fingerprint: record.fingerprint().clone(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, PayloadError> {
        let parts: Vec<&str> = text.split(PAYLOAD_DELIMITER).collect();
        if parts.first() != Some(&PAYLOAD_PREFIX) {
            return Err(PayloadError::Prefix);
        }
        if parts.len() != FIELD_COUNT {
            return Err(PayloadError::FieldCount {
                actual: parts.len(),
            });
        }
        let sequence = parts[3]
            .parse()
            .map_err(|_| PayloadError::InvalidNumber {
                field: "sequence",
                value: parts[3].to_string(),
            })?;
        let fiscal_year = parts[4]
            .parse()
            .map_err(|_| PayloadError::InvalidNumber {
                field: "fiscalYear",
                value: parts[4].to_string(),
            })?;
        Ok(Self {
            issuer_tax_id: parts[1].to_string(),
            series: parts[2].to_string(),
            sequence,
            fiscal_year,
            issue_date: parts[5].to_string(),
            total_amount: parts[6].to_string(),
            fingerprint: Fingerprint::from_encoded(parts[7]),
        })
    }

    pub fn issuer_tax_id(&self) -> &str {
        &self.issuer_tax_id
    }

    pub fn series(&self) -> &str {
        &self.series
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn fiscal_year(&self) -> i32 {
        self.fiscal_year
    }

    pub fn issue_date(&self) -> &str {
        &self.issue_date
    }

    pub fn total_amount(&self) -> &str {
        &self.total_amount
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Whether this payload describes `record`.
    pub fn matches(&self, record: &RegistrationRecord) -> bool {
        self.series == record.key().series()
            && self.fiscal_year == record.key().fiscal_year()
            && self.sequence == record.sequence()
            && &self.fingerprint == record.fingerprint()
    }
}

impl fmt::Display for VerificationPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{PAYLOAD_PREFIX};{};{};{};{};{};{};{}",
            self.issuer_tax_id,
            self.series,
            self.sequence,
            self.fiscal_year,
            self.issue_date,
            self.total_amount,
            self.fingerprint
        )
    }
}

/// The verification string for a registered invoice.
pub fn build(fields: &InvoiceFields, record: &RegistrationRecord) -> String {
    VerificationPayload::new(fields, record).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InvoiceChainLedger;

    fn invoice() -> InvoiceFields {
        InvoiceFields::new(
            Some("A".into()),
            Some(2024),
            "B12345678".into(),
            "12345678Z".into(),
            "2024-03-01".into(),
            "121.00".into(),
        )
        .unwrap()
    }

    #[test]
    fn build_uses_fixed_field_order() {
        let ledger = InvoiceChainLedger::new();
        let fields = invoice();
        let record = ledger.register_invoice(&fields).unwrap();
        let payload = build(&fields, &record);
        assert_eq!(
            payload,
            format!(
                "VERIFACTU;B12345678;A;1;2024;2024-03-01;121.00;{}",
                record.fingerprint()
            )
        );
    }

    #[test]
    fn parse_reads_built_payload() {
        let ledger = InvoiceChainLedger::new();
        let fields = invoice();
        let record = ledger.register_invoice(&fields).unwrap();
        let parsed = VerificationPayload::parse(&build(&fields, &record)).unwrap();
        assert!(parsed.matches(&record));
        assert_eq!(parsed.total_amount(), "121.00");
    }

    #[test]
    fn parse_rejects_malformed_text() {
        assert_eq!(
            VerificationPayload::parse("QR;a;b"),
            Err(PayloadError::Prefix)
        );
        assert_eq!(
            VerificationPayload::parse("VERIFACTU;a;b"),
            Err(PayloadError::FieldCount { actual: 3 })
        );
        assert!(matches!(
            VerificationPayload::parse("VERIFACTU;B1;A;x;2024;d;1;fp"),
            Err(PayloadError::InvalidNumber { field: "sequence", .. })
        ));
    }
}
