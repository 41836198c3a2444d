use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use verifactu_core::ledger::InvoiceFields;
use verifactu_core::signature::{CertificateChain, DocumentToSign, LocalSigner, SigningParameters};

#[allow(dead_code)]
pub fn fixture_path(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(relative)
}

#[allow(dead_code)]
pub fn read_fixture(relative: &str) -> String {
    std::fs::read_to_string(fixture_path(relative))
        .unwrap_or_else(|e| panic!("read fixture {relative}: {e}"))
}

#[allow(dead_code)]
pub fn local_signer() -> LocalSigner {
    LocalSigner::from_pem(
        &read_fixture("keys/signer-chain.pem"),
        &read_fixture("keys/signer-key.pem"),
    )
    .expect("signer from fixtures")
}

#[allow(dead_code)]
pub fn signer_chain() -> CertificateChain {
    CertificateChain::from_pem(&read_fixture("keys/signer-chain.pem")).expect("chain")
}

/// Self-signed RSA-2048 certificate with its PKCS#8 key.
#[allow(dead_code)]
pub fn rsa_signer() -> LocalSigner {
    LocalSigner::from_pem(
        &read_fixture("keys/rsa-cert.pem"),
        &read_fixture("keys/rsa-key.pem"),
    )
    .expect("RSA signer from fixtures")
}

#[allow(dead_code)]
pub fn rsa_chain() -> CertificateChain {
    CertificateChain::from_pem(&read_fixture("keys/rsa-cert.pem")).expect("chain")
}

#[allow(dead_code)]
pub fn invoice_document() -> DocumentToSign {
    DocumentToSign::new(
        "facturae-invoice.xml",
        read_fixture("documents/facturae-invoice.xml"),
    )
}

#[allow(dead_code)]
pub fn receipt_document() -> DocumentToSign {
    DocumentToSign::new("plain-receipt.xml", read_fixture("documents/plain-receipt.xml"))
}

#[allow(dead_code)]
pub fn signing_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap()
}

/// Parameters with a fixed signing time so repeated runs are comparable.
#[allow(dead_code)]
pub fn fixed_params() -> SigningParameters {
    SigningParameters::new().with_signing_time(signing_time())
}

#[allow(dead_code)]
pub fn invoice_fields(series: &str, fiscal_year: i32, issue_date: &str, total: &str) -> InvoiceFields {
    InvoiceFields::new(
        Some(series.to_string()),
        Some(fiscal_year),
        "B12345678".into(),
        "12345678Z".into(),
        issue_date.into(),
        total.into(),
    )
    .expect("valid invoice fields")
}
