//! XAdES invoice signing and VeriFactu-style hash-chained invoice
//! registration.
//!
//! # Examples
//! ```rust
//! use verifactu_core::ledger::{InvoiceChainLedger, InvoiceFields, payload};
//!
//! let ledger = InvoiceChainLedger::new();
//! let fields = InvoiceFields::new(
//!     Some("A".into()),
//!     Some(2024),
//!     "B12345678".into(),
//!     "12345678Z".into(),
//!     "2024-03-01".into(),
//!     "121.00".into(),
//! )?;
//! let record = ledger.register_invoice(&fields)?;
//! assert_eq!(record.sequence(), 1);
//! assert!(payload::build(&fields, &record).starts_with("VERIFACTU;B12345678;A;1;2024;"));
//! # Ok::<(), verifactu_core::Error>(())
//! ```
pub mod config;
pub mod ledger;
pub mod signature;

use std::sync::Once;

use libxml::parser::Parser;
use thiserror::Error;
use tracing::debug;

/// Initializes the XML library once per process.
///
/// Every entry point that touches XML calls this; calling it early from the
/// main thread is still advisable for multi-threaded hosts.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // The first parse runs the library's global initialization.
        let warmed = Parser::default().parse_string("<init/>").is_ok();
        debug!(warmed, "XML library initialized");
    });
}

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Signing(#[from] signature::SigningError),
    #[error(transparent)]
    Policy(#[from] signature::PolicyError),
    #[error(transparent)]
    Ledger(#[from] ledger::LedgerError),
    #[error(transparent)]
    InvoiceFields(#[from] ledger::InvoiceFieldsError),
    #[error(transparent)]
    Payload(#[from] ledger::PayloadError),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}
