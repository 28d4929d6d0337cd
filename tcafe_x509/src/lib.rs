//! Shared X.509 field extraction for the tcafe ingesters.
//!
//! Both the CT and the Rekor pipeline reduce a DER certificate to the same
//! flat [`CertificateSummary`]; each maps it onto its own row layout.

pub mod algorithms;
pub mod summary;

pub use summary::{
    CertificateError, CertificateSummary, ExtensionEntry, NameSummary, serial_hex,
    summarize_certificate, tbs_contains_poison,
};
