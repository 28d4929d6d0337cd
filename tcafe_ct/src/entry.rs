use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use clickhouse::Row;
use serde::Serialize;
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};
use tracing::warn;

use crate::client::RawCtEntry;
use crate::leaf::{LeafBody, LeafError, parse_merkle_tree_leaf};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EntryError {
    #[snafu(display("failed to base64 decode leaf_input"))]
    DecodeLeaf { source: base64::DecodeError },
    #[snafu(display("failed to parse leaf"))]
    Leaf { source: LeafError },
}

pub type Result<T, E = EntryError> = std::result::Result<T, E>;

/// One parsed CT log entry, laid out as the `ct_log_entries` columns.
///
/// String columns that can be absent are nullable; string arrays are never
/// null, only empty. The raw leaf is always carried: parsed fields are
/// derived and recomputable.
#[derive(Debug, Clone, Row, Serialize)]
pub struct CtRow {
    pub log_id: String,
    pub log_index: u64,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub retrieval_timestamp: DateTime<Utc>,
    pub leaf_input: String,
    pub extra_data: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub entry_timestamp: DateTime<Utc>,
    pub entry_type: String,
    pub certificate_sha256: String,
    pub tbs_certificate_sha256: Option<String>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis::option")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis::option")]
    pub not_after: Option<DateTime<Utc>>,
    pub subject_common_name: Option<String>,
    pub subject_organization: Vec<String>,
    pub subject_organizational_unit: Vec<String>,
    pub subject_country: Vec<String>,
    pub subject_locality: Vec<String>,
    pub subject_province: Vec<String>,
    pub issuer_common_name: Option<String>,
    pub issuer_organization: Vec<String>,
    pub issuer_organizational_unit: Vec<String>,
    pub issuer_country: Vec<String>,
    pub issuer_locality: Vec<String>,
    pub issuer_province: Vec<String>,
    pub subject_alternative_names: Vec<String>,
    pub serial_number: Option<String>,
    pub signature_algorithm: Option<String>,
    pub public_key_algorithm: Option<String>,
    pub public_key_size: Option<u32>,
    pub is_ca: bool,
    pub basic_constraints_path_len: Option<u32>,
    pub key_usage: Vec<String>,
    pub extended_key_usage: Vec<String>,
    pub subject_key_identifier: Option<String>,
    pub authority_key_identifier: Option<String>,
    pub crl_distribution_points: Vec<String>,
    pub ocsp_urls: Vec<String>,
    pub precert_issuer_key_hash: Option<String>,
    pub precert_poison_present: bool,
    pub raw_leaf_certificate_der: String,
}

pub const X509_ENTRY_TYPE: &str = "x509_entry";
pub const PRECERT_ENTRY_TYPE: &str = "precert_entry";

/// Parse one raw get-entries element into a row.
///
/// Leaf-level failures (bad base64, unknown wire structure) are errors and
/// the caller skips the index. A certificate that decodes but does not parse
/// still yields a row with the identifiers, hashes and raw bytes.
pub fn parse_log_entry(raw: &RawCtEntry, log_id: &str, log_index: u64) -> Result<CtRow> {
    let leaf_bytes = BASE64.decode(&raw.leaf_input).context(DecodeLeafSnafu)?;
    let leaf = parse_merkle_tree_leaf(&leaf_bytes, log_index).context(LeafSnafu)?;

    let mut row = empty_row(log_id, log_index, raw, leaf.entry.timestamp_ms);

    match &leaf.entry.body {
        LeafBody::X509Certificate(der) => {
            row.entry_type = X509_ENTRY_TYPE.to_string();
            row.certificate_sha256 = hex::encode(Sha256::digest(der));
            row.raw_leaf_certificate_der = BASE64.encode(der);

            match tcafe_x509::summarize_certificate(der) {
                Ok(summary) => apply_certificate_summary(&mut row, &summary),
                Err(error) => {
                    warn!(
                        log_index,
                        error = %error,
                        "failed to parse leaf certificate, emitting row with identifiers only"
                    );
                }
            }
        }
        LeafBody::Precert {
            issuer_key_hash,
            tbs_certificate,
        } => {
            row.entry_type = PRECERT_ENTRY_TYPE.to_string();
            // The TBS hash stands in for both hash columns: the final
            // certificate is not present in a precert leaf.
            let tbs_sha256 = hex::encode(Sha256::digest(tbs_certificate));
            row.certificate_sha256 = tbs_sha256.clone();
            row.tbs_certificate_sha256 = Some(tbs_sha256);
            row.precert_issuer_key_hash = Some(hex::encode(issuer_key_hash));
            row.precert_poison_present = tcafe_x509::tbs_contains_poison(tbs_certificate);
            row.raw_leaf_certificate_der = BASE64.encode(tbs_certificate);
        }
    }

    Ok(row)
}

fn empty_row(log_id: &str, log_index: u64, raw: &RawCtEntry, timestamp_ms: u64) -> CtRow {
    CtRow {
        log_id: log_id.to_string(),
        log_index,
        retrieval_timestamp: Utc::now(),
        leaf_input: raw.leaf_input.clone(),
        extra_data: raw.extra_data.clone(),
        entry_timestamp: DateTime::from_timestamp_millis(timestamp_ms as i64).unwrap_or_default(),
        entry_type: String::new(),
        certificate_sha256: String::new(),
        tbs_certificate_sha256: None,
        not_before: None,
        not_after: None,
        subject_common_name: None,
        subject_organization: Vec::new(),
        subject_organizational_unit: Vec::new(),
        subject_country: Vec::new(),
        subject_locality: Vec::new(),
        subject_province: Vec::new(),
        issuer_common_name: None,
        issuer_organization: Vec::new(),
        issuer_organizational_unit: Vec::new(),
        issuer_country: Vec::new(),
        issuer_locality: Vec::new(),
        issuer_province: Vec::new(),
        subject_alternative_names: Vec::new(),
        serial_number: None,
        signature_algorithm: None,
        public_key_algorithm: None,
        public_key_size: None,
        is_ca: false,
        basic_constraints_path_len: None,
        key_usage: Vec::new(),
        extended_key_usage: Vec::new(),
        subject_key_identifier: None,
        authority_key_identifier: None,
        crl_distribution_points: Vec::new(),
        ocsp_urls: Vec::new(),
        precert_issuer_key_hash: None,
        precert_poison_present: false,
        raw_leaf_certificate_der: String::new(),
    }
}

fn apply_certificate_summary(row: &mut CtRow, summary: &tcafe_x509::CertificateSummary) {
    row.tbs_certificate_sha256 = optional(summary.tbs_sha256.clone());
    row.not_before = optional_time(summary.not_before);
    row.not_after = optional_time(summary.not_after);
    row.subject_common_name = optional(summary.subject.common_name.clone());
    row.subject_organization = summary.subject.organization.clone();
    row.subject_organizational_unit = summary.subject.organizational_unit.clone();
    row.subject_country = summary.subject.country.clone();
    row.subject_locality = summary.subject.locality.clone();
    row.subject_province = summary.subject.province.clone();
    row.issuer_common_name = optional(summary.issuer.common_name.clone());
    row.issuer_organization = summary.issuer.organization.clone();
    row.issuer_organizational_unit = summary.issuer.organizational_unit.clone();
    row.issuer_country = summary.issuer.country.clone();
    row.issuer_locality = summary.issuer.locality.clone();
    row.issuer_province = summary.issuer.province.clone();
    row.subject_alternative_names = summary.subject_alternative_names.clone();
    row.serial_number = optional(summary.serial_hex.clone());
    row.signature_algorithm = optional(summary.signature_algorithm.clone());
    row.public_key_algorithm = optional(summary.public_key_algorithm.clone());
    row.public_key_size = optional_u32(summary.public_key_bits);
    row.is_ca = summary.is_ca;
    row.basic_constraints_path_len = summary.path_len_constraint;
    row.key_usage = summary.key_usage.clone();
    row.extended_key_usage = summary.extended_key_usage.clone();
    row.subject_key_identifier = summary.subject_key_identifier.clone();
    row.authority_key_identifier = summary.authority_key_identifier.clone();
    row.crl_distribution_points = summary.crl_distribution_points.clone();
    row.ocsp_urls = summary.ocsp_urls.clone();
}

fn optional(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

fn optional_u32(value: u32) -> Option<u32> {
    if value == 0 { None } else { Some(value) }
}

fn optional_time(value: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if value.timestamp() == 0 {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaf::ISSUER_KEY_HASH_LEN;
    use crate::leaf::test_encoding::{encode_precert_leaf, encode_x509_leaf};

    fn raw_entry(leaf: &[u8]) -> RawCtEntry {
        RawCtEntry {
            leaf_input: BASE64.encode(leaf),
            extra_data: BASE64.encode(b"chain"),
        }
    }

    #[test]
    fn unparseable_certificate_still_yields_a_row() {
        let der = b"not-actually-der".to_vec();
        let leaf = encode_x509_leaf(1_700_000_000_123, &der);
        let raw = raw_entry(&leaf);

        let row = parse_log_entry(&raw, "ct.example.com/log", 31).unwrap();
        assert_eq!("ct.example.com/log", row.log_id);
        assert_eq!(31, row.log_index);
        assert_eq!(X509_ENTRY_TYPE, row.entry_type);
        assert_eq!(hex::encode(Sha256::digest(&der)), row.certificate_sha256);
        assert_eq!(BASE64.encode(&der), row.raw_leaf_certificate_der);
        assert_eq!(raw.leaf_input, row.leaf_input);
        // Derived certificate fields stay absent.
        assert_eq!(None, row.subject_common_name);
        assert_eq!(None, row.not_before);
        assert!(row.subject_alternative_names.is_empty());
        assert_eq!(
            1_700_000_000_123,
            row.entry_timestamp.timestamp_millis()
        );
    }

    #[test]
    fn precert_rows_use_the_tbs_hash_for_both_hashes() {
        let hash = [0x11u8; ISSUER_KEY_HASH_LEN];
        let tbs = b"fake-tbs".to_vec();
        let leaf = encode_precert_leaf(1_600_000_000_000, &hash, &tbs);
        let raw = raw_entry(&leaf);

        let row = parse_log_entry(&raw, "log", 5).unwrap();
        assert_eq!(PRECERT_ENTRY_TYPE, row.entry_type);
        let expected = hex::encode(Sha256::digest(&tbs));
        assert_eq!(expected, row.certificate_sha256);
        assert_eq!(Some(expected), row.tbs_certificate_sha256);
        assert_eq!(Some(hex::encode(hash)), row.precert_issuer_key_hash);
        assert!(!row.precert_poison_present);
    }

    #[test]
    fn invalid_base64_is_an_error() {
        let raw = RawCtEntry {
            leaf_input: "!!!not-base64!!!".to_string(),
            extra_data: String::new(),
        };
        let error = parse_log_entry(&raw, "log", 0).unwrap_err();
        assert!(matches!(error, EntryError::DecodeLeaf { .. }));
    }

    #[test]
    fn garbage_leaf_bytes_are_an_error() {
        let raw = RawCtEntry {
            leaf_input: BASE64.encode([0u8; 3]),
            extra_data: String::new(),
        };
        let error = parse_log_entry(&raw, "log", 0).unwrap_err();
        assert!(matches!(error, EntryError::Leaf { .. }));
    }

    #[test]
    fn reparsing_yields_identical_identifier_fields() {
        let der = b"certificate-bytes".to_vec();
        let leaf = encode_x509_leaf(1_700_000_000_000, &der);
        let raw = raw_entry(&leaf);

        let first = parse_log_entry(&raw, "log", 12).unwrap();
        let second = parse_log_entry(&raw, "log", 12).unwrap();
        assert_eq!(first.certificate_sha256, second.certificate_sha256);
        assert_eq!(first.entry_timestamp, second.entry_timestamp);
        assert_eq!(first.raw_leaf_certificate_der, second.raw_leaf_certificate_der);
    }
}
