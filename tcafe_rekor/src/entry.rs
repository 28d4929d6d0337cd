use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use clickhouse::Row;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};
use tracing::warn;

use crate::{
    checkpoint::{CheckpointError, validate_checkpoint_tree_id},
    pgp,
    types::{EntryBody, RekorLogEntry},
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RekorEntryError {
    /// The API contract guarantees verification data; its absence means the
    /// response cannot be trusted at all.
    #[snafu(display("entry {uuid} at global index {log_index} has no verification"))]
    MissingVerification { uuid: String, log_index: u64 },
    #[snafu(display("entry {uuid} at global index {log_index} has no inclusion proof"))]
    MissingInclusionProof { uuid: String, log_index: u64 },
    /// The row's checkpoint names a different tree than the one announced.
    #[snafu(display("checkpoint validation failed for entry {uuid} at global index {log_index}"))]
    Checkpoint {
        uuid: String,
        log_index: u64,
        source: CheckpointError,
    },
}

pub type Result<T, E = RekorEntryError> = std::result::Result<T, E>;

pub const HASHEDREKORD_KIND: &str = "hashedrekord";
pub const REKORD_KIND: &str = "rekord";

/// One parsed Rekor entry, laid out as the `rekor_log_entries` columns.
///
/// `log_index` is the tree-local index from the inclusion proof, not the
/// global one used on the wire: re-mirroring stays idempotent when the
/// inactive-shard set changes.
#[derive(Debug, Clone, Row, Serialize)]
pub struct RekorRow {
    pub tree_id: String,
    pub log_index: u64,
    pub entry_uuid: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub retrieval_timestamp: DateTime<Utc>,
    pub body: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::secs")]
    pub integrated_time: DateTime<Utc>,
    pub log_id: String,
    pub kind: String,
    pub api_version: String,
    pub signature_format: Option<String>,
    pub data_hash_algorithm: Option<String>,
    pub data_hash_value: Option<String>,
    pub data_url: Option<String>,
    pub signature_url: Option<String>,
    pub public_key_url: Option<String>,
    pub signed_entry_timestamp: Option<String>,
    pub x509_certificate_sha256: Option<String>,
    pub x509_subject_dn: Option<String>,
    pub x509_subject_cn: Option<String>,
    pub x509_subject_organization: Vec<String>,
    pub x509_subject_ou: Vec<String>,
    pub x509_subject_country: Vec<String>,
    pub x509_subject_locality: Vec<String>,
    pub x509_subject_province: Vec<String>,
    pub x509_issuer_dn: Option<String>,
    pub x509_issuer_cn: Option<String>,
    pub x509_issuer_organization: Vec<String>,
    pub x509_issuer_ou: Vec<String>,
    pub x509_issuer_country: Vec<String>,
    pub x509_issuer_locality: Vec<String>,
    pub x509_issuer_province: Vec<String>,
    pub x509_serial_number: Option<String>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis::option")]
    pub x509_not_before: Option<DateTime<Utc>>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis::option")]
    pub x509_not_after: Option<DateTime<Utc>>,
    pub x509_sans: Vec<String>,
    pub x509_signature_algorithm: Option<String>,
    pub x509_public_key_algorithm: Option<String>,
    pub x509_public_key_size: Option<u32>,
    pub x509_is_ca: bool,
    pub x509_key_usage: Vec<String>,
    pub x509_extended_key_usage: Vec<String>,
    /// JSON object mapping OID to `{critical, value}` (value base64).
    pub x509_extensions: Option<String>,
    pub pgp_signature_hash: Option<String>,
    pub pgp_public_key_fingerprint: Option<String>,
    pub pgp_key_id: Option<String>,
    pub pgp_signer_user_id: Option<String>,
    pub pgp_signer_email: Option<String>,
    pub pgp_signer_name: Option<String>,
    pub pgp_key_algorithm: Option<String>,
    pub pgp_key_size: Option<u32>,
    pub pgp_subkey_fingerprints: Vec<String>,
}

/// Parse one retrieved entry into a row.
///
/// The only fatal conditions are a missing verification envelope and a
/// checkpoint naming the wrong tree; those unwind the whole fetch loop. A
/// body that fails to decode still yields a row carrying the raw body and
/// common metadata.
pub fn parse_rekor_entry(
    uuid: &str,
    entry: &RekorLogEntry,
    expected_tree_id: &str,
) -> Result<RekorRow> {
    let verification = entry
        .verification
        .as_ref()
        .ok_or_else(|| RekorEntryError::MissingVerification {
            uuid: uuid.to_string(),
            log_index: entry.log_index,
        })?;
    let proof = verification.inclusion_proof.as_ref().ok_or_else(|| {
        RekorEntryError::MissingInclusionProof {
            uuid: uuid.to_string(),
            log_index: entry.log_index,
        }
    })?;

    validate_checkpoint_tree_id(&proof.checkpoint, expected_tree_id).context(CheckpointSnafu {
        uuid: uuid.to_string(),
        log_index: entry.log_index,
    })?;

    let mut row = empty_row(uuid, entry, expected_tree_id, proof.log_index);
    row.signed_entry_timestamp = optional(verification.signed_entry_timestamp.clone());

    match decode_entry_body(&entry.body) {
        Ok(body) => {
            row.kind = body.kind.clone();
            row.api_version = body.api_version.clone();
            extract_spec_fields(&body.spec, &mut row);

            match body.kind.as_str() {
                HASHEDREKORD_KIND => extract_x509_certificate(&body.spec, &mut row),
                REKORD_KIND => extract_pgp_signature(&body.spec, &mut row),
                _ => {}
            }
        }
        Err(error) => {
            warn!(
                uuid,
                global_index = entry.log_index,
                error = %error,
                "failed to decode entry body, emitting row with metadata only"
            );
        }
    }

    Ok(row)
}

fn empty_row(uuid: &str, entry: &RekorLogEntry, tree_id: &str, tree_local_index: u64) -> RekorRow {
    RekorRow {
        tree_id: tree_id.to_string(),
        log_index: tree_local_index,
        entry_uuid: uuid.to_string(),
        retrieval_timestamp: Utc::now(),
        body: entry.body.clone(),
        integrated_time: DateTime::from_timestamp(entry.integrated_time, 0).unwrap_or_default(),
        log_id: entry.log_id.clone(),
        kind: String::new(),
        api_version: String::new(),
        signature_format: None,
        data_hash_algorithm: None,
        data_hash_value: None,
        data_url: None,
        signature_url: None,
        public_key_url: None,
        signed_entry_timestamp: None,
        x509_certificate_sha256: None,
        x509_subject_dn: None,
        x509_subject_cn: None,
        x509_subject_organization: Vec::new(),
        x509_subject_ou: Vec::new(),
        x509_subject_country: Vec::new(),
        x509_subject_locality: Vec::new(),
        x509_subject_province: Vec::new(),
        x509_issuer_dn: None,
        x509_issuer_cn: None,
        x509_issuer_organization: Vec::new(),
        x509_issuer_ou: Vec::new(),
        x509_issuer_country: Vec::new(),
        x509_issuer_locality: Vec::new(),
        x509_issuer_province: Vec::new(),
        x509_serial_number: None,
        x509_not_before: None,
        x509_not_after: None,
        x509_sans: Vec::new(),
        x509_signature_algorithm: None,
        x509_public_key_algorithm: None,
        x509_public_key_size: None,
        x509_is_ca: false,
        x509_key_usage: Vec::new(),
        x509_extended_key_usage: Vec::new(),
        x509_extensions: None,
        pgp_signature_hash: None,
        pgp_public_key_fingerprint: None,
        pgp_key_id: None,
        pgp_signer_user_id: None,
        pgp_signer_email: None,
        pgp_signer_name: None,
        pgp_key_algorithm: None,
        pgp_key_size: None,
        pgp_subkey_fingerprints: Vec::new(),
    }
}

#[derive(Debug, Snafu)]
enum BodyError {
    #[snafu(display("base64: {source}"))]
    Decode { source: base64::DecodeError },
    #[snafu(display("json: {source}"))]
    Json { source: serde_json::Error },
}

fn decode_entry_body(body: &str) -> std::result::Result<EntryBody, BodyError> {
    let bytes = BASE64.decode(body).context(DecodeSnafu)?;
    serde_json::from_slice(&bytes).context(JsonSnafu)
}

fn extract_spec_fields(spec: &Value, row: &mut RekorRow) {
    row.signature_format = string_at(spec, "/signature/format");
    row.data_hash_algorithm = string_at(spec, "/data/hash/algorithm");
    row.data_hash_value = string_at(spec, "/data/hash/value");
    row.data_url = string_at(spec, "/data/url");
    row.signature_url = string_at(spec, "/signature/url");
    row.public_key_url = string_at(spec, "/signature/publicKey/url");
}

fn extract_x509_certificate(spec: &Value, row: &mut RekorRow) {
    let Some(content) = string_at(spec, "/signature/publicKey/content") else {
        return;
    };
    let Ok(pem_bytes) = BASE64.decode(&content) else {
        warn!("failed to base64 decode publicKey content");
        return;
    };

    let Ok((_, pem)) = x509_parser::pem::parse_x509_pem(&pem_bytes) else {
        // Plain public keys (non-certificate PEM, raw keys) carry no
        // certificate fields.
        return;
    };
    if pem.label != "CERTIFICATE" {
        return;
    }

    let summary = match tcafe_x509::summarize_certificate(&pem.contents) {
        Ok(summary) => summary,
        Err(error) => {
            warn!(error = %error, "failed to parse embedded x509 certificate");
            return;
        }
    };

    row.x509_certificate_sha256 = Some(summary.der_sha256.clone());
    row.x509_subject_dn = optional(summary.subject.distinguished_name.clone());
    row.x509_subject_cn = optional(summary.subject.common_name.clone());
    row.x509_subject_organization = summary.subject.organization.clone();
    row.x509_subject_ou = summary.subject.organizational_unit.clone();
    row.x509_subject_country = summary.subject.country.clone();
    row.x509_subject_locality = summary.subject.locality.clone();
    row.x509_subject_province = summary.subject.province.clone();
    row.x509_issuer_dn = optional(summary.issuer.distinguished_name.clone());
    row.x509_issuer_cn = optional(summary.issuer.common_name.clone());
    row.x509_issuer_organization = summary.issuer.organization.clone();
    row.x509_issuer_ou = summary.issuer.organizational_unit.clone();
    row.x509_issuer_country = summary.issuer.country.clone();
    row.x509_issuer_locality = summary.issuer.locality.clone();
    row.x509_issuer_province = summary.issuer.province.clone();
    // Decimal serial, matching the rows already stored for this table.
    row.x509_serial_number = optional(summary.serial_decimal.clone());
    row.x509_not_before = Some(summary.not_before);
    row.x509_not_after = Some(summary.not_after);
    row.x509_sans = summary.subject_alternative_names.clone();
    row.x509_signature_algorithm = optional(summary.signature_algorithm.clone());
    row.x509_public_key_algorithm = optional(summary.public_key_algorithm.clone());
    row.x509_public_key_size = optional_u32(summary.public_key_bits);
    row.x509_is_ca = summary.is_ca;
    row.x509_key_usage = summary.key_usage.clone();
    row.x509_extended_key_usage = summary.extended_key_usage.clone();
    row.x509_extensions = extensions_json(&summary.extensions);
}

fn extract_pgp_signature(spec: &Value, row: &mut RekorRow) {
    if string_at(spec, "/signature/format").as_deref() != Some("pgp") {
        return;
    }

    if let Some(content) = string_at(spec, "/signature/content") {
        match BASE64.decode(&content) {
            Ok(signature) => {
                row.pgp_signature_hash = Some(hex::encode(Sha256::digest(&signature)));
            }
            Err(error) => warn!(error = %error, "failed to decode PGP signature content"),
        }
    }

    let Some(content) = string_at(spec, "/signature/publicKey/content") else {
        return;
    };
    let Ok(key_bytes) = BASE64.decode(&content) else {
        warn!("failed to decode PGP public key content");
        return;
    };

    let armored = String::from_utf8_lossy(&key_bytes);
    match pgp::parse_armored_public_key(&armored) {
        Ok(key) => {
            row.pgp_public_key_fingerprint = optional(key.fingerprint);
            row.pgp_key_id = optional(key.key_id);
            row.pgp_key_algorithm = optional(key.algorithm);
            row.pgp_key_size = optional_u32(key.key_size);
            row.pgp_subkey_fingerprints = key.subkey_fingerprints;
            row.pgp_signer_user_id = key.signer_user_id;
            row.pgp_signer_email = key.signer_email;
            row.pgp_signer_name = key.signer_name;
        }
        Err(error) => warn!(error = %error, "failed to parse PGP public key"),
    }
}

fn extensions_json(extensions: &[tcafe_x509::ExtensionEntry]) -> Option<String> {
    if extensions.is_empty() {
        return None;
    }
    let mut map = serde_json::Map::new();
    for extension in extensions {
        map.insert(
            extension.oid.clone(),
            serde_json::json!({
                "critical": extension.critical,
                "value": extension.value_base64,
            }),
        );
    }
    serde_json::to_string(&map).ok()
}

fn string_at(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(String::from)
}

fn optional(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

fn optional_u32(value: u32) -> Option<u32> {
    if value == 0 { None } else { Some(value) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InclusionProof, Verification};

    const TREE_ID: &str = "1193050959916656506";
    const CHECKPOINT: &str = "rekor.sigstore.dev - 1193050959916656506\n100\nroot\n";

    fn entry_with_body(body_json: &str) -> RekorLogEntry {
        RekorLogEntry {
            log_id: "c0d23d6ad406973f".to_string(),
            log_index: 105,
            body: BASE64.encode(body_json),
            integrated_time: 1_689_000_000,
            verification: Some(Verification {
                inclusion_proof: Some(InclusionProof {
                    log_index: 5,
                    root_hash: "root".to_string(),
                    tree_size: 100,
                    hashes: Vec::new(),
                    checkpoint: CHECKPOINT.to_string(),
                }),
                signed_entry_timestamp: "MEUCIQ==".to_string(),
            }),
        }
    }

    #[test]
    fn rows_carry_the_tree_local_index() {
        let entry = entry_with_body(
            r#"{"apiVersion":"0.0.1","kind":"hashedrekord","spec":{
                "data":{"hash":{"algorithm":"sha256","value":"deadbeef"}},
                "signature":{"format":"x509"}
            }}"#,
        );

        let row = parse_rekor_entry("uuid-1", &entry, TREE_ID).unwrap();
        assert_eq!(TREE_ID, row.tree_id);
        // Global index 105 maps to tree-local index 5.
        assert_eq!(5, row.log_index);
        assert_eq!("hashedrekord", row.kind);
        assert_eq!("0.0.1", row.api_version);
        assert_eq!(Some("sha256".to_string()), row.data_hash_algorithm);
        assert_eq!(Some("deadbeef".to_string()), row.data_hash_value);
        assert_eq!(Some("x509".to_string()), row.signature_format);
        assert_eq!(1_689_000_000, row.integrated_time.timestamp());
        assert_eq!(Some("MEUCIQ==".to_string()), row.signed_entry_timestamp);
    }

    #[test]
    fn checkpoint_mismatch_is_fatal() {
        let mut entry = entry_with_body(r#"{"apiVersion":"0.0.1","kind":"rekord","spec":{}}"#);
        if let Some(verification) = entry.verification.as_mut() {
            if let Some(proof) = verification.inclusion_proof.as_mut() {
                proof.checkpoint = "rekor.sigstore.dev - T_OTHER\n100\nroot\n".to_string();
            }
        }

        let error = parse_rekor_entry("uuid-2", &entry, TREE_ID).unwrap_err();
        assert!(matches!(error, RekorEntryError::Checkpoint { .. }));
    }

    #[test]
    fn missing_verification_is_fatal() {
        let mut entry = entry_with_body(r#"{"kind":"rekord","spec":{}}"#);
        entry.verification = None;
        let error = parse_rekor_entry("uuid-3", &entry, TREE_ID).unwrap_err();
        assert!(matches!(error, RekorEntryError::MissingVerification { .. }));
    }

    #[test]
    fn undecodable_body_still_yields_a_row() {
        let mut entry = entry_with_body("{}");
        entry.body = "!!not-base64!!".to_string();

        let row = parse_rekor_entry("uuid-4", &entry, TREE_ID).unwrap();
        assert_eq!("!!not-base64!!", row.body);
        assert_eq!("", row.kind);
        assert_eq!(None, row.signature_format);
    }

    #[test]
    fn rekord_entries_extract_pgp_fields() {
        let key_stream = {
            use crate::pgp::test_encoding::*;
            let mut stream = Vec::new();
            stream.extend(old_format_packet(6, &rsa_key_body(1_460_000_000, 4096)));
            stream.extend(new_format_packet(
                13,
                b"Devuan Repository <repository@devuan.org>",
            ));
            stream.extend(old_format_packet(14, &rsa_key_body(1_460_000_100, 4096)));
            stream
        };
        let armored = crate::pgp::test_encoding::armor(&key_stream);

        let body = serde_json::json!({
            "apiVersion": "0.0.1",
            "kind": "rekord",
            "spec": {
                "data": {"hash": {"algorithm": "sha256", "value": "cafe"}},
                "signature": {
                    "format": "pgp",
                    "content": BASE64.encode(b"detached-signature"),
                    "publicKey": {"content": BASE64.encode(armored.as_bytes())}
                }
            }
        });
        let entry = entry_with_body(&body.to_string());

        let row = parse_rekor_entry("uuid-5", &entry, TREE_ID).unwrap();
        assert_eq!("rekord", row.kind);
        assert_eq!(
            Some(hex::encode(Sha256::digest(b"detached-signature"))),
            row.pgp_signature_hash
        );
        assert_eq!(Some("RSA".to_string()), row.pgp_key_algorithm);
        assert_eq!(Some(4096), row.pgp_key_size);
        assert_eq!(
            Some("repository@devuan.org".to_string()),
            row.pgp_signer_email
        );
        assert_eq!(1, row.pgp_subkey_fingerprints.len());
        assert!(row.pgp_public_key_fingerprint.is_some());
    }

    #[test]
    fn non_pgp_rekord_entries_keep_pgp_fields_empty() {
        let entry = entry_with_body(
            r#"{"apiVersion":"0.0.1","kind":"rekord","spec":{
                "signature":{"format":"minisign","content":"YWJj"}
            }}"#,
        );
        let row = parse_rekor_entry("uuid-6", &entry, TREE_ID).unwrap();
        assert_eq!(None, row.pgp_signature_hash);
        assert_eq!(None, row.pgp_public_key_fingerprint);
    }

    #[test]
    fn unknown_kinds_keep_only_common_metadata() {
        let entry = entry_with_body(
            r#"{"apiVersion":"0.0.1","kind":"intoto","spec":{"content":{"envelope":"x"}}}"#,
        );
        let row = parse_rekor_entry("uuid-7", &entry, TREE_ID).unwrap();
        assert_eq!("intoto", row.kind);
        assert_eq!(None, row.x509_certificate_sha256);
        assert_eq!(None, row.pgp_signature_hash);
    }

    #[test]
    fn hashedrekord_with_plain_public_key_has_no_x509_fields() {
        let body = serde_json::json!({
            "apiVersion": "0.0.1",
            "kind": "hashedrekord",
            "spec": {
                "data": {"hash": {"algorithm": "sha256", "value": "00"}},
                "signature": {
                    "format": "x509",
                    "publicKey": {"content": BASE64.encode(
                        b"-----BEGIN PUBLIC KEY-----\nMFkw\n-----END PUBLIC KEY-----\n"
                    )}
                }
            }
        });
        let entry = entry_with_body(&body.to_string());
        let row = parse_rekor_entry("uuid-8", &entry, TREE_ID).unwrap();
        assert_eq!(None, row.x509_certificate_sha256);
        assert_eq!(None, row.x509_subject_cn);
    }
}
