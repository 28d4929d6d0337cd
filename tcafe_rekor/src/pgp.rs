//! PGP public-key block parsing for rekord entries.
//!
//! This is a narrow reader, not a full RFC 4880 implementation: it walks the
//! packet stream far enough to recover the primary key's identity, the
//! signer user id, and subkey fingerprints.
//!
//! The fingerprint is SHA-256 over `0x99 || u16be(len) || packet`, not the
//! RFC's SHA-1 over the same bytes. The store already holds rows keyed this
//! way, so the formula must stay bit-for-bit.

use std::sync::LazyLock;

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use snafu::Snafu;
use tracing::warn;

/// Armor bodies in the wild mix padded and unpadded base64; the checksum
/// line is stripped before decoding, which can leave either form.
static ARMOR_BASE64: LazyLock<GeneralPurpose> = LazyLock::new(|| {
    GeneralPurpose::new(
        &alphabet::STANDARD,
        GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
    )
});

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^>]+)>").expect("valid email regex"));
static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^<(]+)").expect("valid name regex"));

const PACKET_PUBLIC_KEY: u8 = 6;
const PACKET_USER_ID: u8 = 13;
const PACKET_PUBLIC_SUBKEY: u8 = 14;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PgpError {
    #[snafu(display("input is not an armored PGP public key block"))]
    NotArmored,
    #[snafu(display("no base64 data found in armor"))]
    EmptyArmor,
    #[snafu(display("failed to decode armor base64"))]
    DecodeArmor { source: base64::DecodeError },
    #[snafu(display("truncated packet: {context}"))]
    Truncated { context: &'static str },
    #[snafu(display("invalid packet header byte {header:#04x}"))]
    InvalidHeader { header: u8 },
    #[snafu(display("unsupported key version {version}"))]
    UnsupportedKeyVersion { version: u8 },
}

pub type Result<T, E = PgpError> = std::result::Result<T, E>;

/// What the Rekor row keeps from a public key block.
#[derive(Debug, Clone, Default)]
pub struct PgpKeySummary {
    pub fingerprint: String,
    pub key_id: String,
    pub algorithm: String,
    pub key_size: u32,
    pub subkey_fingerprints: Vec<String>,
    pub signer_user_id: Option<String>,
    pub signer_name: Option<String>,
    pub signer_email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PublicKeyPacket {
    pub fingerprint: String,
    pub key_id: String,
    pub algorithm: String,
    pub key_size: u32,
    pub created_at: DateTime<Utc>,
}

enum Packet {
    PublicKey(PublicKeyPacket),
    UserId(String),
    Other,
}

/// Parse an ASCII-armored public key block into a key summary.
pub fn parse_armored_public_key(armored: &str) -> Result<PgpKeySummary> {
    if !armored.contains("-----BEGIN PGP PUBLIC KEY BLOCK-----") {
        return NotArmoredSnafu.fail();
    }
    let packets = decode_armor(armored)?;
    Ok(parse_packets(&packets))
}

/// Strip armor framing and decode the base64 body.
///
/// Header lines (anything with a `:`), the `-----` markers and the
/// `=`-prefixed checksum line are dropped.
pub fn decode_armor(armored: &str) -> Result<Vec<u8>> {
    let mut body = String::new();
    let mut in_data = false;

    for line in armored.lines() {
        let line = line.trim();
        if line.starts_with("-----BEGIN PGP") {
            in_data = true;
            continue;
        }
        if line.starts_with("-----END PGP") {
            break;
        }
        if !in_data || line.is_empty() || line.contains(':') || line.starts_with('=') {
            continue;
        }
        body.push_str(line);
    }

    if body.is_empty() {
        return EmptyArmorSnafu.fail();
    }

    ARMOR_BASE64
        .decode(&body)
        .map_err(|source| PgpError::DecodeArmor { source })
}

/// Walk a binary packet stream. A framing error ends the walk; whatever was
/// recovered up to that point is kept.
pub fn parse_packets(data: &[u8]) -> PgpKeySummary {
    let mut summary = PgpKeySummary::default();
    let mut primary: Option<PublicKeyPacket> = None;
    let mut user_ids: Vec<String> = Vec::new();

    let mut offset = 0usize;
    while offset < data.len() {
        let (packet, consumed) = match parse_packet(&data[offset..]) {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(offset, error = %error, "stopping PGP packet walk");
                break;
            }
        };

        match packet {
            Packet::PublicKey(key) => {
                if primary.is_none() {
                    primary = Some(key);
                } else {
                    summary.subkey_fingerprints.push(key.fingerprint);
                }
            }
            Packet::UserId(user_id) => user_ids.push(user_id),
            Packet::Other => {}
        }

        offset += consumed;
    }

    if let Some(primary) = primary {
        summary.fingerprint = primary.fingerprint;
        summary.key_id = primary.key_id;
        summary.algorithm = primary.algorithm;
        summary.key_size = primary.key_size;
    }

    if let Some(user_id) = user_ids.into_iter().next() {
        let (email, name) = split_user_id(&user_id);
        summary.signer_user_id = Some(user_id);
        summary.signer_email = email;
        summary.signer_name = name;
    }

    summary
}

/// Parse one packet; returns the parsed form and the total bytes consumed.
fn parse_packet(data: &[u8]) -> Result<(Packet, usize)> {
    let header = *data.first().ok_or(PgpError::Truncated {
        context: "packet header",
    })?;
    if header & 0x80 == 0 {
        return InvalidHeaderSnafu { header }.fail();
    }

    let new_format = header & 0x40 != 0;
    let packet_type;
    let body_len;
    let header_len;

    if new_format {
        packet_type = header & 0x3f;
        let length_byte = *data.get(1).ok_or(PgpError::Truncated {
            context: "new-format length",
        })?;
        if length_byte < 192 {
            body_len = length_byte as usize;
            header_len = 2;
        } else if length_byte < 224 {
            let second = *data.get(2).ok_or(PgpError::Truncated {
                context: "two-byte length",
            })?;
            body_len = ((length_byte as usize - 192) << 8) + second as usize + 192;
            header_len = 3;
        } else {
            // Partial body length, treated as a single span. Multi-part
            // partial bodies are therefore truncated; see the module docs.
            body_len = 1usize << (length_byte & 0x1f);
            header_len = 2;
        }
    } else {
        packet_type = (header & 0x3c) >> 2;
        let length_type = header & 0x03;
        match length_type {
            0 => {
                body_len = *data.get(1).ok_or(PgpError::Truncated {
                    context: "one-byte length",
                })? as usize;
                header_len = 2;
            }
            1 => {
                if data.len() < 3 {
                    return TruncatedSnafu {
                        context: "two-byte length",
                    }
                    .fail();
                }
                body_len = u16::from_be_bytes([data[1], data[2]]) as usize;
                header_len = 3;
            }
            2 => {
                if data.len() < 5 {
                    return TruncatedSnafu {
                        context: "four-byte length",
                    }
                    .fail();
                }
                body_len = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
                header_len = 5;
            }
            _ => {
                // Indeterminate length: the packet runs to the end.
                body_len = data.len() - 1;
                header_len = 1;
            }
        }
    }

    let total_len = header_len + body_len;
    if total_len > data.len() {
        return TruncatedSnafu {
            context: "packet body",
        }
        .fail();
    }

    let body = &data[header_len..total_len];

    let packet = match packet_type {
        PACKET_PUBLIC_KEY | PACKET_PUBLIC_SUBKEY => {
            Packet::PublicKey(parse_public_key_packet(body)?)
        }
        PACKET_USER_ID => {
            if body.is_empty() {
                return TruncatedSnafu {
                    context: "user id packet",
                }
                .fail();
            }
            Packet::UserId(String::from_utf8_lossy(body).into_owned())
        }
        _ => Packet::Other,
    };

    Ok((packet, total_len))
}

/// Parse a version-4 public key (or subkey) packet body.
pub fn parse_public_key_packet(body: &[u8]) -> Result<PublicKeyPacket> {
    if body.len() < 6 {
        return TruncatedSnafu {
            context: "public key packet",
        }
        .fail();
    }

    let version = body[0];
    if version != 4 {
        return UnsupportedKeyVersionSnafu { version }.fail();
    }

    let created = u32::from_be_bytes([body[1], body[2], body[3], body[4]]);
    let algorithm_id = body[5];

    let (algorithm, key_size) = match algorithm_id {
        1 => {
            // RSA: the next MPI's 16-bit length is the modulus size in bits.
            if body.len() < 8 {
                return TruncatedSnafu {
                    context: "RSA modulus length",
                }
                .fail();
            }
            ("RSA".to_string(), u16::from_be_bytes([body[6], body[7]]) as u32)
        }
        17 => {
            if body.len() < 8 {
                return TruncatedSnafu {
                    context: "DSA prime length",
                }
                .fail();
            }
            ("DSA".to_string(), u16::from_be_bytes([body[6], body[7]]) as u32)
        }
        18 => ("ECDH".to_string(), 256),
        19 => ("ECDSA".to_string(), 256),
        22 => ("EdDSA".to_string(), 256),
        other => (format!("Unknown({other})"), 0),
    };

    let fingerprint = fingerprint(body);
    let key_id = fingerprint[fingerprint.len() - 16..].to_string();

    Ok(PublicKeyPacket {
        fingerprint,
        key_id,
        algorithm,
        key_size,
        created_at: DateTime::from_timestamp(created as i64, 0).unwrap_or_default(),
    })
}

/// SHA-256 over `0x99 || u16be(len) || packet` (see the module docs).
pub fn fingerprint(packet: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update([0x99]);
    hasher.update((packet.len() as u16).to_be_bytes());
    hasher.update(packet);
    hex::encode(hasher.finalize())
}

/// Split `"Name (Comment) <email@host>"` into (email, name).
pub fn split_user_id(user_id: &str) -> (Option<String>, Option<String>) {
    let email = EMAIL_RE
        .captures(user_id)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string());

    let name = NAME_RE
        .captures(user_id)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|name| !name.is_empty());

    (email, name)
}


#[cfg(test)]
mod tests {
    use super::test_encoding::*;
    use super::*;

    fn devuan_style_key() -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend(old_format_packet(6, &rsa_key_body(1_460_000_000, 4096)));
        stream.extend(new_format_packet(
            13,
            b"Devuan Repository <repository@devuan.org>",
        ));
        stream.extend(old_format_packet(14, &rsa_key_body(1_460_000_100, 4096)));
        stream
    }

    #[test]
    fn parses_a_full_key_block() {
        let stream = devuan_style_key();
        let summary = parse_packets(&stream);

        assert_eq!("RSA", summary.algorithm);
        assert_eq!(4096, summary.key_size);
        assert_eq!(64, summary.fingerprint.len());
        assert_eq!(16, summary.key_id.len());
        assert_eq!(1, summary.subkey_fingerprints.len());
        assert_ne!(summary.fingerprint, summary.subkey_fingerprints[0]);
        assert_eq!(
            Some("repository@devuan.org".to_string()),
            summary.signer_email
        );
        assert_eq!(Some("Devuan Repository".to_string()), summary.signer_name);
        assert_eq!(
            Some("Devuan Repository <repository@devuan.org>".to_string()),
            summary.signer_user_id
        );
    }

    #[test]
    fn armor_round_trip() {
        let stream = devuan_style_key();
        let armored = armor(&stream);

        let decoded = decode_armor(&armored).unwrap();
        assert_eq!(stream, decoded);

        let summary = parse_armored_public_key(&armored).unwrap();
        assert_eq!(Some("repository@devuan.org".to_string()), summary.signer_email);
        assert!(summary.subkey_fingerprints.len() >= 1);
    }

    #[test]
    fn fingerprint_formula_is_stable() {
        // sha256(0x99 || u16be(3) || "abc")
        let expected = {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update([0x99, 0x00, 0x03]);
            hasher.update(b"abc");
            hex::encode(hasher.finalize())
        };
        assert_eq!(expected, fingerprint(b"abc"));
    }

    #[test]
    fn key_id_is_the_fingerprint_tail() {
        let body = rsa_key_body(1_600_000_000, 2048);
        let key = parse_public_key_packet(&body).unwrap();
        assert_eq!(key.fingerprint[48..], key.key_id);
        assert_eq!(2048, key.key_size);
        assert_eq!("RSA", key.algorithm);
        assert_eq!(1_600_000_000, key.created_at.timestamp());
    }

    #[test]
    fn eddsa_keys_default_to_256_bits() {
        let mut body = vec![4u8];
        body.extend_from_slice(&1_650_000_000u32.to_be_bytes());
        body.push(22);
        let key = parse_public_key_packet(&body).unwrap();
        assert_eq!("EdDSA", key.algorithm);
        assert_eq!(256, key.key_size);
    }

    #[test]
    fn unknown_algorithms_are_labeled() {
        let mut body = vec![4u8];
        body.extend_from_slice(&1u32.to_be_bytes());
        body.push(99);
        let key = parse_public_key_packet(&body).unwrap();
        assert_eq!("Unknown(99)", key.algorithm);
        assert_eq!(0, key.key_size);
    }

    #[test]
    fn version_3_keys_are_rejected() {
        let mut body = vec![3u8];
        body.extend_from_slice(&[0u8; 5]);
        assert!(matches!(
            parse_public_key_packet(&body),
            Err(PgpError::UnsupportedKeyVersion { version: 3 })
        ));
    }

    #[test]
    fn framing_error_keeps_the_prefix() {
        let mut stream = devuan_style_key();
        // A byte without the marker bit set stops the walk.
        stream.push(0x00);
        let summary = parse_packets(&stream);
        assert_eq!("RSA", summary.algorithm);
        assert_eq!(1, summary.subkey_fingerprints.len());
    }

    #[test]
    fn user_id_splitting() {
        let (email, name) = split_user_id("Alice Example (work) <alice@example.com>");
        assert_eq!(Some("alice@example.com".to_string()), email);
        assert_eq!(Some("Alice Example".to_string()), name);

        let (email, name) = split_user_id("<bare@example.com>");
        assert_eq!(Some("bare@example.com".to_string()), email);
        assert_eq!(None, name);

        let (email, name) = split_user_id("Only A Name");
        assert_eq!(None, email);
        assert_eq!(Some("Only A Name".to_string()), name);
    }

    #[test]
    fn non_armored_input_is_rejected() {
        assert!(matches!(
            parse_armored_public_key("just text"),
            Err(PgpError::NotArmored)
        ));
    }

    #[test]
    fn armor_without_body_is_rejected() {
        let armored =
            "-----BEGIN PGP PUBLIC KEY BLOCK-----\n-----END PGP PUBLIC KEY BLOCK-----\n";
        assert!(matches!(decode_armor(armored), Err(PgpError::EmptyArmor)));
    }

    #[test]
    fn new_format_two_byte_length_round_trips() {
        // Body of 300 bytes forces the two-byte length form.
        let body: Vec<u8> = {
            let mut b = vec![4u8];
            b.extend_from_slice(&1u32.to_be_bytes());
            b.push(1);
            b.extend_from_slice(&2048u16.to_be_bytes());
            b.resize(300, 0xbb);
            b
        };
        let mut packet = vec![0xc0 | 6];
        let adjusted = body.len() - 192;
        packet.push(192 + (adjusted >> 8) as u8);
        packet.push((adjusted & 0xff) as u8);
        packet.extend_from_slice(&body);

        let summary = parse_packets(&packet);
        assert_eq!("RSA", summary.algorithm);
        assert_eq!(2048, summary.key_size);
    }
}
