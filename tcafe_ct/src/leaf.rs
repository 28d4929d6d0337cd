//! RFC 6962 `MerkleTreeLeaf` / `TimestampedEntry` wire parsing.

use snafu::{ResultExt, Snafu};
use tracing::warn;

use crate::wire::{WireError, WireReader};

pub const V1: u8 = 0;
pub const TIMESTAMPED_ENTRY_LEAF_TYPE: u8 = 0;
pub const ISSUER_KEY_HASH_LEN: usize = 32;

const X509_ENTRY: u16 = 0;
const PRECERT_ENTRY: u16 = 1;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LeafError {
    #[snafu(display("malformed leaf encoding"))]
    Wire { source: WireError },
    #[snafu(display("unknown MerkleTreeLeaf version {version}"))]
    UnknownVersion { version: u8 },
    #[snafu(display("unknown MerkleTreeLeaf type {leaf_type}"))]
    UnknownLeafType { leaf_type: u8 },
    #[snafu(display("unknown TimestampedEntry type {entry_type}"))]
    UnknownEntryType { entry_type: u16 },
}

pub type Result<T, E = LeafError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafBody {
    /// DER of the end certificate.
    X509Certificate(Vec<u8>),
    /// TBS of the precertificate plus the issuer key hash bound in the leaf.
    Precert {
        issuer_key_hash: [u8; ISSUER_KEY_HASH_LEN],
        tbs_certificate: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedEntry {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub body: LeafBody,
    pub extensions: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTreeLeaf {
    pub version: u8,
    pub leaf_type: u8,
    pub entry: TimestampedEntry,
}

/// Parse a decoded `leaf_input`.
///
/// Some logs hand out a bare `TimestampedEntry` instead of the standard
/// `MerkleTreeLeaf` wrapper; when the wrapped parse fails structurally the
/// bare form is tried, a warning is logged, and V1 wrapper metadata is
/// synthesized.
pub fn parse_merkle_tree_leaf(input: &[u8], log_index: u64) -> Result<MerkleTreeLeaf> {
    match parse_wrapped(input) {
        Ok(leaf) => {
            if leaf.version != V1 {
                return UnknownVersionSnafu {
                    version: leaf.version,
                }
                .fail();
            }
            if leaf.leaf_type != TIMESTAMPED_ENTRY_LEAF_TYPE {
                return UnknownLeafTypeSnafu {
                    leaf_type: leaf.leaf_type,
                }
                .fail();
            }
            Ok(leaf)
        }
        Err(wrapped_error) => match parse_timestamped_entry(&mut WireReader::new(input)) {
            Ok(entry) => {
                warn!(
                    log_index,
                    "leaf_input parsed as a bare TimestampedEntry, assuming a V1 MerkleTreeLeaf wrapper"
                );
                Ok(MerkleTreeLeaf {
                    version: V1,
                    leaf_type: TIMESTAMPED_ENTRY_LEAF_TYPE,
                    entry,
                })
            }
            Err(_) => Err(wrapped_error),
        },
    }
}

fn parse_wrapped(input: &[u8]) -> Result<MerkleTreeLeaf> {
    let mut reader = WireReader::new(input);
    let version = reader.read_u8("version").context(WireSnafu)?;
    let leaf_type = reader.read_u8("leaf_type").context(WireSnafu)?;
    let entry = parse_timestamped_entry(&mut reader)?;

    Ok(MerkleTreeLeaf {
        version,
        leaf_type,
        entry,
    })
}

fn parse_timestamped_entry(reader: &mut WireReader<'_>) -> Result<TimestampedEntry> {
    let timestamp_ms = reader.read_u64("timestamp").context(WireSnafu)?;
    let entry_type = reader.read_u16("entry_type").context(WireSnafu)?;

    let body = match entry_type {
        X509_ENTRY => {
            let certificate = reader.read_u24_prefixed("certificate").context(WireSnafu)?;
            LeafBody::X509Certificate(certificate.to_vec())
        }
        PRECERT_ENTRY => {
            let hash_bytes = reader
                .read_bytes(ISSUER_KEY_HASH_LEN, "issuer_key_hash")
                .context(WireSnafu)?;
            let mut issuer_key_hash = [0u8; ISSUER_KEY_HASH_LEN];
            issuer_key_hash.copy_from_slice(hash_bytes);
            let tbs = reader
                .read_u24_prefixed("tbs_certificate")
                .context(WireSnafu)?;
            LeafBody::Precert {
                issuer_key_hash,
                tbs_certificate: tbs.to_vec(),
            }
        }
        entry_type => return UnknownEntryTypeSnafu { entry_type }.fail(),
    };

    let extensions = reader.read_u16_prefixed("extensions").context(WireSnafu)?;

    Ok(TimestampedEntry {
        timestamp_ms,
        body,
        extensions: extensions.to_vec(),
    })
}

#[cfg(test)]
pub(crate) mod test_encoding {
    use super::*;

    /// Encode a V1 x509_entry leaf for tests.
    pub fn encode_x509_leaf(timestamp_ms: u64, der: &[u8]) -> Vec<u8> {
        let mut out = vec![V1, TIMESTAMPED_ENTRY_LEAF_TYPE];
        out.extend_from_slice(&timestamp_ms.to_be_bytes());
        out.extend_from_slice(&X509_ENTRY.to_be_bytes());
        out.extend_from_slice(&u24_be(der.len()));
        out.extend_from_slice(der);
        out.extend_from_slice(&0u16.to_be_bytes());
        out
    }

    /// Encode a V1 precert_entry leaf for tests.
    pub fn encode_precert_leaf(
        timestamp_ms: u64,
        issuer_key_hash: &[u8; ISSUER_KEY_HASH_LEN],
        tbs: &[u8],
    ) -> Vec<u8> {
        let mut out = vec![V1, TIMESTAMPED_ENTRY_LEAF_TYPE];
        out.extend_from_slice(&timestamp_ms.to_be_bytes());
        out.extend_from_slice(&PRECERT_ENTRY.to_be_bytes());
        out.extend_from_slice(issuer_key_hash);
        out.extend_from_slice(&u24_be(tbs.len()));
        out.extend_from_slice(tbs);
        out.extend_from_slice(&0u16.to_be_bytes());
        out
    }

    pub fn u24_be(len: usize) -> [u8; 3] {
        let bytes = (len as u32).to_be_bytes();
        [bytes[1], bytes[2], bytes[3]]
    }
}

#[cfg(test)]
mod tests {
    use super::test_encoding::*;
    use super::*;

    #[test]
    fn parses_an_x509_leaf() {
        let der = b"fake-der-bytes".to_vec();
        let encoded = encode_x509_leaf(1_700_000_000_123, &der);

        let leaf = parse_merkle_tree_leaf(&encoded, 7).unwrap();
        assert_eq!(V1, leaf.version);
        assert_eq!(1_700_000_000_123, leaf.entry.timestamp_ms);
        assert_eq!(LeafBody::X509Certificate(der), leaf.entry.body);
        assert!(leaf.entry.extensions.is_empty());
    }

    #[test]
    fn parses_a_precert_leaf() {
        let hash = [0xabu8; ISSUER_KEY_HASH_LEN];
        let tbs = b"fake-tbs".to_vec();
        let encoded = encode_precert_leaf(1_650_000_000_000, &hash, &tbs);

        let leaf = parse_merkle_tree_leaf(&encoded, 0).unwrap();
        match leaf.entry.body {
            LeafBody::Precert {
                issuer_key_hash,
                tbs_certificate,
            } => {
                assert_eq!(hash, issuer_key_hash);
                assert_eq!(tbs, tbs_certificate);
            }
            other => panic!("expected precert body, got {other:?}"),
        }
    }

    #[test]
    fn accepts_a_bare_timestamped_entry() {
        let der = b"fake-der".to_vec();
        let full = encode_x509_leaf(42, &der);
        // Strip the two-byte MerkleTreeLeaf wrapper.
        let bare = &full[2..];

        let leaf = parse_merkle_tree_leaf(bare, 9).unwrap();
        assert_eq!(V1, leaf.version);
        assert_eq!(TIMESTAMPED_ENTRY_LEAF_TYPE, leaf.leaf_type);
        assert_eq!(42, leaf.entry.timestamp_ms);
        assert_eq!(LeafBody::X509Certificate(der), leaf.entry.body);
    }

    #[test]
    fn rejects_unknown_versions() {
        let mut encoded = encode_x509_leaf(42, b"der");
        encoded[0] = 2;
        let error = parse_merkle_tree_leaf(&encoded, 0).unwrap_err();
        assert!(matches!(error, LeafError::UnknownVersion { version: 2 }));
    }

    #[test]
    fn rejects_unknown_leaf_types() {
        let mut encoded = encode_x509_leaf(42, b"der");
        encoded[1] = 9;
        let error = parse_merkle_tree_leaf(&encoded, 0).unwrap_err();
        assert!(matches!(error, LeafError::UnknownLeafType { leaf_type: 9 }));
    }

    #[test]
    fn rejects_garbage() {
        let error = parse_merkle_tree_leaf(&[0x00], 0).unwrap_err();
        assert!(matches!(error, LeafError::Wire { .. }));
    }
}
