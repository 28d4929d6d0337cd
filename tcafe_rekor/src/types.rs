use serde::{Deserialize, Serialize};

/// `/api/v1/log` response: the active tree plus any frozen shards.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RekorLogInfo {
    pub root_hash: String,
    pub tree_size: u64,
    #[serde(default)]
    pub signed_tree_head: String,
    #[serde(rename = "treeID")]
    pub tree_id: String,
    #[serde(default)]
    pub inactive_shards: Vec<InactiveShard>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InactiveShard {
    #[serde(default)]
    pub root_hash: String,
    pub tree_size: u64,
    #[serde(default)]
    pub signed_tree_head: String,
    #[serde(rename = "treeID")]
    pub tree_id: String,
}

impl RekorLogInfo {
    /// Total leaf count across the active tree and every inactive shard;
    /// this is the space the global batch index addresses.
    pub fn total_log_size(&self) -> u64 {
        self.tree_size + self.inactive_shard_total()
    }

    /// Sum of the inactive shard sizes: the offset between a tree-local
    /// index on the active tree and its global index.
    pub fn inactive_shard_total(&self) -> u64 {
        self.inactive_shards.iter().map(|s| s.tree_size).sum()
    }

    pub fn global_index(&self, tree_local_index: u64) -> u64 {
        tree_local_index + self.inactive_shard_total()
    }
}

/// One entry as returned by `entries/retrieve`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RekorLogEntry {
    #[serde(rename = "logID", default)]
    pub log_id: String,
    /// Global index across all shards.
    pub log_index: u64,
    /// Base64 of the JSON entry body.
    pub body: String,
    /// Unix seconds.
    pub integrated_time: i64,
    pub verification: Option<Verification>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub inclusion_proof: Option<InclusionProof>,
    #[serde(default)]
    pub signed_entry_timestamp: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InclusionProof {
    /// Index local to the tree that holds the entry.
    pub log_index: u64,
    pub root_hash: String,
    pub tree_size: u64,
    #[serde(default)]
    pub hashes: Vec<String>,
    pub checkpoint: String,
}

/// Decoded entry body: `{apiVersion, kind, spec}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryBody {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub spec: serde_json::Value,
}

/// `entries/retrieve` request payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchLogQuery {
    pub log_indexes: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_index_adds_the_inactive_shard_sizes() {
        let info = RekorLogInfo {
            root_hash: String::new(),
            tree_size: 500,
            signed_tree_head: String::new(),
            tree_id: "T2".to_string(),
            inactive_shards: vec![
                InactiveShard {
                    root_hash: String::new(),
                    tree_size: 100,
                    signed_tree_head: String::new(),
                    tree_id: "T0".to_string(),
                },
                InactiveShard {
                    root_hash: String::new(),
                    tree_size: 25,
                    signed_tree_head: String::new(),
                    tree_id: "T1".to_string(),
                },
            ],
        };

        assert_eq!(625, info.total_log_size());
        assert_eq!(125, info.inactive_shard_total());
        assert_eq!(130, info.global_index(5));
    }

    #[test]
    fn log_info_deserializes_the_api_shape() {
        let body = r#"{
            "rootHash": "abcd",
            "treeSize": 42,
            "signedTreeHead": "sth",
            "treeID": "1193050959916656506",
            "inactiveShards": [
                {"rootHash": "ef", "treeSize": 10, "signedTreeHead": "s", "treeID": "T1"}
            ]
        }"#;

        let info: RekorLogInfo = serde_json::from_str(body).unwrap();
        assert_eq!("1193050959916656506", info.tree_id);
        assert_eq!(42, info.tree_size);
        assert_eq!(1, info.inactive_shards.len());
        assert_eq!(52, info.total_log_size());
    }

    #[test]
    fn entry_deserializes_with_verification() {
        let body = r#"{
            "logID": "c0d2",
            "logIndex": 105,
            "body": "e30=",
            "integratedTime": 1689000000,
            "verification": {
                "inclusionProof": {
                    "logIndex": 5,
                    "rootHash": "ab",
                    "treeSize": 500,
                    "hashes": [],
                    "checkpoint": "rekor.sigstore.dev - T2\n500\nabcd\n"
                },
                "signedEntryTimestamp": "MEUC"
            }
        }"#;

        let entry: RekorLogEntry = serde_json::from_str(body).unwrap();
        assert_eq!(105, entry.log_index);
        let proof = entry.verification.unwrap().inclusion_proof.unwrap();
        assert_eq!(5, proof.log_index);
        assert!(proof.checkpoint.starts_with("rekor.sigstore.dev"));
    }
}
