//! Checkpoint tree-identity enforcement.
//!
//! The first line of an inclusion-proof checkpoint names the log host and
//! the tree it commits to (`"rekor.sigstore.dev - 1193050959916656506"`).
//! Every stored row must come from the announced tree; a mismatch means the
//! index space has shifted under us and continuing would corrupt the mirror.

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CheckpointError {
    #[snafu(display("empty checkpoint"))]
    Empty,
    #[snafu(display("invalid checkpoint format: expected at least 3 lines, got {lines}"))]
    TooShort { lines: usize },
    #[snafu(display("invalid checkpoint first line: {line}"))]
    FirstLine { line: String },
    #[snafu(display("empty tree id in checkpoint"))]
    EmptyTreeId,
    #[snafu(display("checkpoint tree id mismatch: expected {expected}, got {found}"))]
    TreeIdMismatch { expected: String, found: String },
}

pub type Result<T, E = CheckpointError> = std::result::Result<T, E>;

/// Extract the tree id from a checkpoint's first line.
pub fn parse_checkpoint_tree_id(checkpoint: &str) -> Result<&str> {
    let trimmed = checkpoint.trim();
    let lines: Vec<&str> = trimmed.lines().collect();
    if lines.len() < 3 {
        return TooShortSnafu { lines: lines.len() }.fail();
    }

    let first = lines[0];
    let mut parts = first.splitn(2, " - ");
    let (Some(_host), Some(tree_id)) = (parts.next(), parts.next()) else {
        return FirstLineSnafu { line: first }.fail();
    };

    let tree_id = tree_id.trim();
    if tree_id.is_empty() {
        return EmptyTreeIdSnafu.fail();
    }

    Ok(tree_id)
}

/// Enforce that the checkpoint commits to the expected tree.
pub fn validate_checkpoint_tree_id(checkpoint: &str, expected: &str) -> Result<()> {
    if checkpoint.is_empty() {
        return EmptySnafu.fail();
    }

    let found = parse_checkpoint_tree_id(checkpoint)?;
    if found != expected {
        return TreeIdMismatchSnafu {
            expected: expected.to_string(),
            found: found.to_string(),
        }
        .fail();
    }

    Ok(())
}
