// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Branch identity and the opaque branch token.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{decode_page_token, encode_page_token};
use crate::error::Result;

/// A contiguous slice of an ancestor branch that a descendant inherits.
///
/// `[begin_node_id, end_node_id)`. The end bound is exclusive and equals the
/// fork point of the next range (or of the owning branch itself).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRange {
    /// The ancestor branch contributing these nodes.
    pub branch_id: String,
    /// First node id inherited from this ancestor. Inclusive.
    pub begin_node_id: i64,
    /// First node id NOT inherited from this ancestor. Exclusive.
    pub end_node_id: i64,
}

/// Identity of one branch within a history tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    /// The tree this branch belongs to (one tree per workflow run family).
    pub tree_id: String,
    /// This branch's own id.
    pub branch_id: String,
    /// Ancestor ranges, ordered root-first. Empty for a root branch.
    pub ancestors: Vec<BranchRange>,
}

impl BranchInfo {
    /// Create a fresh root branch in a new tree.
    pub fn new_root() -> Self {
        Self {
            tree_id: Uuid::new_v4().to_string(),
            branch_id: Uuid::new_v4().to_string(),
            ancestors: Vec::new(),
        }
    }

    /// Encode this branch into an opaque token.
    ///
    /// The token is versioned by the codec; stores treat it as raw bytes.
    pub fn to_token(&self) -> Result<Vec<u8>> {
        encode_page_token(self)
    }

    /// Decode a token produced by [`BranchInfo::to_token`].
    pub fn from_token(token: &[u8]) -> Result<Self> {
        decode_page_token(token)
    }

    /// The branch that owns `node_id`: the terminal branch id when the node
    /// is at or past the last fork point, otherwise the ancestor whose range
    /// covers it.
    pub fn branch_for_node(&self, node_id: i64) -> &str {
        for range in &self.ancestors {
            if node_id >= range.begin_node_id && node_id < range.end_node_id {
                return &range.branch_id;
            }
        }
        &self.branch_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_token_round_trip() {
        let info = BranchInfo {
            tree_id: "tree-1".to_string(),
            branch_id: "branch-2".to_string(),
            ancestors: vec![BranchRange {
                branch_id: "branch-1".to_string(),
                begin_node_id: 1,
                end_node_id: 5,
            }],
        };
        let token = info.to_token().expect("encode");
        let back = BranchInfo::from_token(&token).expect("decode");
        assert_eq!(back, info);
    }

    #[test]
    fn test_branch_for_node_walks_ancestors() {
        let info = BranchInfo {
            tree_id: "t".to_string(),
            branch_id: "leaf".to_string(),
            ancestors: vec![
                BranchRange {
                    branch_id: "root".to_string(),
                    begin_node_id: 1,
                    end_node_id: 4,
                },
                BranchRange {
                    branch_id: "mid".to_string(),
                    begin_node_id: 4,
                    end_node_id: 9,
                },
            ],
        };
        assert_eq!(info.branch_for_node(1), "root");
        assert_eq!(info.branch_for_node(3), "root");
        assert_eq!(info.branch_for_node(4), "mid");
        assert_eq!(info.branch_for_node(9), "leaf");
        assert_eq!(info.branch_for_node(100), "leaf");
    }
}
