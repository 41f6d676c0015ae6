//! Decoding of raw stream frames into commit events.

use crate::error::{FeedError, Result};
use crate::types::{CommitEvent, CreateOp, DeleteOp, Operations, PostRecord, POST_COLLECTION};
use serde::Deserialize;
use serde_json::Value;

/// A frame as it arrives from the event source.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StreamFrame {
    Commit(CommitFrame),
    /// Identity, handle, info and any other non-commit frames.
    #[serde(other)]
    Other,
}

/// A repository commit.
#[derive(Debug, Deserialize)]
pub struct CommitFrame {
    pub seq: u64,
    pub repo: String,
    #[serde(default)]
    pub ops: Vec<RepoOp>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpAction {
    Create,
    Update,
    Delete,
}

/// One record operation within a commit.
#[derive(Debug, Deserialize)]
pub struct RepoOp {
    pub action: OpAction,
    /// `<collection>/<rkey>`.
    pub path: String,
    #[serde(default)]
    pub cid: Option<String>,
    #[serde(default)]
    pub record: Option<Value>,
}

impl RepoOp {
    fn collection(&self) -> Result<&str> {
        self.path
            .split_once('/')
            .map(|(collection, _)| collection)
            .ok_or_else(|| FeedError::Decode(format!("op path has no rkey: {}", self.path)))
    }
}

/// Decode a frame. Non-commit frames yield `None`.
pub fn decode_frame(bytes: &[u8]) -> Result<Option<CommitEvent>> {
    match serde_json::from_slice::<StreamFrame>(bytes)? {
        StreamFrame::Commit(commit) => ops_by_type(commit).map(Some),
        StreamFrame::Other => Ok(None),
    }
}

/// Reduce a commit to its post creates and deletes.
///
/// Updates and ops on other collections are dropped. A post create without
/// a cid or a decodable record fails the whole commit.
pub fn ops_by_type(commit: CommitFrame) -> Result<CommitEvent> {
    let mut operations = Operations::default();

    for op in commit.ops {
        if op.collection()? != POST_COLLECTION {
            continue;
        }
        let uri = format!("at://{}/{}", commit.repo, op.path);

        match op.action {
            OpAction::Create => {
                let cid = op
                    .cid
                    .ok_or_else(|| FeedError::Decode(format!("create without cid: {uri}")))?;
                let value = op
                    .record
                    .ok_or_else(|| FeedError::Decode(format!("create without record: {uri}")))?;
                let record: PostRecord = serde_json::from_value(value)?;
                operations.creates.push(CreateOp {
                    uri,
                    cid,
                    author: commit.repo.clone(),
                    record,
                });
            }
            OpAction::Delete => operations.deletes.push(DeleteOp { uri }),
            OpAction::Update => {}
        }
    }

    Ok(CommitEvent {
        seq: commit.seq,
        repo: commit.repo,
        operations,
    })
}
