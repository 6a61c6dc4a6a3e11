//! Message identifier helpers.
//!
//! DisService identifies every published message by the triple
//! `groupName:senderNodeId:seqNum`. Chunked (on-demand) messages live in a
//! shadow group whose name carries the `.[od]` suffix.

use std::fmt;

use crate::error::{DisServiceError, Result};

/// Separator between the three components of a message id.
pub const ID_SEPARATOR: char = ':';

/// Group-name suffix marking the on-demand (chunked) shadow group.
pub const ON_DEMAND_SUFFIX: &str = ".[od]";

/// Builds the canonical message id for a published message.
pub fn message_id(group_name: &str, sender_id: &str, seq_num: u32) -> String {
    format!("{group_name}{ID_SEPARATOR}{sender_id}{ID_SEPARATOR}{seq_num}")
}

/// Builds the message id for a chunk, placing it in the on-demand shadow
/// group. The suffix is appended at most once.
pub fn chunk_message_id(group_name: &str, sender_id: &str, seq_num: u32) -> String {
    if group_name.ends_with(ON_DEMAND_SUFFIX) {
        message_id(group_name, sender_id, seq_num)
    } else {
        format!("{group_name}{ON_DEMAND_SUFFIX}{ID_SEPARATOR}{sender_id}{ID_SEPARATOR}{seq_num}")
    }
}

/// Parsed form of a DisService message id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub group_name: String,
    pub sender_id: String,
    pub seq_num: u32,
}

impl MessageId {
    /// Parses a `group:sender:seq` id. All three components must be present,
    /// the group and sender non-empty, and the sequence number numeric.
    pub fn parse(id: &str) -> Result<Self> {
        let mut parts = id.split(ID_SEPARATOR);
        let group = parts.next().unwrap_or_default();
        let sender = parts.next();
        let seq = parts.next();
        if parts.next().is_some() {
            return Err(DisServiceError::InvalidArgument(format!(
                "message id has too many components: {id}"
            )));
        }
        let (Some(sender), Some(seq)) = (sender, seq) else {
            return Err(DisServiceError::InvalidArgument(format!(
                "message id must have three components: {id}"
            )));
        };
        if group.is_empty() || sender.is_empty() {
            return Err(DisServiceError::InvalidArgument(format!(
                "message id has an empty component: {id}"
            )));
        }
        let seq_num = seq.parse().map_err(|_| {
            DisServiceError::InvalidArgument(format!("message id has a non-numeric seqNum: {id}"))
        })?;
        Ok(Self {
            group_name: group.to_string(),
            sender_id: sender.to_string(),
            seq_num,
        })
    }

    /// Whether this id addresses the on-demand (chunked) shadow group.
    pub fn is_chunk(&self) -> bool {
        self.group_name.ends_with(ON_DEMAND_SUFFIX)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{ID_SEPARATOR}{}{ID_SEPARATOR}{}",
            self.group_name, self.sender_id, self.seq_num
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_format() {
        assert_eq!(message_id("grp", "node-1", 42), "grp:node-1:42");
    }

    #[test]
    fn test_chunk_id_appends_suffix_once() {
        assert_eq!(chunk_message_id("grp", "n", 1), "grp.[od]:n:1");
        assert_eq!(chunk_message_id("grp.[od]", "n", 1), "grp.[od]:n:1");
    }

    #[test]
    fn test_parse_round_trip() {
        let id = MessageId::parse("grp:node-1:42").unwrap();
        assert_eq!(id.group_name, "grp");
        assert_eq!(id.sender_id, "node-1");
        assert_eq!(id.seq_num, 42);
        assert!(!id.is_chunk());
        assert_eq!(id.to_string(), "grp:node-1:42");
    }

    #[test]
    fn test_parse_chunk_id() {
        let id = MessageId::parse("grp.[od]:node-1:7").unwrap();
        assert!(id.is_chunk());
    }

    #[test]
    fn test_parse_rejects_malformed_ids() {
        assert!(MessageId::parse("").is_err());
        assert!(MessageId::parse("grp:node").is_err());
        assert!(MessageId::parse("grp:node:1:extra").is_err());
        assert!(MessageId::parse(":node:1").is_err());
        assert!(MessageId::parse("grp::1").is_err());
        assert!(MessageId::parse("grp:node:notanumber").is_err());
    }
}
