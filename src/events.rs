//! Event types delivered to callback handlers.

use bytes::Bytes;

/// The five event kinds the proxy server can push on the callback channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DataArrived,
    ChunkArrived,
    MetadataArrived,
    DataAvailable,
    SearchArrived,
}

impl EventKind {
    /// All kinds, in registration-replay order.
    pub const ALL: [EventKind; 5] = [
        EventKind::DataArrived,
        EventKind::ChunkArrived,
        EventKind::MetadataArrived,
        EventKind::DataAvailable,
        EventKind::SearchArrived,
    ];

    /// Verb sent on the command channel to enable delivery of this kind.
    pub fn registration_verb(self) -> &'static str {
        match self {
            EventKind::DataArrived => "registerDataArrivedCallback",
            EventKind::ChunkArrived => "registerChunkArrivedCallback",
            EventKind::MetadataArrived => "registerMetadataArrivedCallback",
            EventKind::DataAvailable => "registerDataAvailableCallback",
            EventKind::SearchArrived => "registerSearchListener",
        }
    }

    /// Token announcing this kind on the callback channel.
    pub fn callback_token(self) -> &'static str {
        match self {
            EventKind::DataArrived => "dataArrivedCallback",
            EventKind::ChunkArrived => "chunkArrivedCallback",
            EventKind::MetadataArrived => "metadataArrivedCallback",
            EventKind::DataAvailable => "dataAvailableCallback",
            EventKind::SearchArrived => "searchArrivedCallback",
        }
    }

    pub(crate) fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.callback_token() == token)
    }
}

/// A complete message arrived on a subscribed group.
#[derive(Debug, Clone)]
pub struct DataArrivedEvent {
    /// Canonical `group:sender:seq` id of the message.
    pub msg_id: String,
    pub sender: String,
    pub group_name: String,
    pub seq_num: u32,
    pub object_id: Option<String>,
    pub instance_id: Option<String>,
    pub mime_type: Option<String>,
    pub data: Bytes,
    /// Length of the metadata portion at the front of `data`.
    pub metadata_length: u32,
    pub tag: u16,
    pub priority: u8,
    /// Set when the message answers a previously issued query.
    pub query_id: Option<String>,
}

/// One chunk of a large message arrived.
#[derive(Debug, Clone)]
pub struct ChunkArrivedEvent {
    /// Id of the chunk in the on-demand shadow group.
    pub msg_id: String,
    pub sender: String,
    pub group_name: String,
    pub seq_num: u32,
    pub object_id: Option<String>,
    pub instance_id: Option<String>,
    pub mime_type: Option<String>,
    pub data: Bytes,
    pub chunk_index: u8,
    pub total_chunks: u8,
    /// Id of the whole chunked message this chunk belongs to.
    pub chunked_msg_id: String,
    pub tag: u16,
    pub priority: u8,
    pub query_id: Option<String>,
}

/// Metadata describing a (possibly chunked) message arrived.
#[derive(Debug, Clone)]
pub struct MetadataArrivedEvent {
    pub msg_id: String,
    pub sender: String,
    pub group_name: String,
    pub seq_num: u32,
    pub object_id: Option<String>,
    pub instance_id: Option<String>,
    pub mime_type: Option<String>,
    pub metadata: Bytes,
    /// Whether the described data is chunked.
    pub data_chunked: bool,
    pub tag: u16,
    pub priority: u8,
    pub query_id: Option<String>,
}

/// A message became available for on-demand retrieval.
#[derive(Debug, Clone)]
pub struct DataAvailableEvent {
    pub msg_id: String,
    pub sender: String,
    pub group_name: String,
    pub seq_num: u32,
    pub object_id: Option<String>,
    pub instance_id: Option<String>,
    pub mime_type: Option<String>,
    /// Id to pass to `retrieve` to fetch the data.
    pub ref_obj_id: Option<String>,
    pub data: Bytes,
    pub tag: u16,
    pub priority: u8,
    pub query_id: Option<String>,
}

/// Another node issued a search this client may answer via `replyToQuery`.
#[derive(Debug, Clone)]
pub struct SearchEvent {
    pub search_id: Option<String>,
    pub group_name: Option<String>,
    pub querier: Option<String>,
    pub query_type: Option<String>,
    pub query_qualifiers: Option<String>,
    pub query: Bytes,
}

/// Connection lifecycle notification.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionEvent {
    /// True for ServerConnect, false for ServerDisconnect.
    pub connected: bool,
}
