//! Callback dispatch loop.
//!
//! Reads events off the callback channel one at a time: decode the event,
//! run the registered handlers synchronously, then acknowledge with `OK`.
//! The server holds the next event until the acknowledgement arrives, so a
//! slow handler applies backpressure instead of piling up events.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::events::{
    ChunkArrivedEvent, DataArrivedEvent, DataAvailableEvent, EventKind, MetadataArrivedEvent,
    SearchEvent,
};
use crate::msgid::{chunk_message_id, message_id};
use crate::protocol::{FrameReader, FrameWriter};

use super::registry::CallbackRegistry;

const ACK: &str = "OK";

/// Runs until the callback channel fails. Errors are reported to the caller
/// so the connection manager can start a reconnect cycle.
pub(crate) async fn dispatch_loop<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    registry: &CallbackRegistry,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = reader.read_line().await?;
        let token = line.split_whitespace().next().unwrap_or("");
        match EventKind::from_token(token) {
            Some(EventKind::DataArrived) => {
                let event = decode_data_arrived(reader).await?;
                registry.dispatch_data_arrived(&event);
                writer.write_line(ACK).await?;
            }
            Some(EventKind::ChunkArrived) => {
                let event = decode_chunk_arrived(reader).await?;
                registry.dispatch_chunk_arrived(&event);
                writer.write_line(ACK).await?;
            }
            Some(EventKind::MetadataArrived) => {
                let event = decode_metadata_arrived(reader).await?;
                registry.dispatch_metadata_arrived(&event);
                writer.write_line(ACK).await?;
            }
            Some(EventKind::DataAvailable) => {
                let event = decode_data_available(reader).await?;
                registry.dispatch_data_available(&event);
                writer.write_line(ACK).await?;
            }
            Some(EventKind::SearchArrived) => {
                let event = decode_search_arrived(reader).await?;
                registry.dispatch_search_arrived(&event);
                writer.write_line(ACK).await?;
            }
            // Unknown tokens are skipped without an acknowledgement; there
            // is no way to know how many bytes the unknown event carries.
            None => {
                tracing::warn!(token, "unknown callback event token");
            }
        }
    }
}

pub(crate) async fn decode_data_arrived<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
) -> Result<DataArrivedEvent> {
    let sender = reader.read_line().await?;
    let group_name = reader.read_line().await?;
    let seq_num = reader.read_u32().await?;
    let object_id = reader.read_string_block().await?;
    let instance_id = reader.read_string_block().await?;
    let mime_type = reader.read_string_block().await?;
    let data_len = reader.read_u32().await?;
    let metadata_length = reader.read_u32().await?;
    let data = reader.read_exact(data_len as usize).await?;
    let tag = reader.read_u16().await?;
    let priority = reader.read_u8().await?;
    let query_id = reader.read_string_block().await?;
    Ok(DataArrivedEvent {
        msg_id: message_id(&group_name, &sender, seq_num),
        sender,
        group_name,
        seq_num,
        object_id,
        instance_id,
        mime_type,
        data,
        metadata_length,
        tag,
        priority,
        query_id,
    })
}

pub(crate) async fn decode_chunk_arrived<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
) -> Result<ChunkArrivedEvent> {
    let sender = reader.read_line().await?;
    let group_name = reader.read_line().await?;
    let seq_num = reader.read_u32().await?;
    let object_id = reader.read_string_block().await?;
    let instance_id = reader.read_string_block().await?;
    let mime_type = reader.read_string_block().await?;
    let data_len = reader.read_u32().await?;
    let data = reader.read_exact(data_len as usize).await?;
    let chunk_index = reader.read_u8().await?;
    let total_chunks = reader.read_u8().await?;
    let chunked_msg_id = reader.read_line().await?;
    let tag = reader.read_u16().await?;
    let priority = reader.read_u8().await?;
    let query_id = reader.read_string_block().await?;
    Ok(ChunkArrivedEvent {
        msg_id: chunk_message_id(&group_name, &sender, seq_num),
        sender,
        group_name,
        seq_num,
        object_id,
        instance_id,
        mime_type,
        data,
        chunk_index,
        total_chunks,
        chunked_msg_id,
        tag,
        priority,
        query_id,
    })
}

pub(crate) async fn decode_metadata_arrived<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
) -> Result<MetadataArrivedEvent> {
    let sender = reader.read_line().await?;
    let group_name = reader.read_line().await?;
    let seq_num = reader.read_u32().await?;
    let object_id = reader.read_string_block().await?;
    let instance_id = reader.read_string_block().await?;
    let mime_type = reader.read_string_block().await?;
    let metadata_len = reader.read_u32().await?;
    let metadata = reader.read_exact(metadata_len as usize).await?;
    let data_chunked = reader.read_u8().await? == 1;
    let tag = reader.read_u16().await?;
    let priority = reader.read_u8().await?;
    let query_id = reader.read_string_block().await?;
    Ok(MetadataArrivedEvent {
        msg_id: message_id(&group_name, &sender, seq_num),
        sender,
        group_name,
        seq_num,
        object_id,
        instance_id,
        mime_type,
        metadata,
        data_chunked,
        tag,
        priority,
        query_id,
    })
}

pub(crate) async fn decode_data_available<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
) -> Result<DataAvailableEvent> {
    let sender = reader.read_line().await?;
    let group_name = reader.read_line().await?;
    let seq_num = reader.read_u32().await?;
    let object_id = reader.read_string_block().await?;
    let instance_id = reader.read_string_block().await?;
    let mime_type = reader.read_string_block().await?;
    let ref_obj_id = reader.read_string_block().await?;
    let data_len = reader.read_u32().await?;
    let data = reader.read_exact(data_len as usize).await?;
    let tag = reader.read_u16().await?;
    let priority = reader.read_u8().await?;
    let query_id = reader.read_string_block().await?;
    Ok(DataAvailableEvent {
        msg_id: message_id(&group_name, &sender, seq_num),
        sender,
        group_name,
        seq_num,
        object_id,
        instance_id,
        mime_type,
        ref_obj_id,
        data,
        tag,
        priority,
        query_id,
    })
}

pub(crate) async fn decode_search_arrived<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
) -> Result<SearchEvent> {
    let search_id = reader.read_string_block().await?;
    let group_name = reader.read_string_block().await?;
    let querier = reader.read_string_block().await?;
    let query_type = reader.read_string_block().await?;
    let query_qualifiers = reader.read_string_block().await?;
    let query_len = reader.read_u32().await?;
    let query = reader.read_exact(query_len as usize).await?;
    Ok(SearchEvent {
        search_id,
        group_name,
        querier,
        query_type,
        query_qualifiers,
        query,
    })
}
