//! Proxy façade and builder.
//!
//! [`ProxyBuilder`] configures the connection; [`DisServiceProxy`] exposes
//! the publish/subscribe operations. Every operation runs one framed
//! request/response exchange on the command channel, serialized so two
//! callers can never interleave frames. When the connection drops
//! mid-exchange the operation blocks until the background supervisor has
//! reconnected, then reissues its request from the start.
//!
//! # Example
//!
//! ```ignore
//! use disservice_client::ProxyBuilder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let proxy = ProxyBuilder::new().host("127.0.0.1").start();
//!     proxy
//!         .on_data_arrived(|event| {
//!             println!("{}: {} bytes", event.msg_id, event.data.len());
//!         })
//!         .await?;
//!     proxy.wait_connected().await?;
//!     proxy.subscribe("chat", 0, false, false, false).await?;
//!     Ok(())
//! }
//! ```

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::callback::HandlerId;
use crate::connection::{CommandChannel, Shared, Supervisor};
use crate::error::{DisServiceError, Result};
use crate::events::{
    ChunkArrivedEvent, ConnectionEvent, DataArrivedEvent, DataAvailableEvent, EventKind,
    MetadataArrivedEvent, SearchEvent,
};
use crate::transport::{Connector, TcpConnector};

/// Default proxy server host.
pub const DEFAULT_HOST: &str = "localhost";

/// Default proxy server port.
pub const DEFAULT_PORT: u16 = 56487;

/// Default pause between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Builder for configuring and starting a [`DisServiceProxy`].
pub struct ProxyBuilder {
    host: String,
    port: u16,
    application_id: u16,
    response_timeout: Option<Duration>,
    reconnect_interval: Duration,
    connector: Option<Arc<dyn Connector>>,
}

impl ProxyBuilder {
    pub fn new() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            application_id: 0,
            response_timeout: None,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            connector: None,
        }
    }

    /// Proxy server host. Defaults to `localhost`.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Proxy server port. Defaults to 56487.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Application id sent in the registration handshake. The server may
    /// reassign it; read the effective value with
    /// [`DisServiceProxy::application_id`].
    pub fn application_id(mut self, id: u16) -> Self {
        self.application_id = id;
        self
    }

    /// Bound on how long an operation waits for a response status line.
    /// Unset by default, meaning operations wait indefinitely.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    /// Pause between reconnect attempts. Defaults to 5 seconds.
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Replaces the TCP socket factory, mainly for tests.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Starts the background connection supervisor and returns the proxy
    /// handle. Operations can be issued immediately; they block until the
    /// first connection is established.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> DisServiceProxy {
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new(self.host, self.port)));
        let shared = Arc::new(Shared::new(self.application_id));
        *shared.response_timeout.lock().unwrap() = self.response_timeout;
        let supervisor = Supervisor::spawn(shared.clone(), connector, self.reconnect_interval);
        DisServiceProxy {
            inner: Arc::new(ProxyInner {
                shared,
                supervisor: StdMutex::new(Some(supervisor)),
            }),
        }
    }
}

impl Default for ProxyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ProxyInner {
    shared: Arc<Shared>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        // Last handle gone: tear down the background tasks and sockets.
        self.shared.dispose();
        if let Some(handle) = self.supervisor.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Handle to a DisService proxy session. Cheap to clone; all clones share
/// one connection, one callback registry and one command channel.
#[derive(Clone)]
pub struct DisServiceProxy {
    inner: Arc<ProxyInner>,
}

/// Runs one command exchange, transparently retrying across reconnects.
/// Connection failures put the caller back to waiting on the gate;
/// any other error is returned as-is.
macro_rules! with_command {
    ($self:ident, |$chan:ident| $body:expr) => {{
        loop {
            $self.check_usable()?;
            $self.inner.shared.wait_connected().await?;
            let mut slot = $self.inner.shared.command.lock().await;
            if $self.inner.shared.is_disposed() {
                return Err(DisServiceError::Disposed);
            }
            let Some($chan) = slot.as_mut() else {
                // The gate raced with a loss; wait for the next session.
                drop(slot);
                tokio::task::yield_now().await;
                continue;
            };
            let generation = $chan.generation;
            let result = tokio::select! {
                res = async { $body } => res,
                // A loss reported by the callback channel kills the whole
                // session; don't keep reading from the doomed socket.
                _ = $self.inner.shared.wait_lost(generation) => {
                    Err(DisServiceError::ConnectionClosed)
                }
                _ = $self.inner.shared.wait_disposed() => Err(DisServiceError::Disposed),
            };
            match result {
                Ok(value) => break Ok(value),
                Err(e) if e.is_connection_failure() => {
                    drop(slot);
                    $self.inner.shared.signal_lost(generation);
                }
                Err(e) => break Err(e),
            }
        }
    }};
}

impl DisServiceProxy {
    /// Starts building a proxy with default settings.
    pub fn builder() -> ProxyBuilder {
        ProxyBuilder::new()
    }

    /// The application id currently registered with the server. May differ
    /// from the configured one when the server reassigned it.
    pub fn application_id(&self) -> u16 {
        self.inner.shared.application_id.load(Ordering::Relaxed)
    }

    /// Whether a session with the proxy server is currently established.
    pub fn is_connected(&self) -> bool {
        self.inner.shared.is_connected()
    }

    /// Blocks until a session is established.
    pub async fn wait_connected(&self) -> Result<()> {
        self.inner.shared.wait_connected().await
    }

    /// Changes the response timeout for subsequent operations. `None`
    /// means wait indefinitely.
    pub fn set_response_timeout(&self, timeout: Option<Duration>) {
        *self.inner.shared.response_timeout.lock().unwrap() = timeout;
    }

    /// Shuts the proxy down: closes both sockets, stops the background
    /// tasks and fails all pending and future operations with
    /// [`DisServiceError::Disposed`]. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.shared.dispose();
        // Make sure the sockets are dropped even if the supervisor had
        // already exited; waiting on the lock yields to any exchange that
        // is just now observing disposal.
        let mut slot = self.inner.shared.command.lock().await;
        *slot = None;
    }

    fn check_usable(&self) -> Result<()> {
        if self.inner.shared.is_disposed() {
            return Err(DisServiceError::Disposed);
        }
        if self.inner.shared.registry.in_callback_thread() {
            return Err(DisServiceError::CalledFromCallback);
        }
        Ok(())
    }

    fn require_group(group_name: &str) -> Result<()> {
        if group_name.is_empty() {
            return Err(DisServiceError::InvalidArgument(
                "groupName cannot be empty".into(),
            ));
        }
        Ok(())
    }

    fn require_id(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(DisServiceError::InvalidArgument(
                "message id cannot be empty".into(),
            ));
        }
        Ok(())
    }

    async fn read_status(&self, chan: &mut CommandChannel) -> Result<String> {
        let timeout = self.inner.shared.response_timeout();
        chan.reader.read_line_timeout(timeout).await
    }

    // ---- publication ----

    /// Publishes a message to a group. Returns the server-assigned
    /// message id.
    #[allow(clippy::too_many_arguments)]
    pub async fn push(
        &self,
        group_name: &str,
        object_id: Option<&str>,
        instance_id: Option<&str>,
        mime_type: Option<&str>,
        metadata: Option<&[u8]>,
        data: &[u8],
        expiration: Duration,
        history_window: u16,
        tag: u16,
        priority: u8,
    ) -> Result<String> {
        Self::require_group(group_name)?;
        with_command!(self, |chan| {
            self.do_push_or_store(
                chan,
                "push",
                group_name,
                object_id,
                instance_id,
                mime_type,
                metadata,
                data,
                expiration,
                history_window,
                tag,
                priority,
            )
            .await
        })
    }

    /// Stores a message for on-demand retrieval without disseminating it.
    /// Returns the server-assigned message id.
    #[allow(clippy::too_many_arguments)]
    pub async fn store(
        &self,
        group_name: &str,
        object_id: Option<&str>,
        instance_id: Option<&str>,
        mime_type: Option<&str>,
        metadata: Option<&[u8]>,
        data: &[u8],
        expiration: Duration,
        history_window: u16,
        tag: u16,
        priority: u8,
    ) -> Result<String> {
        Self::require_group(group_name)?;
        with_command!(self, |chan| {
            self.do_push_or_store(
                chan,
                "store",
                group_name,
                object_id,
                instance_id,
                mime_type,
                metadata,
                data,
                expiration,
                history_window,
                tag,
                priority,
            )
            .await
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn do_push_or_store(
        &self,
        chan: &mut CommandChannel,
        verb: &str,
        group_name: &str,
        object_id: Option<&str>,
        instance_id: Option<&str>,
        mime_type: Option<&str>,
        metadata: Option<&[u8]>,
        data: &[u8],
        expiration: Duration,
        history_window: u16,
        tag: u16,
        priority: u8,
    ) -> Result<String> {
        chan.writer.write_line(verb).await?;
        chan.writer.write_line(group_name).await?;
        chan.writer.write_string_block(object_id).await?;
        chan.writer.write_string_block(instance_id).await?;
        chan.writer.write_string_block(mime_type).await?;
        chan.writer.write_block(metadata).await?;
        chan.writer.write_u32(data.len() as u32).await?;
        chan.writer.write_blob(data).await?;
        chan.writer
            .write_u64(expiration.as_millis() as u64)
            .await?;
        chan.writer.write_u16(history_window).await?;
        chan.writer.write_u16(tag).await?;
        chan.writer.write_u8(priority).await?;

        let response = self.read_status(chan).await?;
        if response.starts_with("ERROR") {
            return Err(DisServiceError::Remote(response));
        }
        chan.reader.read_line().await
    }

    /// Makes a message available for on-demand retrieval, announcing its
    /// metadata to the group. Returns the server-assigned message id.
    #[allow(clippy::too_many_arguments)]
    pub async fn make_available(
        &self,
        group_name: &str,
        object_id: Option<&str>,
        instance_id: Option<&str>,
        metadata: &[u8],
        data: &[u8],
        mime_type: Option<&str>,
        expiration: Duration,
        history_window: u16,
        tag: u16,
        priority: u8,
    ) -> Result<String> {
        Self::require_group(group_name)?;
        with_command!(self, |chan| {
            chan.writer.write_line("makeAvailable").await?;
            chan.writer.write_line(group_name).await?;
            chan.writer.write_string_block(object_id).await?;
            chan.writer.write_string_block(instance_id).await?;
            chan.writer.write_block(Some(metadata)).await?;
            chan.writer.write_u32(data.len() as u32).await?;
            chan.writer.write_blob(data).await?;
            chan.writer.write_string_block(mime_type).await?;
            chan.writer
                .write_u64(expiration.as_millis() as u64)
                .await?;
            chan.writer.write_u16(history_window).await?;
            chan.writer.write_u16(tag).await?;
            chan.writer.write_u8(priority).await?;

            let response = self.read_status(chan).await?;
            if response.starts_with("ERROR") {
                return Err(DisServiceError::Remote(response));
            }
            chan.reader.read_line().await
        })
    }

    /// Cancels a previously pushed or stored message by id. Returns
    /// whether the server accepted the cancellation.
    pub async fn cancel(&self, msg_id: &str) -> Result<bool> {
        Self::require_id(msg_id)?;
        with_command!(self, |chan| {
            chan.writer.write_line("cancel_str").await?;
            chan.writer.write_line(msg_id).await?;
            let response = self.read_status(chan).await?;
            Ok(response.starts_with("OK"))
        })
    }

    /// Cancels all messages carrying the given tag.
    pub async fn cancel_tag(&self, tag: u16) -> Result<bool> {
        with_command!(self, |chan| {
            chan.writer.write_line("cancel_int").await?;
            chan.writer.write_u16(tag).await?;
            let response = self.read_status(chan).await?;
            Ok(response.starts_with("OK"))
        })
    }

    // ---- filtering ----

    /// Suppresses delivery of messages with the given tag on a group.
    pub async fn add_filter(&self, group_name: &str, tag: u16) -> Result<bool> {
        Self::require_group(group_name)?;
        with_command!(self, |chan| {
            chan.writer.write_line("addFilter").await?;
            chan.writer.write_line(group_name).await?;
            chan.writer.write_u16(tag).await?;
            let response = self.read_status(chan).await?;
            Ok(response.starts_with("OK"))
        })
    }

    /// Removes a tag filter installed by [`add_filter`](Self::add_filter).
    pub async fn remove_filter(&self, group_name: &str, tag: u16) -> Result<bool> {
        Self::require_group(group_name)?;
        with_command!(self, |chan| {
            chan.writer.write_line("removeFilter").await?;
            chan.writer.write_line(group_name).await?;
            chan.writer.write_u16(tag).await?;
            let response = self.read_status(chan).await?;
            Ok(response.starts_with("OK"))
        })
    }

    // ---- retrieval ----

    /// Retrieves the data of a stored message into `buf`. Returns the
    /// number of bytes retrieved, or -1 when the server could not satisfy
    /// the request within `timeout`.
    pub async fn retrieve(&self, msg_id: &str, buf: &mut Vec<u8>, timeout: Duration) -> Result<i64> {
        Self::require_id(msg_id)?;
        with_command!(self, |chan| {
            self.do_retrieve(chan, msg_id, buf, timeout).await
        })
    }

    async fn do_retrieve(
        &self,
        chan: &mut CommandChannel,
        msg_id: &str,
        buf: &mut Vec<u8>,
        timeout: Duration,
    ) -> Result<i64> {
        chan.writer.write_line("retrieve").await?;
        chan.writer.write_line(msg_id).await?;
        chan.writer.write_u64(timeout.as_millis() as u64).await?;

        let response = self.read_status(chan).await?;
        if response.starts_with("OK") {
            let size = chan.reader.read_u32().await?;
            if size > 0 {
                let bytes = chan.reader.read_exact(size as usize).await?;
                buf.clear();
                buf.extend_from_slice(&bytes);
            }
            let response = chan.reader.read_line().await?;
            if response.starts_with("OK") {
                return Ok(size as i64);
            }
        }
        Ok(-1)
    }

    /// Asks the server to write a stored message's data to a file, by path
    /// as seen from the server. Returns the byte count reported by the
    /// server, or -1 on refusal.
    pub async fn retrieve_file(&self, msg_id: &str, file_path: &str) -> Result<i64> {
        Self::require_id(msg_id)?;
        with_command!(self, |chan| {
            chan.writer.write_line("retrieve_file").await?;
            chan.writer.write_line(msg_id).await?;
            chan.writer.write_line(file_path).await?;
            let response = self.read_status(chan).await?;
            if response.starts_with("OK") {
                let size = response
                    .split_whitespace()
                    .nth(1)
                    .and_then(|tok| tok.parse().ok())
                    .unwrap_or(-1);
                return Ok(size);
            }
            Ok(-1)
        })
    }

    /// Requests redelivery of up to `history_length` past messages for a
    /// group/tag. Returns 0 when accepted, -1 when refused.
    pub async fn request(
        &self,
        group_name: &str,
        tag: u16,
        history_length: u16,
        timeout: Duration,
    ) -> Result<i32> {
        Self::require_group(group_name)?;
        with_command!(self, |chan| {
            chan.writer.write_line("request").await?;
            chan.writer.write_line(group_name).await?;
            chan.writer.write_u16(tag).await?;
            chan.writer.write_u16(history_length).await?;
            chan.writer.write_u64(timeout.as_millis() as u64).await?;
            let response = self.read_status(chan).await?;
            Ok(if response.starts_with("OK") { 0 } else { -1 })
        })
    }

    // ---- subscriptions ----

    /// Subscribes to a group.
    pub async fn subscribe(
        &self,
        group_name: &str,
        priority: u8,
        group_reliable: bool,
        msg_reliable: bool,
        sequenced: bool,
    ) -> Result<bool> {
        Self::require_group(group_name)?;
        with_command!(self, |chan| {
            chan.writer.write_line("subscribe").await?;
            chan.writer.write_line(group_name).await?;
            chan.writer.write_u8(priority).await?;
            chan.writer.write_u8(group_reliable as u8).await?;
            chan.writer.write_u8(msg_reliable as u8).await?;
            chan.writer.write_u8(sequenced as u8).await?;
            let response = self.read_status(chan).await?;
            Ok(response.starts_with("OK"))
        })
    }

    /// Subscribes to a single tag within a group.
    pub async fn subscribe_tag(
        &self,
        group_name: &str,
        priority: u8,
        tag: u16,
        group_reliable: bool,
        msg_reliable: bool,
        sequenced: bool,
    ) -> Result<bool> {
        Self::require_group(group_name)?;
        with_command!(self, |chan| {
            chan.writer.write_line("subscribe_tag").await?;
            chan.writer.write_line(group_name).await?;
            chan.writer.write_u8(priority).await?;
            chan.writer.write_u16(tag).await?;
            chan.writer.write_u8(group_reliable as u8).await?;
            chan.writer.write_u8(msg_reliable as u8).await?;
            chan.writer.write_u8(sequenced as u8).await?;
            let response = self.read_status(chan).await?;
            Ok(response.starts_with("OK"))
        })
    }

    /// Drops a group subscription.
    pub async fn unsubscribe(&self, group_name: &str) -> Result<bool> {
        Self::require_group(group_name)?;
        with_command!(self, |chan| {
            chan.writer.write_line("unsubscribe").await?;
            chan.writer.write_line(group_name).await?;
            let response = self.read_status(chan).await?;
            Ok(response.starts_with("OK"))
        })
    }

    /// Drops a tag subscription within a group.
    pub async fn unsubscribe_tag(&self, group_name: &str, tag: u16) -> Result<bool> {
        Self::require_group(group_name)?;
        with_command!(self, |chan| {
            chan.writer.write_line("unsubscribe_tag").await?;
            chan.writer.write_line(group_name).await?;
            chan.writer.write_u16(tag).await?;
            let response = self.read_status(chan).await?;
            Ok(response.starts_with("OK"))
        })
    }

    // ---- identity ----

    /// Looks up the id of a message previously published with the given
    /// object/instance ids. When the server knows several matches the most
    /// recently received one is returned.
    pub async fn get_dis_service_id(
        &self,
        object_id: Option<&str>,
        instance_id: Option<&str>,
    ) -> Result<Option<String>> {
        with_command!(self, |chan| {
            chan.writer.write_line("getDisServiceId").await?;
            chan.writer.write_string_block(object_id).await?;
            chan.writer.write_string_block(instance_id).await?;

            let response = self.read_status(chan).await?;
            if response.starts_with("ERROR") {
                return Err(DisServiceError::Remote(response));
            }
            // Ids stream as blocks until a zero-length terminator.
            let mut last = None;
            while let Some(block) = chan.reader.read_block().await? {
                last = Some(String::from_utf8_lossy(&block).into_owned());
            }
            let response = self.read_status(chan).await?;
            if response.starts_with("ERROR") {
                return Err(DisServiceError::Remote(response));
            }
            Ok(last)
        })
    }

    /// Reserves and returns the id the next push to `group_name` will get.
    pub async fn get_next_push_id(&self, group_name: &str) -> Result<String> {
        Self::require_group(group_name)?;
        with_command!(self, |chan| {
            chan.writer.write_line("getNextPushId").await?;
            chan.writer.write_line(group_name).await?;
            let response = self.read_status(chan).await?;
            if !response.starts_with("OK") {
                return Err(DisServiceError::Remote(response));
            }
            chan.reader.read_line().await
        })
    }

    // ---- search ----

    /// Issues a search to the group. Returns the server-assigned query id,
    /// or `None` when the server did not assign one.
    pub async fn search(
        &self,
        group_name: &str,
        query_type: &str,
        query_qualifiers: Option<&str>,
        query: &[u8],
    ) -> Result<Option<String>> {
        Self::require_group(group_name)?;
        if query_type.is_empty() {
            return Err(DisServiceError::InvalidArgument(
                "queryType cannot be empty".into(),
            ));
        }
        with_command!(self, |chan| {
            chan.writer.write_line("search").await?;
            chan.writer.write_string_block(Some(group_name)).await?;
            chan.writer.write_string_block(Some(query_type)).await?;
            chan.writer.write_string_block(query_qualifiers).await?;
            chan.writer.write_u32(query.len() as u32).await?;
            chan.writer.write_blob(query).await?;

            let response = self.read_status(chan).await?;
            if response.starts_with("ERROR") {
                return Err(DisServiceError::Remote(response));
            }
            chan.reader.read_string_block().await
        })
    }

    /// Answers a search received via
    /// [`on_search_arrived`](Self::on_search_arrived) with the ids of
    /// matching messages.
    pub async fn reply_to_query(&self, query_id: &str, msg_ids: &[String]) -> Result<()> {
        Self::require_id(query_id)?;
        with_command!(self, |chan| {
            chan.writer.write_line("replyToQuery").await?;
            chan.writer.write_string_block(Some(query_id)).await?;
            chan.writer.write_u32(msg_ids.len() as u32).await?;
            for msg_id in msg_ids {
                chan.writer.write_string_block(Some(msg_id)).await?;
            }
            let response = self.read_status(chan).await?;
            if response.starts_with("ERROR") {
                return Err(DisServiceError::Remote(response));
            }
            Ok(())
        })
    }

    // ---- callbacks ----

    /// Sends the registration verb for `kind` if a session is up. Failures
    /// surface as a connection loss; the registration is replayed on
    /// reconnect either way.
    async fn announce(&self, kind: EventKind) {
        let mut slot = self.inner.shared.command.lock().await;
        if let Some(chan) = slot.as_mut() {
            let generation = chan.generation;
            if let Err(e) = chan.writer.write_line(kind.registration_verb()).await {
                drop(slot);
                tracing::debug!(error = %e, "failed to announce callback registration");
                self.inner.shared.signal_lost(generation);
            }
        }
    }

    /// Registers a handler for complete messages arriving on subscribed
    /// groups. The first handler of a kind enables server-side delivery of
    /// that kind, now and after every reconnect.
    pub async fn on_data_arrived<F>(&self, handler: F) -> Result<HandlerId>
    where
        F: Fn(&DataArrivedEvent) + Send + Sync + 'static,
    {
        if self.inner.shared.is_disposed() {
            return Err(DisServiceError::Disposed);
        }
        let (id, first) = self
            .inner
            .shared
            .registry
            .add_data_arrived(Arc::new(handler));
        if first && self.inner.shared.is_connected() {
            self.announce(EventKind::DataArrived).await;
        }
        Ok(id)
    }

    /// Registers a handler for arriving chunks of large messages.
    pub async fn on_chunk_arrived<F>(&self, handler: F) -> Result<HandlerId>
    where
        F: Fn(&ChunkArrivedEvent) + Send + Sync + 'static,
    {
        if self.inner.shared.is_disposed() {
            return Err(DisServiceError::Disposed);
        }
        let (id, first) = self
            .inner
            .shared
            .registry
            .add_chunk_arrived(Arc::new(handler));
        if first && self.inner.shared.is_connected() {
            self.announce(EventKind::ChunkArrived).await;
        }
        Ok(id)
    }

    /// Registers a handler for arriving message metadata.
    pub async fn on_metadata_arrived<F>(&self, handler: F) -> Result<HandlerId>
    where
        F: Fn(&MetadataArrivedEvent) + Send + Sync + 'static,
    {
        if self.inner.shared.is_disposed() {
            return Err(DisServiceError::Disposed);
        }
        let (id, first) = self
            .inner
            .shared
            .registry
            .add_metadata_arrived(Arc::new(handler));
        if first && self.inner.shared.is_connected() {
            self.announce(EventKind::MetadataArrived).await;
        }
        Ok(id)
    }

    /// Registers a handler for data-available announcements.
    pub async fn on_data_available<F>(&self, handler: F) -> Result<HandlerId>
    where
        F: Fn(&DataAvailableEvent) + Send + Sync + 'static,
    {
        if self.inner.shared.is_disposed() {
            return Err(DisServiceError::Disposed);
        }
        let (id, first) = self
            .inner
            .shared
            .registry
            .add_data_available(Arc::new(handler));
        if first && self.inner.shared.is_connected() {
            self.announce(EventKind::DataAvailable).await;
        }
        Ok(id)
    }

    /// Registers a handler for searches issued by other nodes. Answer them
    /// with [`reply_to_query`](Self::reply_to_query) from outside the
    /// handler.
    pub async fn on_search_arrived<F>(&self, handler: F) -> Result<HandlerId>
    where
        F: Fn(&SearchEvent) + Send + Sync + 'static,
    {
        if self.inner.shared.is_disposed() {
            return Err(DisServiceError::Disposed);
        }
        let (id, first) = self
            .inner
            .shared
            .registry
            .add_search_arrived(Arc::new(handler));
        if first && self.inner.shared.is_connected() {
            self.announce(EventKind::SearchArrived).await;
        }
        Ok(id)
    }

    /// Registers a connection-established handler. When a session is
    /// already up the handler is additionally invoked immediately, on the
    /// caller's thread.
    pub fn on_server_connect<F>(&self, handler: F) -> Result<HandlerId>
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        if self.inner.shared.is_disposed() {
            return Err(DisServiceError::Disposed);
        }
        let handler = Arc::new(handler);
        let id = self.inner.shared.registry.add_server_connect(handler.clone());
        if self.inner.shared.is_connected() {
            handler(&ConnectionEvent { connected: true });
        }
        Ok(id)
    }

    /// Registers a connection-lost handler.
    pub fn on_server_disconnect<F>(&self, handler: F) -> Result<HandlerId>
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        if self.inner.shared.is_disposed() {
            return Err(DisServiceError::Disposed);
        }
        Ok(self
            .inner
            .shared
            .registry
            .add_server_disconnect(Arc::new(handler)))
    }

    /// Removes a previously registered handler. The event kind stays
    /// registered with the server; undelivered events of that kind are
    /// decoded and dropped.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.inner.shared.registry.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = ProxyBuilder::new();
        assert_eq!(builder.host, DEFAULT_HOST);
        assert_eq!(builder.port, DEFAULT_PORT);
        assert_eq!(builder.application_id, 0);
        assert_eq!(builder.response_timeout, None);
        assert_eq!(builder.reconnect_interval, DEFAULT_RECONNECT_INTERVAL);
    }

    #[test]
    fn test_builder_overrides() {
        let builder = ProxyBuilder::new()
            .host("10.0.0.1")
            .port(4000)
            .application_id(17)
            .response_timeout(Duration::from_secs(2))
            .reconnect_interval(Duration::from_millis(250));
        assert_eq!(builder.host, "10.0.0.1");
        assert_eq!(builder.port, 4000);
        assert_eq!(builder.application_id, 17);
        assert_eq!(builder.response_timeout, Some(Duration::from_secs(2)));
        assert_eq!(builder.reconnect_interval, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_empty_group_rejected_before_connecting() {
        let proxy = ProxyBuilder::new().port(1).start();
        let err = proxy
            .subscribe("", 0, false, false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DisServiceError::InvalidArgument(_)));
        let err = proxy.get_next_push_id("").await.unwrap_err();
        assert!(matches!(err, DisServiceError::InvalidArgument(_)));
        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_query_type_rejected() {
        let proxy = ProxyBuilder::new().port(1).start();
        let err = proxy.search("grp", "", None, b"q").await.unwrap_err();
        assert!(matches!(err, DisServiceError::InvalidArgument(_)));
        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn test_operations_fail_after_shutdown() {
        let proxy = ProxyBuilder::new().port(1).start();
        proxy.shutdown().await;
        let err = proxy.cancel("grp:node:1").await.unwrap_err();
        assert!(matches!(err, DisServiceError::Disposed));
        let err = proxy.on_data_arrived(|_| {}).await.unwrap_err();
        assert!(matches!(err, DisServiceError::Disposed));
    }
}
