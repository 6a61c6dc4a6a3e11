//! Handler registry for callback events.
//!
//! Handlers are plain synchronous closures invoked on the dispatch loop's
//! thread, one event at a time. While a handler runs, the registry records
//! the dispatching thread so the façade can reject proxy calls made from
//! inside a handler instead of deadlocking.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use crate::events::{
    ChunkArrivedEvent, ConnectionEvent, DataArrivedEvent, DataAvailableEvent, EventKind,
    MetadataArrivedEvent, SearchEvent,
};

/// Opaque handle returned by handler registration, usable for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub type DataArrivedHandler = Arc<dyn Fn(&DataArrivedEvent) + Send + Sync>;
pub type ChunkArrivedHandler = Arc<dyn Fn(&ChunkArrivedEvent) + Send + Sync>;
pub type MetadataArrivedHandler = Arc<dyn Fn(&MetadataArrivedEvent) + Send + Sync>;
pub type DataAvailableHandler = Arc<dyn Fn(&DataAvailableEvent) + Send + Sync>;
pub type SearchArrivedHandler = Arc<dyn Fn(&SearchEvent) + Send + Sync>;
pub type ConnectionHandler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

#[derive(Default)]
struct Inner {
    data_arrived: Vec<(u64, DataArrivedHandler)>,
    chunk_arrived: Vec<(u64, ChunkArrivedHandler)>,
    metadata_arrived: Vec<(u64, MetadataArrivedHandler)>,
    data_available: Vec<(u64, DataAvailableHandler)>,
    search_arrived: Vec<(u64, SearchArrivedHandler)>,
    server_connect: Vec<(u64, ConnectionHandler)>,
    server_disconnect: Vec<(u64, ConnectionHandler)>,
    next_id: u64,
    /// Thread currently running event handlers, if any.
    dispatch_thread: Option<ThreadId>,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Shared registry of callback handlers.
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    inner: Mutex<Inner>,
}

macro_rules! add_event_handler {
    ($fn_name:ident, $field:ident, $handler:ty) => {
        /// Returns the handler id and whether it is the first of its kind,
        /// in which case the registration verb must be announced.
        pub(crate) fn $fn_name(&self, handler: $handler) -> (HandlerId, bool) {
            let mut inner = self.inner.lock().unwrap();
            let first = inner.$field.is_empty();
            let id = inner.next_id();
            inner.$field.push((id, handler));
            (HandlerId(id), first)
        }
    };
}

macro_rules! dispatch_event {
    ($fn_name:ident, $field:ident, $event:ty) => {
        pub(crate) fn $fn_name(&self, event: &$event) {
            let handlers: Vec<_> = {
                let inner = self.inner.lock().unwrap();
                inner.$field.iter().map(|(_, h)| h.clone()).collect()
            };
            self.with_dispatch_guard(|| {
                for handler in &handlers {
                    invoke(|| handler(event));
                }
            });
        }
    };
}

impl CallbackRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    add_event_handler!(add_data_arrived, data_arrived, DataArrivedHandler);
    add_event_handler!(add_chunk_arrived, chunk_arrived, ChunkArrivedHandler);
    add_event_handler!(add_metadata_arrived, metadata_arrived, MetadataArrivedHandler);
    add_event_handler!(add_data_available, data_available, DataAvailableHandler);
    add_event_handler!(add_search_arrived, search_arrived, SearchArrivedHandler);

    pub(crate) fn add_server_connect(&self, handler: ConnectionHandler) -> HandlerId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        inner.server_connect.push((id, handler));
        HandlerId(id)
    }

    pub(crate) fn add_server_disconnect(&self, handler: ConnectionHandler) -> HandlerId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        inner.server_disconnect.push((id, handler));
        HandlerId(id)
    }

    /// Removes a handler by id. Returns false when the id is unknown.
    ///
    /// Removing the last handler of a kind does not unregister the kind on
    /// the server; events of that kind are simply dropped after decoding.
    pub(crate) fn remove(&self, id: HandlerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let target = id.0;
        macro_rules! remove_from {
            ($field:ident) => {{
                let before = inner.$field.len();
                inner.$field.retain(|(id, _)| *id != target);
                if inner.$field.len() != before {
                    return true;
                }
            }};
        }
        remove_from!(data_arrived);
        remove_from!(chunk_arrived);
        remove_from!(metadata_arrived);
        remove_from!(data_available);
        remove_from!(search_arrived);
        remove_from!(server_connect);
        remove_from!(server_disconnect);
        false
    }

    pub(crate) fn has_handlers(&self, kind: EventKind) -> bool {
        let inner = self.inner.lock().unwrap();
        match kind {
            EventKind::DataArrived => !inner.data_arrived.is_empty(),
            EventKind::ChunkArrived => !inner.chunk_arrived.is_empty(),
            EventKind::MetadataArrived => !inner.metadata_arrived.is_empty(),
            EventKind::DataAvailable => !inner.data_available.is_empty(),
            EventKind::SearchArrived => !inner.search_arrived.is_empty(),
        }
    }

    /// Kinds that must be announced on the command channel after a
    /// (re)connect, in fixed replay order.
    pub(crate) fn kinds_to_announce(&self) -> Vec<EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(|k| self.has_handlers(*k))
            .collect()
    }

    /// Whether the current thread is inside an event handler invocation.
    pub(crate) fn in_callback_thread(&self) -> bool {
        self.inner.lock().unwrap().dispatch_thread == Some(thread::current().id())
    }

    fn with_dispatch_guard(&self, f: impl FnOnce()) {
        self.inner.lock().unwrap().dispatch_thread = Some(thread::current().id());
        f();
        self.inner.lock().unwrap().dispatch_thread = None;
    }

    dispatch_event!(dispatch_data_arrived, data_arrived, DataArrivedEvent);
    dispatch_event!(dispatch_chunk_arrived, chunk_arrived, ChunkArrivedEvent);
    dispatch_event!(dispatch_metadata_arrived, metadata_arrived, MetadataArrivedEvent);
    dispatch_event!(dispatch_data_available, data_available, DataAvailableEvent);
    dispatch_event!(dispatch_search_arrived, search_arrived, SearchEvent);

    /// Connection notifications run on the supervisor's context and do not
    /// set the dispatch guard; proxy calls from them remain legal.
    pub(crate) fn dispatch_server_connect(&self, event: &ConnectionEvent) {
        let handlers: Vec<_> = {
            let inner = self.inner.lock().unwrap();
            inner.server_connect.iter().map(|(_, h)| h.clone()).collect()
        };
        for handler in &handlers {
            invoke(|| handler(event));
        }
    }

    pub(crate) fn dispatch_server_disconnect(&self, event: &ConnectionEvent) {
        let handlers: Vec<_> = {
            let inner = self.inner.lock().unwrap();
            inner
                .server_disconnect
                .iter()
                .map(|(_, h)| h.clone())
                .collect()
        };
        for handler in &handlers {
            invoke(|| handler(event));
        }
    }
}

/// Runs a handler, containing any panic so one bad handler cannot take
/// down the dispatch loop.
fn invoke(f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!("callback handler panicked");
    }
}
