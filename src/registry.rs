// ABOUTME: Handle allocation and the two handle->resource maps shared by a TunnelEngine
// ABOUTME: One mutex covers both maps and the allocator so lookups never block on I/O

use crate::connection::Transport;
use crate::control_link::ControlLink;
use crate::handle::Handle;
use crate::stream::DataStream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct Inner<T: Transport> {
    next_handle: u32,
    links: HashMap<Handle, Arc<ControlLink<T>>>,
    streams: HashMap<Handle, Arc<DataStream<T>>>,
}

/// The registry backing one [`crate::engine::TunnelEngine`]. `Handle → ControlLink` and
/// `Handle → DataStream` are disjoint maps sharing a single allocator and a single
/// `std::sync::Mutex`. Lookups are synchronous and must never await while holding the lock.
pub struct HandleRegistry<T: Transport> {
    inner: Mutex<Inner<T>>,
}

impl<T: Transport> Default for HandleRegistry<T> {
    fn default() -> Self {
        HandleRegistry {
            inner: Mutex::new(Inner {
                next_handle: 1,
                links: HashMap::new(),
                streams: HashMap::new(),
            }),
        }
    }
}

impl<T: Transport> HandleRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh handle, strictly greater than any previously returned. Panics if the
    /// 32-bit handle space is exhausted; an engine allocating four billion handles over its
    /// lifetime is not a case this registry tries to recover from.
    pub fn allocate(&self) -> Handle {
        let mut inner = self.inner.lock().unwrap();
        let value = inner.next_handle;
        inner.next_handle = inner
            .next_handle
            .checked_add(1)
            .expect("handle space exhausted");
        Handle::from(value)
    }

    pub fn insert_stream(&self, handle: Handle, stream: Arc<DataStream<T>>) {
        self.inner.lock().unwrap().streams.insert(handle, stream);
    }

    pub fn insert_link(&self, handle: Handle, link: Arc<ControlLink<T>>) {
        self.inner.lock().unwrap().links.insert(handle, link);
    }

    pub fn lookup_stream(&self, handle: Handle) -> Option<Arc<DataStream<T>>> {
        self.inner.lock().unwrap().streams.get(&handle).cloned()
    }

    pub fn take_stream(&self, handle: Handle) -> Option<Arc<DataStream<T>>> {
        self.inner.lock().unwrap().streams.remove(&handle)
    }

    pub fn take_link(&self, handle: Handle) -> Option<Arc<ControlLink<T>>> {
        self.inner.lock().unwrap().links.remove(&handle)
    }
}
