use crate::buffer::{BoundedBuffer, PopTimeout, PushTimeout, DEFAULT_BUFFER_CAPACITY};
use crate::item::WorkItem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Process-unique identifier of a [`BufferPort`].
pub type PortId = u64;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// A producer's paired queue endpoints.
///
/// One port owns exactly one outbound ("raw") and one inbound ("processed")
/// [`BoundedBuffer`]. The owning producer pushes raw items and pops processed
/// ones; the broker works the opposite sides of both buffers through the
/// handles obtained at enrollment. A port is a unique, movable resource
/// identifying one producer session; it cannot be cloned.
pub struct BufferPort<T> {
    id: PortId,
    raw: Arc<BoundedBuffer<WorkItem<T>>>,
    processed: Arc<BoundedBuffer<WorkItem<T>>>,
}

impl<T> BufferPort<T> {
    /// Creates a port whose buffers use [`DEFAULT_BUFFER_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    /// Creates a port with custom buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let id = NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed);
        let raw = Arc::new(BoundedBuffer::with_capacity(capacity));
        let processed = Arc::new(BoundedBuffer::with_capacity(capacity));
        raw.set_id(id);
        processed.set_id(id);
        Self { id, raw, processed }
    }

    /// The process-unique port id.
    pub fn id(&self) -> PortId {
        self.id
    }

    /// Pushes a raw item outbound, blocking while the buffer is full.
    pub fn submit(&self, item: WorkItem<T>) {
        self.raw.push_front(item);
    }

    /// Pushes a raw item outbound, giving up after `timeout`.
    pub fn submit_timeout(
        &self,
        item: WorkItem<T>,
        timeout: Duration,
    ) -> Result<(), PushTimeout<WorkItem<T>>> {
        self.raw.push_front_timeout(item, timeout)
    }

    /// Pops the next processed item, giving up after `timeout`.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<WorkItem<T>, PopTimeout> {
        self.processed.pop_back_timeout(timeout)
    }

    /// Broker-facing handle to the outbound buffer.
    pub(crate) fn raw_handle(&self) -> Arc<BoundedBuffer<WorkItem<T>>> {
        Arc::clone(&self.raw)
    }

    /// Broker-facing handle to the inbound buffer.
    pub(crate) fn processed_handle(&self) -> Arc<BoundedBuffer<WorkItem<T>>> {
        Arc::clone(&self.processed)
    }
}

impl<T> Default for BufferPort<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Command;

    #[test]
    fn port_ids_are_unique() {
        let a = BufferPort::<u8>::new();
        let b = BufferPort::<u8>::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn buffers_carry_the_port_id() {
        let port = BufferPort::<u8>::new();
        assert_eq!(port.raw_handle().id(), Some(port.id()));
        assert_eq!(port.processed_handle().id(), Some(port.id()));
    }

    #[test]
    fn submitted_items_appear_on_the_raw_side() {
        let port = BufferPort::with_capacity(4);
        port.submit(WorkItem::new(42u8, Command::Noop));
        let item = port
            .raw_handle()
            .pop_back_timeout(Duration::from_millis(10))
            .unwrap();
        assert_eq!(*item.payload(), 42);
    }
}
