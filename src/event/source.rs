use tokio::sync::mpsc;

use super::Event;

/// EventSource delivers kernel syscall events in arrival order.
///
/// The kernel probe is an external collaborator; it hands well-formed
/// events to the collector through this interface. `next` is the only
/// blocking call permitted on the event-drain task.
pub trait EventSource: Send {
    /// Wait for the next event; `None` signals end of stream.
    fn next(&mut self) -> impl std::future::Future<Output = Option<Event>> + Send;
}

/// Channel-backed event source. The probe (or a test harness) feeds the
/// sender half; the collector drains the receiver half.
pub struct ChannelSource {
    rx: mpsc::Receiver<Event>,
}

impl ChannelSource {
    /// Creates a source with the given queue capacity, returning the
    /// producer handle alongside it.
    pub fn new(capacity: usize) -> (mpsc::Sender<Event>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

impl EventSource for ChannelSource {
    async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventClass, ThreadInfo};

    fn event(class: EventClass) -> Event {
        Event {
            class,
            timestamp_ns: 1_000,
            rawres: Some(0),
            fd: None,
            thread: ThreadInfo::default(),
        }
    }

    #[tokio::test]
    async fn test_channel_source_preserves_order() {
        let (tx, mut source) = ChannelSource::new(8);

        tx.send(event(EventClass::Connect)).await.expect("send");
        tx.send(event(EventClass::Close)).await.expect("send");

        assert_eq!(
            source.next().await.map(|e| e.class),
            Some(EventClass::Connect)
        );
        assert_eq!(
            source.next().await.map(|e| e.class),
            Some(EventClass::Close)
        );
    }

    #[tokio::test]
    async fn test_channel_source_ends_when_sender_dropped() {
        let (tx, mut source) = ChannelSource::new(8);
        drop(tx);
        assert!(source.next().await.is_none());
    }
}
