//! Transport seam and the in-process fan-out implementation.
//!
//! A [`Transport`] moves one encoded frame over one physical channel. The
//! bridge times every call and reports the outcome to the channel registry;
//! inbound frames come back through [`Bridge::receive_frame`](crate::bridge::Bridge::receive_frame).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::broadcast;

use crate::channel::Channel;
use crate::error::TransportError;

pub trait Transport: Send + Sync + 'static {
    /// Deliver `frame` to the remote peer over `channel`.
    fn send<'a>(&'a self, channel: &'a Channel, frame: Vec<u8>) -> BoxFuture<'a, Result<(), TransportError>>;
}

/// Frame counters for an [`InProcessTransport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub listeners: usize,
}

/// Same-process transport backed by a tokio broadcast channel.
///
/// Every subscriber receives every frame, which covers both the event-bus
/// (one listener) and fan-out broadcast (many listeners) channel kinds.
/// Sending with no listener attached fails with `ChannelClosed`.
pub struct InProcessTransport {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl InProcessTransport {
    /// `capacity` frames are buffered per listener before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    /// Attach a listener. Hand it to [`Bridge::listen`](crate::bridge::Bridge::listen)
    /// on the receiving side.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            listeners: self.sender.receiver_count(),
        }
    }
}

impl Transport for InProcessTransport {
    fn send<'a>(&'a self, channel: &'a Channel, frame: Vec<u8>) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            match self.sender.send(Arc::new(frame)) {
                Ok(_) => {
                    self.frames_sent.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(_) => {
                    self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    Err(TransportError::ChannelClosed(channel.id.clone()))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;

    #[tokio::test]
    async fn test_frames_reach_every_listener() {
        let transport = InProcessTransport::new(16);
        let channel = Channel::new("bus", ChannelKind::Broadcast);
        let mut rx1 = transport.subscribe();
        let mut rx2 = transport.subscribe();

        transport.send(&channel, vec![1, 2, 3]).await.unwrap();

        assert_eq!(*rx1.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(*rx2.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(transport.stats().frames_sent, 1);
        assert_eq!(transport.stats().listeners, 2);
    }

    #[tokio::test]
    async fn test_send_without_listener_fails() {
        let transport = InProcessTransport::new(4);
        let channel = Channel::new("bus", ChannelKind::EventBus);

        let err = transport.send(&channel, vec![0]).await.unwrap_err();
        assert_eq!(err, TransportError::ChannelClosed("bus".into()));
        assert_eq!(transport.stats().frames_dropped, 1);
    }
}
