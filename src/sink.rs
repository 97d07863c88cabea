//! Subscriber sinks.
//!
//! A sink is the per-subscriber seam between the core and whatever
//! transport the API collaborator speaks. The broadcast task hands it the
//! bytes of a published slot; a sink that fails is dropped from the fan-out
//! set without disturbing the others.

use std::io;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Per-subscriber output interface.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Deliver one frame. The slice borrows shared memory and is only valid
    /// for the duration of the call; a sink that needs to keep the bytes
    /// must copy them.
    async fn send_frame(&self, frame: &[u8]) -> io::Result<()>;

    /// Called once when the session ends (close or engine loss) while this
    /// subscriber is still attached.
    async fn closed(&self) {}
}

/// Sink backed by a bounded tokio channel. Frames are copied out of shared
/// memory into owned buffers, which makes this the convenient choice for
/// tests and in-process consumers.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl ChannelSink {
    /// Create a sink and the receiver its frames arrive on. Dropping the
    /// receiver fails the sink, which unsubscribes it on the next frame.
    pub fn new(capacity: usize) -> (ChannelSink, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ChannelSink { tx }, rx)
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_frame(&self, frame: &[u8]) -> io::Result<()> {
        self.tx
            .send(frame.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "subscriber receiver dropped"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn frames_are_copied_through() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.send_frame(&[1, 2, 3]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn dropped_receiver_fails_the_sink() {
        let (sink, rx) = ChannelSink::new(4);
        drop(rx);
        assert!(sink.send_frame(&[0u8; 8]).await.is_err());
    }
}
