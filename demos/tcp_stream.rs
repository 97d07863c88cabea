//! Stream frames to every TCP client that connects.
//!
//! Creates one session over the procedural `wave` animator and subscribes a
//! raw-bytes TCP sink per connection. Watch the stream with e.g.
//! `nc 127.0.0.1 9000 | xxd | head`.
//!
//! Run with: `cargo run --example tcp_stream -- --bind 127.0.0.1:9000`

use std::io;

use async_trait::async_trait;
use clap::Parser;
use log::{info, warn};
use posed::{FrameSink, SessionRegistry};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, tcp::OwnedWriteHalf};
use tokio::sync::Mutex;

#[derive(Parser, Debug)]
#[command(name = "tcp_stream", about)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:9000")]
    bind: String,

    /// Bones in the streamed skeleton.
    #[arg(long, default_value_t = 24)]
    bones: u32,
}

struct TcpSink {
    writer: Mutex<OwnedWriteHalf>,
}

#[async_trait]
impl FrameSink for TcpSink {
    async fn send_frame(&self, frame: &[u8]) -> io::Result<()> {
        self.writer.lock().await.write_all(frame).await
    }

    async fn closed(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let registry = SessionRegistry::new();
    let session = registry
        .create("tcp-demo", "wave", &args.bones.to_string())
        .await?;
    let (skeleton, frame_bytes) = session.describe();
    info!(
        "streaming {} bones ({frame_bytes} bytes/frame) on {}",
        skeleton.num_bones(),
        args.bind
    );

    let listener = TcpListener::bind(&args.bind).await?;
    loop {
        let (stream, peer) = listener.accept().await?;
        let (_, writer) = stream.into_split();
        let sink = TcpSink {
            writer: Mutex::new(writer),
        };
        match session.subscribe(Box::new(sink)).await {
            Ok(subscription) => info!("{peer} subscribed as {subscription:?}"),
            Err(err) => warn!("{peer} rejected: {err}"),
        }
    }
}
