//! A peer that speaks the wire format by hand.
//!
//! Used where a test needs to withhold acknowledgements or misbehave in
//! ways a [`Manager`](tether_core::Manager) never would.

use std::sync::Arc;
use tether_core::block::BlockPool;
use tether_core::format::Outbound;
use tether_core::{BincodeCodec, ControlMessage, FormatReceiver, FormatSender, Frame};
use tether_transport::{Link, MemoryLink, MemoryNetwork, TransportStats};
use tokio::sync::mpsc;

/// Raw client end of a memory link
pub struct RawPeer {
    link: Arc<MemoryLink>,
    frames: mpsc::UnboundedReceiver<Vec<u8>>,
    sender: FormatSender<String>,
    receiver: FormatReceiver<String>,
}

impl RawPeer {
    /// Dial `name` on `network`.
    ///
    /// # Panics
    ///
    /// Panics if nothing listens at `name`.
    pub async fn dial(network: &MemoryNetwork, name: &str, label: &str) -> Self {
        let link = network.dial(name, label).expect("dial");
        let frames = link.take_receiver().await.expect("receiver");
        let codec = Arc::new(BincodeCodec::<String>::new());
        Self {
            link,
            frames,
            sender: FormatSender::new(codec.clone(), BlockPool::new(1200, 16)),
            receiver: FormatReceiver::new(codec, 1024 * 1024),
        }
    }

    /// Frame builder for hand-made frames.
    pub fn format(&self) -> &FormatSender<String> {
        &self.sender
    }

    /// Send a plaintext frame.
    ///
    /// # Panics
    ///
    /// Panics if the link is closed.
    pub async fn send(&self, outbound: &Outbound) {
        let block = self.sender.seal(outbound, None).expect("seal");
        self.link
            .send(block.as_slice(), block.reliability())
            .await
            .expect("send");
    }

    /// Send a control message.
    pub async fn send_control(&self, message: ControlMessage<String>) {
        let outbound = self.sender.control(&message).expect("control");
        self.send(&outbound).await;
    }

    /// Acknowledge a channel update.
    pub async fn sync(&self, channel: i32, sequence: u8) {
        let outbound = self.sender.sync(channel, sequence);
        self.send(&outbound).await;
    }

    /// Next frame, or `None` once the server hangs up.
    ///
    /// # Panics
    ///
    /// Panics on a frame that does not parse.
    pub async fn next(&mut self) -> Option<Frame<String>> {
        let bytes = self.frames.recv().await?;
        Some(self.receiver.parse(&bytes, None).expect("frame").1)
    }

    /// Every frame already delivered, without waiting.
    pub fn drain(&mut self) -> Vec<Frame<String>> {
        let mut frames = Vec::new();
        while let Ok(bytes) = self.frames.try_recv() {
            frames.push(self.receiver.parse(&bytes, None).expect("frame").1);
        }
        frames
    }

    /// Plaintext connect handshake. Returns the server's response.
    ///
    /// # Panics
    ///
    /// Panics if the server hangs up first.
    pub async fn connect(&mut self, request: Option<&str>) -> Option<String> {
        self.send_control(ControlMessage::Connect {
            request: request.map(str::to_string),
        })
        .await;
        loop {
            match self.next().await.expect("server hung up during connect") {
                Frame::Control(ControlMessage::CompleteConnect { response }) => return response,
                _ => continue,
            }
        }
    }

    /// Link traffic counters.
    pub fn stats(&self) -> TransportStats {
        self.link.stats()
    }
}
