//! Recording application handler.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_core::{ConnectionRef, Handler, NetworkError, Responder};
use tokio::sync::Notify;

/// Handler event as observed by a [`Recorder`]
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Handshake completed
    Connected {
        /// Connection ID
        connection: u32,
        /// Client request (server side) or server response (client side)
        message: Option<String>,
    },
    /// Connection closed
    Disconnected {
        /// Connection ID
        connection: u32,
        /// Error, `None` for graceful closes
        error: Option<NetworkError>,
    },
    /// Fire-and-forget message
    Received {
        /// Connection ID
        connection: u32,
        /// Payload
        message: String,
    },
    /// Inbound request
    Request {
        /// Connection ID
        connection: u32,
        /// Request ID as assigned by the requester
        id: u32,
        /// Payload
        message: String,
    },
    /// Peer opened a channel
    ChannelOpened {
        /// Connection ID
        connection: u32,
        /// Channel ID
        channel: i32,
        /// Channel profile
        profile: Option<String>,
    },
    /// Channel value delivered
    ChannelUpdate {
        /// Connection ID
        connection: u32,
        /// Channel ID
        channel: i32,
        /// Value
        message: String,
    },
    /// Peer closed a channel
    ChannelClosed {
        /// Connection ID
        connection: u32,
        /// Channel ID
        channel: i32,
    },
}

/// Handler that records every event.
///
/// Connect requests of `"deny"` are rejected; everything else is welcomed.
/// Requests are echoed except `"ignore"` (never answered) and `"refuse"`
/// (rejected).
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    changed: Notify,
}

impl Recorder {
    /// Create a recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of recorded events.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Number of recorded events matching `filter`.
    pub fn count(&self, filter: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| filter(e)).count()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
        self.changed.notify_waiters();
    }

    /// Wait until `find` returns a value over the recorded events.
    ///
    /// # Panics
    ///
    /// Panics if nothing matches within five seconds.
    pub async fn wait_for<T>(&self, mut find: impl FnMut(&[Event]) -> Option<T>) -> T {
        let wait = async {
            loop {
                let changed = self.changed.notified();
                tokio::pin!(changed);
                changed.as_mut().enable();
                if let Some(found) = find(&self.events.lock().unwrap()) {
                    return found;
                }
                changed.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("event not observed in time")
    }
}

impl Handler<String> for Recorder {
    fn on_connection(
        &self,
        _connection: &ConnectionRef<String>,
        request: Option<&String>,
    ) -> Result<Option<String>, String> {
        match request.map(String::as_str) {
            Some("deny") => Err("denied".to_string()),
            _ => Ok(Some("welcome".to_string())),
        }
    }

    fn on_connected(&self, connection: &ConnectionRef<String>, message: Option<&String>) {
        self.push(Event::Connected {
            connection: connection.id(),
            message: message.cloned(),
        });
    }

    fn on_disconnected(&self, connection: &ConnectionRef<String>, error: Option<&NetworkError>) {
        self.push(Event::Disconnected {
            connection: connection.id(),
            error: error.cloned(),
        });
    }

    fn on_received(&self, connection: &ConnectionRef<String>, message: String) {
        self.push(Event::Received {
            connection: connection.id(),
            message,
        });
    }

    fn on_request(
        &self,
        connection: &ConnectionRef<String>,
        message: String,
        responder: Responder<String>,
    ) {
        self.push(Event::Request {
            connection: connection.id(),
            id: responder.request_id(),
            message: message.clone(),
        });
        match message.as_str() {
            "ignore" => drop(responder),
            "refuse" => {
                let _ = responder.reject("refused");
            }
            _ => {
                let _ = responder.respond(format!("echo {message}"));
            }
        }
    }

    fn on_channel_opened(
        &self,
        connection: &ConnectionRef<String>,
        channel: i32,
        profile: Option<String>,
    ) {
        self.push(Event::ChannelOpened {
            connection: connection.id(),
            channel,
            profile,
        });
    }

    fn on_channel_update(&self, connection: &ConnectionRef<String>, channel: i32, message: String) {
        self.push(Event::ChannelUpdate {
            connection: connection.id(),
            channel,
            message,
        });
    }

    fn on_channel_closed(&self, connection: &ConnectionRef<String>, channel: i32) {
        self.push(Event::ChannelClosed {
            connection: connection.id(),
            channel,
        });
    }
}
