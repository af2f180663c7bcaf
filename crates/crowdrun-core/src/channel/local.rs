//! In-process channel pair.
//!
//! [`LocalChannel`] is the server end handed to the supervisor; [`RemoteEnd`]
//! plays the remote client. The test suite drives whole task runs through
//! it, and embedders hosting the remote side in the same process can too.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Channel, ChannelError, ChannelHandlers, await_alive};
use crate::packet::Packet;

const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_ALIVE_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct Shared {
    channel_id: String,
    handlers: RwLock<Option<ChannelHandlers>>,
    /// Remote side is connected.
    alive: AtomicBool,
    /// Remote side takes deliveries; clearing it makes sends fail.
    accepting: AtomicBool,
    /// Server side has finished `open()`.
    opened: AtomicBool,
    closed: AtomicBool,
    to_remote: mpsc::UnboundedSender<Packet>,
}

impl Shared {
    fn handlers(&self) -> Option<ChannelHandlers> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Server end of an in-process channel.
#[derive(Debug, Clone)]
pub struct LocalChannel {
    shared: Arc<Shared>,
    open_timeout: Duration,
    alive_interval: Duration,
}

/// Remote end of an in-process channel.
#[derive(Debug)]
pub struct RemoteEnd {
    shared: Arc<Shared>,
    inbox: mpsc::UnboundedReceiver<Packet>,
}

/// Create a connected pair of channel ends. The remote end starts
/// disconnected; call [`RemoteEnd::connect`] to bring it up.
pub fn local_pair(channel_id: impl Into<String>) -> (LocalChannel, RemoteEnd) {
    let (to_remote, inbox) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        channel_id: channel_id.into(),
        handlers: RwLock::new(None),
        alive: AtomicBool::new(false),
        accepting: AtomicBool::new(true),
        opened: AtomicBool::new(false),
        closed: AtomicBool::new(false),
        to_remote,
    });
    let channel = LocalChannel {
        shared: shared.clone(),
        open_timeout: DEFAULT_OPEN_TIMEOUT,
        alive_interval: DEFAULT_ALIVE_INTERVAL,
    };
    (channel, RemoteEnd { shared, inbox })
}

impl LocalChannel {
    /// Set how long `open()` waits for the remote side and how often it
    /// pings with ALIVE meanwhile.
    pub fn with_open_window(mut self, timeout: Duration, alive_interval: Duration) -> Self {
        self.open_timeout = timeout;
        self.alive_interval = alive_interval;
        self
    }
}

#[async_trait]
impl Channel for LocalChannel {
    fn channel_id(&self) -> &str {
        &self.shared.channel_id
    }

    fn set_handlers(&self, handlers: ChannelHandlers) {
        *self
            .shared
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handlers);
    }

    async fn open(&self) -> Result<(), ChannelError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed(self.shared.channel_id.clone()));
        }
        await_alive(self, self.open_timeout, self.alive_interval).await?;
        self.shared.opened.store(true, Ordering::SeqCst);
        if let Some(handlers) = self.shared.handlers() {
            (handlers.on_open)(&self.shared.channel_id);
        }
        Ok(())
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        debug!(channel_id = %self.shared.channel_id, "local channel closed");
    }

    async fn send(&self, packet: &Packet) -> bool {
        if !self.is_alive() || !self.shared.accepting.load(Ordering::SeqCst) {
            return false;
        }
        self.shared.to_remote.send(packet.clone()).is_ok()
    }

    fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst) && !self.shared.closed.load(Ordering::SeqCst)
    }
}

impl RemoteEnd {
    pub fn channel_id(&self) -> &str {
        &self.shared.channel_id
    }

    /// Connect (or reconnect) the remote side. A reconnect after the server
    /// finished opening fires `on_open` again.
    pub fn connect(&self) {
        let was_alive = self.shared.alive.swap(true, Ordering::SeqCst);
        if !was_alive && self.shared.opened.load(Ordering::SeqCst) {
            if let Some(handlers) = self.shared.handlers() {
                (handlers.on_open)(&self.shared.channel_id);
            }
        }
    }

    /// Drop the connection abruptly, firing `on_catastrophic_disconnect`.
    pub fn disconnect(&self) {
        let was_alive = self.shared.alive.swap(false, Ordering::SeqCst);
        if was_alive {
            if let Some(handlers) = self.shared.handlers() {
                (handlers.on_catastrophic_disconnect)(&self.shared.channel_id);
            }
        }
    }

    /// Make server-side sends fail (false) or succeed again (true) without
    /// dropping the connection.
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Deliver a packet to the server. Returns false when disconnected.
    pub fn send(&self, packet: Packet) -> bool {
        if !self.shared.alive.load(Ordering::SeqCst) || self.shared.closed.load(Ordering::SeqCst) {
            return false;
        }
        match self.shared.handlers() {
            Some(handlers) => {
                (handlers.on_message)(&self.shared.channel_id, packet);
                true
            }
            None => false,
        }
    }

    /// Next packet sent by the server.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.inbox.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Packet> {
        self.inbox.try_recv().ok()
    }
}
