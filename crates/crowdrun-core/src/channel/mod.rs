//! Transport abstraction between the server and one remote execution
//! environment.
//!
//! Higher layers only see [`Channel`] and the [`ChannelEvent`]s its handlers
//! emit; they never know which transport is underneath.

pub mod local;
pub mod outbox;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::packet::Packet;

pub use local::{LocalChannel, RemoteEnd, local_pair};
pub use outbox::Outbox;

/// How often [`await_alive`] re-checks `is_alive` between ALIVE packets.
const ALIVE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel {channel_id} did not come alive within {waited:?}")]
    ConnectionFailed { channel_id: String, waited: Duration },

    #[error("channel {0} is closed")]
    Closed(String),
}

pub type ChannelCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&str, Packet) + Send + Sync>;

/// Callbacks a channel invokes. Each receives the channel id.
#[derive(Clone)]
pub struct ChannelHandlers {
    pub on_open: ChannelCallback,
    pub on_catastrophic_disconnect: ChannelCallback,
    pub on_message: MessageCallback,
}

impl ChannelHandlers {
    /// Handlers that drop everything.
    pub fn noop() -> Self {
        Self {
            on_open: Arc::new(|_| {}),
            on_catastrophic_disconnect: Arc::new(|_| {}),
            on_message: Arc::new(|_, _| {}),
        }
    }

    /// Handlers that turn every callback into a [`ChannelEvent`] on `tx`.
    ///
    /// Callbacks run on the transport's thread; forwarding keeps them
    /// non-blocking and hands the work to whoever drains `tx`.
    pub fn forwarding(tx: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        let open_tx = tx.clone();
        let disconnect_tx = tx.clone();
        Self {
            on_open: Arc::new(move |channel_id| {
                let _ = open_tx.send(ChannelEvent::Opened {
                    channel_id: channel_id.to_owned(),
                });
            }),
            on_catastrophic_disconnect: Arc::new(move |channel_id| {
                let _ = disconnect_tx.send(ChannelEvent::Disconnected {
                    channel_id: channel_id.to_owned(),
                });
            }),
            on_message: Arc::new(move |channel_id, packet| {
                let _ = tx.send(ChannelEvent::Message {
                    channel_id: channel_id.to_owned(),
                    packet,
                });
            }),
        }
    }
}

impl fmt::Debug for ChannelHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandlers").finish_non_exhaustive()
    }
}

/// A channel callback, as data.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Opened { channel_id: String },
    Disconnected { channel_id: String },
    Message { channel_id: String, packet: Packet },
}

/// Connection to one remote execution environment.
///
/// Delivery is at-least-once within one connection lifetime; nothing is
/// promised across reconnects.
#[async_trait]
pub trait Channel: Send + Sync {
    fn channel_id(&self) -> &str;

    /// Register the callbacks. Replaces any previously registered set.
    fn set_handlers(&self, handlers: ChannelHandlers);

    /// Bring the channel up, failing with [`ChannelError::ConnectionFailed`]
    /// if the remote side does not answer within the channel's open window.
    async fn open(&self) -> Result<(), ChannelError>;

    async fn close(&self);

    /// Try to deliver one packet. Returns false if it was not sent.
    async fn send(&self, packet: &Packet) -> bool;

    fn is_alive(&self) -> bool;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Channel) {}
};

/// Poll `is_alive` until it holds, sending ALIVE every `alive_interval`,
/// or fail once `timeout` has elapsed.
pub async fn await_alive(
    channel: &dyn Channel,
    timeout: Duration,
    alive_interval: Duration,
) -> Result<(), ChannelError> {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut last_alive: Option<Instant> = None;

    loop {
        if channel.is_alive() {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(ChannelError::ConnectionFailed {
                channel_id: channel.channel_id().to_owned(),
                waited: now - started,
            });
        }
        if last_alive.is_none_or(|at| now - at >= alive_interval) {
            channel.send(&Packet::alive(channel.channel_id())).await;
            last_alive = Some(now);
        }
        tokio::time::sleep(ALIVE_POLL.min(deadline - now)).await;
    }
}
