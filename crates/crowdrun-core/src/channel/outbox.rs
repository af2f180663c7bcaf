//! Per-channel FIFO queues of packets waiting to be sent.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::packet::Packet;

/// Outbound packets, one queue per channel id.
///
/// Producers push and move on; the supervisor's sender task drains each
/// queue in order and puts a packet back at the head when its send fails.
#[derive(Debug, Default)]
pub struct Outbox {
    queues: Mutex<HashMap<String, VecDeque<Packet>>>,
    notify: Notify,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Packet>>> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a packet at the tail and wake the sender.
    pub fn push(&self, channel_id: &str, packet: Packet) {
        self.lock()
            .entry(channel_id.to_owned())
            .or_default()
            .push_back(packet);
        self.notify.notify_one();
    }

    /// Put a packet whose send failed back at the head.
    pub fn requeue_front(&self, channel_id: &str, packet: Packet) {
        self.lock()
            .entry(channel_id.to_owned())
            .or_default()
            .push_front(packet);
    }

    pub fn pop(&self, channel_id: &str) -> Option<Packet> {
        self.lock().get_mut(channel_id).and_then(VecDeque::pop_front)
    }

    pub fn len(&self, channel_id: &str) -> usize {
        self.lock().get(channel_id).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, channel_id: &str) -> bool {
        self.len(channel_id) == 0
    }

    /// Ids of channels with at least one queued packet.
    pub fn pending_channels(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Discard everything queued for a channel.
    pub fn drop_channel(&self, channel_id: &str) -> usize {
        self.lock().remove(channel_id).map_or(0, |queue| queue.len())
    }

    /// Wake the sender without queuing anything.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Resolves after the next push (or immediately if one happened since
    /// the last wait).
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}
