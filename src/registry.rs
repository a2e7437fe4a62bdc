use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::ProjectEvent;

/// Handle for one connected client. The registry owns it for the duration
/// of its membership; the receiving half lives with the connection's writer
/// task, so a send only fails once the connection is gone.
pub struct Subscriber {
    id: Uuid,
    sender: mpsc::UnboundedSender<String>,
}

impl Subscriber {
    pub fn new(sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn send(&self, payload: &str) -> bool {
        self.sender.send(payload.to_string()).is_ok()
    }
}

struct PendingEvent {
    payload: String,
    enqueued_at: Instant,
}

#[derive(Default)]
struct ChannelState {
    subscribers: Vec<Subscriber>,
    pending: VecDeque<PendingEvent>,
}

/// Per-project pub/sub registry with a short-lived pending buffer for
/// events published while nobody is connected.
///
/// Constructed once at startup and injected wherever events are produced.
/// All mutations go through one coarse lock; channel counts stay in the
/// dozens, so contention is not a concern here.
pub struct EventRegistry {
    channels: Mutex<HashMap<String, ChannelState>>,
    idle_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    buffer_max: usize,
    buffer_ttl: Duration,
}

impl EventRegistry {
    pub fn new(buffer_max: usize, buffer_ttl: Duration) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            idle_tx: Mutex::new(None),
            buffer_max,
            buffer_ttl,
        }
    }

    /// Installs the channel that receives a project id every time its
    /// subscriber count drops to zero. The preview supervisor consumes
    /// these to tear down idle dev-servers.
    pub fn set_idle_notifier(&self, tx: mpsc::UnboundedSender<String>) {
        *self.idle_tx.lock() = Some(tx);
    }

    /// Registers a connection under a project. Any non-expired pending
    /// events are flushed to this subscriber only, in original publish
    /// order, then the buffer is cleared. Subscribing the same connection
    /// twice is a no-op.
    pub fn subscribe(&self, project_id: &str, subscriber: Subscriber) {
        let mut channels = self.channels.lock();
        let channel = channels.entry(project_id.to_string()).or_default();

        if channel.subscribers.iter().any(|s| s.id == subscriber.id) {
            debug!("subscriber {} already registered for {}", subscriber.id, project_id);
            return;
        }

        Self::prune_expired(&mut channel.pending, self.buffer_ttl);
        let mut flushed = 0;
        while let Some(pending) = channel.pending.front() {
            if !subscriber.send(&pending.payload) {
                // Connection died before registration; keep the rest of
                // the buffer for the next subscriber.
                warn!(
                    "not registering subscriber {} for {}: connection gone",
                    subscriber.id, project_id
                );
                return;
            }
            channel.pending.pop_front();
            flushed += 1;
        }
        if flushed > 0 {
            info!("flushed {} pending event(s) to new subscriber for {}", flushed, project_id);
        }

        info!("subscriber {} joined project {}", subscriber.id, project_id);
        channel.subscribers.push(subscriber);
    }

    /// Removes a connection. The channel entry survives as long as its
    /// pending buffer does; the buffer itself expires via TTL.
    pub fn unsubscribe(&self, project_id: &str, subscriber_id: Uuid) {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get_mut(project_id) else {
            return;
        };

        let before = channel.subscribers.len();
        channel.subscribers.retain(|s| s.id != subscriber_id);
        if channel.subscribers.len() == before {
            return;
        }
        info!("subscriber {} left project {}", subscriber_id, project_id);

        if channel.subscribers.is_empty() {
            if channel.pending.is_empty() {
                channels.remove(project_id);
            }
            self.notify_idle(project_id);
        }
    }

    /// Current subscriber count for a project.
    pub fn count(&self, project_id: &str) -> usize {
        self.channels
            .lock()
            .get(project_id)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    /// Serializes the event once and delivers it to every current
    /// subscriber. A failed send drops that one subscriber and delivery
    /// continues; nothing is ever raised to the publisher.
    pub fn broadcast(&self, project_id: &str, event: &ProjectEvent) {
        let Some(frame) = event.to_frame() else {
            return;
        };
        self.broadcast_frame(project_id, &frame);
    }

    /// Delivers an already-serialized frame; used by the publisher so the
    /// serialization cost is paid once per publish, not per tier.
    pub fn broadcast_frame(&self, project_id: &str, frame: &str) {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get_mut(project_id) else {
            return;
        };

        let before = channel.subscribers.len();
        channel.subscribers.retain(|subscriber| {
            let delivered = subscriber.send(frame);
            if !delivered {
                warn!(
                    "dropping subscriber {} on {}: connection gone",
                    subscriber.id, project_id
                );
            }
            delivered
        });

        if channel.subscribers.is_empty() && before > 0 {
            if channel.pending.is_empty() {
                channels.remove(project_id);
            }
            self.notify_idle(project_id);
        }
    }

    /// Delivers a frame to every current subscriber, or buffers it when no
    /// live subscriber remains. Delivery and the buffer fallback happen
    /// under one lock acquisition, so a publish cannot fall between a
    /// departing subscriber and the pending buffer. Returns the number of
    /// subscribers reached.
    pub fn deliver_frame(&self, project_id: &str, frame: String) -> usize {
        let mut channels = self.channels.lock();
        let channel = channels.entry(project_id.to_string()).or_default();

        let before = channel.subscribers.len();
        channel.subscribers.retain(|subscriber| {
            let delivered = subscriber.send(&frame);
            if !delivered {
                warn!(
                    "dropping subscriber {} on {}: connection gone",
                    subscriber.id, project_id
                );
            }
            delivered
        });

        let delivered = channel.subscribers.len();
        if delivered == 0 {
            self.push_pending(channel, project_id, frame);
            if before > 0 {
                self.notify_idle(project_id);
            }
        }
        delivered
    }

    /// Holds an event for a project with no live subscriber. Oldest entries
    /// are evicted when the buffer is full; expired entries are pruned
    /// opportunistically.
    pub fn buffer(&self, project_id: &str, event: &ProjectEvent) {
        let Some(frame) = event.to_frame() else {
            return;
        };
        self.buffer_frame(project_id, frame);
    }

    pub fn buffer_frame(&self, project_id: &str, frame: String) {
        let mut channels = self.channels.lock();
        let channel = channels.entry(project_id.to_string()).or_default();
        self.push_pending(channel, project_id, frame);
    }

    fn push_pending(&self, channel: &mut ChannelState, project_id: &str, frame: String) {
        Self::prune_expired(&mut channel.pending, self.buffer_ttl);
        while channel.pending.len() >= self.buffer_max {
            channel.pending.pop_front();
            debug!("pending buffer full for {}, evicting oldest", project_id);
        }
        channel.pending.push_back(PendingEvent {
            payload: frame,
            enqueued_at: Instant::now(),
        });
    }

    /// Number of deliverable buffered events for a project.
    pub fn pending_count(&self, project_id: &str) -> usize {
        let mut channels = self.channels.lock();
        match channels.get_mut(project_id) {
            Some(channel) => {
                Self::prune_expired(&mut channel.pending, self.buffer_ttl);
                channel.pending.len()
            }
            None => 0,
        }
    }

    fn prune_expired(pending: &mut VecDeque<PendingEvent>, ttl: Duration) {
        while pending
            .front()
            .map(|p| p.enqueued_at.elapsed() > ttl)
            .unwrap_or(false)
        {
            pending.pop_front();
        }
    }

    fn notify_idle(&self, project_id: &str) {
        if let Some(tx) = self.idle_tx.lock().as_ref() {
            let _ = tx.send(project_id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ProjectEvent;

    fn test_registry() -> EventRegistry {
        EventRegistry::new(8, Duration::from_secs(30))
    }

    fn connected() -> (Subscriber, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Subscriber::new(tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn test_broadcast_delivers_in_publish_order_exactly_once() {
        let registry = test_registry();
        let (sub, mut rx) = connected();
        registry.subscribe("p1", sub);

        for i in 0..5 {
            registry.broadcast("p1", &ProjectEvent::error(format!("e{}", i)));
        }

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 5);
        for (i, frame) in frames.iter().enumerate() {
            assert!(frame.contains(&format!("e{}", i)));
        }
    }

    #[test]
    fn test_broadcast_reaches_all_subscribers() {
        let registry = test_registry();
        let (sub_a, mut rx_a) = connected();
        let (sub_b, mut rx_b) = connected();
        registry.subscribe("p1", sub_a);
        registry.subscribe("p1", sub_b);

        registry.broadcast("p1", &ProjectEvent::error("hello"));

        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[test]
    fn test_dead_subscriber_does_not_abort_delivery() {
        let registry = test_registry();
        let (sub_dead, rx_dead) = connected();
        let (sub_live, mut rx_live) = connected();
        registry.subscribe("p1", sub_dead);
        registry.subscribe("p1", sub_live);
        drop(rx_dead);

        registry.broadcast("p1", &ProjectEvent::error("still here"));

        assert_eq!(drain(&mut rx_live).len(), 1);
        assert_eq!(registry.count("p1"), 1);
    }

    #[test]
    fn test_buffered_event_flushes_once_to_new_subscriber() {
        let registry = test_registry();
        registry.buffer("p1", &ProjectEvent::error("missed me"));
        assert_eq!(registry.pending_count("p1"), 1);

        let (sub, mut rx) = connected();
        registry.subscribe("p1", sub);

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("missed me"));
        assert_eq!(registry.pending_count("p1"), 0);

        // A second subscriber must not see the flushed event again.
        let (sub2, mut rx2) = connected();
        registry.subscribe("p1", sub2);
        assert!(drain(&mut rx2).is_empty());
    }

    #[test]
    fn test_expired_pending_events_are_not_delivered() {
        let registry = EventRegistry::new(8, Duration::from_millis(20));
        registry.buffer("p1", &ProjectEvent::error("stale"));
        std::thread::sleep(Duration::from_millis(40));

        let (sub, mut rx) = connected();
        registry.subscribe("p1", sub);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_buffer_evicts_oldest_when_full() {
        let registry = EventRegistry::new(2, Duration::from_secs(30));
        registry.buffer("p1", &ProjectEvent::error("first"));
        registry.buffer("p1", &ProjectEvent::error("second"));
        registry.buffer("p1", &ProjectEvent::error("third"));

        let (sub, mut rx) = connected();
        registry.subscribe("p1", sub);
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("second"));
        assert!(frames[1].contains("third"));
    }

    #[test]
    fn test_deliver_frame_buffers_when_last_subscriber_died() {
        let registry = test_registry();
        let (idle_tx, mut idle_rx) = mpsc::unbounded_channel();
        registry.set_idle_notifier(idle_tx);

        let (sub, rx) = connected();
        registry.subscribe("p1", sub);
        drop(rx);

        // The lone subscriber is gone but still registered; the frame must
        // land in the pending buffer instead of vanishing.
        let delivered = registry.deliver_frame("p1", "{\"late\":true}".to_string());
        assert_eq!(delivered, 0);
        assert_eq!(registry.count("p1"), 0);
        assert_eq!(registry.pending_count("p1"), 1);
        assert_eq!(idle_rx.try_recv().unwrap(), "p1");

        let (sub2, mut rx2) = connected();
        registry.subscribe("p1", sub2);
        assert_eq!(drain(&mut rx2).len(), 1);
    }

    #[test]
    fn test_deliver_frame_reports_reached_subscribers() {
        let registry = test_registry();
        let (sub, mut rx) = connected();
        registry.subscribe("p1", sub);

        assert_eq!(registry.deliver_frame("p1", "{}".to_string()), 1);
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(registry.pending_count("p1"), 0);
    }

    #[test]
    fn test_flush_failure_skips_registration_and_keeps_pending() {
        let registry = test_registry();
        registry.buffer("p1", &ProjectEvent::error("held"));

        let (sub, rx) = connected();
        drop(rx);
        registry.subscribe("p1", sub);

        // The dead connection must not inflate the count, and the buffered
        // event stays for the next subscriber.
        assert_eq!(registry.count("p1"), 0);
        assert_eq!(registry.pending_count("p1"), 1);

        let (sub2, mut rx2) = connected();
        registry.subscribe("p1", sub2);
        assert_eq!(drain(&mut rx2).len(), 1);
    }

    #[test]
    fn test_subscribe_is_idempotent_per_connection() {
        let registry = test_registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let subscriber = Subscriber::new(tx.clone());
        let id = subscriber.id();
        registry.subscribe("p1", subscriber);
        registry.subscribe(
            "p1",
            Subscriber {
                id,
                sender: tx,
            },
        );
        assert_eq!(registry.count("p1"), 1);
    }

    #[test]
    fn test_unsubscribe_to_zero_sends_idle_notice() {
        let registry = test_registry();
        let (idle_tx, mut idle_rx) = mpsc::unbounded_channel();
        registry.set_idle_notifier(idle_tx);

        let (sub, _rx) = connected();
        let id = sub.id();
        registry.subscribe("p1", sub);
        registry.unsubscribe("p1", id);

        assert_eq!(idle_rx.try_recv().unwrap(), "p1");
        assert_eq!(registry.count("p1"), 0);
    }

    #[test]
    fn test_unsubscribe_keeps_pending_buffer() {
        let registry = test_registry();
        let (sub, _rx) = connected();
        let id = sub.id();
        registry.subscribe("p1", sub);
        registry.unsubscribe("p1", id);

        registry.buffer("p1", &ProjectEvent::error("late"));
        let (sub2, mut rx2) = connected();
        registry.subscribe("p1", sub2);
        assert_eq!(drain(&mut rx2).len(), 1);
    }
}
