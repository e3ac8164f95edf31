//! Observability event stream (§3a, §9 design note). The core publishes
//! these on a `broadcast` channel; a terminal dashboard or any other UI is a
//! collaborator that subscribes, never a participant on the request path.
//! When nobody is listening, or a slow subscriber falls behind, `broadcast`
//! semantics drop the oldest event for that subscriber — the core itself
//! never blocks or buffers unboundedly on its behalf.

use tokio::sync::broadcast;
use uuid::Uuid;

/// Default capacity for the event broadcast channel. Generous enough that a
/// dashboard polling at a reasonable interval won't miss bursts, small enough
/// that a permanently-unread channel doesn't grow without bound.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum TunnelEvent {
    RequestStarted {
        request_id: Uuid,
        subdomain: String,
        method: String,
        path: String,
    },
    RequestCompleted {
        request_id: Uuid,
        status: u16,
        duration_ms: u64,
    },
    RequestTimedOut {
        request_id: Uuid,
    },
    StreamProgress {
        request_id: Uuid,
        bytes_so_far: u64,
    },
    ConnectionStateChanged {
        subdomain: String,
        state: ConnectionState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    Disconnected,
}

pub type EventSender = broadcast::Sender<TunnelEvent>;
pub type EventReceiver = broadcast::Receiver<TunnelEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}

/// Publish an event, ignoring the "no subscribers" error — the request path
/// must never fail because nobody is watching the dashboard.
pub fn publish(sender: &EventSender, event: TunnelEvent) {
    let _ = sender.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let (tx, _rx) = channel();
        publish(
            &tx,
            TunnelEvent::RequestTimedOut {
                request_id: Uuid::nil(),
            },
        );
    }

    #[tokio::test]
    async fn subscriber_observes_published_event() {
        let (tx, mut rx) = channel();
        publish(
            &tx,
            TunnelEvent::ConnectionStateChanged {
                subdomain: "brave-fox-abcd".to_string(),
                state: ConnectionState::Connected,
            },
        );
        let event = rx.recv().await.unwrap();
        match event {
            TunnelEvent::ConnectionStateChanged { subdomain, state } => {
                assert_eq!(subdomain, "brave-fox-abcd");
                assert_eq!(state, ConnectionState::Connected);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
