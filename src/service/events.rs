//! Progress event bus.
//!
//! In-process broadcast of lifecycle events for subscribers (API layers,
//! notification fan-out). Emission never blocks: with no subscribers the
//! event is dropped, and lagging subscribers lose oldest-first.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::types::PlatformId;

pub type EventReceiver = broadcast::Receiver<Event>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // send() errs only when nobody is listening, which is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    VideoReady {
        video_id: Uuid,
    },
    ConnectionLinked {
        connection_id: Uuid,
        platform: PlatformId,
    },
    ConnectionRevoked {
        platform: PlatformId,
    },
    MultiPostCreated {
        multi_post_id: Uuid,
        post_ids: Vec<Uuid>,
    },
    ScheduleFired {
        schedule_id: Uuid,
        post_ids: Vec<Uuid>,
    },
    PostPublished {
        post_id: Uuid,
        platform: PlatformId,
        platform_post_id: String,
        platform_url: Option<String>,
    },
    PostRetrying {
        post_id: Uuid,
        platform: PlatformId,
        attempt: i64,
        delay_ms: u64,
    },
    PostFailed {
        post_id: Uuid,
        platform: PlatformId,
        error_kind: ErrorKind,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_and_receive() {
        let bus = EventBus::new(16);
        let mut receiver = bus.subscribe();

        let video_id = Uuid::new_v4();
        bus.emit(Event::VideoReady { video_id });

        match receiver.recv().await.unwrap() {
            Event::VideoReady { video_id: got } => assert_eq!(got, video_id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_see_every_event() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(Event::ConnectionRevoked {
            platform: PlatformId::Twitter,
        });

        assert!(matches!(
            a.recv().await.unwrap(),
            Event::ConnectionRevoked { .. }
        ));
        assert!(matches!(
            b.recv().await.unwrap(),
            Event::ConnectionRevoked { .. }
        ));
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_a_no_op() {
        let bus = EventBus::new(16);
        bus.emit(Event::VideoReady {
            video_id: Uuid::new_v4(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = Event::PostFailed {
            post_id: Uuid::new_v4(),
            platform: PlatformId::Facebook,
            error_kind: ErrorKind::RepostCooldown,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"post_failed""#));
        assert!(json.contains("REPOST_COOLDOWN"));
    }
}
