use glam::Vec3;

use super::{BodyIndex, ColliderIndex};

/// Typed events produced by the space during a tick and drained by the
/// application afterward.
#[derive(Debug, Clone, PartialEq)]
pub enum PhysicsEvent {
    BodySlept {
        body: BodyIndex,
    },
    BodyAwoke {
        body: BodyIndex,
    },
    CollisionStarted {
        colliders: (ColliderIndex, ColliderIndex),
    },
    CollisionEnded {
        colliders: (ColliderIndex, ColliderIndex),
    },
    /// A velocity setter or integration step exceeded the space maximum.
    InvalidVelocity {
        body: BodyIndex,
        clamped: Vec3,
    },
    /// A recoverable problem; repeated identical warnings in one tick are
    /// coalesced into a single event.
    Warning {
        message: String,
    },
}

#[derive(Debug, Default)]
pub struct PhysicsEventQueue {
    events: Vec<PhysicsEvent>,
    frame_warnings: Vec<String>,
}

impl PhysicsEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: PhysicsEvent) {
        if let PhysicsEvent::Warning { message } = &event {
            if self.frame_warnings.iter().any(|seen| seen == message) {
                return;
            }
            self.frame_warnings.push(message.clone());
        }
        self.events.push(event);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{message}");
        self.push(PhysicsEvent::Warning { message });
    }

    /// Called at each tick boundary so coalescing is per frame.
    pub fn begin_frame(&mut self) {
        self.frame_warnings.clear();
    }

    pub fn drain(&mut self) -> Vec<PhysicsEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_coalesce_within_a_frame() {
        let mut queue = PhysicsEventQueue::new();
        queue.begin_frame();
        queue.warn("mesh invalid");
        queue.warn("mesh invalid");
        queue.warn("other problem");
        assert_eq!(queue.drain().len(), 2);

        queue.begin_frame();
        queue.warn("mesh invalid");
        assert_eq!(queue.drain().len(), 1);
    }
}
