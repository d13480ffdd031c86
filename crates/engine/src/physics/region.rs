use super::{BodyIndex, ColliderIndex, EffectIndex};

/// A collider-scoped volume whose effects apply to every body overlapping
/// it. The owning collider is normally a ghost so overlaps are detected but
/// never resolved.
#[derive(Debug, Default)]
pub struct Region {
    pub collider: ColliderIndex,
    pub effects: Vec<EffectIndex>,
    /// Bodies overlapping this tick; rebuilt during contact generation.
    pub touching_bodies: Vec<BodyIndex>,
}

impl Region {
    pub fn new(collider: ColliderIndex) -> Self {
        Self {
            collider,
            effects: Vec::new(),
            touching_bodies: Vec::new(),
        }
    }

    pub fn begin_tick(&mut self) {
        self.touching_bodies.clear();
    }

    pub fn add_touching(&mut self, body: BodyIndex) {
        if !self.touching_bodies.contains(&body) {
            self.touching_bodies.push(body);
        }
    }
}
