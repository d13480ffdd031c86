use std::collections::HashMap;

use glam::{Mat3, Vec3};

use super::edges::TriangleInfo;
use super::shape::{Aabb, Shape};
use super::{BodyIndex, EffectIndex, NodeIndex};

/// How the collider's active body moves; cached so queries and filters never
/// need to chase the body arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Motion {
    #[default]
    Static,
    Kinematic,
    Dynamic,
}

/// Surface properties mixed per contact pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    pub density: f32,
    pub friction: f32,
    pub restitution: f32,
    /// Wins restitution mixing outright instead of taking the maximum.
    pub high_priority: bool,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            density: 1.0,
            friction: 0.5,
            restitution: 0.0,
            high_priority: false,
        }
    }
}

impl Material {
    pub fn mixed_friction(&self, other: &Material) -> f32 {
        (self.friction * other.friction).sqrt()
    }

    pub fn mixed_restitution(&self, other: &Material) -> f32 {
        match (self.high_priority, other.high_priority) {
            (true, false) => self.restitution,
            (false, true) => other.restitution,
            _ => self.restitution.max(other.restitution),
        }
    }
}

/// A shape bound into the physics node tree.
#[derive(Debug)]
pub struct Collider {
    pub shape: Shape,
    pub node: NodeIndex,
    /// The rigid body on the same node, if any.
    pub direct_body: Option<BodyIndex>,
    /// The closest non-static body up the ancestor chain; forces apply here.
    pub active_body: Option<BodyIndex>,
    pub motion: Motion,
    pub collision_group: u32,
    /// Ghost colliders detect but never resolve.
    pub ghost: bool,
    pub material: Material,
    pub effects: Vec<EffectIndex>,
    pub world_translation: Vec3,
    pub world_rotation: Mat3,
    pub world_aabb: Aabb,
    pub bounding_sphere_center: Vec3,
    pub bounding_sphere_radius: f32,
    /// Height-map edge adjacency built lazily per touched triangle.
    pub edge_cache: HashMap<u32, TriangleInfo>,
}

impl Collider {
    pub fn new(shape: Shape, node: NodeIndex) -> Self {
        let radius = shape.bounding_radius();
        Self {
            shape,
            node,
            direct_body: None,
            active_body: None,
            motion: Motion::Static,
            collision_group: 0,
            ghost: false,
            material: Material::default(),
            effects: Vec::new(),
            world_translation: Vec3::ZERO,
            world_rotation: Mat3::IDENTITY,
            world_aabb: Aabb::ZERO,
            bounding_sphere_center: Vec3::ZERO,
            bounding_sphere_radius: radius,
        edge_cache: HashMap::new(),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.motion == Motion::Dynamic
    }

    pub fn is_kinematic(&self) -> bool {
        self.motion == Motion::Kinematic
    }

    pub fn is_static(&self) -> bool {
        self.motion == Motion::Static
    }

    /// Refreshes cached world-space transform and bounds from the node.
    pub fn update_world_bounds(&mut self, translation: Vec3, rotation: Mat3) {
        self.world_translation = translation;
        self.world_rotation = rotation;
        self.world_aabb = self.shape.world_aabb(translation, rotation);
        self.bounding_sphere_center = self.world_aabb.center();
        self.bounding_sphere_radius = self.shape.bounding_radius();
    }

    pub fn to_world(&self, local: Vec3) -> Vec3 {
        self.world_rotation * local + self.world_translation
    }

    pub fn to_local(&self, world: Vec3) -> Vec3 {
        self.world_rotation.transpose() * (world - self.world_translation)
    }

    pub fn world_center_of_mass(&self) -> Vec3 {
        self.to_world(self.shape.local_center_of_mass())
    }

    pub fn mass(&self) -> f32 {
        self.shape.volume() * self.material.density
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restitution_mixing_honors_priority() {
        let soft = Material {
            restitution: 0.1,
            high_priority: true,
            ..Default::default()
        };
        let bouncy = Material {
            restitution: 0.9,
            ..Default::default()
        };
        assert_eq!(soft.mixed_restitution(&bouncy), 0.1);
        assert_eq!(bouncy.mixed_restitution(&soft), 0.1);

        let plain = Material::default();
        assert_eq!(plain.mixed_restitution(&bouncy), 0.9);
    }

    #[test]
    fn collider_mass_scales_with_density() {
        let mut collider = Collider::new(
            Shape::Box {
                half_extents: Vec3::splat(0.5),
            },
            0,
        );
        collider.material.density = 2.5;
        assert!((collider.mass() - 2.5).abs() < 1e-5);
    }
}
