use bitflags::bitflags;
use glam::{Mat3, Vec3};

use super::body::RigidBody;
use super::collider::Collider;
use super::spring::SpringSystem;
use super::{BodyIndex, ColliderIndex, NodeIndex, RegionIndex};

bitflags! {
    /// Effect categories, used by bodies to opt out of space-scoped effects.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EffectKindFlags: u32 {
        const FORCE = 1 << 0;
        const GRAVITY = 1 << 1;
        const POINT_FORCE = 1 << 2;
        const POINT_GRAVITY = 1 << 3;
        const WIND = 1 << 4;
        const THRUST = 1 << 5;
        const TORQUE = 1 << 6;
    }
}

/// Where an effect is attached, which decides what it applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectScope {
    /// Applies to every body in the space.
    Space,
    /// Applies to bodies under this node's subtree.
    Hierarchy(NodeIndex),
    /// Applies to bodies overlapping the region's collider.
    Region(RegionIndex),
    /// Applies to one body.
    Body(BodyIndex),
    /// Applies to the collider's active body.
    Collider(ColliderIndex),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PointInterpolation {
    #[default]
    Linear,
    Quadratic,
}

/// What happens past the max distance of a point effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PointEndCondition {
    /// No force beyond the max distance.
    NoEffect,
    /// Keep interpolating along the same curve.
    ContinueFalloff,
    /// Hold the strength computed at the max distance.
    #[default]
    ClampToMax,
}

#[derive(Debug, Clone)]
pub enum EffectKind {
    /// Constant directional force.
    Force { direction: Vec3, strength: f32 },
    /// Constant acceleration, independent of mass.
    Gravity { direction: Vec3, strength: f32 },
    PointForce {
        local_position: Vec3,
        min_distance: f32,
        max_distance: f32,
        strength_at_min: f32,
        strength_at_max: f32,
        interpolation: PointInterpolation,
        end_condition: PointEndCondition,
    },
    PointGravity {
        local_position: Vec3,
        min_distance: f32,
        max_distance: f32,
        strength_at_min: f32,
        strength_at_max: f32,
        interpolation: PointInterpolation,
        end_condition: PointEndCondition,
    },
    /// Drag proportional to exposed face area.
    Wind { direction: Vec3, speed: f32 },
    /// Force applied at an offset point, producing torque.
    Thrust {
        direction: Vec3,
        strength: f32,
        local_offset: Vec3,
    },
    Torque { axis: Vec3, strength: f32 },
}

impl EffectKind {
    pub fn flag(&self) -> EffectKindFlags {
        match self {
            EffectKind::Force { .. } => EffectKindFlags::FORCE,
            EffectKind::Gravity { .. } => EffectKindFlags::GRAVITY,
            EffectKind::PointForce { .. } => EffectKindFlags::POINT_FORCE,
            EffectKind::PointGravity { .. } => EffectKindFlags::POINT_GRAVITY,
            EffectKind::Wind { .. } => EffectKindFlags::WIND,
            EffectKind::Thrust { .. } => EffectKindFlags::THRUST,
            EffectKind::Torque { .. } => EffectKindFlags::TORQUE,
        }
    }
}

/// A force field attached somewhere in the space. World-space parameters are
/// computed once per tick in `precalculate` and shared by every application.
#[derive(Debug, Clone)]
pub struct PhysicsEffect {
    pub kind: EffectKind,
    pub scope: EffectScope,
    pub active: bool,
    /// Wake sleeping bodies when the effect changes.
    pub wake_on_change: bool,
    /// Interpret directions in the owner's local space.
    pub local_space_direction: bool,
    world_direction: Vec3,
    world_position: Vec3,
}

impl PhysicsEffect {
    pub fn new(kind: EffectKind, scope: EffectScope) -> Self {
        Self {
            kind,
            scope,
            active: true,
            wake_on_change: true,
            local_space_direction: false,
            world_direction: Vec3::ZERO,
            world_position: Vec3::ZERO,
        }
    }

    pub fn world_direction(&self) -> Vec3 {
        self.world_direction
    }

    pub fn world_position(&self) -> Vec3 {
        self.world_position
    }

    /// Computes world-space parameters once per tick from the owner's
    /// transform.
    pub fn precalculate(&mut self, owner_translation: Vec3, owner_rotation: Mat3) {
        if !self.active {
            return;
        }
        let orient = |direction: Vec3| {
            if self.local_space_direction {
                (owner_rotation * direction).normalize_or_zero()
            } else {
                direction.normalize_or_zero()
            }
        };
        match &self.kind {
            EffectKind::Force { direction, .. } | EffectKind::Gravity { direction, .. } => {
                self.world_direction = orient(*direction);
            }
            EffectKind::PointForce { local_position, .. }
            | EffectKind::PointGravity { local_position, .. } => {
                self.world_position = owner_rotation * *local_position + owner_translation;
            }
            EffectKind::Wind { direction, .. } => {
                self.world_direction = orient(*direction);
            }
            EffectKind::Thrust {
                direction,
                local_offset,
                ..
            } => {
                self.world_direction = orient(*direction);
                self.world_position = owner_rotation * *local_offset + owner_translation;
            }
            EffectKind::Torque { axis, .. } => {
                self.world_direction = orient(*axis);
            }
        }
    }

    /// Applies the effect's forces to a rigid body. `colliders` are the
    /// body's own colliders, needed by wind for face areas.
    pub fn apply_to_body(&self, body: &mut RigidBody, colliders: &[&Collider]) {
        if !self.active {
            return;
        }
        match &self.kind {
            EffectKind::Force { strength, .. } => {
                body.apply_force(self.world_direction * *strength);
            }
            EffectKind::Gravity { strength, .. } => {
                let acceleration = self.world_direction * *strength;
                let force = body.inv_mass.apply_inverted(acceleration);
                body.apply_force(force);
            }
            EffectKind::PointForce {
                min_distance,
                max_distance,
                strength_at_min,
                strength_at_max,
                interpolation,
                end_condition,
                ..
            } => {
                if let Some(force) = self.point_force(
                    body.center_of_mass,
                    *min_distance,
                    *max_distance,
                    *strength_at_min,
                    *strength_at_max,
                    *interpolation,
                    *end_condition,
                ) {
                    body.apply_force(force);
                }
            }
            EffectKind::PointGravity {
                min_distance,
                max_distance,
                strength_at_min,
                strength_at_max,
                interpolation,
                end_condition,
                ..
            } => {
                if let Some(acceleration) = self.point_force(
                    body.center_of_mass,
                    *min_distance,
                    *max_distance,
                    *strength_at_min,
                    *strength_at_max,
                    *interpolation,
                    *end_condition,
                ) {
                    let force = body.inv_mass.apply_inverted(acceleration);
                    body.apply_force(force);
                }
            }
            EffectKind::Wind { speed, .. } => {
                if body.is_kinematic() {
                    return;
                }
                for collider in colliders {
                    self.apply_wind_to_collider(body, collider, *speed);
                }
            }
            EffectKind::Thrust { strength, .. } => {
                let force = self.world_direction * *strength;
                body.apply_force_at_point(force, self.world_position);
            }
            EffectKind::Torque { strength, .. } => {
                body.apply_torque(self.world_direction * *strength);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn point_force(
        &self,
        target: Vec3,
        min_distance: f32,
        max_distance: f32,
        strength_at_min: f32,
        strength_at_max: f32,
        interpolation: PointInterpolation,
        end_condition: PointEndCondition,
    ) -> Option<Vec3> {
        let offset = target - self.world_position;
        let distance = offset.length();
        if distance <= f32::EPSILON {
            return None;
        }
        let direction = offset / distance;

        if distance > max_distance && end_condition == PointEndCondition::NoEffect {
            return None;
        }
        let strength = if distance < min_distance {
            strength_at_min
        } else {
            let mut t = (distance - min_distance) / (max_distance - min_distance);
            if end_condition == PointEndCondition::ClampToMax {
                t = t.min(1.0);
            }
            let t = match interpolation {
                PointInterpolation::Linear => t,
                PointInterpolation::Quadratic => t * t,
            };
            strength_at_min + (strength_at_max - strength_at_min) * t
        };
        Some(direction * strength)
    }

    fn apply_wind_to_collider(&self, body: &mut RigidBody, collider: &Collider, speed: f32) {
        let rotation = collider.world_rotation;
        let basis = [rotation.x_axis, rotation.y_axis, rotation.z_axis];
        // Approximate exposed area per basis plane from the shape's aabb.
        let extents = collider.world_aabb.half_extents() * 2.0;
        let areas = [
            extents.y * extents.z,
            extents.x * extents.z,
            extents.x * extents.y,
        ];

        let force = self.world_direction * speed;
        for axis in 0..3 {
            let alignment = self.world_direction.dot(basis[axis]);
            let mut offset_axis = basis[axis];
            if alignment < 0.0 {
                offset_axis = -offset_axis;
            }
            body.apply_force_at_offset(force * (alignment.abs() * areas[axis]), offset_axis);
        }
    }

    /// Applies the effect to a spring system's point masses and faces.
    pub fn apply_to_spring(&self, system: &mut SpringSystem) {
        if !self.active {
            return;
        }
        match &self.kind {
            EffectKind::Force { strength, .. } => {
                let force = self.world_direction * *strength;
                for point in system.point_masses_mut() {
                    if point.inv_mass != 0.0 {
                        point.force += force;
                    }
                }
            }
            EffectKind::Gravity { strength, .. } => {
                let acceleration = self.world_direction * *strength;
                for point in system.point_masses_mut() {
                    if point.inv_mass != 0.0 {
                        point.force += acceleration / point.inv_mass;
                    }
                }
            }
            EffectKind::Wind { speed, .. } => {
                let wind_direction = self.world_direction;
                let wind_speed_sq = speed * speed;
                system.apply_face_force(|p0, p1, p2| {
                    let raw_normal = (p0 - p1).cross(p2 - p1);
                    let mut normal = raw_normal;
                    let area = 0.5 * normal.length();
                    normal = normal.normalize_or_zero();
                    let strength = normal.dot(wind_direction) * wind_speed_sq;
                    normal * (area * strength)
                });
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dynamic_body() -> RigidBody {
        let mut body = RigidBody::new(0);
        body.inv_mass.set_inv_mass(0.5);
        body
    }

    #[test]
    fn gravity_is_mass_independent() {
        let mut effect = PhysicsEffect::new(
            EffectKind::Gravity {
                direction: -Vec3::Y,
                strength: 10.0,
            },
            EffectScope::Space,
        );
        effect.precalculate(Vec3::ZERO, Mat3::IDENTITY);

        // Mass 2 body receives force 20 for acceleration 10.
        let mut body = dynamic_body();
        effect.apply_to_body(&mut body, &[]);
        assert!((body.force.y - -20.0).abs() < 1e-5);
    }

    #[test]
    fn force_ignores_mass() {
        let mut effect = PhysicsEffect::new(
            EffectKind::Force {
                direction: Vec3::X,
                strength: 6.0,
            },
            EffectScope::Space,
        );
        effect.precalculate(Vec3::ZERO, Mat3::IDENTITY);
        let mut body = dynamic_body();
        effect.apply_to_body(&mut body, &[]);
        assert!((body.force.x - 6.0).abs() < 1e-5);
    }

    #[test]
    fn point_force_interpolates_and_clamps() {
        let mut effect = PhysicsEffect::new(
            EffectKind::PointForce {
                local_position: Vec3::ZERO,
                min_distance: 1.0,
                max_distance: 5.0,
                strength_at_min: 10.0,
                strength_at_max: 0.0,
                interpolation: PointInterpolation::Linear,
                end_condition: PointEndCondition::ClampToMax,
            },
            EffectScope::Space,
        );
        effect.precalculate(Vec3::ZERO, Mat3::IDENTITY);

        let mut body = dynamic_body();
        body.center_of_mass = Vec3::new(3.0, 0.0, 0.0);
        effect.apply_to_body(&mut body, &[]);
        // Halfway: strength 5, pushing outward.
        assert!((body.force.x - 5.0).abs() < 1e-4);

        let mut far = dynamic_body();
        far.center_of_mass = Vec3::new(100.0, 0.0, 0.0);
        effect.apply_to_body(&mut far, &[]);
        assert!(far.force.x.abs() < 1e-4);
    }

    #[test]
    fn point_force_no_effect_past_max() {
        let mut effect = PhysicsEffect::new(
            EffectKind::PointForce {
                local_position: Vec3::ZERO,
                min_distance: 1.0,
                max_distance: 5.0,
                strength_at_min: 10.0,
                strength_at_max: 10.0,
                interpolation: PointInterpolation::Linear,
                end_condition: PointEndCondition::NoEffect,
            },
            EffectScope::Space,
        );
        effect.precalculate(Vec3::ZERO, Mat3::IDENTITY);
        let mut body = dynamic_body();
        body.center_of_mass = Vec3::new(6.0, 0.0, 0.0);
        effect.apply_to_body(&mut body, &[]);
        assert_eq!(body.force, Vec3::ZERO);
    }

    #[test]
    fn local_space_direction_rotates_with_owner() {
        let mut effect = PhysicsEffect::new(
            EffectKind::Force {
                direction: Vec3::X,
                strength: 1.0,
            },
            EffectScope::Space,
        );
        effect.local_space_direction = true;
        effect.precalculate(Vec3::ZERO, Mat3::from_rotation_z(std::f32::consts::FRAC_PI_2));
        let mut body = dynamic_body();
        effect.apply_to_body(&mut body, &[]);
        assert!(body.force.y > 0.99);
    }

    #[test]
    fn torque_spins_about_world_axis() {
        let mut effect = PhysicsEffect::new(
            EffectKind::Torque {
                axis: Vec3::Y,
                strength: 3.0,
            },
            EffectScope::Space,
        );
        effect.precalculate(Vec3::ZERO, Mat3::IDENTITY);
        let mut body = dynamic_body();
        effect.apply_to_body(&mut body, &[]);
        assert!((body.torque.y - 3.0).abs() < 1e-5);
    }
}
