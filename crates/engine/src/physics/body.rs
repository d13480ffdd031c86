use bitflags::bitflags;
use glam::{Mat3, Quat, Vec3};

use super::effect::EffectKindFlags;
use super::mass::{Inertia, Mass, MassOverride};
use super::{BodyIndex, ColliderIndex, EffectIndex, NodeIndex};

/// Angular speed below which a body may accumulate sleep time.
pub const ANGULAR_SLEEP_EPSILON: f32 = 0.16;
/// Linear speed below which a body may accumulate sleep time.
pub const LINEAR_SLEEP_EPSILON: f32 = 0.16;
/// Seconds under both thresholds before a body falls asleep.
pub const TIME_TO_SLEEP: f32 = 1.0;
/// Hard clamp applied before a body joins a space.
pub const MAX_UNSPACED_VELOCITY: f32 = 1e10;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BodyFlags: u32 {
        const STATIC = 1 << 0;
        const KINEMATIC = 1 << 1;
        const ASLEEP = 1 << 2;
        const ALLOW_SLEEP = 1 << 3;
        const ROTATION_LOCKED = 1 << 4;
        const MODE_2D = 1 << 5;
        const INHERIT_2D = 1 << 6;
        /// Sleep time already accumulated this tick.
        const SLEEP_ACCUMULATED = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DynamicState {
    #[default]
    Dynamic,
    Static,
    Kinematic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode2D {
    #[default]
    InheritFromSpace,
    Mode2D,
    Mode3D,
}

/// Linear/angular state, composed mass and inertia, and sleep management for
/// one rigid body.
#[derive(Debug)]
pub struct RigidBody {
    pub velocity: Vec3,
    pub velocity_old: Vec3,
    pub angular_velocity: Vec3,
    pub angular_velocity_old: Vec3,
    pub force: Vec3,
    pub torque: Vec3,
    /// World-space center of mass.
    pub center_of_mass: Vec3,
    /// Body-space offset from center of mass back to the node translation.
    pub position_offset: Vec3,
    pub rotation: Quat,
    pub inv_mass: Mass,
    pub inertia: Inertia,
    pub mass_override: MassOverride,
    pub sleep_timer: f32,
    pub flags: BodyFlags,
    pub node: NodeIndex,
    pub parent_body: Option<BodyIndex>,
    pub child_bodies: Vec<BodyIndex>,
    pub colliders: Vec<ColliderIndex>,
    pub effects: Vec<EffectIndex>,
    /// Space-scoped effect kinds this body opts out of.
    pub ignore_space_effects: EffectKindFlags,
}

impl RigidBody {
    pub fn new(node: NodeIndex) -> Self {
        Self {
            velocity: Vec3::ZERO,
            velocity_old: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            angular_velocity_old: Vec3::ZERO,
            force: Vec3::ZERO,
            torque: Vec3::ZERO,
            center_of_mass: Vec3::ZERO,
            position_offset: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            inv_mass: Mass::default(),
            inertia: Inertia::default(),
            mass_override: MassOverride::default(),
            sleep_timer: 0.0,
            flags: BodyFlags::ALLOW_SLEEP | BodyFlags::INHERIT_2D,
            node,
            parent_body: None,
            child_bodies: Vec::new(),
            colliders: Vec::new(),
            effects: Vec::new(),
            ignore_space_effects: EffectKindFlags::empty(),
        }
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(BodyFlags::STATIC)
    }

    pub fn is_kinematic(&self) -> bool {
        self.flags.contains(BodyFlags::KINEMATIC)
    }

    pub fn is_dynamic(&self) -> bool {
        !self.flags.intersects(BodyFlags::STATIC | BodyFlags::KINEMATIC)
    }

    pub fn is_asleep(&self) -> bool {
        self.flags.contains(BodyFlags::ASLEEP)
    }

    pub fn allows_sleep(&self) -> bool {
        self.flags.contains(BodyFlags::ALLOW_SLEEP)
    }

    pub fn is_2d(&self) -> bool {
        self.flags.contains(BodyFlags::MODE_2D)
    }

    pub fn dynamic_state(&self) -> DynamicState {
        if self.is_static() {
            DynamicState::Static
        } else if self.is_kinematic() {
            DynamicState::Kinematic
        } else {
            DynamicState::Dynamic
        }
    }

    /// Switches dynamic state, clearing mass and velocities when the body
    /// freezes. Returns true when the state actually changed.
    pub fn set_dynamic_state(&mut self, state: DynamicState) -> bool {
        if state == self.dynamic_state() {
            return false;
        }
        self.flags.remove(BodyFlags::STATIC | BodyFlags::KINEMATIC);
        match state {
            DynamicState::Static => {
                self.flags.insert(BodyFlags::STATIC);
                self.clear_mass_and_velocities();
            }
            DynamicState::Kinematic => {
                self.flags.insert(BodyFlags::KINEMATIC);
                self.clear_mass_and_velocities();
            }
            DynamicState::Dynamic => {}
        }
        true
    }

    pub fn clear_mass_and_velocities(&mut self) {
        self.inv_mass.set_inv_mass(0.0);
        self.inertia.clear();
        self.velocity = Vec3::ZERO;
        self.angular_velocity = Vec3::ZERO;
    }

    pub fn set_rotation_locked(&mut self, locked: bool) {
        if locked == self.flags.contains(BodyFlags::ROTATION_LOCKED) {
            return;
        }
        if locked {
            self.flags.insert(BodyFlags::ROTATION_LOCKED);
            for axis in 0..3 {
                self.inertia.lock_local_axis(axis);
            }
            self.angular_velocity = Vec3::ZERO;
        } else {
            self.flags.remove(BodyFlags::ROTATION_LOCKED);
            for axis in 0..3 {
                self.inertia.unlock_local_axis(axis);
            }
        }
    }

    pub fn set_2d_internal(&mut self, mode_2d: bool) {
        if mode_2d {
            self.flags.insert(BodyFlags::MODE_2D);
            self.velocity.z = 0.0;
            self.inv_mass.set_axis_lock(true, 2);
        } else {
            self.flags.remove(BodyFlags::MODE_2D);
            self.inv_mass.set_axis_lock(false, 2);
        }
    }

    //
    // Forces, torques, impulses
    //

    pub fn apply_force(&mut self, force: Vec3) {
        self.force += force;
    }

    pub fn apply_torque(&mut self, torque: Vec3) {
        self.torque += torque;
    }

    pub fn apply_force_at_offset(&mut self, force: Vec3, world_offset: Vec3) {
        self.apply_force(force);
        self.apply_torque(world_offset.cross(force));
    }

    pub fn apply_force_at_point(&mut self, force: Vec3, world_point: Vec3) {
        self.apply_force_at_offset(force, world_point - self.center_of_mass);
    }

    pub fn apply_linear_impulse(&mut self, impulse: Vec3) {
        self.velocity += self.inv_mass.apply(impulse);
    }

    pub fn apply_angular_impulse(&mut self, impulse: Vec3) {
        self.angular_velocity += self.inertia.apply(impulse);
    }

    pub fn apply_impulse_at_offset(&mut self, impulse: Vec3, world_offset: Vec3) {
        self.apply_linear_impulse(impulse);
        self.apply_angular_impulse(world_offset.cross(impulse));
    }

    pub fn apply_impulse_at_point(&mut self, impulse: Vec3, world_point: Vec3) {
        self.apply_impulse_at_offset(impulse, world_point - self.center_of_mass);
    }

    pub fn point_velocity(&self, world_point: Vec3) -> Vec3 {
        self.velocity + self.angular_velocity.cross(world_point - self.center_of_mass)
    }

    //
    // Sleep
    //

    /// Accumulates sleep time when both speeds sit under the thresholds.
    /// Returns true when the body is currently below them.
    pub fn update_sleep_timer(&mut self, dt: f32) -> bool {
        // Guard against double accumulation when multiple islands visit us.
        let dt = if self.flags.contains(BodyFlags::SLEEP_ACCUMULATED) {
            0.0
        } else {
            dt
        };
        self.flags.insert(BodyFlags::SLEEP_ACCUMULATED);

        let linear_sq = self.velocity.length_squared();
        let angular_sq = self.angular_velocity.length_squared();
        if self.allows_sleep()
            && linear_sq <= LINEAR_SLEEP_EPSILON * LINEAR_SLEEP_EPSILON
            && angular_sq <= ANGULAR_SLEEP_EPSILON * ANGULAR_SLEEP_EPSILON
        {
            self.sleep_timer += dt;
            return true;
        }
        self.sleep_timer = 0.0;
        false
    }

    pub fn should_sleep(&self) -> bool {
        self.sleep_timer >= TIME_TO_SLEEP
    }

    /// Clears all motion and marks the body asleep. The space dispatches the
    /// sleep event.
    pub fn put_to_sleep(&mut self) {
        self.flags.insert(BodyFlags::ASLEEP);
        self.velocity = Vec3::ZERO;
        self.velocity_old = Vec3::ZERO;
        self.angular_velocity = Vec3::ZERO;
        self.angular_velocity_old = Vec3::ZERO;
        self.force = Vec3::ZERO;
        self.torque = Vec3::ZERO;
    }

    /// Wakes the body if asleep. Returns true when the state changed so the
    /// space can dispatch the wake event and propagate to frozen children.
    pub fn internal_wake_up(&mut self) -> bool {
        if !self.is_asleep() {
            return false;
        }
        self.flags.remove(BodyFlags::ASLEEP);
        self.sleep_timer = 0.0;
        true
    }

    pub fn force_asleep(&mut self) {
        self.sleep_timer = TIME_TO_SLEEP;
        self.put_to_sleep();
    }

    //
    // Kinematics
    //

    /// Derives kinematic velocities from the transform delta since last tick.
    pub fn derive_kinematic_velocity(
        &mut self,
        old_translation: Vec3,
        old_rotation: Mat3,
        new_translation: Vec3,
        new_rotation: Mat3,
        dt: f32,
    ) {
        if !self.is_kinematic() || dt == 0.0 {
            return;
        }
        self.velocity = (new_translation - old_translation) / dt;
        self.angular_velocity = angular_velocity_approximation(old_rotation, new_rotation, dt);
    }

    /// Integrates orientation by the angular velocity over dt, renormalizing.
    pub fn integrate_rotation(&mut self, dt: f32) {
        let omega = self.angular_velocity;
        if omega.length_squared() <= f32::EPSILON {
            return;
        }
        let delta = Quat::from_xyzw(omega.x, omega.y, omega.z, 0.0) * self.rotation;
        self.rotation = Quat::from_xyzw(
            self.rotation.x + 0.5 * dt * delta.x,
            self.rotation.y + 0.5 * dt * delta.y,
            self.rotation.z + 0.5 * dt * delta.z,
            self.rotation.w + 0.5 * dt * delta.w,
        )
        .normalize();
    }
}

/// Angular velocity taking one rotation matrix to another over dt.
pub fn angular_velocity_approximation(
    old_rotation: Mat3,
    new_rotation: Mat3,
    dt: f32,
) -> Vec3 {
    let delta = new_rotation * old_rotation.transpose();
    let quat = Quat::from_mat3(&delta).normalize();
    let (axis, angle) = quat.to_axis_angle();
    // Take the short way around.
    let angle = if angle > std::f32::consts::PI {
        angle - std::f32::consts::TAU
    } else {
        angle
    };
    axis * (angle / dt)
}

/// Clamps each velocity component into `[-max, max]`; reports whether any
/// component was out of range.
pub fn clamp_velocity(value: Vec3, max: f32) -> (Vec3, bool) {
    let clamped = value.clamp(Vec3::splat(-max), Vec3::splat(max));
    (clamped, clamped != value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_state_transitions_clear_motion() {
        let mut body = RigidBody::new(0);
        body.velocity = Vec3::X;
        assert!(body.set_dynamic_state(DynamicState::Static));
        assert_eq!(body.velocity, Vec3::ZERO);
        assert_eq!(body.inv_mass.inv_mass(), 0.0);
        assert!(!body.set_dynamic_state(DynamicState::Static));
    }

    #[test]
    fn sleep_timer_accumulates_only_below_thresholds() {
        let mut body = RigidBody::new(0);
        body.velocity = Vec3::new(0.1, 0.0, 0.0);
        assert!(body.update_sleep_timer(0.5));
        body.flags.remove(BodyFlags::SLEEP_ACCUMULATED);
        assert!(body.update_sleep_timer(0.6));
        assert!(body.should_sleep());

        body.flags.remove(BodyFlags::SLEEP_ACCUMULATED);
        body.velocity = Vec3::new(1.0, 0.0, 0.0);
        assert!(!body.update_sleep_timer(0.5));
        assert_eq!(body.sleep_timer, 0.0);
    }

    #[test]
    fn double_accumulation_is_guarded() {
        let mut body = RigidBody::new(0);
        body.update_sleep_timer(0.5);
        body.update_sleep_timer(0.5);
        assert_eq!(body.sleep_timer, 0.5);
    }

    #[test]
    fn sleeping_clears_velocity_and_forces() {
        let mut body = RigidBody::new(0);
        body.velocity = Vec3::X;
        body.force = Vec3::Y;
        body.put_to_sleep();
        assert!(body.is_asleep());
        assert_eq!(body.velocity, Vec3::ZERO);
        assert_eq!(body.force, Vec3::ZERO);
        assert!(body.internal_wake_up());
        assert!(!body.internal_wake_up());
    }

    #[test]
    fn kinematic_velocity_derivation() {
        let mut body = RigidBody::new(0);
        body.set_dynamic_state(DynamicState::Kinematic);
        body.derive_kinematic_velocity(
            Vec3::ZERO,
            Mat3::IDENTITY,
            Vec3::new(1.0, 0.0, 0.0),
            Mat3::from_rotation_y(0.1),
            0.1,
        );
        assert!((body.velocity.x - 10.0).abs() < 1e-4);
        assert!((body.angular_velocity.y - 1.0).abs() < 1e-3);
    }

    #[test]
    fn clamp_reports_out_of_range() {
        let (clamped, was_clamped) = clamp_velocity(Vec3::new(0.0, 1e12, 0.0), 100.0);
        assert!(was_clamped);
        assert_eq!(clamped.y, 100.0);
        let (_, was_clamped) = clamp_velocity(Vec3::ONE, 100.0);
        assert!(!was_clamped);
    }
}
