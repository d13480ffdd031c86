use glam::{Mat3, Quat, Vec3};

use super::arena::Arena;
use super::body::RigidBody;
use super::collider::Collider;
use super::manifold::Manifold;
use super::BodyIndex;

/// Relative approach speed below which restitution is ignored.
const RESTITUTION_THRESHOLD: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PositionCorrectionMethod {
    /// Fold position error into the velocity solve as a bias velocity.
    PseudoVelocity,
    /// Post-solve nonlinear Gauss-Seidel translation of the bodies.
    #[default]
    NonlinearGaussSeidel,
}

#[derive(Debug, Clone)]
pub struct SolverConfig {
    pub velocity_iterations: u32,
    pub position_iterations: u32,
    pub position_correction: PositionCorrectionMethod,
    pub warm_start: bool,
    /// Allowed residual penetration.
    pub slop: f32,
    /// Error feedback factor for pseudo-velocity correction.
    pub baumgarte: f32,
    /// Largest positional fix applied per iteration.
    pub max_position_correction: f32,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            velocity_iterations: 8,
            position_iterations: 3,
            position_correction: PositionCorrectionMethod::NonlinearGaussSeidel,
            warm_start: true,
            slop: 0.01,
            baumgarte: 0.2,
            max_position_correction: 0.2,
        }
    }
}

/// Per-joint error correction limits.
#[derive(Debug, Clone, Copy)]
pub struct JointConfig {
    pub linear_baumgarte: f32,
    pub angular_baumgarte: f32,
    pub linear_error_limit: f32,
    pub angular_error_limit: f32,
    pub slop: f32,
}

impl Default for JointConfig {
    fn default() -> Self {
        Self {
            linear_baumgarte: 0.2,
            angular_baumgarte: 0.2,
            linear_error_limit: 0.2,
            angular_error_limit: 0.4,
            slop: 0.0,
        }
    }
}

/// Locks the relative position and orientation of two bodies.
#[derive(Debug)]
pub struct WeldJoint {
    pub bodies: (BodyIndex, BodyIndex),
    /// Anchors relative to each body's center of mass, in body rotation frame.
    pub local_anchor0: Vec3,
    pub local_anchor1: Vec3,
    /// Target relative orientation: rotation1 = rotation0 * reference.
    pub reference_rotation: Quat,
    pub config: JointConfig,
    pub active: bool,
    accumulated_linear: Vec3,
    accumulated_angular: Vec3,
}

impl WeldJoint {
    /// Welds two bodies in their current relative pose about `world_anchor`.
    pub fn new(
        bodies: (BodyIndex, BodyIndex),
        body0: &RigidBody,
        body1: &RigidBody,
        world_anchor: Vec3,
    ) -> Self {
        Self {
            bodies,
            local_anchor0: body0.rotation.inverse() * (world_anchor - body0.center_of_mass),
            local_anchor1: body1.rotation.inverse() * (world_anchor - body1.center_of_mass),
            reference_rotation: body0.rotation.inverse() * body1.rotation,
            config: JointConfig::default(),
            active: true,
            accumulated_linear: Vec3::ZERO,
            accumulated_angular: Vec3::ZERO,
        }
    }
}

fn skew(v: Vec3) -> Mat3 {
    Mat3::from_cols(
        Vec3::new(0.0, v.z, -v.y),
        Vec3::new(-v.z, 0.0, v.x),
        Vec3::new(v.y, -v.x, 0.0),
    )
}

fn orthonormal_basis(normal: Vec3) -> (Vec3, Vec3) {
    let t1 = if normal.x.abs() > 0.9 {
        Vec3::new(-normal.y, normal.x, 0.0)
    } else {
        Vec3::new(0.0, -normal.z, normal.y)
    }
    .normalize_or_zero();
    let t2 = normal.cross(t1).normalize_or_zero();
    (t1, t2)
}

#[derive(Debug, Clone, Copy)]
struct SolverSide {
    body: Option<BodyIndex>,
    inv_mass: f32,
    inv_inertia: Mat3,
    com: Vec3,
}

impl SolverSide {
    fn gather(body_index: Option<BodyIndex>, bodies: &Arena<RigidBody>, fallback_com: Vec3) -> Self {
        match body_index.and_then(|index| bodies.get(index).map(|body| (index, body))) {
            Some((index, body)) if body.is_dynamic() => Self {
                body: Some(index),
                inv_mass: body.inv_mass.inv_mass(),
                inv_inertia: body.inertia.inv_world(),
                com: body.center_of_mass,
            },
            Some((index, body)) => Self {
                // Kinematic and static bodies contribute their velocity but
                // absorb no impulse.
                body: Some(index),
                inv_mass: 0.0,
                inv_inertia: Mat3::ZERO,
                com: body.center_of_mass,
            },
            None => Self {
                body: None,
                inv_mass: 0.0,
                inv_inertia: Mat3::ZERO,
                com: fallback_com,
            },
        }
    }

    fn velocity(&self, bodies: &Arena<RigidBody>) -> (Vec3, Vec3) {
        self.body
            .and_then(|index| bodies.get(index))
            .map(|body| (body.velocity, body.angular_velocity))
            .unwrap_or((Vec3::ZERO, Vec3::ZERO))
    }

    fn apply_impulse(&self, bodies: &mut Arena<RigidBody>, impulse: Vec3, r: Vec3) {
        if self.inv_mass == 0.0 && self.inv_inertia == Mat3::ZERO {
            return;
        }
        if let Some(body) = self.body.and_then(|index| bodies.get_mut(index)) {
            body.velocity += body.inv_mass.apply(impulse);
            body.angular_velocity += body.inertia.apply(r.cross(impulse));
        }
    }
}

struct ContactPointConstraint {
    r0: Vec3,
    r1: Vec3,
    normal: Vec3,
    tangents: (Vec3, Vec3),
    normal_mass: f32,
    tangent_mass: (f32, f32),
    bias: f32,
    penetration: f32,
    accumulated: Vec3,
    manifold_point: usize,
}

struct ContactConstraint {
    manifold_index: usize,
    side0: SolverSide,
    side1: SolverSide,
    friction: f32,
    points: Vec<ContactPointConstraint>,
}

fn effective_mass(side0: &SolverSide, side1: &SolverSide, r0: Vec3, r1: Vec3, axis: Vec3) -> f32 {
    let angular0 = (side0.inv_inertia * r0.cross(axis)).cross(r0);
    let angular1 = (side1.inv_inertia * r1.cross(axis)).cross(r1);
    let k = side0.inv_mass + side1.inv_mass + axis.dot(angular0 + angular1);
    if k > 0.0 { 1.0 / k } else { 0.0 }
}

/// Runs the full constraint solve: warm start, velocity iterations over
/// contacts and weld joints, then the configured position correction.
/// Accumulated impulses are written back to the manifolds afterward.
pub fn solve(
    config: &SolverConfig,
    bodies: &mut Arena<RigidBody>,
    colliders: &Arena<Collider>,
    manifolds: &mut [Manifold],
    joints: &mut Arena<WeldJoint>,
    dt: f32,
) {
    let mut constraints = Vec::new();
    for (manifold_index, manifold) in manifolds.iter().enumerate() {
        let Some(collider0) = colliders.get(manifold.colliders.0) else {
            continue;
        };
        let Some(collider1) = colliders.get(manifold.colliders.1) else {
            continue;
        };
        if collider0.ghost || collider1.ghost {
            continue;
        }
        let side0 = SolverSide::gather(collider0.active_body, bodies, collider0.world_translation);
        let side1 = SolverSide::gather(collider1.active_body, bodies, collider1.world_translation);
        if side0.inv_mass == 0.0 && side1.inv_mass == 0.0 {
            continue;
        }

        let mut constraint = ContactConstraint {
            manifold_index,
            side0,
            side1,
            friction: manifold.friction,
            points: Vec::with_capacity(manifold.contact_count()),
        };
        let restitution = manifold.restitution;

        for (point_index, point) in manifold.points().iter().enumerate() {
            let normal = point.normal;
            let r0 = point.world_points[0] - side0.com;
            let r1 = point.world_points[1] - side1.com;
            let tangents = orthonormal_basis(normal);

            let (v0, w0) = side0.velocity(bodies);
            let (v1, w1) = side1.velocity(bodies);
            let relative = (v1 + w1.cross(r1)) - (v0 + w0.cross(r0));
            let approach = relative.dot(normal);

            let mut bias = 0.0;
            if approach < -RESTITUTION_THRESHOLD {
                bias = -restitution * approach;
            }
            if config.position_correction == PositionCorrectionMethod::PseudoVelocity {
                bias += config.baumgarte / dt * (point.penetration - config.slop).max(0.0);
            }

            constraint.points.push(ContactPointConstraint {
                r0,
                r1,
                normal,
                tangents,
                normal_mass: effective_mass(&side0, &side1, r0, r1, normal),
                tangent_mass: (
                    effective_mass(&side0, &side1, r0, r1, tangents.0),
                    effective_mass(&side0, &side1, r0, r1, tangents.1),
                ),
                bias,
                penetration: point.penetration,
                accumulated: if config.warm_start {
                    point.accumulated_impulse
                } else {
                    Vec3::ZERO
                },
                manifold_point: point_index,
            });
        }
        constraints.push(constraint);
    }

    // Warm start: re-apply last tick's impulses.
    if config.warm_start {
        for constraint in &constraints {
            for point in &constraint.points {
                let impulse = point.normal * point.accumulated.x
                    + point.tangents.0 * point.accumulated.y
                    + point.tangents.1 * point.accumulated.z;
                constraint.side0.apply_impulse(bodies, -impulse, point.r0);
                constraint.side1.apply_impulse(bodies, impulse, point.r1);
            }
        }
    }

    let joint_indices = joints.indices();
    for &joint_index in &joint_indices {
        warm_start_joint(joints, joint_index, bodies, config.warm_start);
    }

    for _ in 0..config.velocity_iterations {
        for constraint in &mut constraints {
            solve_contact_velocities(constraint, bodies);
        }
        for &joint_index in &joint_indices {
            solve_joint_velocities(joints, joint_index, bodies, dt);
        }
    }

    // Store accumulated impulses for next tick's warm start.
    for constraint in &constraints {
        let manifold = &mut manifolds[constraint.manifold_index];
        for point in &constraint.points {
            manifold.points_mut()[point.manifold_point].accumulated_impulse = point.accumulated;
        }
    }

    if config.position_correction == PositionCorrectionMethod::NonlinearGaussSeidel {
        for _ in 0..config.position_iterations {
            for constraint in &mut constraints {
                solve_contact_positions(constraint, bodies, config);
            }
        }
    }
}

fn solve_contact_velocities(constraint: &mut ContactConstraint, bodies: &mut Arena<RigidBody>) {
    let side0 = constraint.side0;
    let side1 = constraint.side1;
    for point in &mut constraint.points {
        // Friction first, clamped by the current normal impulse.
        let (v0, w0) = side0.velocity(bodies);
        let (v1, w1) = side1.velocity(bodies);
        let relative = (v1 + w1.cross(point.r1)) - (v0 + w0.cross(point.r0));

        let max_friction = constraint.friction * point.accumulated.x;
        for (axis, (tangent, tangent_mass)) in [
            (1, (point.tangents.0, point.tangent_mass.0)),
            (2, (point.tangents.1, point.tangent_mass.1)),
        ] {
            let lambda = -relative.dot(tangent) * tangent_mass;
            let previous = point.accumulated[axis];
            let next = (previous + lambda).clamp(-max_friction, max_friction);
            let applied = next - previous;
            point.accumulated[axis] = next;
            let impulse = tangent * applied;
            side0.apply_impulse(bodies, -impulse, point.r0);
            side1.apply_impulse(bodies, impulse, point.r1);
        }

        // Normal impulse.
        let (v0, w0) = side0.velocity(bodies);
        let (v1, w1) = side1.velocity(bodies);
        let relative = (v1 + w1.cross(point.r1)) - (v0 + w0.cross(point.r0));
        let approach = relative.dot(point.normal);
        let lambda = (point.bias - approach) * point.normal_mass;
        let previous = point.accumulated.x;
        let next = (previous + lambda).max(0.0);
        let applied = next - previous;
        point.accumulated.x = next;
        let impulse = point.normal * applied;
        side0.apply_impulse(bodies, -impulse, point.r0);
        side1.apply_impulse(bodies, impulse, point.r1);
    }
}

fn solve_contact_positions(
    constraint: &mut ContactConstraint,
    bodies: &mut Arena<RigidBody>,
    config: &SolverConfig,
) {
    let side0 = constraint.side0;
    let side1 = constraint.side1;
    for point in &mut constraint.points {
        let error = (point.penetration - config.slop).max(0.0);
        if error <= 0.0 {
            continue;
        }
        let correction = (error * config.baumgarte).min(config.max_position_correction);
        let magnitude = correction * point.normal_mass;
        let offset = point.normal * magnitude;
        point.penetration -= correction;

        if let Some(body) = side0.body.and_then(|index| bodies.get_mut(index)) {
            if body.is_dynamic() {
                let shift = -offset * side0.inv_mass;
                body.center_of_mass += shift;
            }
        }
        if let Some(body) = side1.body.and_then(|index| bodies.get_mut(index)) {
            if body.is_dynamic() {
                let shift = offset * side1.inv_mass;
                body.center_of_mass += shift;
            }
        }
    }
}

fn warm_start_joint(
    joints: &mut Arena<WeldJoint>,
    joint_index: u32,
    bodies: &mut Arena<RigidBody>,
    warm_start: bool,
) {
    let Some(joint) = joints.get_mut(joint_index) else {
        return;
    };
    if !joint.active {
        return;
    }
    if !warm_start {
        joint.accumulated_linear = Vec3::ZERO;
        joint.accumulated_angular = Vec3::ZERO;
        return;
    }
    let (linear, angular) = (joint.accumulated_linear, joint.accumulated_angular);
    let (bodies0, bodies1) = joint.bodies;
    let side0 = SolverSide::gather(Some(bodies0), bodies, Vec3::ZERO);
    let side1 = SolverSide::gather(Some(bodies1), bodies, Vec3::ZERO);
    let r0 = anchor_offset(bodies, bodies0, joint.local_anchor0);
    let r1 = anchor_offset(bodies, bodies1, joint.local_anchor1);
    side0.apply_impulse(bodies, -linear, r0);
    side1.apply_impulse(bodies, linear, r1);
    if let Some(body) = bodies.get_mut(bodies0) {
        let angular_impulse = body.inertia.apply(-angular);
        body.angular_velocity += angular_impulse;
    }
    if let Some(body) = bodies.get_mut(bodies1) {
        let angular_impulse = body.inertia.apply(angular);
        body.angular_velocity += angular_impulse;
    }
}

fn anchor_offset(bodies: &Arena<RigidBody>, body: BodyIndex, local_anchor: Vec3) -> Vec3 {
    bodies
        .get(body)
        .map(|body| body.rotation * local_anchor)
        .unwrap_or(local_anchor)
}

fn solve_joint_velocities(
    joints: &mut Arena<WeldJoint>,
    joint_index: u32,
    bodies: &mut Arena<RigidBody>,
    dt: f32,
) {
    let Some(joint) = joints.get(joint_index) else {
        return;
    };
    if !joint.active {
        return;
    }
    let (index0, index1) = joint.bodies;
    let config = joint.config;
    let local_anchor0 = joint.local_anchor0;
    let local_anchor1 = joint.local_anchor1;
    let reference = joint.reference_rotation;

    let side0 = SolverSide::gather(Some(index0), bodies, Vec3::ZERO);
    let side1 = SolverSide::gather(Some(index1), bodies, Vec3::ZERO);
    if side0.inv_mass == 0.0 && side1.inv_mass == 0.0 {
        return;
    }
    let r0 = anchor_offset(bodies, index0, local_anchor0);
    let r1 = anchor_offset(bodies, index1, local_anchor1);

    // Linear rows: anchors track each other.
    let anchor0 = side0.com + r0;
    let anchor1 = side1.com + r1;
    let position_error = anchor1 - anchor0;
    let error_magnitude = position_error.length();
    let clamped_error = if error_magnitude > config.linear_error_limit {
        position_error * (config.linear_error_limit / error_magnitude)
    } else {
        position_error
    };

    let (v0, w0) = side0.velocity(bodies);
    let (v1, w1) = side1.velocity(bodies);
    let velocity_error = (v1 + w1.cross(r1)) - (v0 + w0.cross(r0));
    let bias = clamped_error * (config.linear_baumgarte / dt);

    let k_linear = Mat3::from_diagonal(Vec3::splat(side0.inv_mass + side1.inv_mass))
        + (skew(r0) * side0.inv_inertia * skew(r0).transpose())
        + (skew(r1) * side1.inv_inertia * skew(r1).transpose());
    let impulse = k_linear.inverse() * -(velocity_error + bias);
    side0.apply_impulse(bodies, -impulse, r0);
    side1.apply_impulse(bodies, impulse, r1);

    // Angular rows: relative orientation holds the reference.
    let rotation0 = bodies.get(index0).map(|b| b.rotation).unwrap_or(Quat::IDENTITY);
    let rotation1 = bodies.get(index1).map(|b| b.rotation).unwrap_or(Quat::IDENTITY);
    let target = rotation0 * reference;
    let error_quat = rotation1 * target.inverse();
    let (axis, angle) = error_quat.normalize().to_axis_angle();
    let angle = if angle > std::f32::consts::PI {
        angle - std::f32::consts::TAU
    } else {
        angle
    };
    let angular_error = axis * angle.clamp(-config.angular_error_limit, config.angular_error_limit);

    let (_, w0) = side0.velocity(bodies);
    let (_, w1) = side1.velocity(bodies);
    let angular_velocity_error = w1 - w0;
    let angular_bias = angular_error * (config.angular_baumgarte / dt);
    let k_angular = side0.inv_inertia + side1.inv_inertia;
    let angular_impulse = if k_angular == Mat3::ZERO {
        Vec3::ZERO
    } else {
        k_angular.inverse() * -(angular_velocity_error + angular_bias)
    };

    if let Some(body) = bodies.get_mut(index0) {
        if body.is_dynamic() {
            let delta = body.inertia.apply(-angular_impulse);
            body.angular_velocity += delta;
        }
    }
    if let Some(body) = bodies.get_mut(index1) {
        if body.is_dynamic() {
            let delta = body.inertia.apply(angular_impulse);
            body.angular_velocity += delta;
        }
    }

    if let Some(joint) = joints.get_mut(joint_index) {
        joint.accumulated_linear += impulse;
        joint.accumulated_angular += angular_impulse;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::manifold::{AddingPolicy, ContactFrame, ManifoldPoint};
    use crate::physics::shape::Shape;

    fn dynamic_sphere_body(node: u32, position: Vec3, velocity: Vec3) -> RigidBody {
        let mut body = RigidBody::new(node);
        body.center_of_mass = position;
        body.velocity = velocity;
        body.inv_mass.set_inv_mass(1.0);
        body.inertia
            .set_inv_local(Mat3::from_diagonal(Vec3::splat(2.5)));
        body.inertia.compute_world(Mat3::IDENTITY);
        body
    }

    #[test]
    fn equal_spheres_bounce_elastically() {
        let mut bodies = Arena::new();
        let body0 = bodies.insert(dynamic_sphere_body(0, Vec3::new(-1.0, 0.0, 0.0), Vec3::X));
        let body1 = bodies.insert(dynamic_sphere_body(1, Vec3::new(1.0, 0.0, 0.0), -Vec3::X));

        let mut colliders = Arena::new();
        let mut collider0 = Collider::new(Shape::Sphere { radius: 1.0 }, 0);
        collider0.active_body = Some(body0);
        collider0.update_world_bounds(Vec3::new(-1.0, 0.0, 0.0), Mat3::IDENTITY);
        let c0 = colliders.insert(collider0);
        let mut collider1 = Collider::new(Shape::Sphere { radius: 1.0 }, 1);
        collider1.active_body = Some(body1);
        collider1.update_world_bounds(Vec3::new(1.0, 0.0, 0.0), Mat3::IDENTITY);
        let c1 = colliders.insert(collider1);

        let mut manifold = Manifold::new((c0, c1), AddingPolicy::Normal);
        manifold.friction = 0.0;
        manifold.restitution = 1.0;
        let frame0 = ContactFrame {
            translation: Vec3::new(-1.0, 0.0, 0.0),
            rotation: Mat3::IDENTITY,
        };
        let frame1 = ContactFrame {
            translation: Vec3::new(1.0, 0.0, 0.0),
            rotation: Mat3::IDENTITY,
        };
        let mut points = [ManifoldPoint::new(Vec3::ZERO, Vec3::X, 0.0)];
        manifold.add_points(&mut points, &frame0, &frame1);

        let mut manifolds = vec![manifold];
        let mut joints = Arena::new();
        solve(
            &SolverConfig::default(),
            &mut bodies,
            &colliders,
            &mut manifolds,
            &mut joints,
            1.0 / 60.0,
        );

        let v0 = bodies.get(body0).unwrap().velocity;
        let v1 = bodies.get(body1).unwrap().velocity;
        assert!((v0.x - -1.0).abs() < 1e-5, "v0 {v0:?}");
        assert!((v1.x - 1.0).abs() < 1e-5, "v1 {v1:?}");
    }

    #[test]
    fn resting_contact_does_not_gain_energy() {
        let mut bodies = Arena::new();
        let falling = bodies.insert(dynamic_sphere_body(
            0,
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(0.0, -0.5, 0.0),
        ));

        let mut colliders = Arena::new();
        let mut sphere = Collider::new(Shape::Sphere { radius: 1.0 }, 0);
        sphere.active_body = Some(falling);
        let c0 = colliders.insert(sphere);
        let ground = Collider::new(
            Shape::Box {
                half_extents: Vec3::new(10.0, 1.0, 10.0),
            },
            1,
        );
        let c1 = colliders.insert(ground);

        let mut manifold = Manifold::new((c0, c1), AddingPolicy::Normal);
        manifold.friction = 0.5;
        manifold.restitution = 0.0;
        let frame = ContactFrame {
            translation: Vec3::ZERO,
            rotation: Mat3::IDENTITY,
        };
        let mut points = [ManifoldPoint::new(Vec3::ZERO, -Vec3::Y, 0.0)];
        manifold.add_points(&mut points, &frame, &frame);

        let mut manifolds = vec![manifold];
        let mut joints = Arena::new();
        solve(
            &SolverConfig::default(),
            &mut bodies,
            &colliders,
            &mut manifolds,
            &mut joints,
            1.0 / 60.0,
        );

        // Approach below the restitution threshold: velocity just zeroes.
        let v = bodies.get(falling).unwrap().velocity;
        assert!(v.y.abs() < 1e-4, "velocity {v:?}");
    }

    #[test]
    fn weld_joint_matches_velocities() {
        let mut bodies = Arena::new();
        let body0 = bodies.insert(dynamic_sphere_body(0, Vec3::ZERO, Vec3::X));
        let body1 = bodies.insert(dynamic_sphere_body(1, Vec3::new(2.0, 0.0, 0.0), Vec3::ZERO));

        let joint = {
            let b0 = bodies.get(body0).unwrap();
            let b1 = bodies.get(body1).unwrap();
            WeldJoint::new((body0, body1), b0, b1, Vec3::new(1.0, 0.0, 0.0))
        };
        let mut joints = Arena::new();
        joints.insert(joint);

        let colliders = Arena::new();
        let mut manifolds = Vec::new();
        solve(
            &SolverConfig::default(),
            &mut bodies,
            &colliders,
            &mut manifolds,
            &mut joints,
            1.0 / 60.0,
        );

        let v0 = bodies.get(body0).unwrap().velocity;
        let v1 = bodies.get(body1).unwrap().velocity;
        // Momentum is shared; the relative velocity collapses.
        assert!((v0.x - v1.x).abs() < 0.05, "v0 {v0:?} v1 {v1:?}");
        assert!((v0.x + v1.x - 1.0).abs() < 1e-3);
    }
}
