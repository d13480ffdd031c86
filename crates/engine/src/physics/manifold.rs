use glam::{Mat3, Vec3};

use super::ColliderIndex;

/// Contacts whose penetration drops below the negative of this, or whose
/// tangential drift exceeds it, are discarded during refresh. Part of the
/// tuning contract alongside the quad-area point selection.
pub const CONTACT_BREAKING_THRESHOLD: f32 = 0.02;
/// Squared local-space distance within which a new point matches a cached one.
const CACHING_DISTANCE_SQ: f32 = 0.005;
/// Minimum normal length surviving the 2-D correction.
const MIN_2D_NORMAL_LENGTH: f32 = 0.03;

pub const MAX_CONTACTS: usize = 4;

/// World translation + rotation of a collider, for world/local point moves.
#[derive(Debug, Clone, Copy)]
pub struct ContactFrame {
    pub translation: Vec3,
    pub rotation: Mat3,
}

impl ContactFrame {
    pub fn to_local(&self, world: Vec3) -> Vec3 {
        self.rotation.transpose() * (world - self.translation)
    }

    pub fn to_world(&self, local: Vec3) -> Vec3 {
        self.rotation * local + self.translation
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ManifoldPoint {
    pub world_points: [Vec3; 2],
    pub body_points: [Vec3; 2],
    /// Points from object 0 toward object 1.
    pub normal: Vec3,
    pub penetration: f32,
    /// Accumulated (normal, friction-1, friction-2) impulses for warm starts.
    pub accumulated_impulse: Vec3,
}

impl Default for ManifoldPoint {
    fn default() -> Self {
        Self {
            world_points: [Vec3::ZERO; 2],
            body_points: [Vec3::ZERO; 2],
            normal: Vec3::ZERO,
            penetration: 0.0,
            accumulated_impulse: Vec3::ZERO,
        }
    }
}

impl ManifoldPoint {
    pub fn new(world_point: Vec3, normal: Vec3, penetration: f32) -> Self {
        Self {
            world_points: [world_point, world_point - normal * penetration],
            body_points: [Vec3::ZERO; 2],
            normal,
            penetration,
            accumulated_impulse: Vec3::ZERO,
        }
    }
}

/// How incoming contact sets merge with cached points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddingPolicy {
    /// Replace everything; no impulse caching.
    Normal,
    /// Match new points to cached points by proximity, keeping impulses.
    Full,
    /// Refresh cached points each tick and insert at most the deepest new
    /// point, evicting by quad area when full.
    #[default]
    Persistent,
}

/// Persistent contact state for one collider pair, up to four points.
#[derive(Debug, Clone)]
pub struct Manifold {
    pub colliders: (ColliderIndex, ColliderIndex),
    pub policy: AddingPolicy,
    pub friction: f32,
    pub restitution: f32,
    points: [ManifoldPoint; MAX_CONTACTS],
    count: usize,
}

impl Manifold {
    pub fn new(colliders: (ColliderIndex, ColliderIndex), policy: AddingPolicy) -> Self {
        Self {
            colliders,
            policy,
            friction: 0.0,
            restitution: 0.0,
            points: [ManifoldPoint::default(); MAX_CONTACTS],
            count: 0,
        }
    }

    pub fn contact_count(&self) -> usize {
        self.count
    }

    pub fn points(&self) -> &[ManifoldPoint] {
        &self.points[..self.count]
    }

    pub fn points_mut(&mut self) -> &mut [ManifoldPoint] {
        &mut self.points[..self.count]
    }

    pub fn clear(&mut self) {
        self.count = 0;
        self.points = [ManifoldPoint::default(); MAX_CONTACTS];
    }

    /// Flips object order, negating normals and swapping the point pairs.
    pub fn swap_pair(&mut self) {
        self.colliders = (self.colliders.1, self.colliders.0);
        for point in &mut self.points[..self.count] {
            point.normal = -point.normal;
            point.body_points.swap(0, 1);
            point.world_points.swap(0, 1);
        }
    }

    /// Fixed-normal helper for primitive pairs: keeps the normal pointing
    /// from object 0 to object 1 by the center offset.
    pub fn replace_normal(&mut self, index: usize, normal: Vec3, center_offset: Vec3) {
        let mut corrected = normal;
        if center_offset.dot(normal) < 0.0 {
            corrected = -corrected;
        }
        self.points[index].normal = corrected;
    }

    fn find_local_point(&self, local_point_a: Vec3) -> Option<usize> {
        let mut closest = None;
        let mut closest_distance = CACHING_DISTANCE_SQ;
        for (index, point) in self.points[..self.count].iter().enumerate() {
            let distance = (local_point_a - point.body_points[0]).length_squared();
            if distance < closest_distance {
                closest_distance = distance;
                closest = Some(index);
            }
        }
        closest
    }

    fn set_point(&mut self, index: usize, point: &ManifoldPoint) {
        self.points[index] = *point;
        self.points[index].accumulated_impulse = Vec3::ZERO;
    }

    fn remove_point(&mut self, index: usize) {
        if index != self.count - 1 {
            self.points[index] = self.points[self.count - 1];
        }
        self.points[self.count - 1] = ManifoldPoint::default();
        self.count -= 1;
    }

    /// Adds incoming points after stamping their body-local positions, then
    /// merges per the configured policy.
    pub fn add_points(
        &mut self,
        points: &mut [ManifoldPoint],
        frame0: &ContactFrame,
        frame1: &ContactFrame,
    ) {
        for point in points.iter_mut() {
            point.body_points[0] = frame0.to_local(point.world_points[0]);
            point.body_points[1] = frame1.to_local(point.world_points[1]);
        }
        match self.policy {
            AddingPolicy::Normal => self.normal_add(points),
            AddingPolicy::Full => self.full_add(points),
            AddingPolicy::Persistent => self.persistent_add(points, frame0, frame1),
        }
    }

    fn normal_add(&mut self, points: &[ManifoldPoint]) {
        self.count = points.len().min(MAX_CONTACTS);
        self.points[..self.count].copy_from_slice(&points[..self.count]);
    }

    fn full_add(&mut self, points: &[ManifoldPoint]) {
        let cached = self.points;
        let cached_count = self.count;
        let mut persisted = [false; MAX_CONTACTS];

        self.count = points.len().min(MAX_CONTACTS);
        for (index, new_point) in points[..self.count].iter().enumerate() {
            self.set_point(index, new_point);
            for (cached_index, cached_point) in cached[..cached_count].iter().enumerate() {
                if persisted[cached_index] {
                    continue;
                }
                let distance = (cached_point.world_points[0] - new_point.world_points[0])
                    .length_squared();
                if distance < CACHING_DISTANCE_SQ {
                    persisted[cached_index] = true;
                    self.points[index].accumulated_impulse = cached_point.accumulated_impulse;
                    break;
                }
            }
        }
    }

    fn persistent_add(
        &mut self,
        points: &[ManifoldPoint],
        frame0: &ContactFrame,
        frame1: &ContactFrame,
    ) {
        self.refresh_points(frame0, frame1);

        let mut deepest: Option<usize> = None;
        let mut max_depth = -1.0;
        for (index, point) in points.iter().enumerate() {
            match self.find_local_point(point.body_points[0]) {
                Some(existing) => {
                    let impulse = self.points[existing].accumulated_impulse;
                    self.set_point(existing, point);
                    self.points[existing].accumulated_impulse = impulse;
                }
                None => {
                    if point.penetration > max_depth {
                        max_depth = point.penetration;
                        deepest = Some(index);
                    }
                }
            }
        }

        if let Some(index) = deepest {
            self.add_point(&points[index]);
        }
    }

    fn add_point(&mut self, point: &ManifoldPoint) {
        match self.find_local_point(point.body_points[0]) {
            Some(existing) => {
                let impulse = self.points[existing].accumulated_impulse;
                self.set_point(existing, point);
                self.points[existing].accumulated_impulse = impulse;
            }
            None => {
                let index = if self.count == MAX_CONTACTS {
                    self.sort_cached_points(point.body_points[0])
                } else {
                    let index = self.count;
                    self.count += 1;
                    index
                };
                self.set_point(index, point);
            }
        }
    }

    /// Recomputes world points from body-local points, dropping any whose
    /// separation or tangential drift exceeds the breaking threshold.
    pub fn refresh_points(&mut self, frame0: &ContactFrame, frame1: &ContactFrame) {
        let mut index = self.count;
        while index > 0 {
            index -= 1;
            let point = &mut self.points[index];
            point.world_points[0] = frame0.to_world(point.body_points[0]);
            point.world_points[1] = frame1.to_world(point.body_points[1]);
            point.penetration = (point.world_points[0] - point.world_points[1]).dot(point.normal);

            if point.penetration < -CONTACT_BREAKING_THRESHOLD {
                self.remove_point(index);
                continue;
            }
            let projected = point.world_points[0] - point.normal * point.penetration;
            let drift = (projected - point.world_points[1]).length_squared();
            if drift > CONTACT_BREAKING_THRESHOLD * CONTACT_BREAKING_THRESHOLD {
                self.remove_point(index);
            }
        }
    }

    fn compute_quad_area(p1: Vec3, p2: Vec3, p3: Vec3, p4: Vec3) -> f32 {
        let ac = (p3 - p1) * 0.5;
        let bd = (p4 - p2) * 0.5;
        ac.cross(bd).length_squared()
    }

    /// Chooses which cached point the incoming point replaces: keep the
    /// deepest, then maximize the quadrilateral area of the survivors.
    fn sort_cached_points(&self, body_point_a: Vec3) -> usize {
        let mut max_penetration_index = None;
        let mut max_penetration = 0.0;
        for (index, point) in self.points.iter().enumerate() {
            if point.penetration > max_penetration {
                max_penetration = point.penetration;
                max_penetration_index = Some(index);
            }
        }

        let body = |index: usize| self.points[index].body_points[0];
        let mut areas = [0.0f32; MAX_CONTACTS];
        if max_penetration_index != Some(0) {
            areas[0] = Self::compute_quad_area(body_point_a, body(1), body(2), body(3));
        }
        if max_penetration_index != Some(1) {
            areas[1] = Self::compute_quad_area(body_point_a, body(0), body(2), body(3));
        }
        if max_penetration_index != Some(2) {
            areas[2] = Self::compute_quad_area(body_point_a, body(0), body(1), body(3));
        }
        if max_penetration_index != Some(3) {
            areas[3] = Self::compute_quad_area(body_point_a, body(0), body(1), body(2));
        }

        if areas[0] > areas[1] {
            if areas[0] > areas[2] {
                if areas[0] > areas[3] { 0 } else { 3 }
            } else if areas[2] > areas[3] {
                2
            } else {
                3
            }
        } else if areas[1] > areas[2] {
            if areas[1] > areas[3] { 1 } else { 3 }
        } else if areas[2] > areas[3] {
            2
        } else {
            3
        }
    }

    /// Zeroes the z component of every normal when the pair is effectively
    /// 2-D, dropping points whose remaining normal is too short. Ghost pairs
    /// are left untouched so the manifold never empties. Returns false when
    /// the manifold became invalid.
    pub fn correct_for_2d(
        &mut self,
        is_2d: (bool, bool),
        is_dynamic: (bool, bool),
        is_ghost: (bool, bool),
    ) -> bool {
        if is_ghost.0 || is_ghost.1 {
            return true;
        }
        let applies = (is_2d.0 && is_2d.1)
            || (is_2d.0 && !is_dynamic.1)
            || (is_2d.1 && !is_dynamic.0);
        if !applies {
            return true;
        }

        let mut index = self.count;
        while index > 0 {
            index -= 1;
            let mut normal = self.points[index].normal;
            normal.z = 0.0;
            let length = normal.length();
            if length < MIN_2D_NORMAL_LENGTH {
                self.remove_point(index);
            } else {
                self.points[index].normal = normal / length;
            }
        }
        self.count > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_frame() -> ContactFrame {
        ContactFrame {
            translation: Vec3::ZERO,
            rotation: Mat3::IDENTITY,
        }
    }

    fn point_at(position: Vec3, penetration: f32) -> ManifoldPoint {
        ManifoldPoint::new(position, Vec3::Y, penetration)
    }

    #[test]
    fn normal_policy_replaces_contacts() {
        let mut manifold = Manifold::new((0, 1), AddingPolicy::Normal);
        let frame = identity_frame();
        let mut points = [point_at(Vec3::ZERO, 0.1)];
        manifold.add_points(&mut points, &frame, &frame);
        assert_eq!(manifold.contact_count(), 1);

        let mut points = [point_at(Vec3::X, 0.2), point_at(Vec3::Z, 0.2)];
        manifold.add_points(&mut points, &frame, &frame);
        assert_eq!(manifold.contact_count(), 2);
        assert_eq!(manifold.points()[0].accumulated_impulse, Vec3::ZERO);
    }

    #[test]
    fn full_policy_preserves_matched_impulses() {
        let mut manifold = Manifold::new((0, 1), AddingPolicy::Full);
        let frame = identity_frame();
        let mut points = [point_at(Vec3::ZERO, 0.1)];
        manifold.add_points(&mut points, &frame, &frame);
        manifold.points_mut()[0].accumulated_impulse = Vec3::new(5.0, 0.0, 0.0);

        // Same spot persists the impulse; a far point does not.
        let mut points = [point_at(Vec3::new(0.01, 0.0, 0.0), 0.1)];
        manifold.add_points(&mut points, &frame, &frame);
        assert_eq!(manifold.points()[0].accumulated_impulse.x, 5.0);

        let mut points = [point_at(Vec3::new(3.0, 0.0, 0.0), 0.1)];
        manifold.add_points(&mut points, &frame, &frame);
        assert_eq!(manifold.points()[0].accumulated_impulse.x, 0.0);
    }

    #[test]
    fn persistent_policy_adds_one_point_per_tick() {
        let mut manifold = Manifold::new((0, 1), AddingPolicy::Persistent);
        let frame = identity_frame();
        let mut points = [
            point_at(Vec3::new(1.0, 0.0, 0.0), 0.05),
            point_at(Vec3::new(-1.0, 0.0, 0.0), 0.2),
        ];
        manifold.add_points(&mut points, &frame, &frame);
        // Only the deepest of the two new points entered.
        assert_eq!(manifold.contact_count(), 1);
        assert!((manifold.points()[0].penetration - 0.2).abs() < 1e-6);
    }

    #[test]
    fn refresh_drops_separated_points() {
        let mut manifold = Manifold::new((0, 1), AddingPolicy::Persistent);
        let frame = identity_frame();
        let mut points = [point_at(Vec3::ZERO, 0.01)];
        manifold.add_points(&mut points, &frame, &frame);
        assert_eq!(manifold.contact_count(), 1);

        // Move object 0 away along the normal: separation past the breaking
        // threshold discards the point.
        let moved = ContactFrame {
            translation: Vec3::new(0.0, -0.1, 0.0),
            rotation: Mat3::IDENTITY,
        };
        manifold.refresh_points(&moved, &frame);
        assert_eq!(manifold.contact_count(), 0);
    }

    #[test]
    fn refresh_drops_sheared_points() {
        let mut manifold = Manifold::new((0, 1), AddingPolicy::Persistent);
        let frame = identity_frame();
        let mut points = [point_at(Vec3::ZERO, 0.0)];
        manifold.add_points(&mut points, &frame, &frame);

        // Slide object 0 sideways past the threshold.
        let moved = ContactFrame {
            translation: Vec3::new(0.05, 0.0, 0.0),
            rotation: Mat3::IDENTITY,
        };
        manifold.refresh_points(&moved, &frame);
        assert_eq!(manifold.contact_count(), 0);
    }

    #[test]
    fn two_d_correction_drops_z_normals() {
        let mut manifold = Manifold::new((0, 1), AddingPolicy::Normal);
        let frame = identity_frame();
        let mut points = [
            ManifoldPoint::new(Vec3::ZERO, Vec3::Z, 0.1),
            ManifoldPoint::new(Vec3::X, Vec3::new(0.6, 0.8, 0.0), 0.1),
        ];
        manifold.add_points(&mut points, &frame, &frame);

        assert!(manifold.correct_for_2d((true, true), (true, false), (false, false)));
        assert_eq!(manifold.contact_count(), 1);
        assert!(manifold.points()[0].normal.z.abs() < 1e-6);

        // All-z normals invalidate the manifold.
        let mut points = [ManifoldPoint::new(Vec3::ZERO, Vec3::Z, 0.1)];
        manifold.add_points(&mut points, &frame, &frame);
        assert!(!manifold.correct_for_2d((true, true), (true, false), (false, false)));
    }
}
