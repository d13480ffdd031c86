use bitflags::bitflags;
use glam::Vec3;

use super::ColliderIndex;
use super::collider::Collider;
use super::shape::{Aabb, HeightMapShape, PhysicsMesh, Shape, Triangle};

#[derive(Debug, Clone, Copy)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction: direction.normalize_or_zero(),
        }
    }

    pub fn point_at(&self, distance: f32) -> Vec3 {
        self.origin + self.direction * distance
    }
}

/// A plane as (normal, offset) with points satisfying `n . p = d`.
#[derive(Debug, Clone, Copy)]
pub struct Plane {
    pub normal: Vec3,
    pub distance: f32,
}

impl Plane {
    pub fn new(normal: Vec3, point: Vec3) -> Self {
        let normal = normal.normalize_or_zero();
        Self {
            normal,
            distance: normal.dot(point),
        }
    }

    /// Signed distance of the aabb's most positive corner; negative when the
    /// whole box is behind the plane.
    fn aabb_support_distance(&self, aabb: &Aabb) -> f32 {
        let center = aabb.center();
        let half = aabb.half_extents();
        let radius = half.x * self.normal.x.abs()
            + half.y * self.normal.y.abs()
            + half.z * self.normal.z.abs();
        self.normal.dot(center) - self.distance + radius
    }
}

/// Six inward-facing planes.
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    pub fn contains_aabb(&self, aabb: &Aabb) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.aabb_support_distance(aabb) >= 0.0)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CastFilterFlags: u32 {
        const IGNORE_GHOST = 1 << 0;
        const IGNORE_STATIC = 1 << 1;
        const IGNORE_KINEMATIC = 1 << 2;
        const IGNORE_DYNAMIC = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastFilterState {
    DefaultBehavior,
    Accept,
    Reject,
}

/// Filter applied to every candidate collider. A user callback may override
/// all other filter logic by returning accept or reject outright.
pub struct CastFilter<'a> {
    pub flags: CastFilterFlags,
    pub collision_group: Option<u32>,
    pub ignored_collider: Option<ColliderIndex>,
    pub callback: Option<&'a dyn Fn(ColliderIndex, &Collider) -> CastFilterState>,
}

impl Default for CastFilter<'_> {
    fn default() -> Self {
        Self {
            flags: CastFilterFlags::IGNORE_GHOST,
            collision_group: None,
            ignored_collider: None,
            callback: None,
        }
    }
}

impl CastFilter<'_> {
    pub fn is_valid(&self, index: ColliderIndex, collider: &Collider) -> bool {
        if let Some(callback) = self.callback {
            match callback(index, collider) {
                CastFilterState::Accept => return true,
                CastFilterState::Reject => return false,
                CastFilterState::DefaultBehavior => {}
            }
        }
        if self.flags.contains(CastFilterFlags::IGNORE_GHOST) && collider.ghost {
            return false;
        }
        if self.flags.contains(CastFilterFlags::IGNORE_KINEMATIC) && collider.is_kinematic() {
            return false;
        }
        if self.flags.contains(CastFilterFlags::IGNORE_DYNAMIC) && collider.is_dynamic() {
            return false;
        }
        if self.flags.contains(CastFilterFlags::IGNORE_STATIC) && collider.is_static() {
            return false;
        }
        if self.ignored_collider == Some(index) {
            return false;
        }
        if let Some(group) = self.collision_group {
            if collider.collision_group != group {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CastResult {
    pub collider: ColliderIndex,
    pub point: Vec3,
    pub normal: Vec3,
    pub distance: f32,
}

/// A capacity-bounded result set. Ray results stay sorted by distance; when
/// full, hits farther than the current worst are discarded.
#[derive(Debug)]
pub struct CastResults {
    results: Vec<CastResult>,
    capacity: usize,
}

impl CastResults {
    pub fn new(capacity: usize) -> Self {
        Self {
            results: Vec::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn add(&mut self, result: CastResult) {
        let position = self
            .results
            .iter()
            .position(|existing| existing.distance > result.distance)
            .unwrap_or(self.results.len());
        if position >= self.capacity {
            return;
        }
        self.results.insert(position, result);
        self.results.truncate(self.capacity);
    }

    pub fn results(&self) -> &[CastResult] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.results.len() >= self.capacity
    }

    pub fn first(&self) -> Option<&CastResult> {
        self.results.first()
    }
}

/// Ray-vs-collider intersection in world space.
pub fn ray_cast_collider(ray: &Ray, collider: &Collider, max_distance: f32) -> Option<CastResult> {
    // Work in the collider's local space.
    let local_origin = collider.to_local(ray.origin);
    let local_direction = (collider.world_rotation.transpose() * ray.direction).normalize_or_zero();
    let local_ray = Ray {
        origin: local_origin,
        direction: local_direction,
    };

    let hit = match &collider.shape {
        Shape::Sphere { radius } => ray_sphere(&local_ray, Vec3::ZERO, *radius),
        Shape::Box { half_extents } => ray_box(&local_ray, *half_extents),
        Shape::Capsule {
            radius,
            half_height,
        } => ray_capsule(&local_ray, *radius, *half_height),
        Shape::Cylinder {
            radius,
            half_height,
        } => ray_cylinder(&local_ray, *radius, *half_height),
        Shape::Ellipsoid { radii } => ray_ellipsoid(&local_ray, *radii),
        Shape::ConvexMesh(mesh) | Shape::Mesh(mesh) => ray_mesh(&local_ray, mesh),
        Shape::MultiConvexMesh(meshes) => meshes
            .iter()
            .filter_map(|mesh| ray_mesh(&local_ray, mesh))
            .min_by(|a, b| a.0.total_cmp(&b.0)),
        Shape::HeightMap(map) => ray_heightmap(&local_ray, map, max_distance),
    }?;

    let (distance, local_normal) = hit;
    if distance < 0.0 || distance > max_distance {
        return None;
    }
    Some(CastResult {
        collider: 0,
        point: ray.point_at(distance),
        normal: (collider.world_rotation * local_normal).normalize_or_zero(),
        distance,
    })
}

fn ray_sphere(ray: &Ray, center: Vec3, radius: f32) -> Option<(f32, Vec3)> {
    let m = ray.origin - center;
    let b = m.dot(ray.direction);
    let c = m.length_squared() - radius * radius;
    if c > 0.0 && b > 0.0 {
        return None;
    }
    let discriminant = b * b - c;
    if discriminant < 0.0 {
        return None;
    }
    let t = (-b - discriminant.sqrt()).max(0.0);
    let point = ray.point_at(t);
    Some((t, (point - center).normalize_or_zero()))
}

fn ray_box(ray: &Ray, half_extents: Vec3) -> Option<(f32, Vec3)> {
    let mut t_min = 0.0f32;
    let mut t_max = f32::MAX;
    let mut normal = Vec3::ZERO;
    for axis in 0..3 {
        if ray.direction[axis].abs() < 1e-8 {
            if ray.origin[axis].abs() > half_extents[axis] {
                return None;
            }
            continue;
        }
        let inv = 1.0 / ray.direction[axis];
        let mut t1 = (-half_extents[axis] - ray.origin[axis]) * inv;
        let mut t2 = (half_extents[axis] - ray.origin[axis]) * inv;
        let mut axis_normal = Vec3::ZERO;
        axis_normal[axis] = -1.0f32.copysign(ray.direction[axis]);
        if t1 > t2 {
            std::mem::swap(&mut t1, &mut t2);
        }
        if t1 > t_min {
            t_min = t1;
            normal = axis_normal;
        }
        t_max = t_max.min(t2);
        if t_min > t_max {
            return None;
        }
    }
    if normal == Vec3::ZERO {
        // Origin inside the box.
        normal = -ray.direction;
    }
    Some((t_min, normal))
}

fn ray_capsule(ray: &Ray, radius: f32, half_height: f32) -> Option<(f32, Vec3)> {
    // Infinite cylinder about y, then the cap spheres.
    let mut best: Option<(f32, Vec3)> = None;
    let mut consider = |candidate: Option<(f32, Vec3)>| {
        if let Some((t, normal)) = candidate {
            if best.is_none() || t < best.unwrap().0 {
                best = Some((t, normal));
            }
        }
    };

    if let Some((t, normal)) = ray_infinite_cylinder(ray, radius) {
        let y = ray.point_at(t).y;
        if y.abs() <= half_height {
            consider(Some((t, normal)));
        }
    }
    consider(ray_sphere(ray, Vec3::new(0.0, half_height, 0.0), radius));
    consider(ray_sphere(ray, Vec3::new(0.0, -half_height, 0.0), radius));
    best
}

fn ray_infinite_cylinder(ray: &Ray, radius: f32) -> Option<(f32, Vec3)> {
    let origin = Vec3::new(ray.origin.x, 0.0, ray.origin.z);
    let direction = Vec3::new(ray.direction.x, 0.0, ray.direction.z);
    let a = direction.length_squared();
    if a < 1e-10 {
        return None;
    }
    let b = origin.dot(direction);
    let c = origin.length_squared() - radius * radius;
    if c > 0.0 && b > 0.0 {
        return None;
    }
    let discriminant = b * b - a * c;
    if discriminant < 0.0 {
        return None;
    }
    let t = ((-b - discriminant.sqrt()) / a).max(0.0);
    let point = ray.point_at(t);
    let normal = Vec3::new(point.x, 0.0, point.z).normalize_or_zero();
    Some((t, normal))
}

fn ray_cylinder(ray: &Ray, radius: f32, half_height: f32) -> Option<(f32, Vec3)> {
    let mut best: Option<(f32, Vec3)> = None;
    if let Some((t, normal)) = ray_infinite_cylinder(ray, radius) {
        if ray.point_at(t).y.abs() <= half_height {
            best = Some((t, normal));
        }
    }
    // End caps.
    for sign in [1.0f32, -1.0] {
        let plane_y = half_height * sign;
        if ray.direction.y.abs() < 1e-8 {
            continue;
        }
        let t = (plane_y - ray.origin.y) / ray.direction.y;
        if t < 0.0 {
            continue;
        }
        let point = ray.point_at(t);
        if point.x * point.x + point.z * point.z <= radius * radius
            && (best.is_none() || t < best.unwrap().0)
        {
            best = Some((t, Vec3::new(0.0, sign, 0.0)));
        }
    }
    best
}

fn ray_ellipsoid(ray: &Ray, radii: Vec3) -> Option<(f32, Vec3)> {
    // Scale into unit-sphere space.
    let scaled_origin = ray.origin / radii;
    let scaled_direction = ray.direction / radii;
    let length = scaled_direction.length();
    if length < 1e-10 {
        return None;
    }
    let scaled_ray = Ray {
        origin: scaled_origin,
        direction: scaled_direction / length,
    };
    let (scaled_t, _) = ray_sphere(&scaled_ray, Vec3::ZERO, 1.0)?;
    let t = scaled_t / length;
    let point = ray.point_at(t);
    // Gradient of the ellipsoid equation gives the surface normal.
    let normal = (point / (radii * radii)).normalize_or_zero();
    Some((t, normal))
}

/// Moller-Trumbore, front and back faces.
pub fn ray_triangle(ray: &Ray, tri: &Triangle) -> Option<f32> {
    let edge1 = tri.p1 - tri.p0;
    let edge2 = tri.p2 - tri.p0;
    let h = ray.direction.cross(edge2);
    let a = edge1.dot(h);
    if a.abs() < 1e-8 {
        return None;
    }
    let f = 1.0 / a;
    let s = ray.origin - tri.p0;
    let u = f * s.dot(h);
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(edge1);
    let v = f * ray.direction.dot(q);
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = f * edge2.dot(q);
    (t >= 0.0).then_some(t)
}

fn ray_mesh(ray: &Ray, mesh: &PhysicsMesh) -> Option<(f32, Vec3)> {
    if !mesh.is_valid() {
        return None;
    }
    let mut best: Option<(f32, Vec3)> = None;
    for index in 0..mesh.triangle_count() {
        let tri = mesh.triangle(index);
        if let Some(t) = ray_triangle(ray, &tri) {
            if best.is_none() || t < best.unwrap().0 {
                let mut normal = tri.normal();
                if normal.dot(ray.direction) > 0.0 {
                    normal = -normal;
                }
                best = Some((t, normal));
            }
        }
    }
    best
}

fn ray_heightmap(ray: &Ray, map: &HeightMapShape, max_distance: f32) -> Option<(f32, Vec3)> {
    // Bound the triangle search by the ray segment's aabb.
    let end = ray.point_at(max_distance.min(1e6));
    let aabb = Aabb::from_points([ray.origin, end]).expanded(map.cell_size());
    let mut best: Option<(f32, Vec3)> = None;
    for key in map.keys_in_aabb(&aabb) {
        let Some(tri) = map.triangle(key) else {
            continue;
        };
        if let Some(t) = ray_triangle(ray, &tri) {
            if best.is_none() || t < best.unwrap().0 {
                let mut normal = tri.normal();
                if normal.dot(ray.direction) > 0.0 {
                    normal = -normal;
                }
                best = Some((t, normal));
            }
        }
    }
    best
}

/// Sphere-vs-aabb overlap for volume casts.
pub fn sphere_overlaps_aabb(center: Vec3, radius: f32, aabb: &Aabb) -> bool {
    let closest = center.clamp(aabb.min, aabb.max);
    (closest - center).length_squared() <= radius * radius
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::collider::Motion;
    use glam::Mat3;

    fn collider_at(shape: Shape, translation: Vec3) -> Collider {
        let mut collider = Collider::new(shape, 0);
        collider.update_world_bounds(translation, Mat3::IDENTITY);
        collider
    }

    #[test]
    fn ray_hits_sphere_front_face() {
        let collider = collider_at(Shape::Sphere { radius: 1.0 }, Vec3::new(5.0, 0.0, 0.0));
        let ray = Ray::new(Vec3::ZERO, Vec3::X);
        let hit = ray_cast_collider(&ray, &collider, 100.0).unwrap();
        assert!((hit.distance - 4.0).abs() < 1e-4);
        assert!((hit.normal + Vec3::X).length() < 1e-4);
        assert!((hit.point - Vec3::new(4.0, 0.0, 0.0)).length() < 1e-4);
    }

    #[test]
    fn ray_misses_out_of_range() {
        let collider = collider_at(Shape::Sphere { radius: 1.0 }, Vec3::new(5.0, 0.0, 0.0));
        let ray = Ray::new(Vec3::ZERO, Vec3::X);
        assert!(ray_cast_collider(&ray, &collider, 2.0).is_none());
    }

    #[test]
    fn ray_hits_rotated_box() {
        let mut collider = collider_at(
            Shape::Box {
                half_extents: Vec3::splat(1.0),
            },
            Vec3::new(0.0, 3.0, 0.0),
        );
        collider.update_world_bounds(
            Vec3::new(0.0, 3.0, 0.0),
            Mat3::from_rotation_y(std::f32::consts::FRAC_PI_4),
        );
        let ray = Ray::new(Vec3::ZERO, Vec3::Y);
        let hit = ray_cast_collider(&ray, &collider, 10.0).unwrap();
        assert!((hit.distance - 2.0).abs() < 1e-4);
        assert!(hit.normal.y < -0.99);
    }

    #[test]
    fn results_stay_sorted_and_bounded() {
        let mut results = CastResults::new(2);
        let result = |distance| CastResult {
            collider: 0,
            point: Vec3::ZERO,
            normal: Vec3::Y,
            distance,
        };
        results.add(result(5.0));
        results.add(result(1.0));
        results.add(result(3.0));
        let distances: Vec<f32> = results.results().iter().map(|r| r.distance).collect();
        assert_eq!(distances, vec![1.0, 3.0]);
    }

    #[test]
    fn filter_masks_apply() {
        let mut collider = collider_at(Shape::Sphere { radius: 1.0 }, Vec3::ZERO);
        collider.motion = Motion::Dynamic;
        let filter = CastFilter {
            flags: CastFilterFlags::IGNORE_DYNAMIC,
            ..Default::default()
        };
        assert!(!filter.is_valid(0, &collider));

        // A callback override wins over the mask.
        let accept = |_: ColliderIndex, _: &Collider| CastFilterState::Accept;
        let filter = CastFilter {
            flags: CastFilterFlags::IGNORE_DYNAMIC,
            callback: Some(&accept),
            ..Default::default()
        };
        assert!(filter.is_valid(0, &collider));
    }

    #[test]
    fn frustum_aabb_test() {
        // A frustum that is just an axis-aligned slab around the origin.
        let frustum = Frustum {
            planes: [
                Plane::new(Vec3::X, Vec3::new(-1.0, 0.0, 0.0)),
                Plane::new(-Vec3::X, Vec3::new(1.0, 0.0, 0.0)),
                Plane::new(Vec3::Y, Vec3::new(0.0, -1.0, 0.0)),
                Plane::new(-Vec3::Y, Vec3::new(0.0, 1.0, 0.0)),
                Plane::new(Vec3::Z, Vec3::new(0.0, 0.0, -1.0)),
                Plane::new(-Vec3::Z, Vec3::new(0.0, 0.0, 1.0)),
            ],
        };
        let inside = Aabb::new(Vec3::splat(-0.1), Vec3::splat(0.1));
        let outside = Aabb::new(Vec3::splat(5.0), Vec3::splat(6.0));
        assert!(frustum.contains_aabb(&inside));
        assert!(!frustum.contains_aabb(&outside));
    }
}
