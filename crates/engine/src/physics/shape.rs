use std::f32::consts::PI;
use std::sync::Arc;

use glam::{Mat3, Vec3};

/// Skip inertia contributions below this mass to avoid numerical blowup.
pub const MIN_INERTIA_MASS: f32 = 1e-6;
/// Masses above this are treated as infinite for inertia purposes.
pub const MAX_INERTIA_MASS: f32 = 1e7;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const ZERO: Aabb = Aabb {
        min: Vec3::ZERO,
        max: Vec3::ZERO,
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        for point in points {
            min = min.min(point);
            max = max.max(point);
        }
        if min.x > max.x {
            return Self::ZERO;
        }
        Self { min, max }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn expanded(&self, margin: f32) -> Aabb {
        Aabb {
            min: self.min - Vec3::splat(margin),
            max: self.max + Vec3::splat(margin),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangle {
    pub p0: Vec3,
    pub p1: Vec3,
    pub p2: Vec3,
}

impl Triangle {
    pub fn new(p0: Vec3, p1: Vec3, p2: Vec3) -> Self {
        Self { p0, p1, p2 }
    }

    pub fn raw_normal(&self) -> Vec3 {
        (self.p1 - self.p0).cross(self.p2 - self.p0)
    }

    pub fn normal(&self) -> Vec3 {
        self.raw_normal().normalize_or_zero()
    }

    pub fn center(&self) -> Vec3 {
        (self.p0 + self.p1 + self.p2) / 3.0
    }

    pub fn aabb(&self) -> Aabb {
        Aabb::from_points([self.p0, self.p1, self.p2])
    }

    pub fn point(&self, index: usize) -> Vec3 {
        match index {
            0 => self.p0,
            1 => self.p1,
            _ => self.p2,
        }
    }
}

/// Closest point on a triangle to `point` (Ericson's method).
pub fn closest_point_on_triangle(triangle: &Triangle, point: Vec3) -> Vec3 {
    let a = triangle.p0;
    let b = triangle.p1;
    let c = triangle.p2;

    let ab = b - a;
    let ac = c - a;
    let ap = point - a;
    let d1 = ab.dot(ap);
    let d2 = ac.dot(ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return a;
    }

    let bp = point - b;
    let d3 = ab.dot(bp);
    let d4 = ac.dot(bp);
    if d3 >= 0.0 && d4 <= d3 {
        return b;
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return a + ab * v;
    }

    let cp = point - c;
    let d5 = ab.dot(cp);
    let d6 = ac.dot(cp);
    if d6 >= 0.0 && d5 <= d6 {
        return c;
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return a + ac * w;
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return b + (c - b) * w;
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    a + ab * v + ac * w
}

/// Closest point on a segment to `point`.
pub fn closest_point_on_segment(start: Vec3, end: Vec3, point: Vec3) -> Vec3 {
    let axis = end - start;
    let length_sq = axis.length_squared();
    if length_sq <= f32::EPSILON {
        return start;
    }
    let t = ((point - start).dot(axis) / length_sq).clamp(0.0, 1.0);
    start + axis * t
}

/// Mass properties computed from a closed triangle mesh (Eberly's polyhedral
/// integrals). Inertia is for unit mass about the center of mass.
#[derive(Debug, Clone, Copy)]
pub struct MassProperties {
    pub volume: f32,
    pub center_of_mass: Vec3,
    pub unit_inertia: Mat3,
}

impl MassProperties {
    pub fn unit() -> Self {
        Self {
            volume: 1.0,
            center_of_mass: Vec3::ZERO,
            unit_inertia: Mat3::IDENTITY,
        }
    }
}

fn subexpressions(w0: f32, w1: f32, w2: f32) -> (f32, f32, f32, f32, f32, f32) {
    let temp0 = w0 + w1;
    let f1 = temp0 + w2;
    let temp1 = w0 * w0;
    let temp2 = temp1 + w1 * temp0;
    let f2 = temp2 + w2 * f1;
    let f3 = w0 * temp1 + w1 * temp2 + w2 * f2;
    let g0 = f2 + w0 * (f1 + w0);
    let g1 = f2 + w1 * (f1 + w1);
    let g2 = f2 + w2 * (f1 + w2);
    (f1, f2, f3, g0, g1, g2)
}

pub fn mesh_mass_properties(vertices: &[Vec3], indices: &[[u32; 3]]) -> Option<MassProperties> {
    let mut integrals = [0.0f32; 10];
    for tri in indices {
        let p0 = *vertices.get(tri[0] as usize)?;
        let p1 = *vertices.get(tri[1] as usize)?;
        let p2 = *vertices.get(tri[2] as usize)?;

        let d = (p1 - p0).cross(p2 - p0);

        let (f1x, f2x, f3x, g0x, g1x, g2x) = subexpressions(p0.x, p1.x, p2.x);
        let (_, f2y, f3y, g0y, g1y, g2y) = subexpressions(p0.y, p1.y, p2.y);
        let (_, f2z, f3z, g0z, g1z, g2z) = subexpressions(p0.z, p1.z, p2.z);

        integrals[0] += d.x * f1x;
        integrals[1] += d.x * f2x;
        integrals[2] += d.y * f2y;
        integrals[3] += d.z * f2z;
        integrals[4] += d.x * f3x;
        integrals[5] += d.y * f3y;
        integrals[6] += d.z * f3z;
        integrals[7] += d.x * (p0.y * g0x + p1.y * g1x + p2.y * g2x);
        integrals[8] += d.y * (p0.z * g0y + p1.z * g1y + p2.z * g2y);
        integrals[9] += d.z * (p0.x * g0z + p1.x * g1z + p2.x * g2z);
    }

    integrals[0] /= 6.0;
    integrals[1] /= 24.0;
    integrals[2] /= 24.0;
    integrals[3] /= 24.0;
    integrals[4] /= 60.0;
    integrals[5] /= 60.0;
    integrals[6] /= 60.0;
    integrals[7] /= 120.0;
    integrals[8] /= 120.0;
    integrals[9] /= 120.0;

    let volume = integrals[0];
    if volume.abs() <= f32::EPSILON {
        return None;
    }
    let center = Vec3::new(integrals[1], integrals[2], integrals[3]) / volume;

    // Inertia about the origin for unit density, then shifted to the center
    // of mass and normalized to unit mass.
    let xx = integrals[5] + integrals[6] - volume * (center.y * center.y + center.z * center.z);
    let yy = integrals[4] + integrals[6] - volume * (center.z * center.z + center.x * center.x);
    let zz = integrals[4] + integrals[5] - volume * (center.x * center.x + center.y * center.y);
    let xy = -(integrals[7] - volume * center.x * center.y);
    let yz = -(integrals[8] - volume * center.y * center.z);
    let xz = -(integrals[9] - volume * center.z * center.x);

    let unit_inertia = Mat3::from_cols(
        Vec3::new(xx, xy, xz),
        Vec3::new(xy, yy, yz),
        Vec3::new(xz, yz, zz),
    ) * (1.0 / volume);

    Some(MassProperties {
        volume: volume.abs(),
        center_of_mass: center,
        unit_inertia,
    })
}

/// A triangle soup used by mesh and convex-mesh colliders. Meshes with
/// dangling indices mark themselves invalid and every query degrades to a
/// safe default (unit volume, identity inertia, zero support).
#[derive(Debug)]
pub struct PhysicsMesh {
    vertices: Vec<Vec3>,
    indices: Vec<[u32; 3]>,
    valid: bool,
    local_aabb: Aabb,
    mass_properties: MassProperties,
    version: u64,
}

impl PhysicsMesh {
    pub fn new(vertices: Vec<Vec3>, indices: Vec<[u32; 3]>) -> Self {
        let valid = !vertices.is_empty()
            && !indices.is_empty()
            && indices
                .iter()
                .all(|tri| tri.iter().all(|&i| (i as usize) < vertices.len()));
        if !valid {
            log::warn!("physics mesh has dangling indices or no geometry; marked invalid");
        }

        let local_aabb = if valid {
            Aabb::from_points(vertices.iter().copied())
        } else {
            Aabb::ZERO
        };
        let mass_properties = if valid {
            mesh_mass_properties(&vertices, &indices).unwrap_or_else(MassProperties::unit)
        } else {
            MassProperties::unit()
        };
        Self {
            vertices,
            indices,
            valid,
            local_aabb,
            mass_properties,
            version: 1,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    pub fn triangle_count(&self) -> usize {
        if self.valid { self.indices.len() } else { 0 }
    }

    pub fn triangle(&self, index: usize) -> Triangle {
        let tri = self.indices[index];
        Triangle::new(
            self.vertices[tri[0] as usize],
            self.vertices[tri[1] as usize],
            self.vertices[tri[2] as usize],
        )
    }

    pub fn local_aabb(&self) -> Aabb {
        self.local_aabb
    }

    pub fn mass_properties(&self) -> MassProperties {
        self.mass_properties
    }

    pub fn support(&self, direction: Vec3) -> Vec3 {
        if !self.valid {
            return Vec3::ZERO;
        }
        let mut best = self.vertices[0];
        let mut best_dot = best.dot(direction);
        for &vertex in &self.vertices[1..] {
            let dot = vertex.dot(direction);
            if dot > best_dot {
                best_dot = dot;
                best = vertex;
            }
        }
        best
    }
}

/// A regular grid of heights spanning the xz plane, two triangles per cell.
/// Missing samples are encoded as NaN and produce no triangles.
#[derive(Debug)]
pub struct HeightMapShape {
    heights: Vec<f32>,
    /// Samples along x.
    width: usize,
    /// Samples along z.
    depth: usize,
    cell_size: f32,
}

impl HeightMapShape {
    pub fn new(heights: Vec<f32>, width: usize, depth: usize, cell_size: f32) -> Self {
        debug_assert_eq!(heights.len(), width * depth);
        Self {
            heights,
            width,
            depth,
            cell_size,
        }
    }

    pub fn sample(&self, x: usize, z: usize) -> Option<f32> {
        if x >= self.width || z >= self.depth {
            return None;
        }
        let height = self.heights[z * self.width + x];
        height.is_finite().then_some(height)
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Triangle keys encode (cell x, cell z, which half).
    pub fn triangle_key(x: usize, z: usize, upper: bool) -> u32 {
        ((z as u32) << 16) | ((x as u32) << 1) | u32::from(upper)
    }

    pub fn decode_key(key: u32) -> (usize, usize, bool) {
        let z = (key >> 16) as usize;
        let x = ((key & 0xffff) >> 1) as usize;
        (x, z, key & 1 != 0)
    }

    /// The triangle for a key, in local space, if all three corners exist.
    /// Lower triangle: (h00, h01, h10); upper: (h01, h11, h10) keeping
    /// counter-clockwise winding seen from +y.
    pub fn triangle(&self, key: u32) -> Option<Triangle> {
        let (x, z, upper) = Self::decode_key(key);
        let h00 = self.sample(x, z);
        let h10 = self.sample(x + 1, z);
        let h01 = self.sample(x, z + 1);
        let h11 = self.sample(x + 1, z + 1);

        let size = self.cell_size;
        let base = Vec3::new(x as f32 * size, 0.0, z as f32 * size);
        let corner = |dx: f32, dz: f32, height: f32| {
            base + Vec3::new(dx * size, height, dz * size)
        };

        if upper {
            let (h01, h11, h10) = (h01?, h11?, h10?);
            Some(Triangle::new(
                corner(0.0, 1.0, h01),
                corner(1.0, 1.0, h11),
                corner(1.0, 0.0, h10),
            ))
        } else {
            let (h00, h01, h10) = (h00?, h01?, h10?);
            Some(Triangle::new(
                corner(0.0, 0.0, h00),
                corner(0.0, 1.0, h01),
                corner(1.0, 0.0, h10),
            ))
        }
    }

    /// All triangle keys whose cells overlap a local-space aabb.
    pub fn keys_in_aabb(&self, aabb: &Aabb) -> Vec<u32> {
        let min_x = (aabb.min.x / self.cell_size).floor().max(0.0) as usize;
        let min_z = (aabb.min.z / self.cell_size).floor().max(0.0) as usize;
        let max_x = ((aabb.max.x / self.cell_size).ceil().max(0.0) as usize)
            .min(self.width.saturating_sub(2));
        let max_z = ((aabb.max.z / self.cell_size).ceil().max(0.0) as usize)
            .min(self.depth.saturating_sub(2));

        let mut keys = Vec::new();
        for z in min_z..=max_z {
            for x in min_x..=max_x {
                keys.push(Self::triangle_key(x, z, false));
                keys.push(Self::triangle_key(x, z, true));
            }
        }
        keys
    }

    pub fn local_aabb(&self) -> Aabb {
        let mut min_height = f32::MAX;
        let mut max_height = f32::MIN;
        for &height in &self.heights {
            if height.is_finite() {
                min_height = min_height.min(height);
                max_height = max_height.max(height);
            }
        }
        if min_height > max_height {
            return Aabb::ZERO;
        }
        Aabb::new(
            Vec3::new(0.0, min_height, 0.0),
            Vec3::new(
                (self.width - 1) as f32 * self.cell_size,
                max_height,
                (self.depth - 1) as f32 * self.cell_size,
            ),
        )
    }
}

/// The collision geometry of one collider, in local space.
#[derive(Debug, Clone)]
pub enum Shape {
    Sphere {
        radius: f32,
    },
    Box {
        half_extents: Vec3,
    },
    Capsule {
        radius: f32,
        /// Half the cylindrical section, along local y.
        half_height: f32,
    },
    Cylinder {
        radius: f32,
        half_height: f32,
    },
    Ellipsoid {
        radii: Vec3,
    },
    ConvexMesh(Arc<PhysicsMesh>),
    Mesh(Arc<PhysicsMesh>),
    MultiConvexMesh(Vec<Arc<PhysicsMesh>>),
    HeightMap(Arc<HeightMapShape>),
}

impl Shape {
    pub fn volume(&self) -> f32 {
        match self {
            Shape::Sphere { radius } => 4.0 / 3.0 * PI * radius.powi(3),
            Shape::Box { half_extents } => {
                8.0 * half_extents.x * half_extents.y * half_extents.z
            }
            Shape::Capsule {
                radius,
                half_height,
            } => {
                PI * radius * radius * (2.0 * half_height) + 4.0 / 3.0 * PI * radius.powi(3)
            }
            Shape::Cylinder {
                radius,
                half_height,
            } => PI * radius * radius * (2.0 * half_height),
            Shape::Ellipsoid { radii } => 4.0 / 3.0 * PI * radii.x * radii.y * radii.z,
            Shape::ConvexMesh(mesh) | Shape::Mesh(mesh) => {
                if mesh.is_valid() {
                    mesh.mass_properties().volume
                } else {
                    1.0
                }
            }
            Shape::MultiConvexMesh(meshes) => meshes
                .iter()
                .map(|mesh| {
                    if mesh.is_valid() {
                        mesh.mass_properties().volume
                    } else {
                        1.0
                    }
                })
                .sum(),
            Shape::HeightMap(_) => 1.0,
        }
    }

    /// Local center of mass.
    pub fn local_center_of_mass(&self) -> Vec3 {
        match self {
            Shape::ConvexMesh(mesh) | Shape::Mesh(mesh) => {
                if mesh.is_valid() {
                    mesh.mass_properties().center_of_mass
                } else {
                    Vec3::ZERO
                }
            }
            Shape::MultiConvexMesh(meshes) => {
                let mut weighted = Vec3::ZERO;
                let mut total = 0.0;
                for mesh in meshes {
                    if mesh.is_valid() {
                        let properties = mesh.mass_properties();
                        weighted += properties.center_of_mass * properties.volume;
                        total += properties.volume;
                    }
                }
                if total > 0.0 { weighted / total } else { Vec3::ZERO }
            }
            _ => Vec3::ZERO,
        }
    }

    /// Local-space inertia tensor for the given mass, about the local center
    /// of mass.
    pub fn local_inertia(&self, mass: f32) -> Mat3 {
        match self {
            Shape::Sphere { radius } => {
                Mat3::from_diagonal(Vec3::splat(0.4 * mass * radius * radius))
            }
            Shape::Box { half_extents } => {
                let w = half_extents * 2.0;
                Mat3::from_diagonal(
                    Vec3::new(
                        w.y * w.y + w.z * w.z,
                        w.x * w.x + w.z * w.z,
                        w.x * w.x + w.y * w.y,
                    ) * (mass / 12.0),
                )
            }
            Shape::Capsule {
                radius,
                half_height,
            } => {
                let r = *radius;
                let h = 2.0 * half_height;
                let cylinder_volume = PI * r * r * h;
                let caps_volume = 4.0 / 3.0 * PI * r.powi(3);
                let total = cylinder_volume + caps_volume;
                let cylinder_mass = mass * cylinder_volume / total;
                let caps_mass = mass * caps_volume / total;

                let axial = cylinder_mass * r * r / 2.0 + caps_mass * 0.4 * r * r;
                let centroid_offset = 3.0 * r / 8.0;
                let cap_center_distance = half_height + centroid_offset;
                let transverse = cylinder_mass * (3.0 * r * r + h * h) / 12.0
                    + caps_mass
                        * (0.4 * r * r - centroid_offset * centroid_offset
                            + cap_center_distance * cap_center_distance);
                Mat3::from_diagonal(Vec3::new(transverse, axial, transverse))
            }
            Shape::Cylinder {
                radius,
                half_height,
            } => {
                let r = *radius;
                let h = 2.0 * half_height;
                let axial = mass * r * r / 2.0;
                let transverse = mass * (3.0 * r * r + h * h) / 12.0;
                Mat3::from_diagonal(Vec3::new(transverse, axial, transverse))
            }
            Shape::Ellipsoid { radii } => Mat3::from_diagonal(
                Vec3::new(
                    radii.y * radii.y + radii.z * radii.z,
                    radii.x * radii.x + radii.z * radii.z,
                    radii.x * radii.x + radii.y * radii.y,
                ) * (mass / 5.0),
            ),
            Shape::ConvexMesh(mesh) | Shape::Mesh(mesh) => {
                if mesh.is_valid() {
                    mesh.mass_properties().unit_inertia * mass
                } else {
                    Mat3::IDENTITY
                }
            }
            Shape::MultiConvexMesh(_) | Shape::HeightMap(_) => Mat3::IDENTITY,
        }
    }

    /// Farthest local point in `direction`.
    pub fn support(&self, direction: Vec3) -> Vec3 {
        let direction = direction.normalize_or_zero();
        match self {
            Shape::Sphere { radius } => direction * *radius,
            Shape::Box { half_extents } => Vec3::new(
                half_extents.x.copysign(direction.x),
                half_extents.y.copysign(direction.y),
                half_extents.z.copysign(direction.z),
            ),
            Shape::Capsule {
                radius,
                half_height,
            } => Vec3::new(0.0, half_height.copysign(direction.y), 0.0) + direction * *radius,
            Shape::Cylinder {
                radius,
                half_height,
            } => {
                let radial = Vec3::new(direction.x, 0.0, direction.z).normalize_or_zero();
                radial * *radius + Vec3::new(0.0, half_height.copysign(direction.y), 0.0)
            }
            Shape::Ellipsoid { radii } => {
                let scaled = (*radii * direction).normalize_or_zero();
                *radii * scaled
            }
            Shape::ConvexMesh(mesh) | Shape::Mesh(mesh) => mesh.support(direction),
            Shape::MultiConvexMesh(meshes) => {
                let mut best = Vec3::ZERO;
                let mut best_dot = f32::MIN;
                for mesh in meshes {
                    let support = mesh.support(direction);
                    let dot = support.dot(direction);
                    if dot > best_dot {
                        best_dot = dot;
                        best = support;
                    }
                }
                best
            }
            Shape::HeightMap(_) => Vec3::ZERO,
        }
    }

    /// World aabb from support points along the world axes.
    pub fn world_aabb(&self, translation: Vec3, rotation: Mat3) -> Aabb {
        match self {
            Shape::Mesh(mesh) | Shape::ConvexMesh(mesh) => {
                rotate_aabb(mesh.local_aabb(), translation, rotation)
            }
            Shape::MultiConvexMesh(meshes) => {
                let mut aabb: Option<Aabb> = None;
                for mesh in meshes {
                    let piece = rotate_aabb(mesh.local_aabb(), translation, rotation);
                    aabb = Some(match aabb {
                        Some(existing) => existing.union(&piece),
                        None => piece,
                    });
                }
                aabb.unwrap_or(Aabb::new(translation, translation))
            }
            Shape::HeightMap(map) => rotate_aabb(map.local_aabb(), translation, rotation),
            _ => {
                let inverse = rotation.transpose();
                let mut min = Vec3::ZERO;
                let mut max = Vec3::ZERO;
                for axis in 0..3 {
                    let world_axis = Vec3::new(
                        f32::from(axis == 0),
                        f32::from(axis == 1),
                        f32::from(axis == 2),
                    );
                    let local_dir = inverse * world_axis;
                    let positive = rotation * self.support(local_dir);
                    let negative = rotation * self.support(-local_dir);
                    max[axis] = positive[axis];
                    min[axis] = negative[axis];
                }
                Aabb::new(min + translation, max + translation)
            }
        }
    }

    /// Radius of the bounding sphere about the shape origin.
    pub fn bounding_radius(&self) -> f32 {
        match self {
            Shape::Sphere { radius } => *radius,
            Shape::Box { half_extents } => half_extents.length(),
            Shape::Capsule {
                radius,
                half_height,
            } => half_height + radius,
            Shape::Cylinder {
                radius,
                half_height,
            } => (radius * radius + half_height * half_height).sqrt(),
            Shape::Ellipsoid { radii } => radii.max_element(),
            Shape::ConvexMesh(mesh) | Shape::Mesh(mesh) => {
                let aabb = mesh.local_aabb();
                aabb.center().length() + aabb.half_extents().length()
            }
            Shape::MultiConvexMesh(meshes) => meshes
                .iter()
                .map(|mesh| {
                    let aabb = mesh.local_aabb();
                    aabb.center().length() + aabb.half_extents().length()
                })
                .fold(0.0, f32::max),
            Shape::HeightMap(map) => {
                let aabb = map.local_aabb();
                aabb.center().length() + aabb.half_extents().length()
            }
        }
    }

    pub fn is_mesh_like(&self) -> bool {
        matches!(
            self,
            Shape::Mesh(_) | Shape::ConvexMesh(_) | Shape::MultiConvexMesh(_) | Shape::HeightMap(_)
        )
    }
}

fn rotate_aabb(local: Aabb, translation: Vec3, rotation: Mat3) -> Aabb {
    // Arvo's method: the rotated box of a box.
    let center = rotation * local.center() + translation;
    let half = local.half_extents();
    let abs = Mat3::from_cols(
        rotation.x_axis.abs(),
        rotation.y_axis.abs(),
        rotation.z_axis.abs(),
    );
    let world_half = abs * half;
    Aabb::new(center - world_half, center + world_half)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_volumes() {
        let sphere = Shape::Sphere { radius: 1.0 };
        assert!((sphere.volume() - 4.0 / 3.0 * PI).abs() < 1e-5);

        let unit_box = Shape::Box {
            half_extents: Vec3::splat(0.5),
        };
        assert!((unit_box.volume() - 1.0).abs() < 1e-6);

        let cylinder = Shape::Cylinder {
            radius: 1.0,
            half_height: 0.5,
        };
        assert!((cylinder.volume() - PI).abs() < 1e-5);
    }

    #[test]
    fn sphere_inertia() {
        let sphere = Shape::Sphere { radius: 2.0 };
        let inertia = sphere.local_inertia(5.0);
        assert!((inertia.x_axis.x - 0.4 * 5.0 * 4.0).abs() < 1e-4);
    }

    #[test]
    fn box_support_points() {
        let shape = Shape::Box {
            half_extents: Vec3::new(1.0, 2.0, 3.0),
        };
        assert_eq!(
            shape.support(Vec3::new(1.0, -1.0, 1.0)),
            Vec3::new(1.0, -2.0, 3.0)
        );
    }

    #[test]
    fn capsule_support_reaches_cap() {
        let shape = Shape::Capsule {
            radius: 0.5,
            half_height: 1.0,
        };
        let top = shape.support(Vec3::Y);
        assert!((top.y - 1.5).abs() < 1e-6);
    }

    #[test]
    fn world_aabb_of_rotated_box() {
        let shape = Shape::Box {
            half_extents: Vec3::new(1.0, 0.5, 0.5),
        };
        let rotation = Mat3::from_rotation_z(std::f32::consts::FRAC_PI_2);
        let aabb = shape.world_aabb(Vec3::new(10.0, 0.0, 0.0), rotation);
        assert!((aabb.max.y - 1.0).abs() < 1e-5);
        assert!((aabb.max.x - 10.5).abs() < 1e-5);
    }

    #[test]
    fn unit_cube_mesh_mass_properties() {
        // Unit cube centered at the origin.
        let half = 0.5;
        let vertices = vec![
            Vec3::new(-half, -half, -half),
            Vec3::new(half, -half, -half),
            Vec3::new(half, half, -half),
            Vec3::new(-half, half, -half),
            Vec3::new(-half, -half, half),
            Vec3::new(half, -half, half),
            Vec3::new(half, half, half),
            Vec3::new(-half, half, half),
        ];
        let indices = vec![
            // -z
            [0, 2, 1],
            [0, 3, 2],
            // +z
            [4, 5, 6],
            [4, 6, 7],
            // -y
            [0, 1, 5],
            [0, 5, 4],
            // +y
            [3, 6, 2],
            [3, 7, 6],
            // -x
            [0, 4, 7],
            [0, 7, 3],
            // +x
            [1, 2, 6],
            [1, 6, 5],
        ];
        let properties = mesh_mass_properties(&vertices, &indices).unwrap();
        assert!((properties.volume - 1.0).abs() < 1e-4);
        assert!(properties.center_of_mass.length() < 1e-4);
        // Unit cube unit mass inertia: 1/6 on the diagonal.
        assert!((properties.unit_inertia.x_axis.x - 1.0 / 6.0).abs() < 1e-3);
    }

    #[test]
    fn invalid_mesh_degrades_to_defaults() {
        let mesh = PhysicsMesh::new(vec![Vec3::ZERO], vec![[0, 1, 2]]);
        assert!(!mesh.is_valid());
        let shape = Shape::Mesh(Arc::new(mesh));
        assert_eq!(shape.volume(), 1.0);
        assert_eq!(shape.local_inertia(1.0), Mat3::IDENTITY);
        assert_eq!(shape.support(Vec3::X), Vec3::ZERO);
    }

    #[test]
    fn heightmap_triangles_cover_cell() {
        let map = HeightMapShape::new(vec![0.0; 4], 2, 2, 1.0);
        let lower = map.triangle(HeightMapShape::triangle_key(0, 0, false)).unwrap();
        let upper = map.triangle(HeightMapShape::triangle_key(0, 0, true)).unwrap();
        assert!(lower.normal().y > 0.99);
        assert!(upper.normal().y > 0.99);
    }

    #[test]
    fn heightmap_missing_sample_drops_triangle() {
        let map = HeightMapShape::new(vec![0.0, 0.0, 0.0, f32::NAN], 2, 2, 1.0);
        assert!(map.triangle(HeightMapShape::triangle_key(0, 0, false)).is_some());
        assert!(map.triangle(HeightMapShape::triangle_key(0, 0, true)).is_none());
    }
}
