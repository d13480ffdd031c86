use glam::Vec3;

use super::collider::Collider;
use super::edges::{correct_heightmap_edge_normals, correct_internal_edge_normals};
use super::manifold::{ContactFrame, ManifoldPoint};
use super::shape::{
    Aabb, HeightMapShape, PhysicsMesh, Shape, Triangle, closest_point_on_segment,
    closest_point_on_triangle,
};

const GJK_MAX_ITERATIONS: usize = 48;
const EPA_MAX_ITERATIONS: usize = 48;
const EPA_TOLERANCE: f32 = 1e-4;

/// Generates world-space contact points for one overlapping collider pair.
/// Normals point from `c0` toward `c1`.
pub fn collide(c0: &mut Collider, c1: &mut Collider, allow_backfaces: bool) -> Vec<ManifoldPoint> {
    // Mesh-like shapes always act as object 1 internally; swap back after.
    if c0.shape.is_mesh_like() && !c1.shape.is_mesh_like() {
        let mut points = collide_ordered(c1, c0, allow_backfaces);
        for point in &mut points {
            point.normal = -point.normal;
            point.world_points.swap(0, 1);
        }
        return points;
    }
    collide_ordered(c0, c1, allow_backfaces)
}

fn collide_ordered(
    c0: &mut Collider,
    c1: &mut Collider,
    allow_backfaces: bool,
) -> Vec<ManifoldPoint> {
    match (&c0.shape, &c1.shape) {
        (Shape::Sphere { radius: r0 }, Shape::Sphere { radius: r1 }) => {
            sphere_sphere(c0.world_translation, *r0, c1.world_translation, *r1)
                .into_iter()
                .collect()
        }
        (Shape::Sphere { radius }, Shape::Box { half_extents }) => {
            sphere_box(c0.world_translation, *radius, c1, *half_extents, false)
                .into_iter()
                .collect()
        }
        (Shape::Box { half_extents }, Shape::Sphere { radius }) => {
            sphere_box(c1.world_translation, *radius, c0, *half_extents, true)
                .into_iter()
                .collect()
        }
        (
            Shape::Sphere { radius },
            Shape::Capsule {
                radius: capsule_radius,
                half_height,
            },
        ) => sphere_capsule(
            c0.world_translation,
            *radius,
            c1,
            *capsule_radius,
            *half_height,
            false,
        )
        .into_iter()
        .collect(),
        (
            Shape::Capsule {
                radius: capsule_radius,
                half_height,
            },
            Shape::Sphere { radius },
        ) => sphere_capsule(
            c1.world_translation,
            *radius,
            c0,
            *capsule_radius,
            *half_height,
            true,
        )
        .into_iter()
        .collect(),
        (
            Shape::Capsule {
                radius: r0,
                half_height: h0,
            },
            Shape::Capsule {
                radius: r1,
                half_height: h1,
            },
        ) => capsule_capsule(c0, *r0, *h0, c1, *r1, *h1).into_iter().collect(),
        (Shape::Box { half_extents: he0 }, Shape::Box { half_extents: he1 }) => {
            box_box(c0, *he0, c1, *he1)
        }
        (_, Shape::Mesh(_) | Shape::HeightMap(_) | Shape::MultiConvexMesh(_)) => {
            collide_with_mesh(c0, c1, allow_backfaces)
        }
        _ => gjk_epa_contact(c0, c1).into_iter().collect(),
    }
}

//
// Analytic pairs
//

fn sphere_sphere(center0: Vec3, r0: f32, center1: Vec3, r1: f32) -> Option<ManifoldPoint> {
    let offset = center1 - center0;
    let distance = offset.length();
    if distance > r0 + r1 {
        return None;
    }
    let normal = if distance > 1e-6 {
        offset / distance
    } else {
        Vec3::Y
    };
    let mut point = ManifoldPoint::default();
    point.normal = normal;
    point.world_points[0] = center0 + normal * r0;
    point.world_points[1] = center1 - normal * r1;
    point.penetration = r0 + r1 - distance;
    Some(point)
}

fn sphere_box(
    sphere_center: Vec3,
    radius: f32,
    box_collider: &Collider,
    half_extents: Vec3,
    swap: bool,
) -> Option<ManifoldPoint> {
    let local_center = box_collider.to_local(sphere_center);
    let clamped = local_center.clamp(-half_extents, half_extents);
    let closest_world = box_collider.to_world(clamped);

    let offset = sphere_center - closest_world;
    let distance = offset.length();

    let (normal_to_sphere, penetration, box_point) = if distance > 1e-6 {
        (offset / distance, radius - distance, closest_world)
    } else {
        // Sphere center inside the box: push out the face of least depth.
        let depths = half_extents - local_center.abs();
        let axis = if depths.x <= depths.y && depths.x <= depths.z {
            0
        } else if depths.y <= depths.z {
            1
        } else {
            2
        };
        let mut local_normal = Vec3::ZERO;
        local_normal[axis] = 1.0f32.copysign(local_center[axis]);
        let mut surface = local_center;
        surface[axis] = half_extents[axis].copysign(local_center[axis]);
        (
            box_collider.world_rotation * local_normal,
            radius + depths[axis],
            box_collider.to_world(surface),
        )
    };
    if penetration < 0.0 {
        return None;
    }

    // Ordered with the sphere as object 0.
    let normal = -normal_to_sphere;
    let mut point = ManifoldPoint::default();
    point.normal = normal;
    point.world_points[0] = sphere_center + normal * radius;
    point.world_points[1] = box_point;
    point.penetration = penetration;
    if swap {
        point.normal = -point.normal;
        point.world_points.swap(0, 1);
    }
    Some(point)
}

fn capsule_segment(collider: &Collider, half_height: f32) -> (Vec3, Vec3) {
    let axis = collider.world_rotation * Vec3::Y;
    (
        collider.world_translation - axis * half_height,
        collider.world_translation + axis * half_height,
    )
}

fn sphere_capsule(
    sphere_center: Vec3,
    radius: f32,
    capsule: &Collider,
    capsule_radius: f32,
    half_height: f32,
    swap: bool,
) -> Option<ManifoldPoint> {
    let (start, end) = capsule_segment(capsule, half_height);
    let closest = closest_point_on_segment(start, end, sphere_center);
    let mut point = sphere_sphere(sphere_center, radius, closest, capsule_radius)?;
    if swap {
        point.normal = -point.normal;
        point.world_points.swap(0, 1);
    }
    Some(point)
}

fn closest_points_between_segments(
    p1: Vec3,
    q1: Vec3,
    p2: Vec3,
    q2: Vec3,
) -> (Vec3, Vec3) {
    let d1 = q1 - p1;
    let d2 = q2 - p2;
    let r = p1 - p2;
    let a = d1.length_squared();
    let e = d2.length_squared();
    let f = d2.dot(r);

    let (s, t);
    if a <= f32::EPSILON && e <= f32::EPSILON {
        return (p1, p2);
    }
    if a <= f32::EPSILON {
        s = 0.0;
        t = (f / e).clamp(0.0, 1.0);
    } else {
        let c = d1.dot(r);
        if e <= f32::EPSILON {
            t = 0.0;
            s = (-c / a).clamp(0.0, 1.0);
        } else {
            let b = d1.dot(d2);
            let denom = a * e - b * b;
            let mut s_value = if denom > f32::EPSILON {
                ((b * f - c * e) / denom).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let mut t_value = (b * s_value + f) / e;
            if t_value < 0.0 {
                t_value = 0.0;
                s_value = (-c / a).clamp(0.0, 1.0);
            } else if t_value > 1.0 {
                t_value = 1.0;
                s_value = ((b - c) / a).clamp(0.0, 1.0);
            }
            s = s_value;
            t = t_value;
        }
    }
    (p1 + d1 * s, p2 + d2 * t)
}

fn capsule_capsule(
    c0: &Collider,
    r0: f32,
    h0: f32,
    c1: &Collider,
    r1: f32,
    h1: f32,
) -> Option<ManifoldPoint> {
    let (start0, end0) = capsule_segment(c0, h0);
    let (start1, end1) = capsule_segment(c1, h1);
    let (point0, point1) = closest_points_between_segments(start0, end0, start1, end1);
    sphere_sphere(point0, r0, point1, r1)
}

//
// Box-box SAT with reference-face clipping
//

struct ObbAxes {
    axes: [Vec3; 3],
    half_extents: Vec3,
    center: Vec3,
}

impl ObbAxes {
    fn new(collider: &Collider, half_extents: Vec3) -> Self {
        Self {
            axes: [
                collider.world_rotation.x_axis,
                collider.world_rotation.y_axis,
                collider.world_rotation.z_axis,
            ],
            half_extents,
            center: collider.world_translation,
        }
    }

    fn project(&self, axis: Vec3) -> f32 {
        self.half_extents.x * self.axes[0].dot(axis).abs()
            + self.half_extents.y * self.axes[1].dot(axis).abs()
            + self.half_extents.z * self.axes[2].dot(axis).abs()
    }

    fn vertices(&self) -> [Vec3; 8] {
        let mut out = [Vec3::ZERO; 8];
        let mut index = 0;
        for &sx in &[-1.0f32, 1.0] {
            for &sy in &[-1.0f32, 1.0] {
                for &sz in &[-1.0f32, 1.0] {
                    out[index] = self.center
                        + self.axes[0] * (sx * self.half_extents.x)
                        + self.axes[1] * (sy * self.half_extents.y)
                        + self.axes[2] * (sz * self.half_extents.z);
                    index += 1;
                }
            }
        }
        out
    }

    /// The face most anti-parallel to `direction`, as four vertices.
    fn face_toward(&self, direction: Vec3) -> ([Vec3; 4], Vec3) {
        let mut best_axis = 0;
        let mut best_dot = self.axes[0].dot(direction);
        for axis in 1..3 {
            let dot = self.axes[axis].dot(direction);
            if dot.abs() > best_dot.abs() {
                best_dot = dot;
                best_axis = axis;
            }
        }
        let sign = 1.0f32.copysign(best_dot);
        let normal = self.axes[best_axis] * sign;
        let u = self.axes[(best_axis + 1) % 3];
        let v = self.axes[(best_axis + 2) % 3];
        let eu = self.half_extents[(best_axis + 1) % 3];
        let ev = self.half_extents[(best_axis + 2) % 3];
        let face_center = self.center + normal * self.half_extents[best_axis];
        (
            [
                face_center + u * eu + v * ev,
                face_center - u * eu + v * ev,
                face_center - u * eu - v * ev,
                face_center + u * eu - v * ev,
            ],
            normal,
        )
    }
}

fn clip_polygon_against_plane(polygon: &mut Vec<Vec3>, plane_normal: Vec3, plane_offset: f32) {
    let mut output = Vec::with_capacity(polygon.len() + 2);
    for i in 0..polygon.len() {
        let current = polygon[i];
        let next = polygon[(i + 1) % polygon.len()];
        let current_distance = plane_normal.dot(current) - plane_offset;
        let next_distance = plane_normal.dot(next) - plane_offset;
        if current_distance <= 0.0 {
            output.push(current);
        }
        if (current_distance < 0.0) != (next_distance < 0.0) {
            let t = current_distance / (current_distance - next_distance);
            output.push(current + (next - current) * t);
        }
    }
    *polygon = output;
}

fn box_box(c0: &Collider, he0: Vec3, c1: &Collider, he1: Vec3) -> Vec<ManifoldPoint> {
    let a = ObbAxes::new(c0, he0);
    let b = ObbAxes::new(c1, he1);
    let offset = b.center - a.center;

    // Face axes of both boxes plus edge-edge cross products.
    let mut axes = Vec::with_capacity(15);
    axes.extend_from_slice(&a.axes);
    axes.extend_from_slice(&b.axes);
    for &axis_a in &a.axes {
        for &axis_b in &b.axes {
            let cross = axis_a.cross(axis_b);
            if cross.length_squared() > 1e-6 {
                axes.push(cross.normalize());
            }
        }
    }

    let mut min_penetration = f32::MAX;
    let mut best_axis = Vec3::ZERO;
    let mut best_is_face = false;
    for (index, &axis) in axes.iter().enumerate() {
        let overlap = a.project(axis) + b.project(axis) - offset.dot(axis).abs();
        if overlap < 0.0 {
            return Vec::new();
        }
        // Small bias prefers face axes over edge axes for stability.
        let is_face = index < 6;
        let biased = if is_face { overlap } else { overlap + 1e-4 };
        if biased < min_penetration {
            min_penetration = biased;
            best_axis = axis;
            best_is_face = is_face;
        }
    }

    // Orient the separating axis from a to b.
    let normal = if offset.dot(best_axis) >= 0.0 {
        best_axis
    } else {
        -best_axis
    };
    let penetration = a.project(normal) + b.project(normal) - offset.dot(normal).abs();

    if !best_is_face {
        // Edge-edge: a single deepest point from the vertices of b inside a.
        let mut deepest: Option<ManifoldPoint> = None;
        for vertex in b.vertices() {
            let support_a = a.center
                + a.axes[0] * (a.half_extents.x * a.axes[0].dot(normal).signum())
                + a.axes[1] * (a.half_extents.y * a.axes[1].dot(normal).signum())
                + a.axes[2] * (a.half_extents.z * a.axes[2].dot(normal).signum());
            let depth = (support_a - vertex).dot(normal);
            if depth >= 0.0 && deepest.as_ref().is_none_or(|p| depth > p.penetration) {
                let mut point = ManifoldPoint::default();
                point.normal = normal;
                point.world_points[0] = vertex + normal * depth;
                point.world_points[1] = vertex;
                point.penetration = depth;
                deepest = Some(point);
            }
        }
        return deepest
            .map(|point| vec![point])
            .unwrap_or_else(|| single_sat_point(&a, normal, penetration));
    }

    // Reference face on a, incident face on b, clip b's face against a's
    // side planes and keep points below the reference face.
    let (reference_face, reference_normal) = a.face_toward(normal);
    let (incident_face, _) = b.face_toward(-normal);

    let mut polygon: Vec<Vec3> = incident_face.to_vec();
    for i in 0..4 {
        let edge_start = reference_face[i];
        let edge_end = reference_face[(i + 1) % 4];
        let edge = edge_end - edge_start;
        let side_normal = edge.cross(reference_normal).normalize_or_zero();
        // Side planes face outward from the reference face.
        let offset = side_normal.dot(edge_start);
        clip_polygon_against_plane(&mut polygon, side_normal, offset);
        if polygon.is_empty() {
            break;
        }
    }

    let face_offset = reference_normal.dot(reference_face[0]);
    let mut points = Vec::new();
    for vertex in polygon {
        let depth = face_offset - reference_normal.dot(vertex);
        if depth >= 0.0 {
            let mut point = ManifoldPoint::default();
            point.normal = normal;
            point.world_points[0] = vertex + reference_normal * depth;
            point.world_points[1] = vertex;
            point.penetration = depth;
            points.push(point);
        }
    }
    if points.is_empty() {
        return single_sat_point(&a, normal, penetration);
    }

    // Reduce to the deepest four.
    points.sort_by(|a, b| b.penetration.total_cmp(&a.penetration));
    points.truncate(4);
    points
}

fn single_sat_point(a: &ObbAxes, normal: Vec3, penetration: f32) -> Vec<ManifoldPoint> {
    let support = a.center
        + a.axes[0] * (a.half_extents.x * a.axes[0].dot(normal).signum())
        + a.axes[1] * (a.half_extents.y * a.axes[1].dot(normal).signum())
        + a.axes[2] * (a.half_extents.z * a.axes[2].dot(normal).signum());
    let mut point = ManifoldPoint::default();
    point.normal = normal;
    point.world_points[0] = support;
    point.world_points[1] = support - normal * penetration;
    point.penetration = penetration;
    vec![point]
}

//
// GJK / EPA for the remaining convex pairs
//

#[derive(Debug, Clone, Copy)]
struct SupportPoint {
    /// Minkowski difference point.
    w: Vec3,
    a: Vec3,
    b: Vec3,
}

fn world_support(collider: &Collider, world_direction: Vec3) -> Vec3 {
    let local = collider.world_rotation.transpose() * world_direction;
    collider.to_world(collider.shape.support(local))
}

fn minkowski_support(c0: &Collider, c1: &Collider, direction: Vec3) -> SupportPoint {
    let a = world_support(c0, direction);
    let b = world_support(c1, -direction);
    SupportPoint { w: a - b, a, b }
}

fn triple_cross(a: Vec3, b: Vec3, c: Vec3) -> Vec3 {
    a.cross(b).cross(c)
}

/// GJK boolean intersection; on hit returns a tetrahedral simplex enclosing
/// the origin for EPA.
fn gjk(c0: &Collider, c1: &Collider) -> Option<Vec<SupportPoint>> {
    let mut direction = c1.world_translation - c0.world_translation;
    if direction.length_squared() < 1e-8 {
        direction = Vec3::X;
    }
    let mut simplex = vec![minkowski_support(c0, c1, direction)];
    direction = -simplex[0].w;

    for _ in 0..GJK_MAX_ITERATIONS {
        if direction.length_squared() < 1e-10 {
            // Origin on the simplex boundary; treat as touching.
            break;
        }
        let new_point = minkowski_support(c0, c1, direction);
        if new_point.w.dot(direction) < 0.0 {
            return None;
        }
        simplex.push(new_point);
        if do_simplex(&mut simplex, &mut direction) {
            expand_to_tetrahedron(&mut simplex, c0, c1);
            return Some(simplex);
        }
    }
    expand_to_tetrahedron(&mut simplex, c0, c1);
    Some(simplex)
}

fn do_simplex(simplex: &mut Vec<SupportPoint>, direction: &mut Vec3) -> bool {
    match simplex.len() {
        2 => {
            let a = simplex[1].w;
            let b = simplex[0].w;
            let ab = b - a;
            let ao = -a;
            if ab.dot(ao) > 0.0 {
                *direction = triple_cross(ab, ao, ab);
            } else {
                simplex.remove(0);
                *direction = ao;
            }
            false
        }
        3 => {
            let a = simplex[2].w;
            let b = simplex[1].w;
            let c = simplex[0].w;
            let ab = b - a;
            let ac = c - a;
            let ao = -a;
            let abc = ab.cross(ac);

            if abc.cross(ac).dot(ao) > 0.0 {
                if ac.dot(ao) > 0.0 {
                    simplex.remove(1);
                    *direction = triple_cross(ac, ao, ac);
                } else {
                    simplex.remove(0);
                    return do_simplex(simplex, direction);
                }
            } else if ab.cross(abc).dot(ao) > 0.0 {
                simplex.remove(0);
                return do_simplex(simplex, direction);
            } else if abc.dot(ao) > 0.0 {
                *direction = abc;
            } else {
                simplex.swap(0, 1);
                *direction = -abc;
            }
            false
        }
        4 => {
            let a = simplex[3].w;
            let b = simplex[2].w;
            let c = simplex[1].w;
            let d = simplex[0].w;
            let ao = -a;
            let ab = b - a;
            let ac = c - a;
            let ad = d - a;

            let abc = ab.cross(ac);
            let acd = ac.cross(ad);
            let adb = ad.cross(ab);

            if abc.dot(ao) > 0.0 {
                simplex.remove(0);
                return do_simplex(simplex, direction);
            }
            if acd.dot(ao) > 0.0 {
                simplex.remove(2);
                return do_simplex(simplex, direction);
            }
            if adb.dot(ao) > 0.0 {
                simplex.remove(1);
                simplex.swap(0, 1);
                return do_simplex(simplex, direction);
            }
            true
        }
        _ => false,
    }
}

/// Pads a degenerate simplex up to a tetrahedron so EPA can start.
fn expand_to_tetrahedron(simplex: &mut Vec<SupportPoint>, c0: &Collider, c1: &Collider) {
    let directions = [
        Vec3::X,
        Vec3::Y,
        Vec3::Z,
        -Vec3::X,
        -Vec3::Y,
        -Vec3::Z,
    ];
    let mut cursor = 0;
    while simplex.len() < 4 && cursor < directions.len() {
        let candidate = minkowski_support(c0, c1, directions[cursor]);
        cursor += 1;
        if simplex
            .iter()
            .all(|point| (point.w - candidate.w).length_squared() > 1e-8)
        {
            simplex.push(candidate);
        }
    }
}

struct EpaFace {
    indices: [usize; 3],
    normal: Vec3,
    distance: f32,
}

fn make_face(vertices: &[SupportPoint], indices: [usize; 3]) -> EpaFace {
    let a = vertices[indices[0]].w;
    let b = vertices[indices[1]].w;
    let c = vertices[indices[2]].w;
    let mut normal = (b - a).cross(c - a).normalize_or_zero();
    let mut distance = normal.dot(a);
    if distance < 0.0 {
        normal = -normal;
        distance = -distance;
    }
    EpaFace {
        indices,
        normal,
        distance,
    }
}

/// Expanding polytope: penetration normal (0 toward 1), depth, and witness
/// points on each object.
fn epa(
    mut vertices: Vec<SupportPoint>,
    c0: &Collider,
    c1: &Collider,
) -> Option<(Vec3, f32, Vec3, Vec3)> {
    if vertices.len() < 4 {
        return None;
    }
    vertices.truncate(4);
    let mut faces = vec![
        make_face(&vertices, [0, 1, 2]),
        make_face(&vertices, [0, 1, 3]),
        make_face(&vertices, [0, 2, 3]),
        make_face(&vertices, [1, 2, 3]),
    ];

    for _ in 0..EPA_MAX_ITERATIONS {
        let (closest_index, _) = faces
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.distance.total_cmp(&b.1.distance))?;
        let closest_normal = faces[closest_index].normal;
        let closest_distance = faces[closest_index].distance;

        let support = minkowski_support(c0, c1, closest_normal);
        let growth = support.w.dot(closest_normal) - closest_distance;
        if growth < EPA_TOLERANCE {
            // Converged: project the origin onto the face for witnesses.
            let face = &faces[closest_index];
            let (a, b, c) = (
                vertices[face.indices[0]],
                vertices[face.indices[1]],
                vertices[face.indices[2]],
            );
            let projection = closest_normal * closest_distance;
            let (u, v, w) = barycentric(projection, a.w, b.w, c.w);
            let point_a = a.a * u + b.a * v + c.a * w;
            let point_b = a.b * u + b.b * v + c.b * w;
            return Some((closest_normal, closest_distance, point_a, point_b));
        }

        // Remove faces visible from the new point and stitch the horizon.
        let new_index = vertices.len();
        vertices.push(support);
        let mut horizon: Vec<(usize, usize)> = Vec::new();
        let mut kept = Vec::new();
        for face in faces.drain(..) {
            if face.normal.dot(support.w - vertices[face.indices[0]].w) > 0.0 {
                for edge in [
                    (face.indices[0], face.indices[1]),
                    (face.indices[1], face.indices[2]),
                    (face.indices[2], face.indices[0]),
                ] {
                    if let Some(position) =
                        horizon.iter().position(|&(a, b)| a == edge.1 && b == edge.0)
                    {
                        horizon.remove(position);
                    } else {
                        horizon.push(edge);
                    }
                }
            } else {
                kept.push(face);
            }
        }
        faces = kept;
        for (a, b) in horizon {
            faces.push(make_face(&vertices, [a, b, new_index]));
        }
        if faces.is_empty() {
            return None;
        }
    }
    None
}

fn barycentric(point: Vec3, a: Vec3, b: Vec3, c: Vec3) -> (f32, f32, f32) {
    let v0 = b - a;
    let v1 = c - a;
    let v2 = point - a;
    let d00 = v0.dot(v0);
    let d01 = v0.dot(v1);
    let d11 = v1.dot(v1);
    let d20 = v2.dot(v0);
    let d21 = v2.dot(v1);
    let denominator = d00 * d11 - d01 * d01;
    if denominator.abs() < 1e-10 {
        return (1.0, 0.0, 0.0);
    }
    let v = (d11 * d20 - d01 * d21) / denominator;
    let w = (d00 * d21 - d01 * d20) / denominator;
    (1.0 - v - w, v, w)
}

fn gjk_epa_contact(c0: &Collider, c1: &Collider) -> Option<ManifoldPoint> {
    let simplex = gjk(c0, c1)?;
    let (normal, depth, point_a, point_b) = epa(simplex, c0, c1)?;
    let mut point = ManifoldPoint::default();
    point.normal = normal;
    point.world_points[0] = point_a;
    point.world_points[1] = point_b;
    point.penetration = depth;
    Some(point)
}

//
// Mesh and height-map collision
//

/// Collides a convex collider (object 0) against a mesh-like collider
/// (object 1), correcting internal-edge normals per source triangle.
fn collide_with_mesh(
    convex: &mut Collider,
    mesh_collider: &mut Collider,
    allow_backfaces: bool,
) -> Vec<ManifoldPoint> {
    // Conservative query bounds in the mesh's local space.
    let local_aabb = world_aabb_in_local(convex, mesh_collider);
    let frame = ContactFrame {
        translation: mesh_collider.world_translation,
        rotation: mesh_collider.world_rotation,
    };

    let mut all_points: Vec<ManifoldPoint> = Vec::new();
    match &mesh_collider.shape {
        Shape::Mesh(mesh) => {
            let mesh = mesh.clone();
            collide_mesh_triangles(
                convex,
                mesh_collider,
                &mesh,
                &local_aabb,
                frame,
                allow_backfaces,
                &mut all_points,
            );
        }
        Shape::HeightMap(map) => {
            let map = map.clone();
            for key in map.keys_in_aabb(&local_aabb) {
                let Some(tri) = map.triangle(key) else {
                    continue;
                };
                let world_tri = Triangle::new(
                    frame.to_world(tri.p0),
                    frame.to_world(tri.p1),
                    frame.to_world(tri.p2),
                );
                let Some(mut point) = convex_triangle(convex, &world_tri) else {
                    continue;
                };
                point.body_points[1] = frame.to_local(point.world_points[1]);
                let mut points = [point];
                correct_heightmap_edge_normals(
                    &mut points,
                    &map,
                    &mut mesh_collider.edge_cache,
                    key,
                    1,
                    frame.rotation,
                    frame,
                    allow_backfaces,
                );
                all_points.push(points[0]);
            }
        }
        Shape::MultiConvexMesh(pieces) => {
            for piece in pieces.clone() {
                collide_mesh_triangles(
                    convex,
                    mesh_collider,
                    &piece,
                    &local_aabb,
                    frame,
                    allow_backfaces,
                    &mut all_points,
                );
            }
        }
        _ => {}
    }

    all_points.sort_by(|a, b| b.penetration.total_cmp(&a.penetration));
    all_points.truncate(4);
    all_points
}

#[allow(clippy::too_many_arguments)]
fn collide_mesh_triangles(
    convex: &Collider,
    mesh_collider: &Collider,
    mesh: &PhysicsMesh,
    local_aabb: &Aabb,
    frame: ContactFrame,
    allow_backfaces: bool,
    out: &mut Vec<ManifoldPoint>,
) {
    if !mesh.is_valid() {
        return;
    }
    for index in 0..mesh.triangle_count() {
        let tri = mesh.triangle(index);
        if !tri.aabb().overlaps(local_aabb) {
            continue;
        }
        let world_tri = Triangle::new(
            frame.to_world(tri.p0),
            frame.to_world(tri.p1),
            frame.to_world(tri.p2),
        );
        let Some(mut point) = convex_triangle(convex, &world_tri) else {
            continue;
        };
        point.body_points[1] = frame.to_local(point.world_points[1]);
        let info = mesh_collider
            .edge_cache
            .get(&(index as u32))
            .copied()
            .unwrap_or_default();
        let mut points = [point];
        correct_internal_edge_normals(
            &mut points,
            info,
            tri,
            1,
            frame.rotation,
            frame,
            allow_backfaces,
        );
        out.push(points[0]);
    }
}

fn world_aabb_in_local(convex: &Collider, mesh_collider: &Collider) -> Aabb {
    let aabb = convex.world_aabb;
    let corners = [
        Vec3::new(aabb.min.x, aabb.min.y, aabb.min.z),
        Vec3::new(aabb.max.x, aabb.min.y, aabb.min.z),
        Vec3::new(aabb.min.x, aabb.max.y, aabb.min.z),
        Vec3::new(aabb.min.x, aabb.min.y, aabb.max.z),
        Vec3::new(aabb.max.x, aabb.max.y, aabb.min.z),
        Vec3::new(aabb.max.x, aabb.min.y, aabb.max.z),
        Vec3::new(aabb.min.x, aabb.max.y, aabb.max.z),
        Vec3::new(aabb.max.x, aabb.max.y, aabb.max.z),
    ];
    Aabb::from_points(corners.map(|corner| mesh_collider.to_local(corner)))
        .expanded(super::manifold::CONTACT_BREAKING_THRESHOLD)
}

/// Convex-vs-triangle contact: exact for spheres and capsules, support-based
/// for everything else. The triangle is object 1.
fn convex_triangle(convex: &Collider, world_tri: &Triangle) -> Option<ManifoldPoint> {
    match &convex.shape {
        Shape::Sphere { radius } => {
            sphere_triangle(convex.world_translation, *radius, world_tri)
        }
        Shape::Capsule {
            radius,
            half_height,
        } => {
            let (start, end) = capsule_segment(convex, *half_height);
            // Test both cap centers and the segment point nearest the
            // triangle plane; keep the deepest hit.
            let mid = closest_point_on_segment(
                start,
                end,
                closest_point_on_triangle(world_tri, convex.world_translation),
            );
            [start, end, mid]
                .into_iter()
                .filter_map(|center| sphere_triangle(center, *radius, world_tri))
                .max_by(|a, b| a.penetration.total_cmp(&b.penetration))
        }
        _ => {
            let normal = world_tri.normal();
            // Deepest support point of the convex against the triangle plane.
            let local_dir = convex.world_rotation.transpose() * -normal;
            let deepest = convex.to_world(convex.shape.support(local_dir));
            let depth = (world_tri.p0 - deepest).dot(normal);
            if depth < 0.0 {
                return None;
            }
            let on_plane = deepest + normal * depth;
            let closest = closest_point_on_triangle(world_tri, on_plane);
            let threshold = super::manifold::CONTACT_BREAKING_THRESHOLD;
            if (closest - on_plane).length_squared() > threshold * threshold {
                return None;
            }
            let mut point = ManifoldPoint::default();
            point.normal = -normal;
            point.world_points[0] = deepest;
            point.world_points[1] = closest;
            point.penetration = depth;
            Some(point)
        }
    }
}

fn sphere_triangle(center: Vec3, radius: f32, tri: &Triangle) -> Option<ManifoldPoint> {
    let closest = closest_point_on_triangle(tri, center);
    let offset = center - closest;
    let distance = offset.length();
    if distance > radius {
        return None;
    }
    let to_sphere = if distance > 1e-6 {
        offset / distance
    } else {
        tri.normal()
    };
    let mut point = ManifoldPoint::default();
    // Normal points from the sphere (object 0) to the triangle (object 1).
    point.normal = -to_sphere;
    point.world_points[0] = center - to_sphere * radius;
    point.world_points[1] = closest;
    point.penetration = radius - distance;
    Some(point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Mat3;
    use std::sync::Arc;

    fn collider_at(shape: Shape, translation: Vec3) -> Collider {
        let mut collider = Collider::new(shape, 0);
        collider.update_world_bounds(translation, Mat3::IDENTITY);
        collider
    }

    #[test]
    fn overlapping_spheres_contact() {
        let mut a = collider_at(Shape::Sphere { radius: 1.0 }, Vec3::ZERO);
        let mut b = collider_at(Shape::Sphere { radius: 1.0 }, Vec3::new(1.5, 0.0, 0.0));
        let points = collide(&mut a, &mut b, false);
        assert_eq!(points.len(), 1);
        let point = &points[0];
        assert!((point.normal - Vec3::X).length() < 1e-5);
        assert!((point.penetration - 0.5).abs() < 1e-5);
        assert!((point.world_points[0] - Vec3::X).length() < 1e-5);
    }

    #[test]
    fn separated_spheres_do_not_contact() {
        let mut a = collider_at(Shape::Sphere { radius: 1.0 }, Vec3::ZERO);
        let mut b = collider_at(Shape::Sphere { radius: 1.0 }, Vec3::new(3.0, 0.0, 0.0));
        assert!(collide(&mut a, &mut b, false).is_empty());
    }

    #[test]
    fn sphere_on_box_face() {
        let mut sphere = collider_at(Shape::Sphere { radius: 0.5 }, Vec3::new(0.0, 1.25, 0.0));
        let mut ground = collider_at(
            Shape::Box {
                half_extents: Vec3::new(5.0, 1.0, 5.0),
            },
            Vec3::ZERO,
        );
        let points = collide(&mut sphere, &mut ground, false);
        assert_eq!(points.len(), 1);
        // Normal points from the sphere down into the box.
        assert!(points[0].normal.y < -0.99);
        assert!((points[0].penetration - 0.25).abs() < 1e-5);
    }

    #[test]
    fn stacked_boxes_make_a_four_point_manifold() {
        let mut top = collider_at(
            Shape::Box {
                half_extents: Vec3::splat(0.5),
            },
            Vec3::new(0.0, 0.9, 0.0),
        );
        let mut bottom = collider_at(
            Shape::Box {
                half_extents: Vec3::splat(0.5),
            },
            Vec3::ZERO,
        );
        let points = collide(&mut top, &mut bottom, false);
        assert_eq!(points.len(), 4);
        for point in &points {
            assert!(point.normal.y < -0.99);
            assert!((point.penetration - 0.1).abs() < 1e-4);
        }
    }

    #[test]
    fn gjk_detects_cylinder_overlap() {
        let mut a = collider_at(
            Shape::Cylinder {
                radius: 1.0,
                half_height: 1.0,
            },
            Vec3::ZERO,
        );
        let mut b = collider_at(
            Shape::Cylinder {
                radius: 1.0,
                half_height: 1.0,
            },
            Vec3::new(1.5, 0.0, 0.0),
        );
        let points = collide(&mut a, &mut b, false);
        assert_eq!(points.len(), 1);
        assert!(points[0].penetration > 0.3);
        assert!(points[0].normal.x > 0.9);

        let mut far = collider_at(
            Shape::Cylinder {
                radius: 1.0,
                half_height: 1.0,
            },
            Vec3::new(5.0, 0.0, 0.0),
        );
        assert!(collide(&mut a, &mut far, false).is_empty());
    }

    #[test]
    fn sphere_across_coplanar_triangles_gets_face_normal() {
        // Two coplanar triangles forming a quad in the xz plane.
        let mesh = PhysicsMesh::new(
            vec![
                Vec3::new(-1.0, 0.0, -1.0),
                Vec3::new(1.0, 0.0, -1.0),
                Vec3::new(1.0, 0.0, 1.0),
                Vec3::new(-1.0, 0.0, 1.0),
            ],
            vec![[0, 2, 1], [0, 3, 2]],
        );
        let info = super::super::edges::generate_mesh_edge_info(&mesh);
        let mut mesh_collider = collider_at(Shape::Mesh(Arc::new(mesh)), Vec3::ZERO);
        mesh_collider.edge_cache = info;

        // Sphere resting right on the shared edge (the z axis through x=0).
        let mut sphere = collider_at(Shape::Sphere { radius: 0.5 }, Vec3::new(0.0, 0.45, 0.0));
        let points = collide(&mut sphere, &mut mesh_collider, false);
        assert!(!points.is_empty());
        for point in &points {
            // Face normal (downward from sphere to mesh), not edge direction.
            assert!(point.normal.y < -0.99, "normal {:?}", point.normal);
        }
    }
}
