use std::collections::HashMap;

use glam::{Mat3, Vec3};

use super::manifold::{ContactFrame, ManifoldPoint};
use super::shape::{HeightMapShape, PhysicsMesh, Triangle, closest_point_on_segment};

/// Height-map adjacency is cached per touched triangle; past this many
/// entries the cache is cleared outright and repopulates as triangles are
/// revisited. Bounds memory when contacts roam a large map.
pub const HEIGHT_MAP_ADJACENCY_CACHE_LIMIT: usize = 100_000;

const EQUAL_VERTEX_THRESHOLD: f32 = 0.001;
const PLANAR_EPSILON: f32 = 0.01;
const EDGE_DISTANCE_THRESHOLD: f32 = 0.001;
const CONVEX_EPSILON: f32 = 0.001;
const DIRECTION_EPSILON: f32 = 0.05;

/// Voronoi region info for one triangle's three edges, in the fixed order
/// v0v1, v2v0, v1v2.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriangleInfo {
    pub edge_angles: [f32; 3],
    pub edge_convex: [bool; 3],
}

pub type TriangleInfoMap = HashMap<u32, TriangleInfo>;

/// Angle of `test_axis` projected onto the basis (x_basis, y_basis).
fn basis_angle(y_basis: Vec3, x_basis: Vec3, test_axis: Vec3) -> f32 {
    test_axis.dot(y_basis).atan2(test_axis.dot(x_basis))
}

/// Computes the Voronoi region of the edge shared between `tri_a` and
/// `tri_b` (if any) and records it on triangle A's info entry.
pub fn compute_edge_info(tri_a: &Triangle, index_a: u32, tri_b: &Triangle, map: &mut TriangleInfoMap) {
    let normal_a = tri_a.raw_normal();
    if normal_a.length_squared() < EQUAL_VERTEX_THRESHOLD {
        return;
    }
    let normal_b = tri_b.raw_normal();
    if normal_b.length_squared() < EQUAL_VERTEX_THRESHOLD {
        return;
    }
    let normal_a = normal_a.normalize();
    let normal_b = normal_b.normalize();

    // Find the shared edge by pairing nearly-equal vertices.
    let mut shared = 0usize;
    let mut shared_a = [usize::MAX; 3];
    let mut shared_b = [usize::MAX; 3];
    for ia in 0..3 {
        for ib in 0..3 {
            let difference = tri_a.point(ia) - tri_b.point(ib);
            if difference.length_squared() > EQUAL_VERTEX_THRESHOLD {
                continue;
            }
            if shared == 1 && (shared_a[0] == ia || shared_b[0] == ib) {
                continue;
            }
            if shared < 3 {
                shared_a[shared] = ia;
                shared_b[shared] = ib;
                shared += 1;
            }
        }
    }
    if shared != 2 {
        return;
    }

    // Keep counter-clockwise winding when the shared edge is v0v2.
    if shared_a[0] == 0 && shared_a[1] == 2 {
        shared_a.swap(0, 1);
        shared_b.swap(0, 1);
    }

    let vertices_sum_a = shared_a[0] + shared_a[1];
    let other_a = 3 - vertices_sum_a;
    let other_b = 3 - (shared_b[0] + shared_b[1]);
    let edge = tri_a.point(shared_a[1]) - tri_a.point(shared_a[0]);

    // Outward vectors on each surface, perpendicular to normal and edge.
    let mut edge_cross_a = normal_a.cross(edge).normalize_or_zero();
    let from_edge_to_other_a = tri_a.point(other_a) - tri_a.point(shared_a[0]);
    if from_edge_to_other_a.dot(edge_cross_a) < 0.0 {
        edge_cross_a = -edge_cross_a;
    }
    let mut edge_cross_b = normal_b.cross(edge).normalize_or_zero();
    let from_edge_to_other_b = tri_b.point(other_b) - tri_b.point(shared_b[0]);
    if from_edge_to_other_b.dot(edge_cross_b) < 0.0 {
        edge_cross_b = -edge_cross_b;
    }

    // ||cross|| = sin(theta); near zero the triangles are planar.
    let calculated_edge = edge_cross_a.cross(edge_cross_b);
    let length = calculated_edge.length();

    let mut voronoi_angle = 0.0;
    let mut is_convex = false;
    if length >= PLANAR_EPSILON {
        let calculated_edge = calculated_edge / length;
        let computed_normal_a = calculated_edge.cross(edge_cross_a).normalize_or_zero();
        let obtuse_angle = basis_angle(computed_normal_a, edge_cross_a, edge_cross_b);
        // The measured angle rotates A onto B; the Voronoi bound is the
        // remaining angle.
        voronoi_angle = std::f32::consts::PI - obtuse_angle;

        is_convex = normal_a.dot(edge_cross_b) < 0.0;
        if is_convex {
            voronoi_angle = -voronoi_angle;
        }
    }

    // Edge slot order: v0v1 (sum 1), v2v0 (sum 2), v1v2 (sum 3).
    let slot = vertices_sum_a - 1;
    let info = map.entry(index_a).or_default();
    info.edge_angles[slot] = voronoi_angle;
    info.edge_convex[slot] = is_convex;
}

/// Builds the full edge-info map for a mesh by testing every triangle pair.
pub fn generate_mesh_edge_info(mesh: &PhysicsMesh) -> TriangleInfoMap {
    let mut map = TriangleInfoMap::new();
    let count = mesh.triangle_count();
    for index_a in 0..count {
        let tri_a = mesh.triangle(index_a);
        for index_b in 0..count {
            if index_a == index_b {
                continue;
            }
            let tri_b = mesh.triangle(index_b);
            compute_edge_info(&tri_a, index_a as u32, &tri_b, &mut map);
        }
    }
    map
}

/// Builds adjacency for one height-map triangle on demand by testing its
/// three grid neighbors.
pub fn generate_heightmap_edge_info(map: &HeightMapShape, key: u32, cache: &mut TriangleInfoMap) {
    let Some(main) = map.triangle(key) else {
        return;
    };
    let (x, z, upper) = HeightMapShape::decode_key(key);

    let neighbors = if upper {
        [
            // Top edge, diagonal, right edge.
            (x as isize, z as isize + 1, false),
            (x as isize, z as isize, false),
            (x as isize + 1, z as isize, false),
        ]
    } else {
        [
            // Diagonal, left neighbor's upper, below neighbor's upper.
            (x as isize, z as isize, true),
            (x as isize - 1, z as isize, true),
            (x as isize, z as isize - 1, true),
        ]
    };

    for (nx, nz, nupper) in neighbors {
        if nx < 0 || nz < 0 {
            continue;
        }
        let neighbor_key = HeightMapShape::triangle_key(nx as usize, nz as usize, nupper);
        if neighbor_key == key {
            continue;
        }
        if let Some(neighbor) = map.triangle(neighbor_key) {
            compute_edge_info(&main, key, &neighbor, cache);
        }
    }
    // Ensure an entry exists even for boundary triangles with no neighbors.
    cache.entry(key).or_default();
}

struct CorrectionState {
    tri: Triangle,
    tri_normal: Vec3,
    info: TriangleInfo,
    /// Which side of the pair the mesh collider occupies.
    object_index: usize,
    rotation: Mat3,
    frame: ContactFrame,
    local_contact_normal: Vec3,
    best_edge: Option<usize>,
    closest_distance: f32,
    edge: Vec3,
    voronoi_angle: f32,
    convex: bool,
}

fn test_edge_closeness(
    contact_point: Vec3,
    point1: Vec3,
    point2: Vec3,
    angle: f32,
    edge_index: usize,
    state: &mut CorrectionState,
) {
    // Excessively sharp edges are left alone.
    if angle >= std::f32::consts::TAU {
        return;
    }

    let nearest = closest_point_on_segment(point1, point2, contact_point);
    let length = (nearest - contact_point).length();

    // When two edges are equally close (a corner), prefer the edge most
    // perpendicular to the contact normal; rotating the triangle normal
    // about it is closest to a pure rotation.
    let difference = (length - state.closest_distance).abs();
    if difference < 1e-4 {
        let current_edge = (point2 - point1).normalize_or_zero();
        let old_test = state.local_contact_normal.dot(state.edge);
        let new_test = state.local_contact_normal.dot(current_edge);
        if new_test.abs() < old_test.abs() {
            state.closest_distance = length;
            state.best_edge = Some(edge_index);
            state.edge = current_edge;
        }
        return;
    }

    if length < state.closest_distance {
        state.closest_distance = length;
        state.best_edge = Some(edge_index);
        state.edge = (point2 - point1).normalize_or_zero();
    }
}

/// Clamps the local normal back inside the Voronoi region on the one side
/// that produces collision artifacts. Returns the clamped normal when
/// clamping applied.
fn clamp_normal(
    edge: Vec3,
    tri_normal: Vec3,
    local_contact_normal: Vec3,
    voronoi_angle: f32,
) -> Option<Vec3> {
    let edge_cross = edge.cross(tri_normal);
    let angle = basis_angle(edge_cross, tri_normal, local_contact_normal);

    if (voronoi_angle < 0.0 && angle < voronoi_angle)
        || (voronoi_angle >= 0.0 && angle > voronoi_angle)
    {
        let correction = Mat3::from_axis_angle(edge, voronoi_angle - angle);
        return Some(correction * local_contact_normal);
    }
    None
}

/// After changing a normal, moves the mesh-side point so it lies along the
/// new normal from the other object's point; otherwise the persistent
/// manifold would measure phantom shear drift.
fn fix_other_point(point: &mut ManifoldPoint, state: &CorrectionState) {
    let index_a = state.object_index;
    let index_b = 1 - index_a;
    let mut normal = point.normal;
    if index_a == 1 {
        normal = -normal;
    }
    let world_point = point.world_points[index_b] + normal * point.penetration;
    point.world_points[index_a] = world_point;
    point.body_points[index_a] = state.frame.to_local(world_point);
}

fn correct_concave_normal(point: &mut ManifoldPoint, state: &CorrectionState) {
    // Concave: the triangle normal bounds the region; just make sure it
    // faces with the contact normal.
    let mut tri_normal = state.tri_normal;
    if tri_normal.dot(state.local_contact_normal) < -DIRECTION_EPSILON {
        tri_normal = -tri_normal;
    }
    point.normal = (state.rotation * tri_normal).normalize_or_zero();
    if state.object_index == 1 {
        point.normal = -point.normal;
    }
    fix_other_point(point, state);
}

fn evaluate_best_edge(
    point: &mut ManifoldPoint,
    state: &mut CorrectionState,
    allow_backfaces: bool,
) -> bool {
    // Not near any edge: interior contact. Unless backfaces are allowed,
    // flip normals that ended up behind the triangle.
    if state.closest_distance >= EDGE_DISTANCE_THRESHOLD {
        if !allow_backfaces
            && state.tri_normal.dot(state.local_contact_normal) < -DIRECTION_EPSILON
        {
            point.normal = -point.normal;
        }
        return false;
    }

    let edge = state.edge.normalize_or_zero();

    // Planar edge: use the triangle normal outright.
    if state.voronoi_angle == 0.0 {
        if allow_backfaces {
            correct_concave_normal(point, state);
        } else {
            point.normal = (state.rotation * state.tri_normal).normalize_or_zero();
            if state.object_index == 1 {
                point.normal = -point.normal;
            }
            fix_other_point(point, state);
        }
        return true;
    }

    let is_convex = state.convex;
    let voronoi_angle = state.voronoi_angle;
    let swap_factor = if is_convex { 1.0 } else { -1.0 };

    let normal_a = state.tri_normal;
    let rotation_to_b = Mat3::from_axis_angle(edge, voronoi_angle);
    let normal_b = rotation_to_b * normal_a;

    let dot_a = state.local_contact_normal.dot(normal_a);

    // Back-facing contact normal: snap to the nearest front-face normal.
    if dot_a < CONVEX_EPSILON {
        if allow_backfaces {
            correct_concave_normal(point, state);
        } else {
            let chosen = if is_convex { normal_b } else { normal_a };
            point.normal = (state.rotation * chosen).normalize_or_zero();
            if state.object_index == 1 {
                point.normal = -point.normal;
            }
            fix_other_point(point, state);
        }
        return true;
    }

    // Forward facing over a concave edge: triangle normal wins.
    if !is_convex {
        correct_concave_normal(point, state);
        return true;
    }

    // Convex edge: clamp into the Voronoi region if outside it.
    if let Some(clamped) = clamp_normal(
        edge,
        normal_a * swap_factor,
        state.local_contact_normal,
        voronoi_angle,
    ) {
        point.normal = (state.rotation * clamped).normalize_or_zero();
        if state.object_index == 1 {
            point.normal = -point.normal;
        }
        fix_other_point(point, state);
    }
    true
}

fn correct_point(
    point: &mut ManifoldPoint,
    state: &mut CorrectionState,
    allow_backfaces: bool,
) -> bool {
    // Work in the mesh's local space where the Voronoi info was computed.
    // The pair normal points from object 0 to 1; flip when the mesh is 1.
    let mut pair_normal = point.normal;
    if state.object_index == 1 {
        pair_normal = -pair_normal;
    }
    state.local_contact_normal = (state.rotation.transpose() * pair_normal).normalize_or_zero();

    state.best_edge = None;
    state.closest_distance = f32::MAX;
    state.edge = Vec3::ZERO;

    let body_point = point.body_points[state.object_index];
    let tri = state.tri;
    let info = state.info;
    test_edge_closeness(body_point, tri.p0, tri.p1, info.edge_angles[0], 0, state);
    test_edge_closeness(body_point, tri.p2, tri.p0, info.edge_angles[1], 1, state);
    test_edge_closeness(body_point, tri.p1, tri.p2, info.edge_angles[2], 2, state);

    let Some(best) = state.best_edge else {
        return false;
    };
    state.voronoi_angle = info.edge_angles[best];
    state.convex = info.edge_convex[best];
    state.edge = match best {
        0 => tri.p0 - tri.p1,
        1 => tri.p2 - tri.p0,
        _ => tri.p1 - tri.p2,
    };
    evaluate_best_edge(point, state, allow_backfaces)
}

/// Corrects a set of freshly generated contact points against the triangle
/// they came from. Points not on an edge inherit the normal of the nearest
/// edge-corrected point so the manifold stays coherent.
#[allow(clippy::too_many_arguments)]
pub fn correct_internal_edge_normals(
    points: &mut [ManifoldPoint],
    info: TriangleInfo,
    tri: Triangle,
    object_index: usize,
    rotation: Mat3,
    frame: ContactFrame,
    allow_backfaces: bool,
) {
    let mut state = CorrectionState {
        tri_normal: tri.normal(),
        tri,
        info,
        object_index,
        rotation,
        frame,
        local_contact_normal: Vec3::ZERO,
        best_edge: None,
        closest_distance: f32::MAX,
        edge: Vec3::ZERO,
        voronoi_angle: 0.0,
        convex: false,
    };

    let mut edge_corrected = [false; 8];
    for (index, point) in points.iter_mut().enumerate() {
        let corrected = correct_point(point, &mut state, allow_backfaces);
        if index < edge_corrected.len() {
            edge_corrected[index] = corrected;
        }
    }

    // Second pass: align interior points with their nearest corrected
    // neighbor so one contact set never mixes edge and face normals.
    for i in 0..points.len().min(edge_corrected.len()) {
        if edge_corrected[i] {
            continue;
        }
        let mut closest: Option<usize> = None;
        let mut closest_distance = f32::MAX;
        for j in 0..points.len().min(edge_corrected.len()) {
            if i == j || !edge_corrected[j] {
                continue;
            }
            let distance = (points[i].world_points[object_index]
                - points[j].world_points[object_index])
                .length();
            if distance < closest_distance {
                closest_distance = distance;
                closest = Some(j);
            }
        }
        if let Some(j) = closest {
            points[i].normal = points[j].normal;
            fix_other_point(&mut points[i], &state);
        }
    }
}

/// Height-map variant: builds adjacency lazily in the collider's cache and
/// projects body points onto the triangle before correction.
#[allow(clippy::too_many_arguments)]
pub fn correct_heightmap_edge_normals(
    points: &mut [ManifoldPoint],
    map: &HeightMapShape,
    cache: &mut TriangleInfoMap,
    key: u32,
    object_index: usize,
    rotation: Mat3,
    frame: ContactFrame,
    allow_backfaces: bool,
) {
    if cache.len() > HEIGHT_MAP_ADJACENCY_CACHE_LIMIT {
        cache.clear();
    }
    if !cache.contains_key(&key) {
        generate_heightmap_edge_info(map, key, cache);
    }
    let Some(info) = cache.get(&key).copied() else {
        return;
    };
    let Some(tri) = map.triangle(key) else {
        return;
    };
    let tri_normal = tri.normal();

    for point in points.iter_mut() {
        // Project the body point along the map's up axis onto the triangle
        // plane so correction can identify the swept edge.
        let n = tri_normal;
        let q = tri.p0;
        let p = point.body_points[object_index];
        let d = Vec3::Y;
        let denominator = d.dot(n);
        if denominator.abs() > f32::EPSILON {
            let t = (q - p).dot(n) / denominator;
            let projected = p + d * t;
            point.body_points[object_index] = projected;
            point.world_points[object_index] = frame.to_world(projected);
        }
    }

    correct_internal_edge_normals(
        points,
        info,
        tri,
        object_index,
        rotation,
        frame,
        allow_backfaces,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_pair() -> (Triangle, Triangle) {
        // Two coplanar triangles sharing the edge (0,0,0)-(1,0,0).
        let a = Triangle::new(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 0.0),
        );
        let b = Triangle::new(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.5, 0.0, -1.0),
        );
        (a, b)
    }

    #[test]
    fn coplanar_edge_has_zero_voronoi_angle() {
        let (a, b) = flat_pair();
        let mut map = TriangleInfoMap::new();
        compute_edge_info(&a, 0, &b, &mut map);
        let info = map.get(&0).unwrap();
        // Shared edge v2v0 (vertices 0 and 2 of A).
        assert!(info.edge_angles[1].abs() < 1e-3);
    }

    #[test]
    fn convex_edge_measures_dihedral() {
        // B folds down 90 degrees about the shared x-axis edge.
        let a = Triangle::new(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 0.0),
        );
        let b = Triangle::new(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.5, -1.0, 0.0),
        );
        let mut map = TriangleInfoMap::new();
        compute_edge_info(&a, 0, &b, &mut map);
        let info = map.get(&0).unwrap();
        assert!(info.edge_convex[1]);
        assert!((info.edge_angles[1].abs() - std::f32::consts::FRAC_PI_2).abs() < 0.05);
    }

    #[test]
    fn flat_edge_contact_normal_becomes_face_normal() {
        let (a, b) = flat_pair();
        let mut map = TriangleInfoMap::new();
        compute_edge_info(&a, 0, &b, &mut map);
        let info = *map.get(&0).unwrap();

        // A contact right on the shared edge with a skewed normal.
        let skewed = Vec3::new(0.8, 0.6, 0.0).normalize();
        let mut points = [ManifoldPoint {
            world_points: [Vec3::new(0.5, 0.0, 0.0); 2],
            body_points: [Vec3::new(0.5, 0.0, 0.0); 2],
            normal: skewed,
            penetration: 0.0,
            accumulated_impulse: Vec3::ZERO,
        }];
        let frame = ContactFrame {
            translation: Vec3::ZERO,
            rotation: Mat3::IDENTITY,
        };
        correct_internal_edge_normals(
            &mut points,
            info,
            a,
            0,
            Mat3::IDENTITY,
            frame,
            false,
        );
        // The corrected normal is the face normal, not the edge direction.
        assert!(points[0].normal.y > 0.99, "normal was {:?}", points[0].normal);
    }

    #[test]
    fn convex_edge_clamps_into_voronoi_region() {
        let a = Triangle::new(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 0.0),
        );
        let b = Triangle::new(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.5, -1.0, 0.0),
        );
        let mut map = TriangleInfoMap::new();
        compute_edge_info(&a, 0, &b, &mut map);
        let info = *map.get(&0).unwrap();
        let dihedral = info.edge_angles[1].abs();

        // A normal tilted far outside the region toward -z.
        let tilted = Vec3::new(0.0, 0.2, -0.98).normalize();
        let mut points = [ManifoldPoint {
            world_points: [Vec3::new(0.5, 0.0, 0.0); 2],
            body_points: [Vec3::new(0.5, 0.0, 0.0); 2],
            normal: tilted,
            penetration: 0.0,
            accumulated_impulse: Vec3::ZERO,
        }];
        let frame = ContactFrame {
            translation: Vec3::ZERO,
            rotation: Mat3::IDENTITY,
        };
        correct_internal_edge_normals(&mut points, info, a, 0, Mat3::IDENTITY, frame, false);

        // The corrected normal sits within the dihedral of the face normal.
        let angle_from_face = points[0].normal.dot(Vec3::Y).clamp(-1.0, 1.0).acos();
        assert!(
            angle_from_face <= dihedral + 0.05,
            "{angle_from_face} vs {dihedral}"
        );
    }

    #[test]
    fn heightmap_cache_clears_past_limit() {
        let map = HeightMapShape::new(vec![0.0; 9], 3, 3, 1.0);
        let mut cache = TriangleInfoMap::new();
        for fake_key in 0..=HEIGHT_MAP_ADJACENCY_CACHE_LIMIT as u32 {
            cache.insert(fake_key + 1000, TriangleInfo::default());
        }
        let mut points = [ManifoldPoint::default()];
        let frame = ContactFrame {
            translation: Vec3::ZERO,
            rotation: Mat3::IDENTITY,
        };
        correct_heightmap_edge_normals(
            &mut points,
            &map,
            &mut cache,
            HeightMapShape::triangle_key(0, 0, false),
            0,
            Mat3::IDENTITY,
            frame,
            false,
        );
        assert!(cache.len() <= 2);
    }
}
