use glam::Vec3;

use super::{NodeIndex, SpringSystemIndex};

/// A particle in a spring system. Anchored points carry zero inverse mass
/// and track an external transform.
#[derive(Debug, Clone)]
pub struct PointMass {
    pub position: Vec3,
    pub old_position: Vec3,
    pub velocity: Vec3,
    pub force: Vec3,
    pub inv_mass: f32,
    pub anchor: Option<Anchor>,
}

/// Pins a point mass to a physics node at a local offset.
#[derive(Debug, Clone, Copy)]
pub struct Anchor {
    pub node: NodeIndex,
    pub local_point: Vec3,
}

#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub index0: usize,
    pub index1: usize,
    pub rest_length: f32,
    /// BFS distances from the nearest anchor, filled by edge sorting.
    pub anchor_distance0: u32,
    pub anchor_distance1: u32,
}

impl Edge {
    fn anchor_distance(&self) -> u32 {
        self.anchor_distance0.min(self.anchor_distance1)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Face {
    pub index0: usize,
    pub index1: usize,
    pub index2: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpringSortOrder {
    #[default]
    None,
    /// Edges closest to an anchor solve first.
    TopDown,
    /// Farthest first.
    BottomUp,
}

/// An edge set connecting two spring systems. Owned by one side; solved only
/// by the owner so shared edges are never relaxed twice.
#[derive(Debug, Clone)]
pub struct SystemConnection {
    pub owner: SpringSystemIndex,
    pub other: SpringSystemIndex,
    /// index0 addresses the owner's points, index1 the other system's.
    pub edges: Vec<Edge>,
}

/// Point masses, edges, and faces relaxed with Jakobsen iterations.
#[derive(Debug, Default)]
pub struct SpringSystem {
    pub point_masses: Vec<PointMass>,
    pub edges: Vec<Edge>,
    pub faces: Vec<Face>,
    /// Global stiffness of the relaxation step.
    pub correction_percent: f32,
    /// Inverse mass given to unanchored points.
    pub point_inv_mass: f32,
    pub sort_order: SpringSortOrder,
    pub owned_connections: Vec<u32>,
    pub connected_connections: Vec<u32>,
}

impl SpringSystem {
    pub fn new() -> Self {
        Self {
            point_masses: Vec::new(),
            edges: Vec::new(),
            faces: Vec::new(),
            correction_percent: 1.0,
            point_inv_mass: 1.0,
            sort_order: SpringSortOrder::None,
            owned_connections: Vec::new(),
            connected_connections: Vec::new(),
        }
    }

    pub fn add_point_mass(&mut self, position: Vec3) -> usize {
        self.point_masses.push(PointMass {
            position,
            old_position: position,
            velocity: Vec3::ZERO,
            force: Vec3::ZERO,
            inv_mass: self.point_inv_mass,
            anchor: None,
        });
        self.point_masses.len() - 1
    }

    /// Adds an edge at the current rest distance, shortened by
    /// `error_correction` to counter per-link stretch in chains.
    pub fn add_edge(&mut self, index0: usize, index1: usize, error_correction: f32) {
        let rest = (self.point_masses[index1].position - self.point_masses[index0].position)
            .length();
        self.edges.push(Edge {
            index0,
            index1,
            rest_length: (rest - error_correction).max(0.0),
            anchor_distance0: u32::MAX,
            anchor_distance1: u32::MAX,
        });
    }

    pub fn add_face(&mut self, index0: usize, index1: usize, index2: usize) {
        self.faces.push(Face {
            index0,
            index1,
            index2,
        });
    }

    pub fn point_masses_mut(&mut self) -> &mut [PointMass] {
        &mut self.point_masses
    }

    /// Anchors a point to a node, or clears the anchor when `anchor` is None.
    pub fn set_anchor(&mut self, index: usize, anchor: Option<Anchor>) {
        let Some(point) = self.point_masses.get_mut(index) else {
            return;
        };
        match anchor {
            Some(anchor) => {
                point.inv_mass = 0.0;
                point.anchor = Some(anchor);
            }
            None => {
                point.inv_mass = self.point_inv_mass;
                point.anchor = None;
            }
        }
    }

    /// Re-pins anchored points to their node transforms. Anchors whose node
    /// no longer resolves release the point back to its mass.
    pub fn update_anchors(&mut self, resolve: impl Fn(NodeIndex) -> Option<(Vec3, glam::Mat3)>) {
        let point_inv_mass = self.point_inv_mass;
        for point in &mut self.point_masses {
            let Some(anchor) = point.anchor else {
                continue;
            };
            match resolve(anchor.node) {
                Some((translation, rotation)) => {
                    point.inv_mass = 0.0;
                    point.position = rotation * anchor.local_point + translation;
                }
                None => {
                    point.inv_mass = point_inv_mass;
                    point.anchor = None;
                }
            }
        }
    }

    /// Applies a per-face force (wind) computed from the face's corners.
    pub fn apply_face_force(&mut self, force_for_face: impl Fn(Vec3, Vec3, Vec3) -> Vec3) {
        for face_index in 0..self.faces.len() {
            let face = self.faces[face_index];
            let p0 = self.point_masses[face.index0].position;
            let p1 = self.point_masses[face.index1].position;
            let p2 = self.point_masses[face.index2].position;
            let force = force_for_face(p0, p1, p2);
            self.point_masses[face.index0].force += force;
            self.point_masses[face.index1].force += force;
            self.point_masses[face.index2].force += force;
        }
    }

    pub fn integrate_velocity(&mut self, dt: f32) {
        for point in &mut self.point_masses {
            point.velocity += point.force * (point.inv_mass * dt);
            point.force = Vec3::ZERO;
        }
    }

    pub fn integrate_position(&mut self, dt: f32) {
        for point in &mut self.point_masses {
            point.position += point.velocity * dt;
        }
    }

    /// One relaxation pass over internal edges.
    pub fn relax(&mut self) {
        let correction = self.correction_percent;
        for edge_index in 0..self.edges.len() {
            let edge = self.edges[edge_index];
            let (p0, p1) = pair_mut(&mut self.point_masses, edge.index0, edge.index1);
            solve_edge(p0, p1, edge.rest_length, correction);
        }
    }

    /// Positions changed directly during relaxation, so velocities are
    /// re-derived from the position deltas. Anchors keep their velocity.
    pub fn update_velocities(&mut self, dt: f32) {
        let inv_dt = 1.0 / dt;
        for point in &mut self.point_masses {
            if point.anchor.is_some() {
                continue;
            }
            point.velocity = (point.position - point.old_position) * inv_dt;
            point.old_position = point.position;
        }
    }

    /// Orders edges by BFS distance from the anchored points, top-down or
    /// bottom-up.
    pub fn sort_edges(&mut self) {
        if self.sort_order == SpringSortOrder::None {
            return;
        }
        let mut distances = vec![u32::MAX; self.point_masses.len()];
        let mut queue = std::collections::VecDeque::new();
        for (index, point) in self.point_masses.iter().enumerate() {
            if point.anchor.is_some() {
                distances[index] = 0;
                queue.push_back(index);
            }
        }

        // Adjacency from the edge list.
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); self.point_masses.len()];
        for edge in &self.edges {
            adjacency[edge.index0].push(edge.index1);
            adjacency[edge.index1].push(edge.index0);
        }

        while let Some(current) = queue.pop_front() {
            for &neighbor in &adjacency[current] {
                if distances[neighbor] == u32::MAX {
                    distances[neighbor] = distances[current] + 1;
                    queue.push_back(neighbor);
                }
            }
        }

        for edge in &mut self.edges {
            edge.anchor_distance0 = distances[edge.index0];
            edge.anchor_distance1 = distances[edge.index1];
        }
        match self.sort_order {
            SpringSortOrder::TopDown => self
                .edges
                .sort_by_key(|edge| edge.anchor_distance()),
            SpringSortOrder::BottomUp => self
                .edges
                .sort_by_key(|edge| std::cmp::Reverse(edge.anchor_distance())),
            SpringSortOrder::None => {}
        }
    }
}

fn pair_mut(points: &mut [PointMass], a: usize, b: usize) -> (&mut PointMass, &mut PointMass) {
    debug_assert_ne!(a, b);
    if a < b {
        let (head, tail) = points.split_at_mut(b);
        (&mut head[a], &mut tail[0])
    } else {
        let (head, tail) = points.split_at_mut(a);
        let (second, first) = (&mut tail[0], &mut head[b]);
        (second, first)
    }
}

/// Jakobsen relaxation of one edge: endpoints snap toward the rest length,
/// weighted by inverse mass and the correction percentage.
pub fn solve_edge(p0: &mut PointMass, p1: &mut PointMass, rest_length: f32, correction: f32) {
    let inv_mass_sum = p0.inv_mass + p1.inv_mass;
    if inv_mass_sum == 0.0 {
        return;
    }
    let offset = p1.position - p0.position;
    let length = offset.length();
    if length == 0.0 {
        return;
    }
    let difference = -(length - rest_length) / (length * inv_mass_sum);
    let impulse = offset * difference * correction;
    p0.position -= impulse * p0.inv_mass;
    p1.position += impulse * p1.inv_mass;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relaxation_restores_rest_length() {
        let mut system = SpringSystem::new();
        let a = system.add_point_mass(Vec3::ZERO);
        let b = system.add_point_mass(Vec3::new(1.0, 0.0, 0.0));
        system.add_edge(a, b, 0.0);

        // Stretch and relax repeatedly.
        system.point_masses[b].position = Vec3::new(3.0, 0.0, 0.0);
        for _ in 0..20 {
            system.relax();
        }
        let length =
            (system.point_masses[b].position - system.point_masses[a].position).length();
        assert!((length - 1.0).abs() < 1e-3);
    }

    #[test]
    fn anchored_point_does_not_move() {
        let mut system = SpringSystem::new();
        let a = system.add_point_mass(Vec3::ZERO);
        let b = system.add_point_mass(Vec3::new(2.0, 0.0, 0.0));
        system.add_edge(a, b, 0.0);
        system.set_anchor(a, Some(Anchor { node: 0, local_point: Vec3::ZERO }));

        system.point_masses[b].position = Vec3::new(4.0, 0.0, 0.0);
        for _ in 0..30 {
            system.relax();
        }
        assert_eq!(system.point_masses[a].position, Vec3::ZERO);
        let length =
            (system.point_masses[b].position - system.point_masses[a].position).length();
        assert!((length - 2.0).abs() < 1e-3);
    }

    #[test]
    fn edge_sort_orders_by_anchor_distance() {
        let mut system = SpringSystem::new();
        // A chain anchored at one end: 0 - 1 - 2 - 3.
        for x in 0..4 {
            system.add_point_mass(Vec3::new(x as f32, 0.0, 0.0));
        }
        // Add edges far-to-near so sorting has work to do.
        system.add_edge(2, 3, 0.0);
        system.add_edge(1, 2, 0.0);
        system.add_edge(0, 1, 0.0);
        system.set_anchor(0, Some(Anchor { node: 0, local_point: Vec3::ZERO }));

        system.sort_order = SpringSortOrder::TopDown;
        system.sort_edges();
        let distances: Vec<u32> = system
            .edges
            .iter()
            .map(|edge| edge.anchor_distance())
            .collect();
        assert_eq!(distances, vec![0, 1, 2]);

        system.sort_order = SpringSortOrder::BottomUp;
        system.sort_edges();
        let distances: Vec<u32> = system
            .edges
            .iter()
            .map(|edge| edge.anchor_distance())
            .collect();
        assert_eq!(distances, vec![2, 1, 0]);
    }

    #[test]
    fn velocities_rederived_from_positions() {
        let mut system = SpringSystem::new();
        let a = system.add_point_mass(Vec3::ZERO);
        system.point_masses[a].position = Vec3::new(0.5, 0.0, 0.0);
        system.update_velocities(0.5);
        assert!((system.point_masses[a].velocity.x - 1.0).abs() < 1e-5);
        assert_eq!(system.point_masses[a].old_position.x, 0.5);
    }
}
