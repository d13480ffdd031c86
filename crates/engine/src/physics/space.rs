use std::collections::HashMap;

use glam::{Mat3, Quat, Vec3};

use super::arena::Arena;
use super::body::{BodyFlags, RigidBody, clamp_velocity};
use super::broadphase::BroadphaseSet;
use super::collider::{Collider, Motion};
use super::contact;
use super::edges::generate_mesh_edge_info;
use super::effect::{EffectScope, PhysicsEffect};
use super::events::{PhysicsEvent, PhysicsEventQueue};
use super::manifold::{AddingPolicy, ContactFrame, Manifold};
use super::mass::combine_inertia;
use super::node::{NodeActions, NodeTree};
use super::query::{CastFilter, CastResult, CastResults, Frustum, Ray, ray_cast_collider};
use super::region::Region;
use super::shape::{Aabb, MAX_INERTIA_MASS, MIN_INERTIA_MASS, Shape};
use super::solver::{self, SolverConfig, WeldJoint};
use super::spring::{SpringSystem, SystemConnection, solve_edge};
use super::{BodyIndex, ColliderIndex, EffectIndex, NodeIndex, RegionIndex, SpringSystemIndex};

#[derive(Debug, Clone)]
pub struct SpaceConfig {
    /// Velocity components clamp to this magnitude.
    pub max_velocity: f32,
    /// Report every invalid velocity instead of once per space (editor use).
    pub report_all_invalid_velocities: bool,
    pub mode_2d: bool,
    /// Accept contacts on triangle back faces during edge correction.
    pub allow_backfaces: bool,
    pub manifold_policy: AddingPolicy,
    pub solver: SolverConfig,
    /// Relaxation passes over every spring system per tick.
    pub spring_iterations: u32,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            max_velocity: 1e10,
            report_all_invalid_velocities: false,
            mode_2d: false,
            allow_backfaces: false,
            manifold_policy: AddingPolicy::Persistent,
            solver: SolverConfig::default(),
            spring_iterations: 4,
        }
    }
}

/// One simulation world: the node tree, all physics objects, and the
/// per-tick pipeline that advances them.
pub struct PhysicsSpace {
    pub config: SpaceConfig,
    nodes: NodeTree,
    colliders: Arena<Collider>,
    bodies: Arena<RigidBody>,
    effects: Arena<PhysicsEffect>,
    regions: Arena<Region>,
    springs: Arena<SpringSystem>,
    spring_connections: Arena<SystemConnection>,
    joints: Arena<WeldJoint>,
    broadphase: BroadphaseSet,
    manifolds: HashMap<(ColliderIndex, ColliderIndex), Manifold>,
    space_effects: Vec<EffectIndex>,
    hierarchy_effects: Vec<EffectIndex>,
    events: PhysicsEventQueue,
    invalid_velocity_reported: bool,
    time: f32,
    tick_count: u64,
}

impl Default for PhysicsSpace {
    fn default() -> Self {
        Self::new(SpaceConfig::default())
    }
}

impl PhysicsSpace {
    pub fn new(config: SpaceConfig) -> Self {
        Self {
            config,
            nodes: NodeTree::new(),
            colliders: Arena::new(),
            bodies: Arena::new(),
            effects: Arena::new(),
            regions: Arena::new(),
            springs: Arena::new(),
            spring_connections: Arena::new(),
            joints: Arena::new(),
            broadphase: BroadphaseSet::new(),
            manifolds: HashMap::new(),
            space_effects: Vec::new(),
            hierarchy_effects: Vec::new(),
            events: PhysicsEventQueue::new(),
            invalid_velocity_reported: false,
            time: 0.0,
            tick_count: 0,
        }
    }

    pub fn time(&self) -> f32 {
        self.time
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn drain_events(&mut self) -> Vec<PhysicsEvent> {
        self.events.drain()
    }

    //
    // Construction
    //

    pub fn add_node(&mut self, parent: Option<NodeIndex>) -> NodeIndex {
        self.nodes.add(parent)
    }

    pub fn node(&self, index: NodeIndex) -> Option<&super::node::PhysicsNode> {
        self.nodes.get(index)
    }

    /// Queues an external transform change, applied at the next tick
    /// boundary.
    pub fn set_node_transform(
        &mut self,
        index: NodeIndex,
        translation: Option<Vec3>,
        rotation: Option<Mat3>,
    ) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.queue_transform(translation, rotation);
        }
    }

    /// Immediately places a node, also overriding the old transform so no
    /// kinematic velocity registers. Used at spawn time.
    pub fn place_node(&mut self, index: NodeIndex, translation: Vec3, rotation: Mat3) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.queue_transform(Some(translation), Some(rotation));
            node.apply_pending();
            node.override_old_transform();
            node.actions |= NodeActions::MASS_UPDATE | NodeActions::BROADPHASE_UPDATE;
        }
        self.refresh_collider_bounds_at(index);
        self.sync_body_to_node(index);
    }

    pub fn add_collider(&mut self, node: NodeIndex, shape: Shape) -> ColliderIndex {
        let mut collider = Collider::new(shape, node);
        // Mesh shapes carry precomputed edge adjacency for normal correction.
        match &collider.shape {
            Shape::Mesh(mesh) | Shape::ConvexMesh(mesh) => {
                if mesh.is_valid() {
                    collider.edge_cache = generate_mesh_edge_info(mesh);
                } else {
                    self.events.warn("collider references an invalid mesh");
                }
            }
            _ => {}
        }
        let index = self.colliders.insert(collider);
        if let Some(node_data) = self.nodes.get_mut(node) {
            node_data.collider = Some(index);
            node_data.actions |= NodeActions::BROADPHASE_INSERT | NodeActions::MASS_UPDATE;
        }
        self.rebind_hierarchy();
        self.refresh_collider_bounds_at(node);
        index
    }

    pub fn collider(&self, index: ColliderIndex) -> Option<&Collider> {
        self.colliders.get(index)
    }

    pub fn collider_mut(&mut self, index: ColliderIndex) -> Option<&mut Collider> {
        self.colliders.get_mut(index)
    }

    pub fn remove_collider(&mut self, index: ColliderIndex) {
        if let Some(collider) = self.colliders.remove(index) {
            if let Some(node) = self.nodes.get_mut(collider.node) {
                node.collider = None;
            }
        }
        self.broadphase.remove(index);
        self.manifolds
            .retain(|pair, _| pair.0 != index && pair.1 != index);
        self.rebind_hierarchy();
    }

    pub fn add_body(&mut self, node: NodeIndex) -> BodyIndex {
        let index = self.bodies.insert(RigidBody::new(node));
        if let Some(node_data) = self.nodes.get_mut(node) {
            node_data.body = Some(index);
            node_data.actions |= NodeActions::MASS_UPDATE;
        }
        if let Some(body) = self.bodies.get_mut(index) {
            if body.flags.contains(BodyFlags::INHERIT_2D) {
                let mode_2d = self.config.mode_2d;
                body.set_2d_internal(mode_2d);
            }
        }
        self.rebind_hierarchy();
        self.sync_body_to_node(node);
        index
    }

    pub fn body(&self, index: BodyIndex) -> Option<&RigidBody> {
        self.bodies.get(index)
    }

    pub fn body_mut(&mut self, index: BodyIndex) -> Option<&mut RigidBody> {
        self.bodies.get_mut(index)
    }

    pub fn remove_body(&mut self, index: BodyIndex) {
        if let Some(body) = self.bodies.remove(index) {
            if let Some(node) = self.nodes.get_mut(body.node) {
                node.body = None;
            }
        }
        self.rebind_hierarchy();
    }

    /// Sets a body's velocity, clamping to the space maximum. The first
    /// clamp per space raises an event; in report-all mode every clamp does.
    pub fn set_body_velocity(&mut self, index: BodyIndex, velocity: Vec3) {
        let max = self.config.max_velocity;
        let report_all = self.config.report_all_invalid_velocities;
        let Some(body) = self.bodies.get_mut(index) else {
            return;
        };
        let (clamped, was_clamped) = clamp_velocity(velocity, max);
        body.velocity = clamped;
        if was_clamped && (report_all || !self.invalid_velocity_reported) {
            self.invalid_velocity_reported = true;
            self.events.push(PhysicsEvent::InvalidVelocity {
                body: index,
                clamped,
            });
        }
    }

    pub fn add_effect(&mut self, effect: PhysicsEffect) -> EffectIndex {
        let scope = effect.scope;
        let index = self.effects.insert(effect);
        match scope {
            EffectScope::Space => self.space_effects.push(index),
            EffectScope::Hierarchy(_) => self.hierarchy_effects.push(index),
            EffectScope::Region(region) => {
                if let Some(region) = self.regions.get_mut(region) {
                    region.effects.push(index);
                }
            }
            EffectScope::Body(body) => {
                if let Some(body) = self.bodies.get_mut(body) {
                    body.effects.push(index);
                }
            }
            EffectScope::Collider(collider) => {
                if let Some(collider) = self.colliders.get_mut(collider) {
                    collider.effects.push(index);
                }
            }
        }
        self.wake_effect_targets(index);
        index
    }

    pub fn effect_mut(&mut self, index: EffectIndex) -> Option<&mut PhysicsEffect> {
        self.effects.get_mut(index)
    }

    /// Wakes whatever an effect applies to, honoring wake-on-change.
    pub fn wake_effect_targets(&mut self, index: EffectIndex) {
        let Some(effect) = self.effects.get(index) else {
            return;
        };
        if !effect.wake_on_change {
            return;
        }
        match effect.scope {
            EffectScope::Space => self.force_awake_all(),
            EffectScope::Hierarchy(node) => {
                let bodies = self.bodies_under(node);
                for body in bodies {
                    self.force_awake_body(body);
                }
            }
            EffectScope::Region(region) => self.wake_region(region),
            EffectScope::Body(body) => self.force_awake_body(body),
            EffectScope::Collider(collider) => {
                if let Some(body) = self
                    .colliders
                    .get(collider)
                    .and_then(|collider| collider.active_body)
                {
                    self.force_awake_body(body);
                }
            }
        }
    }

    pub fn add_region(&mut self, collider: ColliderIndex) -> RegionIndex {
        if let Some(collider) = self.colliders.get_mut(collider) {
            collider.ghost = true;
        }
        self.regions.insert(Region::new(collider))
    }

    pub fn wake_region(&mut self, region: RegionIndex) {
        let touching = self
            .regions
            .get(region)
            .map(|region| region.touching_bodies.clone())
            .unwrap_or_default();
        for body in touching {
            self.force_awake_body(body);
        }
    }

    pub fn add_spring_system(&mut self, system: SpringSystem) -> SpringSystemIndex {
        self.springs.insert(system)
    }

    pub fn spring_system(&self, index: SpringSystemIndex) -> Option<&SpringSystem> {
        self.springs.get(index)
    }

    pub fn spring_system_mut(&mut self, index: SpringSystemIndex) -> Option<&mut SpringSystem> {
        self.springs.get_mut(index)
    }

    /// Connects two spring systems with an edge between `owner_point` and
    /// `other_point`. The edge lives on the owner's connection.
    pub fn connect_spring_systems(
        &mut self,
        owner: SpringSystemIndex,
        other: SpringSystemIndex,
        owner_point: usize,
        other_point: usize,
    ) {
        let Some((owner_system, other_system)) = self.springs.get_pair_mut(owner, other) else {
            return;
        };
        let rest = (other_system.point_masses[other_point].position
            - owner_system.point_masses[owner_point].position)
            .length();

        // Reuse an existing connection between this pair if one exists.
        let existing = owner_system
            .owned_connections
            .iter()
            .copied()
            .find(|&index| {
                self.spring_connections
                    .get(index)
                    .is_some_and(|connection| connection.other == other)
            });
        let edge = super::spring::Edge {
            index0: owner_point,
            index1: other_point,
            rest_length: rest,
            anchor_distance0: u32::MAX,
            anchor_distance1: u32::MAX,
        };
        match existing {
            Some(index) => {
                if let Some(connection) = self.spring_connections.get_mut(index) {
                    connection.edges.push(edge);
                }
            }
            None => {
                let index = self.spring_connections.insert(SystemConnection {
                    owner,
                    other,
                    edges: vec![edge],
                });
                if let Some(system) = self.springs.get_mut(owner) {
                    system.owned_connections.push(index);
                }
                if let Some(system) = self.springs.get_mut(other) {
                    system.connected_connections.push(index);
                }
            }
        }
    }

    pub fn add_weld_joint(&mut self, body0: BodyIndex, body1: BodyIndex, world_anchor: Vec3) -> Option<u32> {
        let joint = {
            let first = self.bodies.get(body0)?;
            let second = self.bodies.get(body1)?;
            WeldJoint::new((body0, body1), first, second, world_anchor)
        };
        Some(self.joints.insert(joint))
    }

    pub fn joint_mut(&mut self, index: u32) -> Option<&mut WeldJoint> {
        self.joints.get_mut(index)
    }

    //
    // Wake and sleep
    //

    pub fn force_awake_all(&mut self) {
        for index in self.bodies.indices() {
            self.force_awake_body(index);
        }
    }

    /// Wakes a body and its static/kinematic descendants; dynamic children
    /// move independently and are left alone.
    pub fn force_awake_body(&mut self, index: BodyIndex) {
        let Some(body) = self.bodies.get_mut(index) else {
            return;
        };
        body.sleep_timer = 0.0;
        let woke = body.internal_wake_up();
        let children = body.child_bodies.clone();
        if woke {
            self.events.push(PhysicsEvent::BodyAwoke { body: index });
        }
        for child in children {
            let is_frozen = self
                .bodies
                .get(child)
                .is_some_and(|child_body| !child_body.is_dynamic());
            if is_frozen {
                self.force_awake_body(child);
            }
        }
    }

    pub fn force_asleep_body(&mut self, index: BodyIndex) {
        if let Some(body) = self.bodies.get_mut(index) {
            if !body.is_asleep() {
                body.force_asleep();
                self.events.push(PhysicsEvent::BodySlept { body: index });
            }
        }
    }

    //
    // Hierarchy binding
    //

    /// Recomputes direct/active body links, composite collider lists, and
    /// parent/child body relationships after any structural change.
    fn rebind_hierarchy(&mut self) {
        for (_, body) in self.bodies.iter_mut() {
            body.colliders.clear();
            body.child_bodies.clear();
            body.parent_body = None;
        }

        // Walk top-down carrying the nearest body up the ancestor chain.
        let mut order: Vec<(NodeIndex, Option<BodyIndex>)> = Vec::new();
        let roots: Vec<NodeIndex> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.parent.is_none())
            .map(|(index, _)| index)
            .collect();
        let mut stack: Vec<(NodeIndex, Option<BodyIndex>)> =
            roots.into_iter().map(|root| (root, None)).collect();
        while let Some((node_index, inherited)) = stack.pop() {
            let Some(node) = self.nodes.get(node_index) else {
                continue;
            };
            let own_body = node.body;
            if let (Some(own), Some(parent)) = (own_body, inherited) {
                if let Some(body) = self.bodies.get_mut(own) {
                    body.parent_body = Some(parent);
                }
                if let Some(parent_body) = self.bodies.get_mut(parent) {
                    parent_body.child_bodies.push(own);
                }
            }
            let carried = own_body.or(inherited);
            order.push((node_index, carried));
            let children = self
                .nodes
                .get(node_index)
                .map(|node| node.children.clone())
                .unwrap_or_default();
            for child in children {
                stack.push((child, carried));
            }
        }

        for (node_index, carried) in order {
            let collider_index = self
                .nodes
                .get(node_index)
                .and_then(|node| node.collider);
            let Some(collider_index) = collider_index else {
                continue;
            };
            // Active body: the nearest non-static body up the body chain.
            let mut active = carried;
            while let Some(candidate) = active {
                let Some(body) = self.bodies.get(candidate) else {
                    break;
                };
                if !body.is_static() {
                    break;
                }
                active = body.parent_body;
            }
            let active = active.or(carried);
            let motion = match active.and_then(|index| self.bodies.get(index)) {
                Some(body) if body.is_dynamic() => Motion::Dynamic,
                Some(body) if body.is_kinematic() => Motion::Kinematic,
                _ => Motion::Static,
            };
            if let Some(collider) = self.colliders.get_mut(collider_index) {
                collider.direct_body = carried;
                collider.active_body = active;
                collider.motion = motion;
            }
            if let Some(body_index) = carried {
                if let Some(body) = self.bodies.get_mut(body_index) {
                    body.colliders.push(collider_index);
                }
            }
        }
    }

    fn bodies_under(&self, node: NodeIndex) -> Vec<BodyIndex> {
        let mut found = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(current) else {
                continue;
            };
            if let Some(body) = node.body {
                found.push(body);
            }
            stack.extend(node.children.iter().copied());
        }
        found
    }

    fn refresh_collider_bounds_at(&mut self, node: NodeIndex) {
        let Some((translation, rotation, collider)) = self.nodes.get(node).map(|node| {
            (
                node.transform.translation,
                node.transform.rotation,
                node.collider,
            )
        }) else {
            return;
        };
        if let Some(collider) = collider.and_then(|index| self.colliders.get_mut(index)) {
            collider.update_world_bounds(translation, rotation);
        }
    }

    fn sync_body_to_node(&mut self, node: NodeIndex) {
        let Some((translation, rotation, body)) = self.nodes.get(node).map(|node| {
            (
                node.transform.translation,
                node.transform.rotation,
                node.body,
            )
        }) else {
            return;
        };
        if let Some(body) = body.and_then(|index| self.bodies.get_mut(index)) {
            body.center_of_mass = translation - rotation * body.position_offset;
            body.rotation = Quat::from_mat3(&rotation).normalize();
            body.inertia.compute_world(rotation);
        }
    }

    //
    // Mass composition
    //

    /// Colliders owned by this body, directly or through static/kinematic
    /// descendant bodies.
    fn composite_colliders(&self, body_index: BodyIndex) -> Vec<ColliderIndex> {
        let mut all = Vec::new();
        let mut stack = vec![body_index];
        while let Some(current) = stack.pop() {
            let Some(body) = self.bodies.get(current) else {
                continue;
            };
            all.extend(body.colliders.iter().copied());
            for &child in &body.child_bodies {
                if self
                    .bodies
                    .get(child)
                    .is_some_and(|child_body| !child_body.is_dynamic())
                {
                    stack.push(child);
                }
            }
        }
        all
    }

    /// Recomputes mass, center of mass, and inertia for one body per the
    /// composition rules.
    pub fn recompute_mass(&mut self, body_index: BodyIndex) {
        let collider_indices = self.composite_colliders(body_index);

        let Some(body) = self.bodies.get(body_index) else {
            return;
        };
        let node = body.node;
        let mass_override = body.mass_override;
        let is_dynamic = body.is_dynamic();
        let rotation_locked = body.flags.contains(BodyFlags::ROTATION_LOCKED);
        let mode_2d = body.is_2d();
        let (node_translation, node_rotation) = self
            .nodes
            .get(node)
            .map(|node| (node.transform.translation, node.transform.rotation))
            .unwrap_or((Vec3::ZERO, Mat3::IDENTITY));

        // Mass and center of mass.
        let mut total_mass = 0.0;
        let mut weighted_center = Vec3::ZERO;
        let mut any_collider = false;
        for &collider_index in &collider_indices {
            let Some(collider) = self.colliders.get(collider_index) else {
                continue;
            };
            let mass = collider.mass();
            weighted_center += collider.world_center_of_mass() * mass;
            total_mass += mass;
            any_collider = true;
        }

        let (mut center_of_mass, mut inv_mass) = if !any_collider {
            (node_translation, mass_override.active.then(|| mass_override.inv_mass).unwrap_or(1.0))
        } else if total_mass > 0.0 {
            (weighted_center / total_mass, 1.0 / total_mass)
        } else {
            (node_translation, 1.0)
        };

        if mass_override.active {
            inv_mass = mass_override.inv_mass;
            if !mass_override.auto_compute_center_of_mass {
                center_of_mass =
                    node_rotation * mass_override.local_center_of_mass + node_translation;
            }
        }

        // Inertia about the computed center of mass, via the parallel axis
        // theorem over world-space collider tensors.
        let mut inertia = Mat3::ZERO;
        let mut any_valid = false;
        let mut too_large = false;
        for &collider_index in &collider_indices {
            let Some(collider) = self.colliders.get(collider_index) else {
                continue;
            };
            let mass = collider.mass();
            if mass < MIN_INERTIA_MASS {
                continue;
            }
            if mass > MAX_INERTIA_MASS {
                too_large = true;
                continue;
            }
            any_valid = true;
            let local = collider.shape.local_inertia(mass);
            let world = collider.world_rotation * local * collider.world_rotation.transpose();
            combine_inertia(
                &mut inertia,
                center_of_mass,
                world,
                collider.world_center_of_mass(),
                mass,
            );
        }

        let Some(body) = self.bodies.get_mut(body_index) else {
            return;
        };
        body.center_of_mass = center_of_mass;
        body.position_offset =
            node_rotation.transpose() * (node_translation - center_of_mass);
        body.inv_mass.set_inv_mass(inv_mass);
        if mode_2d {
            body.inv_mass.set_axis_lock(true, 2);
        }

        if !is_dynamic {
            body.inv_mass.set_inv_mass(0.0);
            body.inertia.clear();
            return;
        }
        if rotation_locked || !any_valid || too_large {
            body.inertia.clear();
            if rotation_locked {
                return;
            }
        }
        if any_valid && !too_large && !rotation_locked {
            if mass_override.active {
                // Overridden mass keeps the computed tensor shape scaled to it.
                let computed_mass = if total_mass > 0.0 { total_mass } else { 1.0 };
                let override_mass = if mass_override.inv_mass > 0.0 {
                    1.0 / mass_override.inv_mass
                } else {
                    computed_mass
                };
                inertia = inertia * (override_mass / computed_mass);
            }
            // World tensor back into body space, then inverted.
            let local = node_rotation.transpose() * inertia * node_rotation;
            body.inertia.set_inv_local(local.inverse());
        }
        body.inertia.compute_world(node_rotation);
        if mode_2d {
            body.inertia.world_lock_2d();
        }
    }

    //
    // Tick
    //

    /// Advances the space one fixed step through the full pipeline.
    pub fn step(&mut self, dt: f32) {
        if dt <= 0.0 {
            return;
        }
        self.events.begin_frame();

        // 1-2. Process queued node work: transform reads, kinematic velocity
        // derivation, mass updates, broadphase actions.
        self.process_node_queues(dt);

        // 3. Effects cache world parameters once.
        self.precalculate_effects();

        // 4. Accumulate effect forces on bodies and spring systems.
        self.apply_effects();

        // 5. Integrate velocities (semi-implicit Euler, dynamic bodies only).
        self.integrate_velocities(dt);

        // 6. Broadphase refresh happened in the node queue pass; collect
        // pairs and 7. generate contacts.
        self.generate_contacts();

        // 8. Solve constraints with warm starting.
        let mut manifolds: Vec<Manifold> = {
            let mut keys: Vec<(ColliderIndex, ColliderIndex)> =
                self.manifolds.keys().copied().collect();
            keys.sort_unstable();
            keys.iter()
                .filter_map(|key| self.manifolds.get(key).cloned())
                .collect()
        };
        solver::solve(
            &self.config.solver,
            &mut self.bodies,
            &self.colliders,
            &mut manifolds,
            &mut self.joints,
            dt,
        );
        for manifold in manifolds {
            self.manifolds.insert(manifold.colliders, manifold);
        }

        // 9. Spring systems: integrate, relax, re-derive velocities.
        self.step_springs(dt);

        // 10. Integrate positions and orientations.
        self.integrate_positions(dt);

        // 11. Sleep management.
        self.update_sleep(dt);

        // 12. Publish transforms bottom-up and refresh collider bounds.
        self.publish_transforms();

        self.time += dt;
        self.tick_count += 1;
    }

    fn process_node_queues(&mut self, dt: f32) {
        let indices = self.nodes.indices();
        for node_index in indices {
            let Some(node) = self.nodes.get_mut(node_index) else {
                continue;
            };
            let actions = node.actions;
            let applied = node.apply_pending();
            if node.actions.contains(NodeActions::OVERRIDE_OLD_TRANSFORM) {
                node.override_old_transform();
            }
            let (old_translation, old_rotation, translation, rotation) = (
                node.transform.old_translation,
                node.transform.old_rotation,
                node.transform.translation,
                node.transform.rotation,
            );
            let body_index = node.body;
            let collider_index = node.collider;
            node.actions.remove(
                NodeActions::KINEMATIC_VELOCITY | NodeActions::MASS_UPDATE,
            );

            if applied {
                // Externally moved: update body state from the new transform.
                if let Some(body) = body_index.and_then(|index| self.bodies.get_mut(index)) {
                    if actions.contains(NodeActions::KINEMATIC_VELOCITY) && body.is_kinematic() {
                        body.derive_kinematic_velocity(
                            old_translation,
                            old_rotation,
                            translation,
                            rotation,
                            dt,
                        );
                    }
                }
                self.sync_body_to_node(node_index);
            }

            if actions.contains(NodeActions::MASS_UPDATE) {
                // Mass terms live on the root of the composite; walk up until
                // the first dynamic body.
                let mut target = body_index.or_else(|| {
                    collider_index
                        .and_then(|index| self.colliders.get(index))
                        .and_then(|collider| collider.direct_body)
                });
                while let Some(body_index) = target {
                    self.recompute_mass(body_index);
                    let Some(body) = self.bodies.get(body_index) else {
                        break;
                    };
                    if body.is_dynamic() {
                        break;
                    }
                    target = body.parent_body;
                }
            }

            // Broadphase actions.
            if let Some(collider_index) = collider_index {
                self.refresh_collider_bounds_at(node_index);
                let Some(collider) = self.colliders.get(collider_index) else {
                    continue;
                };
                let aabb = collider.world_aabb;
                let dynamic = !collider.is_static();
                let Some(node) = self.nodes.get_mut(node_index) else {
                    continue;
                };
                if node.actions.contains(NodeActions::BROADPHASE_REMOVE) {
                    node.actions.remove(NodeActions::BROADPHASE_REMOVE);
                    self.broadphase.remove(collider_index);
                } else if node
                    .actions
                    .intersects(NodeActions::BROADPHASE_INSERT | NodeActions::BROADPHASE_UPDATE)
                {
                    node.actions
                        .remove(NodeActions::BROADPHASE_INSERT | NodeActions::BROADPHASE_UPDATE);
                    self.broadphase.remove(collider_index);
                    if dynamic {
                        self.broadphase.dynamic_phase.insert(collider_index, aabb);
                    } else {
                        self.broadphase.static_phase.insert(collider_index, aabb);
                    }
                }
            }
        }
    }

    fn effect_owner_transform(&self, scope: EffectScope) -> (Vec3, Mat3) {
        let node = match scope {
            EffectScope::Space => None,
            EffectScope::Hierarchy(node) => Some(node),
            EffectScope::Region(region) => self
                .regions
                .get(region)
                .and_then(|region| self.colliders.get(region.collider))
                .map(|collider| collider.node),
            EffectScope::Body(body) => self.bodies.get(body).map(|body| body.node),
            EffectScope::Collider(collider) => {
                self.colliders.get(collider).map(|collider| collider.node)
            }
        };
        node.and_then(|index| self.nodes.get(index))
            .map(|node| (node.transform.translation, node.transform.rotation))
            .unwrap_or((Vec3::ZERO, Mat3::IDENTITY))
    }

    fn precalculate_effects(&mut self) {
        let indices = self.effects.indices();
        for index in indices {
            let Some(effect) = self.effects.get(index) else {
                continue;
            };
            let (translation, rotation) = self.effect_owner_transform(effect.scope);
            if let Some(effect) = self.effects.get_mut(index) {
                effect.precalculate(translation, rotation);
            }
        }
    }

    /// Gathers and applies every effect relevant to each awake dynamic body:
    /// space effects (unless ignored), hierarchy effects on ancestors, body
    /// and collider effects, and effects from overlapping regions.
    fn apply_effects(&mut self) {
        let body_indices = self.bodies.indices();
        for body_index in body_indices {
            let Some(body) = self.bodies.get(body_index) else {
                continue;
            };
            if !body.is_dynamic() || body.is_asleep() {
                continue;
            }
            let ignore = body.ignore_space_effects;
            let node = body.node;

            let mut to_apply: Vec<EffectIndex> = Vec::new();
            for &effect_index in &self.space_effects {
                if let Some(effect) = self.effects.get(effect_index) {
                    if !ignore.contains(effect.kind.flag()) {
                        to_apply.push(effect_index);
                    }
                }
            }
            for &effect_index in &self.hierarchy_effects {
                if let Some(effect) = self.effects.get(effect_index) {
                    if let EffectScope::Hierarchy(root) = effect.scope {
                        if self.node_is_descendant_of(node, root) {
                            to_apply.push(effect_index);
                        }
                    }
                }
            }
            // The body's own effects plus those of its composite colliders.
            to_apply.extend(self.bodies.get(body_index).map(|b| b.effects.clone()).unwrap_or_default());
            for collider_index in self.composite_colliders(body_index) {
                if let Some(collider) = self.colliders.get(collider_index) {
                    to_apply.extend(collider.effects.iter().copied());
                }
            }
            // Region effects for regions this body overlaps.
            for (_, region) in self.regions.iter() {
                if region.touching_bodies.contains(&body_index) {
                    to_apply.extend(region.effects.iter().copied());
                }
            }

            let collider_indices = self
                .bodies
                .get(body_index)
                .map(|body| body.colliders.clone())
                .unwrap_or_default();
            for effect_index in to_apply {
                let Some(effect) = self.effects.get(effect_index).cloned() else {
                    continue;
                };
                let collider_refs: Vec<&Collider> = collider_indices
                    .iter()
                    .filter_map(|&index| self.colliders.get(index))
                    .collect();
                if let Some(body) = self.bodies.get_mut(body_index) {
                    effect.apply_to_body(body, &collider_refs);
                }
            }
        }

        // Space-wide effects also drive spring systems.
        let spring_indices = self.springs.indices();
        for spring_index in spring_indices {
            for &effect_index in &self.space_effects.clone() {
                let Some(effect) = self.effects.get(effect_index).cloned() else {
                    continue;
                };
                if let Some(system) = self.springs.get_mut(spring_index) {
                    effect.apply_to_spring(system);
                }
            }
        }
    }

    fn node_is_descendant_of(&self, node: NodeIndex, ancestor: NodeIndex) -> bool {
        let mut current = Some(node);
        while let Some(index) = current {
            if index == ancestor {
                return true;
            }
            current = self.nodes.get(index).and_then(|node| node.parent);
        }
        false
    }

    fn integrate_velocities(&mut self, dt: f32) {
        let max = self.config.max_velocity;
        let mut clamped_bodies = Vec::new();
        for (index, body) in self.bodies.iter_mut() {
            if !body.is_dynamic() || body.is_asleep() {
                body.force = Vec3::ZERO;
                body.torque = Vec3::ZERO;
                continue;
            }
            body.velocity_old = body.velocity;
            body.angular_velocity_old = body.angular_velocity;

            let acceleration = body.inv_mass.apply(body.force);
            let angular_acceleration = body.inertia.apply(body.torque);
            body.velocity += acceleration * dt;
            body.angular_velocity += angular_acceleration * dt;

            // NaN and runaway velocities clamp rather than crash.
            if !body.velocity.is_finite() {
                body.velocity = Vec3::ZERO;
            }
            if !body.angular_velocity.is_finite() {
                body.angular_velocity = Vec3::ZERO;
            }
            let (clamped, was_clamped) = clamp_velocity(body.velocity, max);
            body.velocity = clamped;
            if was_clamped {
                clamped_bodies.push((index, clamped));
            }
            let (clamped, _) = clamp_velocity(body.angular_velocity, max);
            body.angular_velocity = clamped;

            body.force = Vec3::ZERO;
            body.torque = Vec3::ZERO;
        }
        for (body, clamped) in clamped_bodies {
            if self.config.report_all_invalid_velocities || !self.invalid_velocity_reported {
                self.invalid_velocity_reported = true;
                self.events
                    .push(PhysicsEvent::InvalidVelocity { body, clamped });
            }
        }
    }

    fn generate_contacts(&mut self) {
        for (_, region) in self.regions.iter_mut() {
            region.begin_tick();
        }

        let pairs = self.broadphase.collect_pairs();
        let mut alive: Vec<(ColliderIndex, ColliderIndex)> = Vec::new();

        for (index0, index1) in pairs {
            let allow_backfaces = self.config.allow_backfaces;
            let Some((c0, c1)) = self.colliders.get_pair_mut(index0, index1) else {
                continue;
            };
            // Skip pairs sharing an active body; self-collision is resolved
            // by the composite mass.
            if c0.active_body.is_some() && c0.active_body == c1.active_body {
                continue;
            }
            let both_asleep = {
                let asleep = |body: Option<BodyIndex>, bodies: &Arena<RigidBody>| {
                    body.and_then(|index| bodies.get(index))
                        .map(|body| body.is_asleep() || !body.is_dynamic())
                        .unwrap_or(true)
                };
                asleep(c0.active_body, &self.bodies) && asleep(c1.active_body, &self.bodies)
            };

            let mut points = contact::collide(c0, c1, allow_backfaces);
            if points.is_empty() {
                continue;
            }
            let frame0 = ContactFrame {
                translation: c0.world_translation,
                rotation: c0.world_rotation,
            };
            let frame1 = ContactFrame {
                translation: c1.world_translation,
                rotation: c1.world_rotation,
            };
            let friction = c0.material.mixed_friction(&c1.material);
            let restitution = c0.material.mixed_restitution(&c1.material);
            let is_ghost_pair = c0.ghost || c1.ghost;
            let is_2d = (
                c0.active_body
                    .and_then(|index| self.bodies.get(index))
                    .is_some_and(|body| body.is_2d()),
                c1.active_body
                    .and_then(|index| self.bodies.get(index))
                    .is_some_and(|body| body.is_2d()),
            );
            let is_dynamic = (c0.is_dynamic(), c1.is_dynamic());
            let ghosts = (c0.ghost, c1.ghost);
            let bodies_to_wake = (c0.active_body, c1.active_body);

            let policy = self.config.manifold_policy;
            let key = (index0, index1);
            let manifold = self
                .manifolds
                .entry(key)
                .or_insert_with(|| Manifold::new(key, policy));
            let started = manifold.contact_count() == 0;
            manifold.friction = friction;
            manifold.restitution = restitution;
            manifold.add_points(&mut points, &frame0, &frame1);
            if !manifold.correct_for_2d(is_2d, is_dynamic, ghosts) {
                self.manifolds.remove(&key);
                continue;
            }
            if manifold.contact_count() == 0 {
                self.manifolds.remove(&key);
                continue;
            }
            alive.push(key);

            if started {
                self.events.push(PhysicsEvent::CollisionStarted {
                    colliders: key,
                });
                // Contact wakes sleeping bodies unless the whole pair rests.
                if !both_asleep {
                    if let Some(body) = bodies_to_wake.0 {
                        self.force_awake_body(body);
                    }
                    if let Some(body) = bodies_to_wake.1 {
                        self.force_awake_body(body);
                    }
                }
            }

            // Region overlap bookkeeping.
            if is_ghost_pair {
                for (_, region) in self.regions.iter_mut() {
                    if region.collider == index0 {
                        if let Some(body) = bodies_to_wake.1 {
                            region.add_touching(body);
                        }
                    } else if region.collider == index1 {
                        if let Some(body) = bodies_to_wake.0 {
                            region.add_touching(body);
                        }
                    }
                }
            }
        }

        // Drop manifolds whose pair no longer overlaps.
        let stale: Vec<(ColliderIndex, ColliderIndex)> = self
            .manifolds
            .keys()
            .filter(|key| !alive.contains(key))
            .copied()
            .collect();
        for key in stale {
            self.manifolds.remove(&key);
            self.events
                .push(PhysicsEvent::CollisionEnded { colliders: key });
        }
    }

    fn step_springs(&mut self, dt: f32) {
        // Anchors re-pin to their node transforms first.
        let spring_indices = self.springs.indices();
        for index in spring_indices.iter().copied() {
            let transforms: Vec<(NodeIndex, (Vec3, Mat3))> = self
                .springs
                .get(index)
                .map(|system| {
                    system
                        .point_masses
                        .iter()
                        .filter_map(|point| point.anchor)
                        .filter_map(|anchor| {
                            self.nodes.get(anchor.node).map(|node| {
                                (
                                    anchor.node,
                                    (node.transform.translation, node.transform.rotation),
                                )
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            if let Some(system) = self.springs.get_mut(index) {
                system.update_anchors(|node| {
                    transforms
                        .iter()
                        .find(|(index, _)| *index == node)
                        .map(|(_, transform)| *transform)
                });
            }
        }

        for index in spring_indices.iter().copied() {
            if let Some(system) = self.springs.get_mut(index) {
                system.integrate_velocity(dt);
                system.integrate_position(dt);
            }
        }

        // Relaxation passes across all systems, including owned cross-system
        // connection edges.
        for _ in 0..self.config.spring_iterations {
            for index in spring_indices.iter().copied() {
                if let Some(system) = self.springs.get_mut(index) {
                    system.relax();
                }
            }
            let connection_indices = self.spring_connections.indices();
            for connection_index in connection_indices {
                let Some(connection) = self.spring_connections.get(connection_index) else {
                    continue;
                };
                let (owner, other) = (connection.owner, connection.other);
                let edges = connection.edges.clone();
                // Both systems must still resolve before the edge is solved.
                let Some((owner_system, other_system)) =
                    self.springs.get_pair_mut(owner, other)
                else {
                    self.spring_connections.remove(connection_index);
                    continue;
                };
                let correction = owner_system.correction_percent;
                for edge in edges {
                    if edge.index0 >= owner_system.point_masses.len()
                        || edge.index1 >= other_system.point_masses.len()
                    {
                        continue;
                    }
                    solve_edge(
                        &mut owner_system.point_masses[edge.index0],
                        &mut other_system.point_masses[edge.index1],
                        edge.rest_length,
                        correction,
                    );
                }
            }
        }

        for index in spring_indices {
            if let Some(system) = self.springs.get_mut(index) {
                system.update_velocities(dt);
            }
        }
    }

    fn integrate_positions(&mut self, dt: f32) {
        for (_, body) in self.bodies.iter_mut() {
            if !body.is_dynamic() || body.is_asleep() {
                continue;
            }
            body.center_of_mass += body.velocity * dt;
            body.integrate_rotation(dt);
        }
    }

    fn update_sleep(&mut self, dt: f32) {
        let mut slept = Vec::new();
        for (index, body) in self.bodies.iter_mut() {
            if !body.is_dynamic() || body.is_asleep() {
                body.flags.remove(BodyFlags::SLEEP_ACCUMULATED);
                continue;
            }
            body.update_sleep_timer(dt);
            if body.should_sleep() {
                body.put_to_sleep();
                slept.push(index);
            }
            body.flags.remove(BodyFlags::SLEEP_ACCUMULATED);
        }
        for body in slept {
            self.events.push(PhysicsEvent::BodySlept { body });
        }
    }

    /// Pushes body state back into node transforms, children before parents,
    /// then refreshes collider bounds and broadphase entries.
    fn publish_transforms(&mut self) {
        let order = self.nodes.bottom_up();
        for node_index in order {
            let Some(node) = self.nodes.get(node_index) else {
                continue;
            };
            let Some(body_index) = node.body else {
                continue;
            };
            let Some(body) = self.bodies.get(body_index) else {
                continue;
            };
            if !body.is_dynamic() || body.is_asleep() {
                continue;
            }
            let rotation = Mat3::from_quat(body.rotation);
            let translation = body.center_of_mass + rotation * body.position_offset;
            if let Some(node) = self.nodes.get_mut(node_index) {
                node.transform.old_translation = node.transform.translation;
                node.transform.old_rotation = node.transform.rotation;
                node.transform.translation = translation;
                node.transform.rotation = rotation;
            }
            if let Some(body) = self.bodies.get_mut(body_index) {
                body.inertia.compute_world(rotation);
                if body.is_2d() {
                    body.inertia.world_lock_2d();
                }
            }
        }

        // Refresh collider bounds and dynamic broadphase entries.
        let collider_indices = self.colliders.indices();
        for collider_index in collider_indices {
            let node = self
                .colliders
                .get(collider_index)
                .map(|collider| collider.node);
            if let Some(node) = node {
                self.refresh_collider_bounds_at(node);
            }
            let Some(collider) = self.colliders.get(collider_index) else {
                continue;
            };
            if !collider.is_static() && self.broadphase.dynamic_phase.contains(collider_index) {
                self.broadphase
                    .dynamic_phase
                    .update(collider_index, collider.world_aabb);
            }
        }
    }

    //
    // Spatial queries
    //

    pub fn cast_ray(&self, ray: &Ray, filter: &CastFilter<'_>, results: &mut CastResults, max_distance: f32) {
        for (index, collider) in self.colliders.iter() {
            if !filter.is_valid(index, collider) {
                continue;
            }
            if let Some(mut hit) = ray_cast_collider(ray, collider, max_distance) {
                hit.collider = index;
                results.add(hit);
            }
        }
    }

    /// All accepted colliders whose aabb lies inside the frustum, up to
    /// capacity.
    pub fn cast_frustum(
        &self,
        frustum: &Frustum,
        filter: &CastFilter<'_>,
        results: &mut CastResults,
    ) {
        for (index, collider) in self.colliders.iter() {
            if results.is_full() {
                return;
            }
            if !filter.is_valid(index, collider) {
                continue;
            }
            if frustum.contains_aabb(&collider.world_aabb) {
                results.add(CastResult {
                    collider: index,
                    point: collider.world_aabb.center(),
                    normal: Vec3::ZERO,
                    distance: 0.0,
                });
            }
        }
    }

    pub fn cast_aabb(&self, aabb: &Aabb, filter: &CastFilter<'_>, results: &mut CastResults) {
        for (index, collider) in self.colliders.iter() {
            if results.is_full() {
                return;
            }
            if !filter.is_valid(index, collider) {
                continue;
            }
            if collider.world_aabb.overlaps(aabb) {
                results.add(CastResult {
                    collider: index,
                    point: collider.world_aabb.center(),
                    normal: Vec3::ZERO,
                    distance: 0.0,
                });
            }
        }
    }

    pub fn manifold_count(&self) -> usize {
        self.manifolds.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::body::{DynamicState, LINEAR_SLEEP_EPSILON, TIME_TO_SLEEP};
    use crate::physics::effect::EffectKind;

    const DT: f32 = 1.0 / 60.0;

    fn sphere_space() -> (PhysicsSpace, NodeIndex, BodyIndex, ColliderIndex) {
        let mut space = PhysicsSpace::new(SpaceConfig::default());
        let node = space.add_node(None);
        let body = space.add_body(node);
        let collider = space.add_collider(node, Shape::Sphere { radius: 0.5 });
        space.place_node(node, Vec3::new(0.0, 5.0, 0.0), Mat3::IDENTITY);
        (space, node, body, collider)
    }

    #[test]
    fn gravity_effect_accelerates_body() {
        let (mut space, node, body, _) = sphere_space();
        space.add_effect(PhysicsEffect::new(
            EffectKind::Gravity {
                direction: -Vec3::Y,
                strength: 10.0,
            },
            EffectScope::Space,
        ));
        for _ in 0..60 {
            space.step(DT);
        }
        let velocity = space.body(body).unwrap().velocity;
        assert!((velocity.y + 10.0).abs() < 0.2, "velocity {velocity:?}");
        let translation = space.node(node).unwrap().transform.translation;
        assert!(translation.y < 5.0 - 4.0, "translation {translation:?}");
    }

    #[test]
    fn ignore_space_effects_opts_out() {
        let (mut space, _, body, _) = sphere_space();
        space.add_effect(PhysicsEffect::new(
            EffectKind::Gravity {
                direction: -Vec3::Y,
                strength: 10.0,
            },
            EffectScope::Space,
        ));
        space.body_mut(body).unwrap().ignore_space_effects =
            super::super::effect::EffectKindFlags::GRAVITY;
        space.step(DT);
        assert_eq!(space.body(body).unwrap().velocity, Vec3::ZERO);
    }

    #[test]
    fn mass_composition_of_two_unit_colliders() {
        // Two unit-density unit-volume colliders separated by d along x.
        let mut space = PhysicsSpace::new(SpaceConfig::default());
        let root = space.add_node(None);
        let body = space.add_body(root);
        let child0 = space.add_node(Some(root));
        let child1 = space.add_node(Some(root));
        space.add_collider(
            child0,
            Shape::Box {
                half_extents: Vec3::splat(0.5),
            },
        );
        space.add_collider(
            child1,
            Shape::Box {
                half_extents: Vec3::splat(0.5),
            },
        );
        let d = 4.0;
        space.place_node(child0, Vec3::new(-d / 2.0, 0.0, 0.0), Mat3::IDENTITY);
        space.place_node(child1, Vec3::new(d / 2.0, 0.0, 0.0), Mat3::IDENTITY);
        space.place_node(root, Vec3::ZERO, Mat3::IDENTITY);
        space.recompute_mass(body);

        let body_ref = space.body(body).unwrap();
        assert!((body_ref.inv_mass.mass() - 2.0).abs() < 1e-4);
        assert!(body_ref.center_of_mass.length() < 1e-5);

        // Unit box inertia is 1/6 per unit mass; parallel axis adds 2(d/2)^2.
        let unit = 1.0 / 6.0;
        let expected = 2.0 * unit + 2.0 * (d / 2.0) * (d / 2.0);
        let inv = body_ref.inertia.inv_local();
        assert!((1.0 / inv.y_axis.y - expected).abs() / expected < 1e-3);
        assert!((1.0 / inv.z_axis.z - expected).abs() / expected < 1e-3);
        assert!((1.0 / inv.x_axis.x - 2.0 * unit).abs() < 1e-3);
    }

    #[test]
    fn body_sleeps_after_time_to_sleep() {
        let (mut space, _, body, _) = sphere_space();
        space.body_mut(body).unwrap().velocity = Vec3::new(LINEAR_SLEEP_EPSILON * 0.5, 0.0, 0.0);

        let ticks = (TIME_TO_SLEEP / DT) as usize + 2;
        for _ in 0..ticks {
            space.step(DT);
        }
        assert!(space.body(body).unwrap().is_asleep());
        let events = space.drain_events();
        assert!(events
            .iter()
            .any(|event| matches!(event, PhysicsEvent::BodySlept { .. })));
        assert_eq!(space.body(body).unwrap().velocity, Vec3::ZERO);
    }

    #[test]
    fn falling_sphere_rests_on_static_ground() {
        let mut space = PhysicsSpace::new(SpaceConfig::default());
        let ground_node = space.add_node(None);
        space.add_collider(
            ground_node,
            Shape::Box {
                half_extents: Vec3::new(10.0, 1.0, 10.0),
            },
        );
        space.place_node(ground_node, Vec3::new(0.0, -1.0, 0.0), Mat3::IDENTITY);

        let ball_node = space.add_node(None);
        let ball_body = space.add_body(ball_node);
        space.add_collider(ball_node, Shape::Sphere { radius: 0.5 });
        space.place_node(ball_node, Vec3::new(0.0, 2.0, 0.0), Mat3::IDENTITY);
        space.add_effect(PhysicsEffect::new(
            EffectKind::Gravity {
                direction: -Vec3::Y,
                strength: 10.0,
            },
            EffectScope::Space,
        ));

        for _ in 0..240 {
            space.step(DT);
        }
        let translation = space.node(ball_node).unwrap().transform.translation;
        // Resting on the ground plane at y = 0 with radius 0.5.
        assert!(
            (translation.y - 0.5).abs() < 0.1,
            "translation {translation:?}"
        );
        let velocity = space.body(ball_body).unwrap().velocity;
        assert!(velocity.length() < 0.5, "velocity {velocity:?}");
    }

    #[test]
    fn kinematic_velocity_derived_from_moves() {
        let mut space = PhysicsSpace::new(SpaceConfig::default());
        let node = space.add_node(None);
        let body = space.add_body(node);
        space
            .body_mut(body)
            .unwrap()
            .set_dynamic_state(DynamicState::Kinematic);
        space.place_node(node, Vec3::ZERO, Mat3::IDENTITY);

        space.set_node_transform(node, Some(Vec3::new(1.0, 0.0, 0.0)), None);
        space.step(DT);
        let velocity = space.body(body).unwrap().velocity;
        assert!((velocity.x - 1.0 / DT).abs() < 1e-2, "velocity {velocity:?}");
    }

    #[test]
    fn ray_cast_through_space() {
        let (space, _, _, collider) = sphere_space();
        let mut results = CastResults::new(4);
        space.cast_ray(
            &Ray::new(Vec3::new(0.0, 10.0, 0.0), -Vec3::Y),
            &CastFilter::default(),
            &mut results,
            100.0,
        );
        assert_eq!(results.len(), 1);
        let hit = results.first().unwrap();
        assert_eq!(hit.collider, collider);
        assert!((hit.distance - 4.5).abs() < 1e-3);
    }

    #[test]
    fn two_d_mode_locks_z_velocity() {
        let mut space = PhysicsSpace::new(SpaceConfig {
            mode_2d: true,
            ..Default::default()
        });
        let node = space.add_node(None);
        let body = space.add_body(node);
        space.add_collider(node, Shape::Sphere { radius: 0.5 });
        space.place_node(node, Vec3::ZERO, Mat3::IDENTITY);

        space.body_mut(body).unwrap().apply_force(Vec3::new(0.0, 0.0, 100.0));
        space.step(DT);
        assert_eq!(space.body(body).unwrap().velocity.z, 0.0);
    }

    #[test]
    fn determinism_across_identical_runs() {
        let run = || {
            let mut space = PhysicsSpace::new(SpaceConfig::default());
            let ground = space.add_node(None);
            space.add_collider(
                ground,
                Shape::Box {
                    half_extents: Vec3::new(10.0, 1.0, 10.0),
                },
            );
            space.place_node(ground, Vec3::new(0.0, -1.0, 0.0), Mat3::IDENTITY);
            space.add_effect(PhysicsEffect::new(
                EffectKind::Gravity {
                    direction: -Vec3::Y,
                    strength: 10.0,
                },
                EffectScope::Space,
            ));
            let mut body_indices = Vec::new();
            for i in 0..4 {
                let node = space.add_node(None);
                let body = space.add_body(node);
                space.add_collider(node, Shape::Sphere { radius: 0.5 });
                space.place_node(
                    node,
                    Vec3::new(i as f32 * 0.4, 2.0 + i as f32, 0.3 * i as f32),
                    Mat3::IDENTITY,
                );
                body_indices.push(body);
            }
            for _ in 0..120 {
                space.step(DT);
            }
            body_indices
                .into_iter()
                .map(|index| {
                    let body = space.body(index).unwrap();
                    (body.center_of_mass, body.velocity)
                })
                .collect::<Vec<_>>()
        };
        let first = run();
        let second = run();
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.0.to_array(), b.0.to_array());
            assert_eq!(a.1.to_array(), b.1.to_array());
        }
    }
}
