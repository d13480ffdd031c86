use std::sync::Arc;

use glam::{Mat3, Vec3};

use tether::physics::{
    EffectKind, EffectScope, PhysicsEffect, PhysicsEvent, PhysicsMesh, PhysicsSpace, Shape,
    SpaceConfig,
};

const DT: f32 = 1.0 / 60.0;

#[test]
fn equal_spheres_collide_elastically() {
    let mut space = PhysicsSpace::new(SpaceConfig::default());

    let mut bodies = Vec::new();
    for (x, velocity) in [(-2.0f32, 1.0f32), (2.0, -1.0)] {
        let node = space.add_node(None);
        let body = space.add_body(node);
        let collider = space.add_collider(node, Shape::Sphere { radius: 1.0 });
        space.collider_mut(collider).unwrap().material.restitution = 1.0;
        space.collider_mut(collider).unwrap().material.friction = 0.0;
        space.place_node(node, Vec3::new(x, 0.0, 0.0), Mat3::IDENTITY);
        space.body_mut(body).unwrap().velocity = Vec3::new(velocity, 0.0, 0.0);
        bodies.push(body);
    }

    // Step until the spheres have met and separated again.
    for _ in 0..240 {
        space.step(DT);
    }

    let v0 = space.body(bodies[0]).unwrap().velocity;
    let v1 = space.body(bodies[1]).unwrap().velocity;
    assert!((v0.x + 1.0).abs() < 1e-3, "v0 {v0:?}");
    assert!((v1.x - 1.0).abs() < 1e-3, "v1 {v1:?}");
    assert!(v0.y.abs() < 1e-3 && v0.z.abs() < 1e-3);
}

#[test]
fn collision_events_start_and_end() {
    let mut space = PhysicsSpace::new(SpaceConfig::default());
    let ground = space.add_node(None);
    space.add_collider(
        ground,
        Shape::Box {
            half_extents: Vec3::new(10.0, 1.0, 10.0),
        },
    );
    space.place_node(ground, Vec3::new(0.0, -1.0, 0.0), Mat3::IDENTITY);

    let node = space.add_node(None);
    let body = space.add_body(node);
    space.add_collider(node, Shape::Sphere { radius: 0.5 });
    space.place_node(node, Vec3::new(0.0, 0.4, 0.0), Mat3::IDENTITY);

    space.step(DT);
    let events = space.drain_events();
    assert!(events
        .iter()
        .any(|event| matches!(event, PhysicsEvent::CollisionStarted { .. })));

    // Fling the ball away; the contact ends.
    space.body_mut(body).unwrap().velocity = Vec3::new(0.0, 50.0, 0.0);
    for _ in 0..30 {
        space.step(DT);
    }
    let events = space.drain_events();
    assert!(events
        .iter()
        .any(|event| matches!(event, PhysicsEvent::CollisionEnded { .. })));
}

#[test]
fn sphere_crossing_coplanar_mesh_edge_keeps_face_normal() {
    // A flat quad of two triangles; a sphere pressed onto the shared edge
    // must resolve along the face normal, not the edge.
    let mut space = PhysicsSpace::new(SpaceConfig::default());
    let mesh = PhysicsMesh::new(
        vec![
            Vec3::new(-4.0, 0.0, -4.0),
            Vec3::new(4.0, 0.0, -4.0),
            Vec3::new(4.0, 0.0, 4.0),
            Vec3::new(-4.0, 0.0, 4.0),
        ],
        vec![[0, 2, 1], [0, 3, 2]],
    );
    assert!(mesh.is_valid());
    let mesh_node = space.add_node(None);
    space.add_collider(mesh_node, Shape::Mesh(Arc::new(mesh)));
    space.place_node(mesh_node, Vec3::ZERO, Mat3::IDENTITY);

    let ball_node = space.add_node(None);
    let ball_body = space.add_body(ball_node);
    space.add_collider(ball_node, Shape::Sphere { radius: 0.5 });
    // Right on the diagonal shared edge, slightly overlapping.
    space.place_node(ball_node, Vec3::new(0.0, 0.45, 0.0), Mat3::IDENTITY);
    space.add_effect(PhysicsEffect::new(
        EffectKind::Gravity {
            direction: -Vec3::Y,
            strength: 10.0,
        },
        EffectScope::Space,
    ));
    // Roll across the seam.
    space.body_mut(ball_body).unwrap().velocity = Vec3::new(1.0, 0.0, 0.0);

    for _ in 0..120 {
        space.step(DT);
        let body = space.body(ball_body).unwrap();
        // No sideways kick from internal edges while rolling straight.
        assert!(
            body.velocity.z.abs() < 0.05,
            "edge kick produced {:?}",
            body.velocity
        );
        assert!(body.center_of_mass.y > 0.2, "fell through the mesh");
    }
}

#[test]
fn anchored_spring_rope_hangs_under_gravity() {
    let mut space = PhysicsSpace::new(SpaceConfig::default());
    let anchor_node = space.add_node(None);
    space.place_node(anchor_node, Vec3::new(0.0, 5.0, 0.0), Mat3::IDENTITY);

    let mut rope = tether::SpringSystem::new();
    for i in 0..5 {
        rope.add_point_mass(Vec3::new(i as f32 * 0.5, 5.0, 0.0));
    }
    for i in 0..4 {
        rope.add_edge(i, i + 1, 0.0);
    }
    rope.set_anchor(
        0,
        Some(tether::physics::Anchor {
            node: anchor_node,
            local_point: Vec3::ZERO,
        }),
    );
    let rope_index = space.add_spring_system(rope);

    space.add_effect(PhysicsEffect::new(
        EffectKind::Gravity {
            direction: -Vec3::Y,
            strength: 10.0,
        },
        EffectScope::Space,
    ));

    let mut lowest_tail = f32::MAX;
    for _ in 0..600 {
        space.step(DT);
        let rope = space.spring_system(rope_index).unwrap();
        lowest_tail = lowest_tail.min(rope.point_masses[4].position.y);
    }

    let rope = space.spring_system(rope_index).unwrap();
    // The anchored end stays put and the free end swung down under gravity.
    assert!((rope.point_masses[0].position - Vec3::new(0.0, 5.0, 0.0)).length() < 1e-4);
    assert!(lowest_tail < 3.6, "tail never fell, lowest {lowest_tail}");
    // Relaxation holds the chain near its rest length.
    let mut length = 0.0;
    for i in 0..4 {
        length += (rope.point_masses[i + 1].position - rope.point_masses[i].position).length();
    }
    assert!((length - 2.0).abs() < 0.3, "rope length {length}");
}

#[test]
fn region_effect_applies_only_inside() {
    let mut space = PhysicsSpace::new(SpaceConfig::default());

    // A region volume around the origin pushing bodies upward.
    let region_node = space.add_node(None);
    let region_collider = space.add_collider(
        region_node,
        Shape::Box {
            half_extents: Vec3::splat(2.0),
        },
    );
    space.place_node(region_node, Vec3::ZERO, Mat3::IDENTITY);
    let region = space.add_region(region_collider);
    space.add_effect(PhysicsEffect::new(
        EffectKind::Force {
            direction: Vec3::Y,
            strength: 50.0,
        },
        EffectScope::Region(region),
    ));

    let inside_node = space.add_node(None);
    let inside_body = space.add_body(inside_node);
    space.add_collider(inside_node, Shape::Sphere { radius: 0.5 });
    space.place_node(inside_node, Vec3::ZERO, Mat3::IDENTITY);

    let outside_node = space.add_node(None);
    let outside_body = space.add_body(outside_node);
    space.add_collider(outside_node, Shape::Sphere { radius: 0.5 });
    space.place_node(outside_node, Vec3::new(10.0, 0.0, 0.0), Mat3::IDENTITY);

    for _ in 0..10 {
        space.step(DT);
    }
    let inside_velocity = space.body(inside_body).unwrap().velocity;
    let outside_velocity = space.body(outside_body).unwrap().velocity;
    assert!(inside_velocity.y > 0.1, "inside {inside_velocity:?}");
    assert_eq!(outside_velocity, Vec3::ZERO);
}
