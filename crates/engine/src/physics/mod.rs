pub mod arena;
pub mod body;
pub mod broadphase;
pub mod collider;
pub mod contact;
pub mod edges;
pub mod effect;
pub mod events;
pub mod manifold;
pub mod mass;
pub mod node;
pub mod query;
pub mod region;
pub mod shape;
pub mod solver;
pub mod space;
pub mod spring;

/// Arena indices; physics objects reference each other by index, never by
/// pointer.
pub type NodeIndex = u32;
pub type ColliderIndex = u32;
pub type BodyIndex = u32;
pub type EffectIndex = u32;
pub type RegionIndex = u32;
pub type SpringSystemIndex = u32;
pub type JointIndex = u32;

pub use arena::Arena;
pub use body::{
    ANGULAR_SLEEP_EPSILON, BodyFlags, DynamicState, LINEAR_SLEEP_EPSILON, Mode2D, RigidBody,
    TIME_TO_SLEEP,
};
pub use broadphase::{Broadphase, BroadphaseSet};
pub use collider::{Collider, Material, Motion};
pub use edges::{HEIGHT_MAP_ADJACENCY_CACHE_LIMIT, TriangleInfo, TriangleInfoMap};
pub use effect::{
    EffectKind, EffectKindFlags, EffectScope, PhysicsEffect, PointEndCondition, PointInterpolation,
};
pub use events::{PhysicsEvent, PhysicsEventQueue};
pub use manifold::{AddingPolicy, CONTACT_BREAKING_THRESHOLD, ContactFrame, Manifold, ManifoldPoint};
pub use mass::{Inertia, Mass, MassOverride};
pub use node::{NodeActions, NodeTree, PhysicsNode, WorldTransform};
pub use query::{
    CastFilter, CastFilterFlags, CastFilterState, CastResult, CastResults, Frustum, Plane, Ray,
};
pub use region::Region;
pub use shape::{Aabb, HeightMapShape, MassProperties, PhysicsMesh, Shape, Triangle};
pub use solver::{JointConfig, PositionCorrectionMethod, SolverConfig, WeldJoint};
pub use space::{PhysicsSpace, SpaceConfig};
pub use spring::{Anchor, PointMass, SpringSortOrder, SpringSystem, SystemConnection};
