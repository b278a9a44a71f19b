//! BSP brush and curved-surface collision tracing.
//!
//! Given a precompiled collision world (a BSP tree over convex brushes and
//! patch facet sets) this crate answers two queries: is a volume in solid at
//! a point, and where does a swept volume first hit something. The moving
//! volume is an axis-aligned box or a vertical capsule; the struck geometry
//! is the world, an inline submodel, or the built-in capsule model.

#![allow(clippy::too_many_arguments, clippy::collapsible_if,
         clippy::float_cmp, clippy::needless_range_loop,
         clippy::field_reassign_with_default, clippy::manual_clamp,
         clippy::comparison_chain)]

pub mod consistency;
pub mod math;
pub mod model;
pub mod trace;

pub use consistency::{check_trace_consistency, ConsistencyError};
pub use math::Vec3;
pub use model::{
    box_on_plane_side, Brush, BrushSide, ClipHandle, ClipMap, CollisionSurface, Facet,
    InlineModel, Leaf, Node, Plane, SurfaceCollide, SurfaceType, CONTENTS_BODY, CONTENTS_CORPSE,
    CONTENTS_MONSTERCLIP, CONTENTS_PLAYERCLIP, CONTENTS_SOLID, CONTENTS_WATER,
};
pub use trace::{
    Sphere, Trace, TraceContext, TraceType, RADIUS_EPSILON, SURFACE_CLIP_EPSILON,
};
