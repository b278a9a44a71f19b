// model.rs — Collision model data: planes, brushes, patch surfaces, BSP tree

use crate::math::Vec3;
use tracing::warn;

// ============================================================
// Contents bits
// ============================================================

pub const CONTENTS_SOLID: i32 = 1;
pub const CONTENTS_WATER: i32 = 0x20;
pub const CONTENTS_PLAYERCLIP: i32 = 0x10000;
pub const CONTENTS_MONSTERCLIP: i32 = 0x20000;
pub const CONTENTS_BODY: i32 = 0x200_0000;
pub const CONTENTS_CORPSE: i32 = 0x400_0000;

// ============================================================
// Planes
// ============================================================

pub const PLANE_X: u8 = 0;
pub const PLANE_Y: u8 = 1;
pub const PLANE_Z: u8 = 2;
pub const PLANE_NON_AXIAL: u8 = 3;

/// `dist` is the plane equation constant: `dot(normal, p) == dist` for any
/// point p on the plane. `plane_type < 3` only for positive axial normals,
/// which is what the axial fast paths rely on.
#[derive(Debug, Clone, Copy)]
pub struct Plane {
    pub normal: Vec3,
    pub dist: f32,
    pub plane_type: u8,
    pub signbits: u8,
}

impl Default for Plane {
    fn default() -> Self {
        Self {
            normal: [0.0; 3],
            dist: 0.0,
            plane_type: PLANE_X,
            signbits: 0,
        }
    }
}

impl Plane {
    pub fn new(normal: Vec3, dist: f32) -> Self {
        Self {
            normal,
            dist,
            plane_type: plane_type_for_normal(&normal),
            signbits: signbits_for_normal(&normal),
        }
    }
}

pub fn plane_type_for_normal(normal: &Vec3) -> u8 {
    if normal[0] == 1.0 {
        PLANE_X
    } else if normal[1] == 1.0 {
        PLANE_Y
    } else if normal[2] == 1.0 {
        PLANE_Z
    } else {
        PLANE_NON_AXIAL
    }
}

pub fn signbits_for_normal(normal: &Vec3) -> u8 {
    let mut bits = 0;
    for (i, &n) in normal.iter().enumerate() {
        if n < 0.0 {
            bits |= 1 << i;
        }
    }
    bits
}

/// Returns 1 (front), 2 (back), or 3 (crossing) for a box vs. plane test.
pub fn box_on_plane_side(emins: &Vec3, emaxs: &Vec3, p: &Plane) -> i32 {
    // fast axial cases
    if (p.plane_type as usize) < 3 {
        let t = p.plane_type as usize;
        if p.dist <= emins[t] {
            return 1;
        }
        if p.dist >= emaxs[t] {
            return 2;
        }
        return 3;
    }

    // general case: accumulate the nearest and farthest corner distances
    let mut dist1 = 0.0;
    let mut dist2 = 0.0;
    for i in 0..3 {
        if p.signbits & (1 << i) != 0 {
            dist1 += p.normal[i] * emins[i];
            dist2 += p.normal[i] * emaxs[i];
        } else {
            dist1 += p.normal[i] * emaxs[i];
            dist2 += p.normal[i] * emins[i];
        }
    }

    let mut sides = 0;
    if dist1 >= p.dist {
        sides = 1;
    }
    if dist2 < p.dist {
        sides |= 2;
    }
    sides
}

// ============================================================
// Brushes
// ============================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct BrushSide {
    pub plane_idx: usize,
    pub surface_flags: i32,
}

/// Convex intersection of half-spaces. Sides live in the clip map's flat
/// `brush_sides` table. When a brush has six or more sides, the first six
/// are the axial planes in +X -X +Y -Y +Z -Z order and exactly describe
/// `bounds`; position tests skip them and rely on the bounds reject instead.
#[derive(Debug, Clone, Default)]
pub struct Brush {
    pub first_side: usize,
    pub num_sides: usize,
    pub bounds: [Vec3; 2],
    pub contents: i32,
}

// ============================================================
// Patch surfaces
// ============================================================

pub const MAX_PATCH_PLANES: usize = 2048;
pub const MAX_FACETS: usize = 1024;

/// One convex facet of a patch: a surface plane ringed by border planes.
/// The last border is always the mirrored back side of the surface plane
/// and never produces a contact.
#[derive(Debug, Clone, Default)]
pub struct Facet {
    pub surface_plane: usize,
    pub border_planes: Vec<usize>,
    pub border_inward: Vec<bool>,
}

impl Facet {
    pub fn num_borders(&self) -> usize {
        self.border_planes.len()
    }
}

/// Facet decomposition of a curved surface, produced by the patch
/// preprocessor. Opaque input to the tracing kernel.
#[derive(Debug, Clone, Default)]
pub struct SurfaceCollide {
    pub bounds: [Vec3; 2],
    pub planes: Vec<Plane>,
    pub facets: Vec<Facet>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceType {
    Patch,
    TriangleSoup,
    Other,
}

#[derive(Debug, Clone)]
pub struct CollisionSurface {
    pub surface_type: SurfaceType,
    pub contents: i32,
    pub surface_flags: i32,
    pub sc: Option<SurfaceCollide>,
}

// ============================================================
// BSP tree
// ============================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct Node {
    pub plane_idx: usize,
    /// Negative child c is leaf -1 - c.
    pub children: [i32; 2],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Leaf {
    pub first_leaf_brush: usize,
    pub num_leaf_brushes: usize,
    pub first_leaf_surface: usize,
    pub num_leaf_surfaces: usize,
}

/// An inline submodel: its brushes and surfaces gathered into a single leaf.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineModel {
    pub mins: Vec3,
    pub maxs: Vec3,
    pub leaf: Leaf,
}

// ============================================================
// Clip handles
// ============================================================

/// What a trace collides against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipHandle {
    /// The whole static world, via BSP traversal.
    World,
    /// An inline submodel by index.
    Model(usize),
    /// The temp box model, set up by `ClipMap::temp_box_model`.
    Box,
    /// The temp box model treated as a vertical capsule.
    Capsule,
}

// ============================================================
// Temp box model
// ============================================================

/// A single free-standing six-sided axial brush, used for tracing against
/// entity bounding boxes and capsules without registering them in the world
/// tables. Sides index the model's own plane table.
#[derive(Debug, Clone)]
pub struct BoxModel {
    pub planes: [Plane; 6],
    pub sides: [BrushSide; 6],
    pub brush: Brush,
}

impl BoxModel {
    pub fn new(mins: &Vec3, maxs: &Vec3) -> Self {
        let mut m = Self {
            planes: [Plane::default(); 6],
            sides: [BrushSide::default(); 6],
            brush: Brush {
                first_side: 0,
                num_sides: 6,
                bounds: [[0.0; 3]; 2],
                contents: CONTENTS_BODY,
            },
        };
        for i in 0..6 {
            m.sides[i].plane_idx = i;
        }
        m.set_bounds(mins, maxs);
        m
    }

    pub fn set_bounds(&mut self, mins: &Vec3, maxs: &Vec3) {
        for axis in 0..3 {
            let mut normal = [0.0; 3];
            normal[axis] = 1.0;
            self.planes[axis * 2] = Plane::new(normal, maxs[axis]);
            normal[axis] = -1.0;
            self.planes[axis * 2 + 1] = Plane::new(normal, -mins[axis]);
        }
        self.brush.bounds = [*mins, *maxs];
    }
}

impl Default for BoxModel {
    fn default() -> Self {
        Self::new(&[0.0; 3], &[0.0; 3])
    }
}

// ============================================================
// Clip map
// ============================================================

/// The loaded collision world. Geometry is immutable while tracing; all
/// per-trace scratch (checkcount stamps, patch plane buffers, statistics)
/// lives in `trace::TraceContext`.
#[derive(Debug, Clone, Default)]
pub struct ClipMap {
    pub planes: Vec<Plane>,
    pub brush_sides: Vec<BrushSide>,
    pub brushes: Vec<Brush>,
    pub surfaces: Vec<Option<CollisionSurface>>,
    pub nodes: Vec<Node>,
    pub leafs: Vec<Leaf>,
    pub leaf_brushes: Vec<u32>,
    pub leaf_surfaces: Vec<u32>,
    pub inline_models: Vec<InlineModel>,

    pub box_model: BoxModel,

    /// Baked per-map property: triangle soups carry collision geometry.
    pub per_poly_collision: bool,
    /// Treat patches as empty space.
    pub no_curves: bool,
    /// Test triangle soups even when per_poly_collision is off.
    pub force_triangles: bool,
}

impl ClipMap {
    /// Sets up the temp box model for the given bounds and returns its
    /// handle. With `capsule` set, the box is interpreted as a vertical
    /// capsule by the trace dispatch.
    pub fn temp_box_model(&mut self, mins: &Vec3, maxs: &Vec3, capsule: bool) -> ClipHandle {
        self.box_model.set_bounds(mins, maxs);
        if capsule {
            ClipHandle::Capsule
        } else {
            ClipHandle::Box
        }
    }

    pub fn model_bounds(&self, model: ClipHandle) -> (Vec3, Vec3) {
        match model {
            ClipHandle::World => {
                if let Some(world) = self.inline_models.first() {
                    (world.mins, world.maxs)
                } else {
                    ([0.0; 3], [0.0; 3])
                }
            }
            ClipHandle::Model(idx) => (self.inline_models[idx].mins, self.inline_models[idx].maxs),
            ClipHandle::Box | ClipHandle::Capsule => {
                (self.box_model.brush.bounds[0], self.box_model.brush.bounds[1])
            }
        }
    }

    // ============================================================
    // Box leaf enumeration
    // ============================================================

    fn box_leafnums_r(
        &self,
        mut nodenum: i32,
        mins: &Vec3,
        maxs: &Vec3,
        list: &mut Vec<usize>,
        max_count: usize,
        topnode: &mut i32,
        overflowed: &mut bool,
    ) {
        loop {
            if nodenum < 0 {
                if list.len() >= max_count {
                    *overflowed = true;
                    return;
                }
                list.push((-1 - nodenum) as usize);
                return;
            }

            let node = &self.nodes[nodenum as usize];
            let plane = &self.planes[node.plane_idx];
            let s = box_on_plane_side(mins, maxs, plane);

            if s == 1 {
                nodenum = node.children[0];
            } else if s == 2 {
                nodenum = node.children[1];
            } else {
                if *topnode == -1 {
                    *topnode = nodenum;
                }
                self.box_leafnums_r(
                    node.children[0],
                    mins,
                    maxs,
                    list,
                    max_count,
                    topnode,
                    overflowed,
                );
                nodenum = node.children[1];
            }
        }
    }

    /// Collects the leafs an AABB touches, capped at `max_count`. Returns
    /// the list and the topmost node that splits the box (-1 if the box is
    /// on one side of every plane it met).
    pub fn box_leafnums(&self, mins: &Vec3, maxs: &Vec3, max_count: usize) -> (Vec<usize>, i32) {
        let mut list = Vec::with_capacity(max_count.min(64));
        let mut topnode = -1;
        let mut overflowed = false;
        if !self.nodes.is_empty() {
            self.box_leafnums_r(0, mins, maxs, &mut list, max_count, &mut topnode, &mut overflowed);
        }
        if overflowed {
            warn!(max_count, "box_leafnums: leaf list overflowed");
        }
        (list, topnode)
    }
}
