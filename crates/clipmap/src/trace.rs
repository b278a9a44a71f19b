// trace.rs — Sweep and position queries against the collision model

use crate::math::{
    dot_product, square, vector_add, vector_compare, vector_length, vector_length_squared,
    vector_lerp, vector_ma, vector_negate, vector_normalize, vector_scale, vector_subtract,
    Vec3, VEC3_ORIGIN,
};
use crate::model::{
    BoxModel, Brush, BrushSide, ClipHandle, ClipMap, CollisionSurface, Leaf, Plane,
    SurfaceCollide, SurfaceType, CONTENTS_BODY, MAX_PATCH_PLANES,
};
use tracing::debug;

/// Contact planes are pushed off struck geometry by this much so that
/// follow-up traces started from an endpos do not re-collide immediately.
pub const SURFACE_CLIP_EPSILON: f32 = 0.125;

/// Swept spheres and cylinders are inflated by this much.
pub const RADIUS_EPSILON: f32 = 1.0;

const MAX_POSITION_LEAFS: usize = 1024;

// ============================================================
// Trace results and per-trace state
// ============================================================

/// Shape of the moving volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceType {
    #[default]
    Aabb,
    Capsule,
}

/// Capsule parameters: a sphere of `radius` swept between
/// `center - offset` and `center + offset`; `halfheight` is the full
/// half-extent along the capsule axis.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sphere {
    pub radius: f32,
    pub halfheight: f32,
    pub offset: Vec3,
}

/// Result of a trace. `plane` is only meaningful when
/// `fraction < 1 && !allsolid`; only its normal and dist are filled in.
#[derive(Debug, Clone)]
pub struct Trace {
    pub allsolid: bool,
    pub startsolid: bool,
    pub fraction: f32,
    pub endpos: Vec3,
    pub plane: Plane,
    pub surface_flags: i32,
    pub contents: i32,
}

impl Default for Trace {
    fn default() -> Self {
        Self {
            allsolid: false,
            startsolid: false,
            fraction: 1.0,
            endpos: [0.0; 3],
            plane: Plane::default(),
            surface_flags: 0,
            contents: 0,
        }
    }
}

/// Per-thread trace scratch. The geometry tables are immutable and shared;
/// everything a trace mutates besides its own `TraceWork` lives here: the
/// checkcount stamps that keep a brush or surface from being tested twice
/// when it spans several leafs, the point-trace patch buffers, and the
/// statistics counters.
#[derive(Debug, Clone, Default)]
pub struct TraceContext {
    checkcount: u32,
    brush_checked: Vec<u32>,
    surface_checked: Vec<u32>,
    front_facing: Vec<bool>,
    intersection: Vec<f32>,

    pub c_traces: u32,
    pub c_brush_traces: u32,
    pub c_patch_traces: u32,
    pub c_trisoup_traces: u32,
}

impl TraceContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin_trace(&mut self, cm: &ClipMap) {
        if self.brush_checked.len() < cm.brushes.len() {
            self.brush_checked.resize(cm.brushes.len(), 0);
        }
        if self.surface_checked.len() < cm.surfaces.len() {
            self.surface_checked.resize(cm.surfaces.len(), 0);
        }
        self.checkcount = self.checkcount.wrapping_add(1);
        self.c_traces += 1;
    }
}

/// Working state for one trace, stack-scoped to the query.
#[derive(Debug, Clone, Default)]
struct TraceWork {
    start: Vec3,
    end: Vec3,
    /// size[0] = mins, size[1] = maxs, made symmetric by the driver
    size: [Vec3; 2],
    /// offsets[signbits] = corner of the volume for plane sidedness tests
    offsets: [Vec3; 8],
    max_offset: f32,
    extents: Vec3,
    bounds: [Vec3; 2],
    model_origin: Vec3,
    contents: i32,
    skip_contents: i32,
    is_point: bool,
    trace_type: TraceType,
    sphere: Sphere,
    trace: Trace,
}

// ============================================================
// Basic math
// ============================================================

fn rotate_point(point: &mut Vec3, matrix: &[Vec3; 3]) {
    let tvec = *point;
    point[0] = dot_product(&matrix[0], &tvec);
    point[1] = dot_product(&matrix[1], &tvec);
    point[2] = dot_product(&matrix[2], &tvec);
}

fn transpose_matrix(matrix: &[Vec3; 3]) -> [Vec3; 3] {
    let mut transpose = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            transpose[i][j] = matrix[j][i];
        }
    }
    transpose
}

/// Rotation matrix for Euler angles; the middle row is negated so the rows
/// form the engine's forward/left/up basis.
fn create_rotation_matrix(angles: &Vec3) -> [Vec3; 3] {
    let (forward, right, up) = crate::math::angle_vectors(angles);
    [forward, vector_negate(&right), up]
}

fn project_point_onto_vector(point: &Vec3, v_start: &Vec3, v_dir: &Vec3) -> Vec3 {
    let p_vec = vector_subtract(point, v_start);
    vector_ma(v_start, dot_product(&p_vec, v_dir), v_dir)
}

/// Squared distance from p to the segment [lp1, lp2] with direction `dir`.
fn distance_from_line_squared(p: &Vec3, lp1: &Vec3, lp2: &Vec3, dir: &Vec3) -> f32 {
    let proj = project_point_onto_vector(p, lp1, dir);
    for j in 0..3 {
        if (proj[j] > lp1[j] && proj[j] > lp2[j]) || (proj[j] < lp1[j] && proj[j] < lp2[j]) {
            let t = if (proj[j] - lp1[j]).abs() < (proj[j] - lp2[j]).abs() {
                vector_subtract(p, lp1)
            } else {
                vector_subtract(p, lp2)
            };
            return vector_length_squared(&t);
        }
    }
    vector_length_squared(&vector_subtract(p, &proj))
}

fn bounds_intersect(mins: &Vec3, maxs: &Vec3, mins2: &Vec3, maxs2: &Vec3) -> bool {
    !(maxs[0] < mins2[0] - SURFACE_CLIP_EPSILON
        || maxs[1] < mins2[1] - SURFACE_CLIP_EPSILON
        || maxs[2] < mins2[2] - SURFACE_CLIP_EPSILON
        || mins[0] > maxs2[0] + SURFACE_CLIP_EPSILON
        || mins[1] > maxs2[1] + SURFACE_CLIP_EPSILON
        || mins[2] > maxs2[2] + SURFACE_CLIP_EPSILON)
}

// ============================================================
// Position testing
// ============================================================

fn test_box_in_brush(tw: &mut TraceWork, brush: &Brush, sides: &[BrushSide], planes: &[Plane]) {
    if sides.is_empty() {
        return;
    }

    // special test for axial: the first six brush planes are always axial
    // and are fully covered by the bounds reject
    if tw.bounds[0][0] > brush.bounds[1][0]
        || tw.bounds[0][1] > brush.bounds[1][1]
        || tw.bounds[0][2] > brush.bounds[1][2]
        || tw.bounds[1][0] < brush.bounds[0][0]
        || tw.bounds[1][1] < brush.bounds[0][1]
        || tw.bounds[1][2] < brush.bounds[0][2]
    {
        return;
    }

    if tw.trace_type == TraceType::Capsule {
        for side in sides.iter().skip(6) {
            let plane = &planes[side.plane_idx];

            // adjust the plane distance appropriately for radius
            let dist = plane.dist + tw.sphere.radius;
            // find the closest point on the capsule to the plane
            let t = dot_product(&plane.normal, &tw.sphere.offset);
            let startp = if t > 0.0 {
                vector_subtract(&tw.start, &tw.sphere.offset)
            } else {
                vector_add(&tw.start, &tw.sphere.offset)
            };

            // if completely in front of face, no intersection
            if dot_product(&startp, &plane.normal) - dist > 0.0 {
                return;
            }
        }
    } else {
        for side in sides.iter().skip(6) {
            let plane = &planes[side.plane_idx];

            // adjust the plane distance appropriately for mins/maxs
            let dist = plane.dist
                - dot_product(&tw.offsets[plane.signbits as usize], &plane.normal);

            if dot_product(&tw.start, &plane.normal) - dist > 0.0 {
                return;
            }
        }
    }

    // inside this brush
    tw.trace.startsolid = true;
    tw.trace.allsolid = true;
    tw.trace.fraction = 0.0;
    tw.trace.contents = brush.contents;
}

fn position_test_in_surface_collide(tw: &TraceWork, sc: &SurfaceCollide) -> bool {
    if tw.is_point {
        return false;
    }

    'facets: for facet in &sc.facets {
        let pp = &sc.planes[facet.surface_plane];
        let mut normal = pp.normal;
        let mut dist = pp.dist;
        let startp;

        if tw.trace_type == TraceType::Capsule {
            dist += tw.sphere.radius;
            let t = dot_product(&normal, &tw.sphere.offset);
            startp = if t > 0.0 {
                vector_subtract(&tw.start, &tw.sphere.offset)
            } else {
                vector_add(&tw.start, &tw.sphere.offset)
            };
        } else {
            dist -= dot_product(&tw.offsets[pp.signbits as usize], &normal);
            startp = tw.start;
        }

        if dot_product(&normal, &startp) - dist > 0.0 {
            continue;
        }

        for j in 0..facet.num_borders() {
            let bp = &sc.planes[facet.border_planes[j]];
            if facet.border_inward[j] {
                normal = vector_negate(&bp.normal);
                dist = -bp.dist;
            } else {
                normal = bp.normal;
                dist = bp.dist;
            }

            let startp = if tw.trace_type == TraceType::Capsule {
                dist += tw.sphere.radius;
                let t = dot_product(&normal, &tw.sphere.offset);
                if t > 0.0 {
                    vector_subtract(&tw.start, &tw.sphere.offset)
                } else {
                    vector_add(&tw.start, &tw.sphere.offset)
                }
            } else {
                // works even though the plane might be flipped because the
                // box is centered
                let offset = dot_product(&tw.offsets[bp.signbits as usize], &normal);
                dist += offset.abs();
                tw.start
            };

            if dot_product(&normal, &startp) - dist > 0.0 {
                continue 'facets;
            }
        }

        // inside this patch facet
        return true;
    }

    false
}

// ============================================================
// Brush sweeps
// ============================================================

/// Clips the working volume's path against one convex brush, keeping the
/// latest entry and the earliest exit across all sides.
fn trace_through_brush(
    tw: &mut TraceWork,
    ctx: &mut TraceContext,
    brush: &Brush,
    sides: &[BrushSide],
    planes: &[Plane],
) {
    if sides.is_empty() {
        return;
    }

    ctx.c_brush_traces += 1;

    let mut enter_frac = -1.0f32;
    let mut leave_frac = 1.0f32;
    let mut getout = false;
    let mut startout = false;
    let mut clip_plane: Option<Plane> = None;
    let mut lead_side_flags = 0;

    for side in sides {
        let plane = &planes[side.plane_idx];

        let (d1, d2);
        if tw.trace_type == TraceType::Capsule {
            // adjust the plane distance appropriately for radius
            let dist = plane.dist + tw.sphere.radius;

            // find the closest point on the capsule to the plane
            let t = dot_product(&plane.normal, &tw.sphere.offset);
            let (startp, endp) = if t > 0.0 {
                (
                    vector_subtract(&tw.start, &tw.sphere.offset),
                    vector_subtract(&tw.end, &tw.sphere.offset),
                )
            } else {
                (
                    vector_add(&tw.start, &tw.sphere.offset),
                    vector_add(&tw.end, &tw.sphere.offset),
                )
            };

            d1 = dot_product(&startp, &plane.normal) - dist;
            d2 = dot_product(&endp, &plane.normal) - dist;
        } else {
            // adjust the plane distance appropriately for mins/maxs
            let dist = plane.dist
                - dot_product(&tw.offsets[plane.signbits as usize], &plane.normal);

            d1 = dot_product(&tw.start, &plane.normal) - dist;
            d2 = dot_product(&tw.end, &plane.normal) - dist;
        }

        if d2 > 0.0 {
            getout = true; // endpoint is not in solid
        }
        if d1 > 0.0 {
            startout = true;
        }

        // if completely in front of face, no intersection with the entire brush
        if d1 > 0.0 && (d2 >= SURFACE_CLIP_EPSILON || d2 >= d1) {
            return;
        }

        // if it doesn't cross the plane, the plane isn't relevant
        if d1 <= 0.0 && d2 <= 0.0 {
            continue;
        }

        if d1 > d2 {
            // enter
            let mut f = (d1 - SURFACE_CLIP_EPSILON) / (d1 - d2);
            if f < 0.0 {
                f = 0.0;
            }
            if f > enter_frac {
                enter_frac = f;
                clip_plane = Some(*plane);
                lead_side_flags = side.surface_flags;
            }
        } else {
            // leave
            let mut f = (d1 + SURFACE_CLIP_EPSILON) / (d1 - d2);
            if f > 1.0 {
                f = 1.0;
            }
            if f < leave_frac {
                leave_frac = f;
            }
        }
    }

    if !startout {
        // original point was inside brush
        tw.trace.startsolid = true;
        if !getout {
            tw.trace.allsolid = true;
            tw.trace.fraction = 0.0;
            tw.trace.contents = brush.contents;
        }
        return;
    }

    if enter_frac < leave_frac && enter_frac > -1.0 && enter_frac < tw.trace.fraction {
        if enter_frac < 0.0 {
            enter_frac = 0.0;
        }
        if let Some(plane) = clip_plane {
            tw.trace.fraction = enter_frac;
            tw.trace.plane.normal = plane.normal;
            tw.trace.plane.dist = plane.dist;
            tw.trace.surface_flags = lead_side_flags;
            tw.trace.contents = brush.contents;
        }
    }
}

// ============================================================
// Patch surface sweeps
// ============================================================

/// Special case for point traces because the facets have no volume; uses
/// per-plane state precomputed once for the whole surface.
fn trace_point_through_surface_collide(
    tw: &mut TraceWork,
    ctx: &mut TraceContext,
    sc: &SurfaceCollide,
) {
    if !tw.is_point {
        return;
    }

    debug_assert!(sc.planes.len() <= MAX_PATCH_PLANES);

    // determine the trace's relationship to all planes
    ctx.front_facing.clear();
    ctx.front_facing.resize(sc.planes.len(), false);
    ctx.intersection.clear();
    ctx.intersection.resize(sc.planes.len(), 0.0);

    for (i, plane) in sc.planes.iter().enumerate() {
        let offset = dot_product(&tw.offsets[plane.signbits as usize], &plane.normal);
        let d1 = dot_product(&tw.start, &plane.normal) - plane.dist + offset;
        let d2 = dot_product(&tw.end, &plane.normal) - plane.dist + offset;

        ctx.front_facing[i] = d1 > 0.0;

        if d1 == d2 {
            ctx.intersection[i] = 99999.0;
        } else {
            let f = d1 / (d1 - d2);
            ctx.intersection[i] = if f <= 0.0 { 99999.0 } else { f };
        }
    }

    // see if any of the surface planes are intersected
    for facet in &sc.facets {
        if !ctx.front_facing[facet.surface_plane] {
            continue;
        }

        let intersect = ctx.intersection[facet.surface_plane];
        if intersect < 0.0 {
            continue; // surface is behind the starting point
        }
        if intersect > tw.trace.fraction {
            continue; // already hit something closer
        }

        let mut inside = true;
        for j in 0..facet.num_borders() {
            let k = facet.border_planes[j];
            if ctx.front_facing[k] != facet.border_inward[j] {
                if ctx.intersection[k] > intersect {
                    inside = false;
                    break;
                }
            } else if ctx.intersection[k] < intersect {
                inside = false;
                break;
            }
        }
        if !inside {
            continue;
        }

        // calculate intersection with a slight pushoff
        let plane = &sc.planes[facet.surface_plane];
        let offset = dot_product(&tw.offsets[plane.signbits as usize], &plane.normal);
        let d1 = dot_product(&tw.start, &plane.normal) - plane.dist + offset;
        let d2 = dot_product(&tw.end, &plane.normal) - plane.dist + offset;

        let mut fraction = (d1 - SURFACE_CLIP_EPSILON) / (d1 - d2);
        if fraction < 0.0 {
            fraction = 0.0;
        }
        tw.trace.fraction = fraction;
        tw.trace.plane.normal = plane.normal;
        tw.trace.plane.dist = plane.dist;
    }
}

/// Returns false if the segment is wholly in front of the plane (the facet
/// cannot be hit at all). `hit` is set when the entry fraction advanced.
fn check_facet_plane(
    normal: &Vec3,
    dist: f32,
    start: &Vec3,
    end: &Vec3,
    enter_frac: &mut f32,
    leave_frac: &mut f32,
    hit: &mut bool,
) -> bool {
    *hit = false;

    let d1 = dot_product(start, normal) - dist;
    let d2 = dot_product(end, normal) - dist;

    // if completely in front of face, no intersection with the entire facet
    if d1 > 0.0 && (d2 >= SURFACE_CLIP_EPSILON || d2 >= d1) {
        return false;
    }

    // if it doesn't cross the plane, the plane isn't relevant
    if d1 <= 0.0 && d2 <= 0.0 {
        return true;
    }

    if d1 > d2 {
        // enter
        let mut f = (d1 - SURFACE_CLIP_EPSILON) / (d1 - d2);
        if f < 0.0 {
            f = 0.0;
        }
        // always favor previous plane hits and thus also the surface plane hit
        if f > *enter_frac {
            *enter_frac = f;
            *hit = true;
        }
    } else {
        // leave
        let mut f = (d1 + SURFACE_CLIP_EPSILON) / (d1 - d2);
        if f > 1.0 {
            f = 1.0;
        }
        if f < *leave_frac {
            *leave_frac = f;
        }
    }

    true
}

fn trace_through_surface_collide(tw: &mut TraceWork, ctx: &mut TraceContext, sc: &SurfaceCollide) {
    if !bounds_intersect(&tw.bounds[0], &tw.bounds[1], &sc.bounds[0], &sc.bounds[1]) {
        return;
    }

    if tw.is_point {
        trace_point_through_surface_collide(tw, ctx, sc);
        return;
    }

    let mut best_normal = [0.0; 3];
    let mut best_dist = 0.0;

    'facets: for facet in &sc.facets {
        let mut enter_frac = -1.0f32;
        let mut leave_frac = 1.0f32;
        let mut hitnum: i32 = -1;

        let pp = &sc.planes[facet.surface_plane];
        let mut normal = pp.normal;
        let mut dist = pp.dist;
        let (startp, endp);

        if tw.trace_type == TraceType::Capsule {
            // adjust the plane distance appropriately for radius
            dist += tw.sphere.radius;

            // find the closest point on the capsule to the plane
            let t = dot_product(&normal, &tw.sphere.offset);
            if t > 0.0 {
                startp = vector_subtract(&tw.start, &tw.sphere.offset);
                endp = vector_subtract(&tw.end, &tw.sphere.offset);
            } else {
                startp = vector_add(&tw.start, &tw.sphere.offset);
                endp = vector_add(&tw.end, &tw.sphere.offset);
            }
        } else {
            dist -= dot_product(&tw.offsets[pp.signbits as usize], &normal);
            startp = tw.start;
            endp = tw.end;
        }

        let mut hit = false;
        if !check_facet_plane(
            &normal, dist, &startp, &endp, &mut enter_frac, &mut leave_frac, &mut hit,
        ) {
            continue;
        }
        if hit {
            best_normal = normal;
            best_dist = dist;
        }

        for j in 0..facet.num_borders() {
            let bp = &sc.planes[facet.border_planes[j]];
            if facet.border_inward[j] {
                normal = vector_negate(&bp.normal);
                dist = -bp.dist;
            } else {
                normal = bp.normal;
                dist = bp.dist;
            }

            let (startp, endp);
            if tw.trace_type == TraceType::Capsule {
                dist += tw.sphere.radius;
                let t = dot_product(&normal, &tw.sphere.offset);
                if t > 0.0 {
                    startp = vector_subtract(&tw.start, &tw.sphere.offset);
                    endp = vector_subtract(&tw.end, &tw.sphere.offset);
                } else {
                    startp = vector_add(&tw.start, &tw.sphere.offset);
                    endp = vector_add(&tw.end, &tw.sphere.offset);
                }
            } else {
                // works even though the plane might be flipped because the
                // box is centered
                let offset = dot_product(&tw.offsets[bp.signbits as usize], &normal);
                dist += offset.abs();
                startp = tw.start;
                endp = tw.end;
            }

            if !check_facet_plane(
                &normal, dist, &startp, &endp, &mut enter_frac, &mut leave_frac, &mut hit,
            ) {
                continue 'facets;
            }
            if hit {
                hitnum = j as i32;
                best_normal = normal;
                best_dist = dist;
            }
        }

        // never clip against the back side
        if hitnum == facet.num_borders() as i32 - 1 {
            continue;
        }

        if enter_frac < leave_frac && enter_frac >= 0.0 && enter_frac < tw.trace.fraction {
            tw.trace.fraction = enter_frac;
            tw.trace.plane.normal = best_normal;
            tw.trace.plane.dist = best_dist;
        }
    }
}

// ============================================================
// Capsule primitives
// ============================================================

/// First intersection of the swept path with a sphere.
fn trace_through_sphere(
    tw: &mut TraceWork,
    origin: &Vec3,
    radius: f32,
    start: &Vec3,
    end: &Vec3,
) {
    // if inside the sphere
    let mut dir = vector_subtract(start, origin);
    if vector_length_squared(&dir) < square(radius) {
        tw.trace.fraction = 0.0;
        tw.trace.startsolid = true;
        // test for allsolid
        dir = vector_subtract(end, origin);
        if vector_length_squared(&dir) < square(radius) {
            tw.trace.allsolid = true;
        }
        return;
    }

    let mut dir = vector_subtract(end, start);
    let length = vector_normalize(&mut dir);

    let l1 = distance_from_line_squared(origin, start, end, &dir);
    let l2 = vector_length_squared(&vector_subtract(end, origin));

    // if no intersection with the sphere and the end point is at least an
    // epsilon away
    if l1 >= square(radius) && l2 > square(radius + SURFACE_CLIP_EPSILON) {
        return;
    }

    // | origin - (start + t * dir) | = radius
    // dir is normalized so a = 1
    let v1 = vector_subtract(start, origin);
    let b = 2.0 * dot_product(&dir, &v1);
    let c = vector_length_squared(&v1) - square(radius + RADIUS_EPSILON);

    let d = b * b - 4.0 * c;
    if d > 0.0 {
        let sqrtd = d.sqrt();
        let mut fraction = (-b - sqrtd) * 0.5;
        if fraction < 0.0 {
            fraction = 0.0;
        } else {
            fraction /= length;
        }

        if fraction < tw.trace.fraction {
            tw.trace.fraction = fraction;
            let dir = vector_subtract(end, start);
            let intersection = vector_ma(start, fraction, &dir);
            let mut normal = vector_subtract(&intersection, origin);
            normal = vector_scale(&normal, 1.0 / (radius + RADIUS_EPSILON));
            tw.trace.plane.normal = normal;
            let intersection = vector_add(&tw.model_origin, &intersection);
            tw.trace.plane.dist = dot_product(&normal, &intersection);
            tw.trace.contents = CONTENTS_BODY;
        }
    } else if d == 0.0 {
        // slide along the sphere
    }
    // no intersection at all
}

/// First intersection of the swept path with a vertical cylinder extending
/// `halfheight` above and below the origin.
fn trace_through_vertical_cylinder(
    tw: &mut TraceWork,
    origin: &Vec3,
    radius: f32,
    halfheight: f32,
    start: &Vec3,
    end: &Vec3,
) {
    // 2d coordinates
    let start2d = [start[0], start[1], 0.0];
    let end2d = [end[0], end[1], 0.0];
    let org2d = [origin[0], origin[1], 0.0];

    // if between lower and upper cylinder bounds
    if start[2] <= origin[2] + halfheight && start[2] >= origin[2] - halfheight {
        // if inside the cylinder
        let dir = vector_subtract(&start2d, &org2d);
        if vector_length_squared(&dir) < square(radius) {
            tw.trace.fraction = 0.0;
            tw.trace.startsolid = true;
            let dir = vector_subtract(&end2d, &org2d);
            if vector_length_squared(&dir) < square(radius) {
                tw.trace.allsolid = true;
            }
            return;
        }
    }

    let mut dir = vector_subtract(&end2d, &start2d);
    let length = vector_normalize(&mut dir);

    let l1 = distance_from_line_squared(&org2d, &start2d, &end2d, &dir);
    let l2 = vector_length_squared(&vector_subtract(&end2d, &org2d));

    // if no intersection with the cylinder and the end point is at least an
    // epsilon away
    if l1 >= square(radius) && l2 > square(radius + SURFACE_CLIP_EPSILON) {
        return;
    }

    // (v1[0] + t * dir[0])^2 + (v1[1] + t * dir[1])^2 = radius^2
    // dir is normalized so a = 1
    let v1 = vector_subtract(start, origin);
    let b = 2.0 * (v1[0] * dir[0] + v1[1] * dir[1]);
    let c = v1[0] * v1[0] + v1[1] * v1[1] - square(radius + RADIUS_EPSILON);

    let d = b * b - 4.0 * c;
    if d > 0.0 {
        let sqrtd = d.sqrt();
        let mut fraction = (-b - sqrtd) * 0.5;
        if fraction < 0.0 {
            fraction = 0.0;
        } else {
            fraction /= length;
        }

        if fraction < tw.trace.fraction {
            let dir = vector_subtract(end, start);
            let intersection = vector_ma(start, fraction, &dir);

            // if the intersection is between the cylinder's lower and upper bound
            if intersection[2] <= origin[2] + halfheight
                && intersection[2] >= origin[2] - halfheight
            {
                tw.trace.fraction = fraction;
                let mut normal = vector_subtract(&intersection, origin);
                normal[2] = 0.0;
                normal = vector_scale(&normal, 1.0 / (radius + RADIUS_EPSILON));
                tw.trace.plane.normal = normal;
                let intersection = vector_add(&tw.model_origin, &intersection);
                tw.trace.plane.dist = dot_product(&normal, &intersection);
                tw.trace.contents = CONTENTS_BODY;
            }
        }
    } else if d == 0.0 {
        // slide along the cylinder
    }
    // no intersection at all
}

// ============================================================
// Symmetric size helper
// ============================================================

fn symmetric_size(mins: &Vec3, maxs: &Vec3) -> (Vec3, [Vec3; 2]) {
    let offset = vector_scale(&vector_add(mins, maxs), 0.5);
    let size = [vector_subtract(mins, &offset), vector_subtract(maxs, &offset)];
    (offset, size)
}

// ============================================================
// Clip map queries
// ============================================================

impl ClipMap {
    // ------------------------------------------------------------
    // Leaf iteration
    // ------------------------------------------------------------

    fn test_in_leaf(&self, tw: &mut TraceWork, ctx: &mut TraceContext, leaf: &Leaf) {
        // test box position against all brushes in the leaf
        for k in 0..leaf.num_leaf_brushes {
            let brushnum = self.leaf_brushes[leaf.first_leaf_brush + k] as usize;
            if ctx.brush_checked[brushnum] == ctx.checkcount {
                continue; // already checked this brush in another leaf
            }
            ctx.brush_checked[brushnum] = ctx.checkcount;

            let b = &self.brushes[brushnum];
            if b.contents & tw.contents == 0 {
                continue;
            }
            if b.contents & tw.skip_contents != 0 {
                continue;
            }

            let sides = &self.brush_sides[b.first_side..b.first_side + b.num_sides];
            test_box_in_brush(tw, b, sides, &self.planes);
            if tw.trace.allsolid {
                return;
            }
        }

        // test against all surfaces
        for k in 0..leaf.num_leaf_surfaces {
            let surfnum = self.leaf_surfaces[leaf.first_leaf_surface + k] as usize;
            let Some(surface) = self.surfaces[surfnum].as_ref() else {
                continue;
            };
            if ctx.surface_checked[surfnum] == ctx.checkcount {
                continue; // already checked this surface in another leaf
            }
            ctx.surface_checked[surfnum] = ctx.checkcount;

            if surface.contents & tw.contents == 0 {
                continue;
            }
            if surface.contents & tw.skip_contents != 0 {
                continue;
            }

            if self.position_test_in_surface(tw, surface) {
                tw.trace.startsolid = true;
                tw.trace.allsolid = true;
                tw.trace.fraction = 0.0;
                tw.trace.contents = surface.contents;
                return;
            }
        }
    }

    fn position_test_in_surface(&self, tw: &TraceWork, surface: &CollisionSurface) -> bool {
        let Some(sc) = surface.sc.as_ref() else {
            return false;
        };
        if !self.no_curves && surface.surface_type == SurfaceType::Patch {
            if position_test_in_surface_collide(tw, sc) {
                return true;
            }
        }
        if (self.per_poly_collision || self.force_triangles)
            && surface.surface_type == SurfaceType::TriangleSoup
            && position_test_in_surface_collide(tw, sc)
        {
            return true;
        }
        false
    }

    fn trace_through_surface(
        &self,
        tw: &mut TraceWork,
        ctx: &mut TraceContext,
        surface: &CollisionSurface,
    ) {
        let old_frac = tw.trace.fraction;

        if let Some(sc) = surface.sc.as_ref() {
            if !self.no_curves && surface.surface_type == SurfaceType::Patch {
                trace_through_surface_collide(tw, ctx, sc);
                ctx.c_patch_traces += 1;
            }
            if (self.per_poly_collision || self.force_triangles)
                && surface.surface_type == SurfaceType::TriangleSoup
            {
                trace_through_surface_collide(tw, ctx, sc);
                ctx.c_trisoup_traces += 1;
            }
        }

        if tw.trace.fraction < old_frac {
            tw.trace.surface_flags = surface.surface_flags;
            tw.trace.contents = surface.contents;
        }
    }

    fn trace_through_leaf(&self, tw: &mut TraceWork, ctx: &mut TraceContext, leaf: &Leaf) {
        // trace line against all brushes in the leaf
        for k in 0..leaf.num_leaf_brushes {
            let brushnum = self.leaf_brushes[leaf.first_leaf_brush + k] as usize;
            if ctx.brush_checked[brushnum] == ctx.checkcount {
                continue; // already checked this brush in another leaf
            }
            ctx.brush_checked[brushnum] = ctx.checkcount;

            let b = &self.brushes[brushnum];
            if b.contents & tw.contents == 0 {
                continue;
            }
            if b.contents & tw.skip_contents != 0 {
                continue;
            }
            if !bounds_intersect(&tw.bounds[0], &tw.bounds[1], &b.bounds[0], &b.bounds[1]) {
                continue;
            }

            let sides = &self.brush_sides[b.first_side..b.first_side + b.num_sides];
            trace_through_brush(tw, ctx, b, sides, &self.planes);
            if tw.trace.allsolid {
                return;
            }
        }

        // surfaces never set startsolid/allsolid, so a zero fraction is final
        if tw.trace.fraction == 0.0 {
            return;
        }

        // trace line against all surfaces in the leaf
        for k in 0..leaf.num_leaf_surfaces {
            let surfnum = self.leaf_surfaces[leaf.first_leaf_surface + k] as usize;
            let Some(surface) = self.surfaces[surfnum].as_ref() else {
                continue;
            };
            if ctx.surface_checked[surfnum] == ctx.checkcount {
                continue; // already checked this surface in another leaf
            }
            ctx.surface_checked[surfnum] = ctx.checkcount;

            if surface.contents & tw.contents == 0 {
                continue;
            }
            if surface.contents & tw.skip_contents != 0 {
                continue;
            }
            let Some(sc) = surface.sc.as_ref() else {
                continue;
            };
            if !bounds_intersect(&tw.bounds[0], &tw.bounds[1], &sc.bounds[0], &sc.bounds[1]) {
                continue;
            }

            self.trace_through_surface(tw, ctx, surface);
            if tw.trace.fraction == 0.0 {
                return;
            }
        }
    }

    // ------------------------------------------------------------
    // Temp box model
    // ------------------------------------------------------------

    fn test_in_box_model(&self, tw: &mut TraceWork) {
        let bm = &self.box_model;
        if bm.brush.contents & tw.contents == 0 {
            return;
        }
        if bm.brush.contents & tw.skip_contents != 0 {
            return;
        }
        test_box_in_brush(tw, &bm.brush, &bm.sides, &bm.planes);
    }

    fn trace_through_box_model(&self, tw: &mut TraceWork, ctx: &mut TraceContext) {
        let bm = &self.box_model;
        if bm.brush.contents & tw.contents == 0 {
            return;
        }
        if bm.brush.contents & tw.skip_contents != 0 {
            return;
        }
        if !bounds_intersect(
            &tw.bounds[0],
            &tw.bounds[1],
            &bm.brush.bounds[0],
            &bm.brush.bounds[1],
        ) {
            return;
        }
        trace_through_brush(tw, ctx, &bm.brush, &bm.sides, &bm.planes);
    }

    // ------------------------------------------------------------
    // Capsule dispatch
    // ------------------------------------------------------------

    /// Capsule-in-capsule overlap check. A capsule is a vertical pill: a
    /// cylinder with a tangent sphere of the same radius at each end.
    fn test_capsule_in_capsule(&self, tw: &mut TraceWork, model: ClipHandle) {
        let (mins, maxs) = self.model_bounds(model);

        let top = vector_add(&tw.start, &tw.sphere.offset);
        let bottom = vector_subtract(&tw.start, &tw.sphere.offset);

        let (offset, size) = symmetric_size(&mins, &maxs);
        let halfwidth = size[1][0];
        let halfheight = size[1][2];
        let radius = halfwidth.min(halfheight);
        let offs = halfheight - radius;

        let r = square(tw.sphere.radius + radius);

        // check if any of the spheres overlap
        let mut p1 = offset;
        p1[2] += offs;
        if vector_length_squared(&vector_subtract(&p1, &top)) < r
            || vector_length_squared(&vector_subtract(&p1, &bottom)) < r
        {
            tw.trace.startsolid = true;
            tw.trace.allsolid = true;
            tw.trace.fraction = 0.0;
        }
        let mut p2 = offset;
        p2[2] -= offs;
        if vector_length_squared(&vector_subtract(&p2, &top)) < r
            || vector_length_squared(&vector_subtract(&p2, &bottom)) < r
        {
            tw.trace.startsolid = true;
            tw.trace.allsolid = true;
            tw.trace.fraction = 0.0;
        }

        // if the vertical sphere-center intervals overlap, check the
        // cylinder bodies for overlap in 2d
        if bottom[2] <= p1[2] && top[2] >= p2[2] {
            let top2d = [top[0], top[1], 0.0];
            let org2d = [offset[0], offset[1], 0.0];
            if vector_length_squared(&vector_subtract(&top2d, &org2d)) < r {
                tw.trace.startsolid = true;
                tw.trace.allsolid = true;
                tw.trace.fraction = 0.0;
            }
        }
    }

    /// Box-in-capsule overlap check: swap the volumes so the moving box
    /// becomes the capsule and the capsule model becomes a box brush.
    fn test_box_in_capsule(&self, tw: &mut TraceWork, model: ClipHandle) {
        let (mins, maxs) = self.model_bounds(model);

        // offset for capsule center
        let (offset, size) = symmetric_size(&mins, &maxs);
        tw.start = vector_subtract(&tw.start, &offset);
        tw.end = vector_subtract(&tw.end, &offset);

        // replace the bounding box with the capsule
        tw.trace_type = TraceType::Capsule;
        tw.sphere.radius = size[1][0].min(size[1][2]);
        tw.sphere.halfheight = size[1][2];
        tw.sphere.offset = [0.0, 0.0, size[1][2] - tw.sphere.radius];

        // replace the capsule with the bounding box
        let boxm = BoxModel::new(&tw.size[0], &tw.size[1]);
        if boxm.brush.contents & tw.contents == 0 {
            return;
        }
        if boxm.brush.contents & tw.skip_contents != 0 {
            return;
        }
        test_box_in_brush(tw, &boxm.brush, &boxm.sides, &boxm.planes);
    }

    /// Capsule vs. capsule sweep (not rotated): two sphere sweeps plus a
    /// cylinder sweep when there is horizontal motion.
    fn trace_capsule_through_capsule(&self, tw: &mut TraceWork, model: ClipHandle) {
        let (mins, maxs) = self.model_bounds(model);

        // test trace bounds vs. capsule bounds
        if tw.bounds[0][0] > maxs[0] + RADIUS_EPSILON
            || tw.bounds[0][1] > maxs[1] + RADIUS_EPSILON
            || tw.bounds[0][2] > maxs[2] + RADIUS_EPSILON
            || tw.bounds[1][0] < mins[0] - RADIUS_EPSILON
            || tw.bounds[1][1] < mins[1] - RADIUS_EPSILON
            || tw.bounds[1][2] < mins[2] - RADIUS_EPSILON
        {
            return;
        }

        // top and bottom sphere centers at the start and end of the trace
        let starttop = vector_add(&tw.start, &tw.sphere.offset);
        let startbottom = vector_subtract(&tw.start, &tw.sphere.offset);
        let endtop = vector_add(&tw.end, &tw.sphere.offset);
        let endbottom = vector_subtract(&tw.end, &tw.sphere.offset);

        // top and bottom of the capsule spheres to collide with
        let (offset, size) = symmetric_size(&mins, &maxs);
        let halfwidth = size[1][0];
        let halfheight = size[1][2];
        let mut radius = halfwidth.min(halfheight);
        let offs = halfheight - radius;

        let mut top = offset;
        top[2] += offs;
        let mut bottom = offset;
        bottom[2] -= offs;

        // expand radius of spheres by the mover's radius
        radius += tw.sphere.radius;

        // if there is horizontal movement
        if tw.start[0] != tw.end[0] || tw.start[1] != tw.end[1] {
            // the expanded cylinder is the height of both cylinders minus
            // the radius of both spheres
            let h = halfheight + tw.sphere.halfheight - radius;
            if h > 0.0 {
                let start = tw.start;
                let end = tw.end;
                trace_through_vertical_cylinder(tw, &offset, radius, h, &start, &end);
            }
        }

        trace_through_sphere(tw, &top, radius, &startbottom, &endbottom);
        trace_through_sphere(tw, &bottom, radius, &starttop, &endtop);
    }

    /// Box vs. capsule sweep: swap the volumes, then clip the capsule path
    /// against a box brush built from the mover's size.
    fn trace_box_through_capsule(
        &self,
        tw: &mut TraceWork,
        ctx: &mut TraceContext,
        model: ClipHandle,
    ) {
        let (mins, maxs) = self.model_bounds(model);

        // offset for capsule center
        let (offset, size) = symmetric_size(&mins, &maxs);
        tw.start = vector_subtract(&tw.start, &offset);
        tw.end = vector_subtract(&tw.end, &offset);

        // replace the bounding box with the capsule
        tw.trace_type = TraceType::Capsule;
        tw.sphere.radius = size[1][0].min(size[1][2]);
        tw.sphere.halfheight = size[1][2];
        tw.sphere.offset = [0.0, 0.0, size[1][2] - tw.sphere.radius];

        // replace the capsule with the bounding box
        let boxm = BoxModel::new(&tw.size[0], &tw.size[1]);
        if boxm.brush.contents & tw.contents == 0 {
            return;
        }
        if boxm.brush.contents & tw.skip_contents != 0 {
            return;
        }
        if !bounds_intersect(
            &tw.bounds[0],
            &tw.bounds[1],
            &boxm.brush.bounds[0],
            &boxm.brush.bounds[1],
        ) {
            return;
        }
        trace_through_brush(tw, ctx, &boxm.brush, &boxm.sides, &boxm.planes);
    }

    // ------------------------------------------------------------
    // BSP traversal
    // ------------------------------------------------------------

    /// Traverses all leafs from the start to the end position. For a point
    /// trace they come out exactly in order; larger volumes can hit
    /// something in a later leaf at a smaller intercept fraction.
    fn trace_through_tree(
        &self,
        tw: &mut TraceWork,
        ctx: &mut TraceContext,
        num: i32,
        p1f: f32,
        p2f: f32,
        p1: &Vec3,
        p2: &Vec3,
    ) {
        if tw.trace.fraction < p1f {
            return; // already hit something nearer
        }

        // if < 0, we are in a leaf node
        if num < 0 {
            self.trace_through_leaf(tw, ctx, &self.leafs[(-1 - num) as usize]);
            return;
        }

        // find the point distances to the separating plane and the offset
        // for the size of the box
        let node = self.nodes[num as usize];
        let plane = self.planes[node.plane_idx];

        let (t1, t2, offset);
        if (plane.plane_type as usize) < 3 {
            t1 = p1[plane.plane_type as usize] - plane.dist;
            t2 = p2[plane.plane_type as usize] - plane.dist;
            offset = tw.extents[plane.plane_type as usize];
        } else {
            t1 = dot_product(&plane.normal, p1) - plane.dist;
            t2 = dot_product(&plane.normal, p2) - plane.dist;
            offset = tw.max_offset;
        }

        // see which sides we need to consider
        if t1 >= offset + 1.0 && t2 >= offset + 1.0 {
            self.trace_through_tree(tw, ctx, node.children[0], p1f, p2f, p1, p2);
            return;
        }
        if t1 < -offset - 1.0 && t2 < -offset - 1.0 {
            self.trace_through_tree(tw, ctx, node.children[1], p1f, p2f, p1, p2);
            return;
        }

        // put the crosspoint SURFACE_CLIP_EPSILON units on the near side
        let (side, mut frac, mut frac2);
        if t1 < t2 {
            let idist = 1.0 / (t1 - t2);
            side = 1usize;
            frac2 = (t1 + offset + SURFACE_CLIP_EPSILON) * idist;
            frac = (t1 - offset + SURFACE_CLIP_EPSILON) * idist;
        } else if t1 > t2 {
            let idist = 1.0 / (t1 - t2);
            side = 0usize;
            frac2 = (t1 - offset - SURFACE_CLIP_EPSILON) * idist;
            frac = (t1 + offset + SURFACE_CLIP_EPSILON) * idist;
        } else {
            side = 0usize;
            frac = 1.0;
            frac2 = 0.0;
        }

        // move up to the node
        if frac < 0.0 {
            frac = 0.0;
        }
        if frac > 1.0 {
            frac = 1.0;
        }
        let midf = p1f + (p2f - p1f) * frac;
        let mid = vector_lerp(p1, p2, frac);
        self.trace_through_tree(tw, ctx, node.children[side], p1f, midf, p1, &mid);

        // go past the node
        if frac2 < 0.0 {
            frac2 = 0.0;
        }
        if frac2 > 1.0 {
            frac2 = 1.0;
        }
        let midf = p1f + (p2f - p1f) * frac2;
        let mid = vector_lerp(p1, p2, frac2);
        self.trace_through_tree(tw, ctx, node.children[side ^ 1], midf, p2f, &mid, p2);
    }

    // ------------------------------------------------------------
    // Position test driver
    // ------------------------------------------------------------

    fn position_test(&self, tw: &mut TraceWork, ctx: &mut TraceContext) {
        // identify the leafs we are touching
        let mut mins = vector_add(&tw.start, &tw.size[0]);
        let mut maxs = vector_add(&tw.start, &tw.size[1]);
        for i in 0..3 {
            mins[i] -= 1.0;
            maxs[i] += 1.0;
        }

        ctx.checkcount = ctx.checkcount.wrapping_add(1);
        let (leafs, _topnode) = self.box_leafnums(&mins, &maxs, MAX_POSITION_LEAFS);
        ctx.checkcount = ctx.checkcount.wrapping_add(1);

        // test the contents of the leafs
        for leafnum in leafs {
            let leaf = self.leafs[leafnum];
            self.test_in_leaf(tw, ctx, &leaf);
            if tw.trace.allsolid {
                break;
            }
        }
    }

    // ------------------------------------------------------------
    // Trace driver
    // ------------------------------------------------------------

    fn trace(
        &self,
        ctx: &mut TraceContext,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        model: ClipHandle,
        origin: &Vec3,
        brushmask: i32,
        skipmask: i32,
        trace_type: TraceType,
        sphere: Option<&Sphere>,
    ) -> Trace {
        ctx.begin_trace(self);

        // fill in a default trace
        let mut tw = TraceWork {
            model_origin: *origin,
            trace_type,
            ..Default::default()
        };
        tw.trace.fraction = 1.0; // assume it goes the entire distance until shown otherwise

        if self.nodes.is_empty() {
            // map not loaded, shouldn't happen
            debug!("trace on unloaded clip map");
            tw.trace.endpos = *end;
            return tw.trace;
        }

        tw.contents = brushmask;
        tw.skip_contents = skipmask;

        // adjust so that mins and maxs are always symmetric, which avoids
        // some complications with plane expansion of rotated bmodels
        let (offset, size) = symmetric_size(mins, maxs);
        tw.size = size;
        tw.start = vector_add(start, &offset);
        tw.end = vector_add(end, &offset);

        // if a sphere is already specified
        if let Some(sphere) = sphere {
            tw.sphere = *sphere;
        } else {
            tw.sphere.radius = tw.size[1][0].min(tw.size[1][2]);
            tw.sphere.halfheight = tw.size[1][2];
            tw.sphere.offset = [0.0, 0.0, tw.size[1][2] - tw.sphere.radius];
        }

        tw.max_offset = vector_length(&tw.size[1]);

        // offsets[signbits] = vector to the appropriate corner from origin
        for i in 0..8 {
            for axis in 0..3 {
                tw.offsets[i][axis] = tw.size[(i >> axis) & 1][axis];
            }
        }

        // calculate bounds of the whole move
        if tw.trace_type == TraceType::Capsule {
            for i in 0..3 {
                let reach = tw.sphere.offset[i].abs() + tw.sphere.radius;
                if tw.start[i] < tw.end[i] {
                    tw.bounds[0][i] = tw.start[i] - reach;
                    tw.bounds[1][i] = tw.end[i] + reach;
                } else {
                    tw.bounds[0][i] = tw.end[i] - reach;
                    tw.bounds[1][i] = tw.start[i] + reach;
                }
            }
        } else {
            for i in 0..3 {
                if tw.start[i] < tw.end[i] {
                    tw.bounds[0][i] = tw.start[i] + tw.size[0][i];
                    tw.bounds[1][i] = tw.end[i] + tw.size[1][i];
                } else {
                    tw.bounds[0][i] = tw.end[i] + tw.size[0][i];
                    tw.bounds[1][i] = tw.start[i] + tw.size[1][i];
                }
            }
        }

        // check for position test special case
        if vector_compare(start, end) {
            match model {
                ClipHandle::World => self.position_test(&mut tw, ctx),
                ClipHandle::Capsule => {
                    if tw.trace_type == TraceType::Capsule {
                        self.test_capsule_in_capsule(&mut tw, model);
                    } else {
                        self.test_box_in_capsule(&mut tw, model);
                    }
                }
                ClipHandle::Box => self.test_in_box_model(&mut tw),
                ClipHandle::Model(idx) => {
                    let leaf = self.inline_models[idx].leaf;
                    self.test_in_leaf(&mut tw, ctx, &leaf);
                }
            }
        } else {
            // check for point special case
            if tw.size[0] == [0.0; 3] {
                tw.is_point = true;
                tw.extents = [0.0; 3];
            } else {
                tw.is_point = false;
                tw.extents = tw.size[1];
            }

            // general sweeping through the model
            match model {
                ClipHandle::World => {
                    let p1 = tw.start;
                    let p2 = tw.end;
                    self.trace_through_tree(&mut tw, ctx, 0, 0.0, 1.0, &p1, &p2);
                }
                ClipHandle::Capsule => {
                    if tw.trace_type == TraceType::Capsule {
                        self.trace_capsule_through_capsule(&mut tw, model);
                    } else {
                        self.trace_box_through_capsule(&mut tw, ctx, model);
                    }
                }
                ClipHandle::Box => self.trace_through_box_model(&mut tw, ctx),
                ClipHandle::Model(idx) => {
                    let leaf = self.inline_models[idx].leaf;
                    self.trace_through_leaf(&mut tw, ctx, &leaf);
                }
            }
        }

        // generate endpos from the original, unmodified start/end
        if tw.trace.fraction == 1.0 {
            tw.trace.endpos = *end;
        } else {
            tw.trace.endpos = vector_lerp(start, end, tw.trace.fraction);
        }

        tw.trace
    }

    /// Sweeps a volume from `start` to `end` against `model` and returns the
    /// first contact. `None` mins/maxs mean a point trace. When `start` and
    /// `end` are identical this is a position test.
    pub fn box_trace(
        &self,
        ctx: &mut TraceContext,
        start: &Vec3,
        end: &Vec3,
        mins: Option<&Vec3>,
        maxs: Option<&Vec3>,
        model: ClipHandle,
        brushmask: i32,
        skipmask: i32,
        trace_type: TraceType,
    ) -> Trace {
        self.trace(
            ctx,
            start,
            end,
            mins.unwrap_or(&VEC3_ORIGIN),
            maxs.unwrap_or(&VEC3_ORIGIN),
            model,
            &VEC3_ORIGIN,
            brushmask,
            skipmask,
            trace_type,
            None,
        )
    }

    /// Like `box_trace`, but against a model translated by `origin` and
    /// rotated by Euler `angles`. The trace line is transformed into the
    /// model's frame instead of rotating the model; for a capsule mover the
    /// capsule axis tilts with the model.
    pub fn transformed_box_trace(
        &self,
        ctx: &mut TraceContext,
        start: &Vec3,
        end: &Vec3,
        mins: Option<&Vec3>,
        maxs: Option<&Vec3>,
        model: ClipHandle,
        brushmask: i32,
        skipmask: i32,
        origin: &Vec3,
        angles: &Vec3,
        trace_type: TraceType,
    ) -> Trace {
        let mins = mins.unwrap_or(&VEC3_ORIGIN);
        let maxs = maxs.unwrap_or(&VEC3_ORIGIN);

        // adjust so that mins and maxs are always symmetric
        let (offset, size) = symmetric_size(mins, maxs);
        let mut start_l = vector_add(start, &offset);
        let mut end_l = vector_add(end, &offset);

        // subtract origin offset
        start_l = vector_subtract(&start_l, origin);
        end_l = vector_subtract(&end_l, origin);

        // rotate start and end into the model's frame of reference
        let rotated =
            model != ClipHandle::Box && (angles[0] != 0.0 || angles[1] != 0.0 || angles[2] != 0.0);

        let halfwidth = size[1][0];
        let halfheight = size[1][2];
        let mut sphere = Sphere {
            radius: halfwidth.min(halfheight),
            halfheight,
            offset: [0.0; 3],
        };
        let t = halfheight - sphere.radius;

        let mut matrix = [[0.0; 3]; 3];
        if rotated {
            // rotate the trace line instead of the bmodel. This is still
            // approximate for bounding boxes (the swept box itself is not
            // rotated, since that would invalidate the brush bevels), but
            // exact for capsules, whose offset tilts with the model.
            matrix = create_rotation_matrix(angles);
            rotate_point(&mut start_l, &matrix);
            rotate_point(&mut end_l, &matrix);
            sphere.offset = [matrix[0][2] * t, -matrix[1][2] * t, matrix[2][2] * t];
        } else {
            sphere.offset = [0.0, 0.0, t];
        }

        // sweep the box through the model
        let mut trace = self.trace(
            ctx,
            &start_l,
            &end_l,
            &size[0],
            &size[1],
            model,
            origin,
            brushmask,
            skipmask,
            trace_type,
            Some(&sphere),
        );

        // if the bmodel was rotated and there was a collision
        if rotated && trace.fraction != 1.0 {
            let transpose = transpose_matrix(&matrix);
            rotate_point(&mut trace.plane.normal, &transpose);
        }

        // re-calculate the end position from the unrotated, unoffset inputs
        trace.endpos = vector_lerp(start, end, trace.fraction);

        trace
    }

    // ------------------------------------------------------------
    // Distance queries
    // ------------------------------------------------------------

    /// Signed-distance approximation from `loc` to a model: the largest
    /// half-space distance per brush, minimized over the model's brushes.
    /// Positive means outside; 999999 or more means the model has no
    /// brushes. Debug/AI aid only.
    pub fn distance_to_model(&self, loc: &Vec3, model: ClipHandle) -> f32 {
        let mut dist = 999999.0f32;

        match model {
            ClipHandle::Box | ClipHandle::Capsule => {
                let bm = &self.box_model;
                let d1 = distance_to_brush(loc, &bm.sides, &bm.planes);
                if d1 < dist {
                    dist = d1;
                }
            }
            ClipHandle::World | ClipHandle::Model(_) => {
                let leaf = match model {
                    ClipHandle::Model(idx) => self.inline_models[idx].leaf,
                    _ => match self.inline_models.first() {
                        Some(world) => world.leaf,
                        None => return dist,
                    },
                };
                for k in 0..leaf.num_leaf_brushes {
                    let brushnum = self.leaf_brushes[leaf.first_leaf_brush + k] as usize;
                    let b = &self.brushes[brushnum];
                    let sides = &self.brush_sides[b.first_side..b.first_side + b.num_sides];
                    let d1 = distance_to_brush(loc, sides, &self.planes);
                    if d1 < dist {
                        dist = d1;
                    }
                }
            }
        }

        dist
    }
}

fn distance_to_brush(loc: &Vec3, sides: &[BrushSide], planes: &[Plane]) -> f32 {
    if sides.is_empty() {
        return 999999.0;
    }

    let mut dist = -999999.0f32;
    for side in sides {
        let plane = &planes[side.plane_idx];
        let d1 = dot_product(loc, &plane.normal) - plane.dist;
        // get maximum plane distance
        if d1 > dist {
            dist = d1;
        }
    }
    dist
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Facet, InlineModel, Node, CONTENTS_SOLID, CONTENTS_WATER,
    };

    const CUBE_SURF_FLAGS: i32 = 8;
    const PATCH_SURF_FLAGS: i32 = 16;

    /// A world with a single unit cube brush [0,1]^3, split by one BSP
    /// plane at x = 2. Leaf 0 (back side) holds the brush; leaf 1 is empty.
    /// Inline model 0 wraps the same leaf.
    fn unit_cube_world() -> ClipMap {
        let mut cm = ClipMap::default();

        // brush planes: +X -X +Y -Y +Z -Z, then the node plane
        cm.planes = vec![
            Plane::new([1.0, 0.0, 0.0], 1.0),
            Plane::new([-1.0, 0.0, 0.0], 0.0),
            Plane::new([0.0, 1.0, 0.0], 1.0),
            Plane::new([0.0, -1.0, 0.0], 0.0),
            Plane::new([0.0, 0.0, 1.0], 1.0),
            Plane::new([0.0, 0.0, -1.0], 0.0),
            Plane::new([1.0, 0.0, 0.0], 2.0),
        ];
        cm.brush_sides = (0..6)
            .map(|i| BrushSide {
                plane_idx: i,
                surface_flags: CUBE_SURF_FLAGS,
            })
            .collect();
        cm.brushes = vec![Brush {
            first_side: 0,
            num_sides: 6,
            bounds: [[0.0; 3], [1.0; 3]],
            contents: CONTENTS_SOLID,
        }];
        cm.nodes = vec![Node {
            plane_idx: 6,
            children: [-2, -1],
        }];
        cm.leafs = vec![
            Leaf {
                first_leaf_brush: 0,
                num_leaf_brushes: 1,
                ..Default::default()
            },
            Leaf::default(),
        ];
        cm.leaf_brushes = vec![0];
        cm.inline_models = vec![InlineModel {
            mins: [0.0; 3],
            maxs: [1.0; 3],
            leaf: cm.leafs[0],
        }];
        cm
    }

    /// A flat quad patch facet at z = 0 spanning x,y in [0,10], in a world
    /// split by one BSP plane at z = 50. The facet's last border is the
    /// mirrored back side of the surface plane.
    fn patch_world() -> ClipMap {
        let sc = SurfaceCollide {
            bounds: [[0.0, 0.0, 0.0], [10.0, 10.0, 0.0]],
            planes: vec![
                Plane::new([0.0, 0.0, 1.0], 0.0),
                Plane::new([-1.0, 0.0, 0.0], 0.0),
                Plane::new([1.0, 0.0, 0.0], 10.0),
                Plane::new([0.0, -1.0, 0.0], 0.0),
                Plane::new([0.0, 1.0, 0.0], 10.0),
                Plane::new([0.0, 0.0, -1.0], -0.0),
            ],
            facets: vec![Facet {
                surface_plane: 0,
                border_planes: vec![1, 2, 3, 4, 5],
                border_inward: vec![false; 5],
            }],
        };

        let mut cm = ClipMap::default();
        cm.planes = vec![Plane::new([0.0, 0.0, 1.0], 50.0)];
        cm.nodes = vec![Node {
            plane_idx: 0,
            children: [-2, -1],
        }];
        cm.leafs = vec![
            Leaf {
                first_leaf_surface: 0,
                num_leaf_surfaces: 1,
                ..Default::default()
            },
            Leaf::default(),
        ];
        cm.leaf_surfaces = vec![0];
        cm.surfaces = vec![Some(CollisionSurface {
            surface_type: SurfaceType::Patch,
            contents: CONTENTS_SOLID,
            surface_flags: PATCH_SURF_FLAGS,
            sc: Some(sc),
        })];
        cm
    }

    fn point_trace(cm: &ClipMap, ctx: &mut TraceContext, start: Vec3, end: Vec3) -> Trace {
        cm.box_trace(
            ctx,
            &start,
            &end,
            None,
            None,
            ClipHandle::World,
            CONTENTS_SOLID,
            0,
            TraceType::Aabb,
        )
    }

    // ------------------------------------------------------------
    // Driver basics
    // ------------------------------------------------------------

    #[test]
    fn test_trace_unloaded_world() {
        let cm = ClipMap::default();
        let mut ctx = TraceContext::new();
        let tr = point_trace(&cm, &mut ctx, [0.0; 3], [100.0, 0.0, 0.0]);
        assert_eq!(tr.fraction, 1.0);
        assert_eq!(tr.endpos, [100.0, 0.0, 0.0]);
        assert!(!tr.startsolid);
        assert!(!tr.allsolid);
    }

    #[test]
    fn test_point_trace_hits_cube() {
        let cm = unit_cube_world();
        let mut ctx = TraceContext::new();
        let tr = point_trace(&cm, &mut ctx, [-1.0, 0.5, 0.5], [2.0, 0.5, 0.5]);

        let expected = (1.0 - SURFACE_CLIP_EPSILON) / 3.0;
        assert!(
            (tr.fraction - expected).abs() < 1e-6,
            "fraction {} expected {}",
            tr.fraction,
            expected
        );
        assert_eq!(tr.plane.normal, [-1.0, 0.0, 0.0]);
        assert_eq!(tr.plane.dist, 0.0);
        assert_eq!(tr.contents, CONTENTS_SOLID);
        assert_eq!(tr.surface_flags, CUBE_SURF_FLAGS);
        assert!((tr.endpos[0] - -0.125).abs() < 1e-6);
        assert!(!tr.startsolid);
    }

    #[test]
    fn test_point_trace_misses_cube() {
        let cm = unit_cube_world();
        let mut ctx = TraceContext::new();
        let tr = point_trace(&cm, &mut ctx, [-1.0, 5.0, 0.5], [2.0, 5.0, 0.5]);
        assert_eq!(tr.fraction, 1.0);
        assert_eq!(tr.contents, 0);
        assert_eq!(tr.surface_flags, 0);
        assert_eq!(tr.endpos, [2.0, 5.0, 0.5]);
    }

    #[test]
    fn test_swept_box_hits_cube() {
        let cm = unit_cube_world();
        let mut ctx = TraceContext::new();
        let mins = [-0.5; 3];
        let maxs = [0.5; 3];
        let tr = cm.box_trace(
            &mut ctx,
            &[-2.0, 0.5, 0.5],
            &[2.0, 0.5, 0.5],
            Some(&mins),
            Some(&maxs),
            ClipHandle::World,
            CONTENTS_SOLID,
            0,
            TraceType::Aabb,
        );
        // plane expanded by the half-width: d1 = 1.5, d2 = -2.5
        let expected = (1.5 - SURFACE_CLIP_EPSILON) / 4.0;
        assert!((tr.fraction - expected).abs() < 1e-6);
        assert_eq!(tr.plane.normal, [-1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_skipmask_ignores_brush() {
        let cm = unit_cube_world();
        let mut ctx = TraceContext::new();
        let tr = cm.box_trace(
            &mut ctx,
            &[-1.0, 0.5, 0.5],
            &[2.0, 0.5, 0.5],
            None,
            None,
            ClipHandle::World,
            CONTENTS_SOLID | CONTENTS_WATER,
            CONTENTS_SOLID,
            TraceType::Aabb,
        );
        assert_eq!(tr.fraction, 1.0, "skipmask must exclude the brush");
    }

    #[test]
    fn test_contentmask_mismatch_passes_through() {
        let cm = unit_cube_world();
        let mut ctx = TraceContext::new();
        let tr = cm.box_trace(
            &mut ctx,
            &[-1.0, 0.5, 0.5],
            &[2.0, 0.5, 0.5],
            None,
            None,
            ClipHandle::World,
            CONTENTS_WATER,
            0,
            TraceType::Aabb,
        );
        assert_eq!(tr.fraction, 1.0);
    }

    #[test]
    fn test_asymmetric_box_is_recentered() {
        // mins/maxs shifted entirely positive; the symmetric adjustment
        // must shift the path so results match the centered equivalent
        let cm = unit_cube_world();
        let mut ctx = TraceContext::new();
        let mins = [0.0, -0.5, -0.5];
        let maxs = [1.0, 0.5, 0.5];
        let tr = cm.box_trace(
            &mut ctx,
            &[-3.0, 0.5, 0.5],
            &[2.0, 0.5, 0.5],
            Some(&mins),
            Some(&maxs),
            ClipHandle::World,
            CONTENTS_SOLID,
            0,
            TraceType::Aabb,
        );
        // center path runs from -2.5 to 2.5; front face at x = -0.5 of the
        // expanded brush: d1 = 2.0, d2 = -3.0
        let expected = (2.0 - SURFACE_CLIP_EPSILON) / 5.0;
        assert!((tr.fraction - expected).abs() < 1e-6);
        // the caller's leading face (endpos.x + maxs.x) stops one pushoff
        // short of the brush face at x = 0
        assert!((tr.endpos[0] + 1.0 + SURFACE_CLIP_EPSILON).abs() < 1e-5);
    }

    // ------------------------------------------------------------
    // Position tests
    // ------------------------------------------------------------

    #[test]
    fn test_position_box_inside_cube() {
        let cm = unit_cube_world();
        let mut ctx = TraceContext::new();
        let start = [0.5, 0.5, 0.5];
        let mins = [-1.0; 3];
        let maxs = [1.0; 3];
        let tr = cm.box_trace(
            &mut ctx,
            &start,
            &start,
            Some(&mins),
            Some(&maxs),
            ClipHandle::World,
            CONTENTS_SOLID,
            0,
            TraceType::Aabb,
        );
        assert!(tr.startsolid);
        assert!(tr.allsolid);
        assert_eq!(tr.fraction, 0.0);
        assert_eq!(tr.endpos, start);
        assert_eq!(tr.contents, CONTENTS_SOLID);
    }

    #[test]
    fn test_position_box_outside_cube() {
        let cm = unit_cube_world();
        let mut ctx = TraceContext::new();
        let start = [5.0, 5.0, 5.0];
        let mins = [-0.5; 3];
        let maxs = [0.5; 3];
        let tr = cm.box_trace(
            &mut ctx,
            &start,
            &start,
            Some(&mins),
            Some(&maxs),
            ClipHandle::World,
            CONTENTS_SOLID,
            0,
            TraceType::Aabb,
        );
        assert!(!tr.startsolid);
        assert!(!tr.allsolid);
        assert_eq!(tr.fraction, 1.0);
        assert_eq!(tr.endpos, start);
    }

    #[test]
    fn test_position_world_matches_inline_model() {
        let cm = unit_cube_world();
        let mut ctx = TraceContext::new();
        let start = [0.5, 0.5, 0.5];
        let world = cm.box_trace(
            &mut ctx,
            &start,
            &start,
            None,
            None,
            ClipHandle::World,
            CONTENTS_SOLID,
            0,
            TraceType::Aabb,
        );
        let inline = cm.box_trace(
            &mut ctx,
            &start,
            &start,
            None,
            None,
            ClipHandle::Model(0),
            CONTENTS_SOLID,
            0,
            TraceType::Aabb,
        );
        assert_eq!(world.startsolid, inline.startsolid);
        assert_eq!(world.allsolid, inline.allsolid);
        assert_eq!(world.fraction, inline.fraction);
    }

    // ------------------------------------------------------------
    // Round-trip / monotonicity properties
    // ------------------------------------------------------------

    #[test]
    fn test_reverse_trace_symmetry() {
        let cm = unit_cube_world();
        let mut ctx = TraceContext::new();
        let fwd = point_trace(&cm, &mut ctx, [-1.0, 0.5, 0.5], [2.0, 0.5, 0.5]);
        let rev = point_trace(&cm, &mut ctx, [2.0, 0.5, 0.5], [-1.0, 0.5, 0.5]);

        assert!(fwd.fraction < 1.0 && rev.fraction < 1.0);
        assert_eq!(
            vector_add(&fwd.plane.normal, &rev.plane.normal),
            [0.0; 3],
            "opposing traces hit opposing faces"
        );
        // the gap between the two contacts is the brush thickness plus one
        // clip pushoff per side
        let gap = 1.0 - rev.fraction - fwd.fraction;
        let expected = (1.0 + 2.0 * SURFACE_CLIP_EPSILON) / 3.0;
        assert!((gap - expected).abs() < 1e-5, "gap {gap} expected {expected}");
    }

    #[test]
    fn test_smaller_mover_never_collides_sooner() {
        let cm = unit_cube_world();
        let mut ctx = TraceContext::new();
        let start = [-2.0, 0.5, 0.5];
        let end = [2.0, 0.5, 0.5];
        let mut last_fraction = 0.0f32;
        for half in [0.5f32, 0.25, 0.1] {
            let mins = [-half; 3];
            let maxs = [half; 3];
            let tr = cm.box_trace(
                &mut ctx,
                &start,
                &end,
                Some(&mins),
                Some(&maxs),
                ClipHandle::World,
                CONTENTS_SOLID,
                0,
                TraceType::Aabb,
            );
            assert!(
                tr.fraction >= last_fraction,
                "smaller mover collided sooner: {} < {}",
                tr.fraction,
                last_fraction
            );
            last_fraction = tr.fraction;
        }
    }

    #[test]
    fn test_transformed_identity_matches_box_trace() {
        let cm = unit_cube_world();
        let mut ctx = TraceContext::new();
        let mins = [-0.5; 3];
        let maxs = [0.5; 3];
        let plain = cm.box_trace(
            &mut ctx,
            &[-2.0, 0.5, 0.5],
            &[2.0, 0.5, 0.5],
            Some(&mins),
            Some(&maxs),
            ClipHandle::Model(0),
            CONTENTS_SOLID,
            0,
            TraceType::Aabb,
        );
        let transformed = cm.transformed_box_trace(
            &mut ctx,
            &[-2.0, 0.5, 0.5],
            &[2.0, 0.5, 0.5],
            Some(&mins),
            Some(&maxs),
            ClipHandle::Model(0),
            CONTENTS_SOLID,
            0,
            &[0.0; 3],
            &[0.0; 3],
            TraceType::Aabb,
        );
        assert_eq!(plain.fraction, transformed.fraction);
        assert_eq!(plain.endpos, transformed.endpos);
        assert_eq!(plain.plane.normal, transformed.plane.normal);
        assert_eq!(plain.startsolid, transformed.startsolid);
    }

    // ------------------------------------------------------------
    // Transformed traces
    // ------------------------------------------------------------

    #[test]
    fn test_transformed_translation() {
        let cm = unit_cube_world();
        let mut ctx = TraceContext::new();
        let tr = cm.transformed_box_trace(
            &mut ctx,
            &[0.0, 0.5, 0.5],
            &[20.0, 0.5, 0.5],
            None,
            None,
            ClipHandle::Model(0),
            CONTENTS_SOLID,
            0,
            &[10.0, 0.0, 0.0],
            &[0.0; 3],
            TraceType::Aabb,
        );
        let expected = (10.0 - SURFACE_CLIP_EPSILON) / 20.0;
        assert!((tr.fraction - expected).abs() < 1e-6);
        assert_eq!(tr.plane.normal, [-1.0, 0.0, 0.0]);
        assert!((tr.endpos[0] - 9.875).abs() < 1e-4);
    }

    #[test]
    fn test_transformed_rotation_yaw_90() {
        // yaw 90 maps the local [0,1]^3 cube to world [-1,0]x[0,1]x[0,1]
        let cm = unit_cube_world();
        let mut ctx = TraceContext::new();
        let tr = cm.transformed_box_trace(
            &mut ctx,
            &[-5.0, 0.5, 0.5],
            &[5.0, 0.5, 0.5],
            None,
            None,
            ClipHandle::Model(0),
            CONTENTS_SOLID,
            0,
            &[0.0; 3],
            &[0.0, 90.0, 0.0],
            TraceType::Aabb,
        );
        let expected = (4.0 - SURFACE_CLIP_EPSILON) / 10.0;
        assert!(
            (tr.fraction - expected).abs() < 1e-5,
            "fraction {} expected {}",
            tr.fraction,
            expected
        );
        assert!((tr.plane.normal[0] - -1.0).abs() < 1e-5);
        assert!(tr.plane.normal[1].abs() < 1e-5);
        assert!((tr.endpos[0] - -1.125).abs() < 1e-4);
    }

    // ------------------------------------------------------------
    // Patch surfaces
    // ------------------------------------------------------------

    #[test]
    fn test_point_trace_hits_patch_from_front() {
        let cm = patch_world();
        let mut ctx = TraceContext::new();
        let tr = point_trace(&cm, &mut ctx, [5.0, 5.0, 10.0], [5.0, 5.0, -10.0]);
        let expected = (10.0 - SURFACE_CLIP_EPSILON) / 20.0;
        assert!((tr.fraction - expected).abs() < 1e-6);
        assert_eq!(tr.plane.normal, [0.0, 0.0, 1.0]);
        assert_eq!(tr.surface_flags, PATCH_SURF_FLAGS);
        assert_eq!(tr.contents, CONTENTS_SOLID);
        assert!((tr.endpos[2] - 0.125).abs() < 1e-5);
    }

    #[test]
    fn test_point_trace_through_patch_back_is_free() {
        let cm = patch_world();
        let mut ctx = TraceContext::new();
        let tr = point_trace(&cm, &mut ctx, [5.0, 5.0, -10.0], [5.0, 5.0, 10.0]);
        assert_eq!(tr.fraction, 1.0, "back side must never be clipped against");
        assert_eq!(tr.contents, 0);
    }

    #[test]
    fn test_point_trace_misses_patch_outside_borders() {
        let cm = patch_world();
        let mut ctx = TraceContext::new();
        let tr = point_trace(&cm, &mut ctx, [20.0, 5.0, 10.0], [20.0, 5.0, -10.0]);
        assert_eq!(tr.fraction, 1.0);
    }

    #[test]
    fn test_swept_box_hits_patch() {
        let cm = patch_world();
        let mut ctx = TraceContext::new();
        let mins = [-0.5; 3];
        let maxs = [0.5; 3];
        let tr = cm.box_trace(
            &mut ctx,
            &[5.0, 5.0, 10.0],
            &[5.0, 5.0, -10.0],
            Some(&mins),
            Some(&maxs),
            ClipHandle::World,
            CONTENTS_SOLID,
            0,
            TraceType::Aabb,
        );
        let expected = (9.5 - SURFACE_CLIP_EPSILON) / 20.0;
        assert!((tr.fraction - expected).abs() < 1e-6);
        assert_eq!(tr.plane.normal, [0.0, 0.0, 1.0]);
        // the recorded plane is the expanded one
        assert_eq!(tr.plane.dist, 0.5);
        assert_eq!(tr.surface_flags, PATCH_SURF_FLAGS);
    }

    #[test]
    fn test_swept_box_up_through_patch_back_is_free() {
        let cm = patch_world();
        let mut ctx = TraceContext::new();
        let mins = [-0.5; 3];
        let maxs = [0.5; 3];
        let tr = cm.box_trace(
            &mut ctx,
            &[5.0, 5.0, -10.0],
            &[5.0, 5.0, 10.0],
            Some(&mins),
            Some(&maxs),
            ClipHandle::World,
            CONTENTS_SOLID,
            0,
            TraceType::Aabb,
        );
        assert_eq!(tr.fraction, 1.0, "the last border hit must reject the facet");
    }

    #[test]
    fn test_capsule_hits_patch_like_box() {
        let cm = patch_world();
        let mut ctx = TraceContext::new();
        let mins = [-0.5; 3];
        let maxs = [0.5; 3];
        let tr = cm.box_trace(
            &mut ctx,
            &[5.0, 5.0, 10.0],
            &[5.0, 5.0, -10.0],
            Some(&mins),
            Some(&maxs),
            ClipHandle::World,
            CONTENTS_SOLID,
            0,
            TraceType::Capsule,
        );
        // for a cube-shaped capsule volume the sphere radius equals the
        // half-width, so the surface plane expansion matches the box case
        let expected = (9.5 - SURFACE_CLIP_EPSILON) / 20.0;
        assert!((tr.fraction - expected).abs() < 1e-6);
    }

    #[test]
    fn test_position_box_on_patch() {
        let cm = patch_world();
        let mut ctx = TraceContext::new();
        let start = [5.0, 5.0, 0.25];
        let mins = [-0.5; 3];
        let maxs = [0.5; 3];
        let tr = cm.box_trace(
            &mut ctx,
            &start,
            &start,
            Some(&mins),
            Some(&maxs),
            ClipHandle::World,
            CONTENTS_SOLID,
            0,
            TraceType::Aabb,
        );
        assert!(tr.startsolid && tr.allsolid);
        assert_eq!(tr.contents, CONTENTS_SOLID);
    }

    #[test]
    fn test_position_point_above_patch_not_solid() {
        let cm = patch_world();
        let mut ctx = TraceContext::new();
        let start = [5.0, 5.0, 0.25];
        let tr = cm.box_trace(
            &mut ctx,
            &start,
            &start,
            None,
            None,
            ClipHandle::World,
            CONTENTS_SOLID,
            0,
            TraceType::Aabb,
        );
        assert!(!tr.startsolid);
        assert_eq!(tr.fraction, 1.0);
    }

    #[test]
    fn test_no_curves_disables_patch() {
        let mut cm = patch_world();
        cm.no_curves = true;
        let mut ctx = TraceContext::new();
        let tr = point_trace(&cm, &mut ctx, [5.0, 5.0, 10.0], [5.0, 5.0, -10.0]);
        assert_eq!(tr.fraction, 1.0);
    }

    #[test]
    fn test_triangle_soup_gated_by_config() {
        let mut cm = patch_world();
        if let Some(surface) = cm.surfaces[0].as_mut() {
            surface.surface_type = SurfaceType::TriangleSoup;
        }
        let mut ctx = TraceContext::new();
        let tr = point_trace(&cm, &mut ctx, [5.0, 5.0, 10.0], [5.0, 5.0, -10.0]);
        assert_eq!(tr.fraction, 1.0, "triangle soup untested by default");

        cm.force_triangles = true;
        let tr = point_trace(&cm, &mut ctx, [5.0, 5.0, 10.0], [5.0, 5.0, -10.0]);
        assert!(tr.fraction < 1.0, "force_triangles enables soup collision");

        cm.force_triangles = false;
        cm.per_poly_collision = true;
        let tr = point_trace(&cm, &mut ctx, [5.0, 5.0, 10.0], [5.0, 5.0, -10.0]);
        assert!(tr.fraction < 1.0, "per_poly_collision enables soup collision");
    }

    // ------------------------------------------------------------
    // Capsule vs. capsule and box vs. capsule
    // ------------------------------------------------------------

    fn capsule_mover() -> (Vec3, Vec3) {
        ([-10.0, -10.0, -20.0], [10.0, 10.0, 20.0])
    }

    #[test]
    fn test_capsule_vs_capsule_no_touch() {
        let mut cm = unit_cube_world();
        let handle = cm.temp_box_model(&[90.0, -10.0, -20.0], &[110.0, 10.0, 20.0], true);
        let mut ctx = TraceContext::new();
        let (mins, maxs) = capsule_mover();
        let tr = cm.box_trace(
            &mut ctx,
            &[0.0; 3],
            &[50.0, 0.0, 0.0],
            Some(&mins),
            Some(&maxs),
            handle,
            CONTENTS_BODY,
            0,
            TraceType::Capsule,
        );
        assert_eq!(tr.fraction, 1.0);
        assert_eq!(tr.endpos, [50.0, 0.0, 0.0]);
    }

    #[test]
    fn test_capsule_vs_capsule_horizontal_hit() {
        let mut cm = unit_cube_world();
        let handle = cm.temp_box_model(&[40.0, -10.0, -20.0], &[60.0, 10.0, 20.0], true);
        let mut ctx = TraceContext::new();
        let (mins, maxs) = capsule_mover();
        let tr = cm.box_trace(
            &mut ctx,
            &[0.0; 3],
            &[100.0, 0.0, 0.0],
            Some(&mins),
            Some(&maxs),
            handle,
            CONTENTS_BODY,
            0,
            TraceType::Capsule,
        );
        // cylinders touch when the gap equals both radii plus the sweep
        // inflation: (50 - 20 - 1) / 100
        let expected = (50.0 - 20.0 - RADIUS_EPSILON) / 100.0;
        assert!(
            (tr.fraction - expected).abs() < 1e-5,
            "fraction {} expected {}",
            tr.fraction,
            expected
        );
        assert!((tr.plane.normal[0] - -1.0).abs() < 1e-5);
        assert!(tr.plane.normal[2].abs() < 1e-6);
        assert_eq!(tr.contents, CONTENTS_BODY);
    }

    #[test]
    fn test_capsule_vs_capsule_startsolid() {
        let mut cm = unit_cube_world();
        let handle = cm.temp_box_model(&[40.0, -10.0, -20.0], &[60.0, 10.0, 20.0], true);
        let mut ctx = TraceContext::new();
        let (mins, maxs) = capsule_mover();
        let start = [45.0, 0.0, 0.0];
        let tr = cm.box_trace(
            &mut ctx,
            &start,
            &start,
            Some(&mins),
            Some(&maxs),
            handle,
            CONTENTS_BODY,
            0,
            TraceType::Capsule,
        );
        assert!(tr.startsolid && tr.allsolid);
        assert_eq!(tr.fraction, 0.0);
        assert_eq!(tr.endpos, start);
    }

    #[test]
    fn test_capsule_in_capsule_cylinder_band_overlap() {
        // a squat mover beside a tall capsule: no sphere pair overlaps,
        // only the cylinder bodies do
        let mut cm = unit_cube_world();
        let handle = cm.temp_box_model(&[-10.0, -10.0, -40.0], &[10.0, 10.0, 40.0], true);
        let mut ctx = TraceContext::new();
        let mins = [-10.0; 3];
        let maxs = [10.0; 3];
        let start = [15.0, 0.0, 0.0];
        let tr = cm.box_trace(
            &mut ctx,
            &start,
            &start,
            Some(&mins),
            Some(&maxs),
            handle,
            CONTENTS_BODY,
            0,
            TraceType::Capsule,
        );
        assert!(tr.startsolid && tr.allsolid, "cylinder bodies overlap");
    }

    #[test]
    fn test_box_vs_capsule_sweep() {
        let mut cm = unit_cube_world();
        let handle = cm.temp_box_model(&[-10.0, -10.0, -20.0], &[10.0, 10.0, 20.0], true);
        let mut ctx = TraceContext::new();
        let (mins, maxs) = capsule_mover();
        let tr = cm.box_trace(
            &mut ctx,
            &[-50.0, 0.0, 0.0],
            &[50.0, 0.0, 0.0],
            Some(&mins),
            Some(&maxs),
            handle,
            CONTENTS_BODY,
            0,
            TraceType::Aabb,
        );
        // swapped volumes: the capsule (radius 10) runs into the box face
        // at x = -10 expanded by the radius
        let expected = (30.0 - SURFACE_CLIP_EPSILON) / 100.0;
        assert!(
            (tr.fraction - expected).abs() < 1e-5,
            "fraction {} expected {}",
            tr.fraction,
            expected
        );
        assert_eq!(tr.plane.normal, [-1.0, 0.0, 0.0]);
        assert_eq!(tr.contents, CONTENTS_BODY);
    }

    #[test]
    fn test_box_in_capsule_position() {
        let mut cm = unit_cube_world();
        let handle = cm.temp_box_model(&[-10.0, -10.0, -20.0], &[10.0, 10.0, 20.0], true);
        let mut ctx = TraceContext::new();
        let (mins, maxs) = capsule_mover();
        let start = [5.0, 0.0, 0.0];
        let tr = cm.box_trace(
            &mut ctx,
            &start,
            &start,
            Some(&mins),
            Some(&maxs),
            handle,
            CONTENTS_BODY,
            0,
            TraceType::Aabb,
        );
        assert!(tr.startsolid && tr.allsolid);
    }

    #[test]
    fn test_box_model_sweep() {
        let mut cm = unit_cube_world();
        let handle = cm.temp_box_model(&[-10.0; 3], &[10.0; 3], false);
        let mut ctx = TraceContext::new();
        let tr = cm.box_trace(
            &mut ctx,
            &[-50.0, 0.0, 0.0],
            &[50.0, 0.0, 0.0],
            None,
            None,
            handle,
            CONTENTS_BODY,
            0,
            TraceType::Aabb,
        );
        let expected = (40.0 - SURFACE_CLIP_EPSILON) / 100.0;
        assert!((tr.fraction - expected).abs() < 1e-6);
        assert_eq!(tr.plane.normal, [-1.0, 0.0, 0.0]);
    }

    // ------------------------------------------------------------
    // Capsule primitive edge cases
    // ------------------------------------------------------------

    #[test]
    fn test_sphere_tangent_graze_slides() {
        // path exactly tangent to the inflated sphere: d == 0, no contact
        let mut tw = TraceWork::default();
        tw.trace.fraction = 1.0;
        let radius = 10.0;
        // inflated radius is 11; graze at y = 11
        trace_through_sphere(
            &mut tw,
            &[0.0, 0.0, 0.0],
            radius,
            &[-20.0, 11.0, 0.0],
            &[20.0, 11.0, 0.0],
        );
        assert_eq!(tw.trace.fraction, 1.0, "tangent graze must slide, not hit");
        assert!(!tw.trace.startsolid);
    }

    #[test]
    fn test_sphere_sweep_direct_hit() {
        let mut tw = TraceWork::default();
        tw.trace.fraction = 1.0;
        trace_through_sphere(
            &mut tw,
            &[50.0, 0.0, 0.0],
            10.0,
            &[0.0, 0.0, 0.0],
            &[100.0, 0.0, 0.0],
        );
        // stops where the path meets the inflated radius: 50 - 11
        let expected = (50.0 - 10.0 - RADIUS_EPSILON) / 100.0;
        assert!((tw.trace.fraction - expected).abs() < 1e-5);
        assert!((tw.trace.plane.normal[0] - -1.0).abs() < 1e-5);
        assert_eq!(tw.trace.contents, CONTENTS_BODY);
    }

    #[test]
    fn test_sphere_sweep_startsolid() {
        let mut tw = TraceWork::default();
        tw.trace.fraction = 1.0;
        trace_through_sphere(
            &mut tw,
            &[0.0, 0.0, 0.0],
            10.0,
            &[5.0, 0.0, 0.0],
            &[6.0, 0.0, 0.0],
        );
        assert!(tw.trace.startsolid && tw.trace.allsolid);
        assert_eq!(tw.trace.fraction, 0.0);
    }

    #[test]
    fn test_cylinder_hit_gated_by_height() {
        let mut tw = TraceWork::default();
        tw.trace.fraction = 1.0;
        // path passes over the top of the cylinder
        trace_through_vertical_cylinder(
            &mut tw,
            &[50.0, 0.0, 0.0],
            10.0,
            20.0,
            &[0.0, 0.0, 30.0],
            &[100.0, 0.0, 30.0],
        );
        assert_eq!(tw.trace.fraction, 1.0, "no contact above the cylinder");

        trace_through_vertical_cylinder(
            &mut tw,
            &[50.0, 0.0, 0.0],
            10.0,
            20.0,
            &[0.0, 0.0, 5.0],
            &[100.0, 0.0, 5.0],
        );
        let expected = (50.0 - 10.0 - RADIUS_EPSILON) / 100.0;
        assert!((tw.trace.fraction - expected).abs() < 1e-5);
        assert_eq!(tw.trace.plane.normal[2], 0.0);
    }

    // ------------------------------------------------------------
    // Checkcount dedup
    // ------------------------------------------------------------

    #[test]
    fn test_brush_tested_once_across_leafs() {
        // place the same brush in both leafs of the split; the stamp must
        // keep the second leaf from re-testing it
        let mut cm = unit_cube_world();
        cm.leaf_brushes = vec![0, 0];
        cm.leafs[1] = Leaf {
            first_leaf_brush: 1,
            num_leaf_brushes: 1,
            ..Default::default()
        };
        let mut ctx = TraceContext::new();
        let tr = point_trace(&cm, &mut ctx, [3.0, 0.5, 0.5], [-1.0, 0.5, 0.5]);
        assert!(tr.fraction < 1.0);
        assert_eq!(ctx.c_brush_traces, 1, "brush must be clipped exactly once");
    }

    #[test]
    fn test_statistics_counters() {
        let cm = patch_world();
        let mut ctx = TraceContext::new();
        point_trace(&cm, &mut ctx, [5.0, 5.0, 10.0], [5.0, 5.0, -10.0]);
        point_trace(&cm, &mut ctx, [5.0, 5.0, 10.0], [5.0, 5.0, -10.0]);
        assert_eq!(ctx.c_traces, 2);
        assert_eq!(ctx.c_patch_traces, 2);
        assert_eq!(ctx.c_trisoup_traces, 0);
    }

    // ------------------------------------------------------------
    // Distance queries
    // ------------------------------------------------------------

    #[test]
    fn test_distance_to_model() {
        let cm = unit_cube_world();
        assert_eq!(
            cm.distance_to_model(&[2.0, 0.5, 0.5], ClipHandle::Model(0)),
            1.0
        );
        assert_eq!(
            cm.distance_to_model(&[0.5, 0.5, 0.5], ClipHandle::Model(0)),
            -0.5,
            "inside the brush is negative"
        );
    }

    #[test]
    fn test_distance_to_model_no_brushes() {
        let cm = ClipMap::default();
        assert!(cm.distance_to_model(&[0.0; 3], ClipHandle::World) >= 999999.0);
    }

    // ------------------------------------------------------------
    // Consistency fuzz
    // ------------------------------------------------------------

    #[test]
    fn test_fuzz_traces_are_consistent() {
        use crate::consistency::check_trace_consistency;
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let worlds = [unit_cube_world(), patch_world()];
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut ctx = TraceContext::new();

        for iter in 0..400 {
            let cm = &worlds[iter % worlds.len()];
            let start: Vec3 = [
                rng.gen_range(-3.0..12.0),
                rng.gen_range(-3.0..12.0),
                rng.gen_range(-3.0..12.0),
            ];
            let end: Vec3 = if rng.gen_range(0..10) == 0 {
                start
            } else {
                [
                    rng.gen_range(-3.0..12.0),
                    rng.gen_range(-3.0..12.0),
                    rng.gen_range(-3.0..12.0),
                ]
            };
            let (mins, maxs) = if rng.gen_range(0..4) == 0 {
                ([0.0; 3], [0.0; 3])
            } else {
                let a: Vec3 = [
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-2.0..2.0),
                ];
                let b: Vec3 = [
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-2.0..2.0),
                ];
                (
                    [a[0].min(b[0]), a[1].min(b[1]), a[2].min(b[2])],
                    [a[0].max(b[0]), a[1].max(b[1]), a[2].max(b[2])],
                )
            };
            let trace_type = if rng.gen_range(0..2) == 0 {
                TraceType::Aabb
            } else {
                TraceType::Capsule
            };

            let tr = cm.box_trace(
                &mut ctx,
                &start,
                &end,
                Some(&mins),
                Some(&maxs),
                ClipHandle::World,
                CONTENTS_SOLID,
                0,
                trace_type,
            );
            if let Err(e) = check_trace_consistency(&start, &end, CONTENTS_SOLID, 0, &tr) {
                panic!(
                    "iteration {iter}: {e} (start {start:?} end {end:?} \
                     mins {mins:?} maxs {maxs:?} type {trace_type:?} trace {tr:?})"
                );
            }
        }
    }

    #[test]
    fn test_fuzz_transformed_traces_are_consistent() {
        use crate::consistency::check_trace_consistency;
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let cm = unit_cube_world();
        let mut rng = StdRng::seed_from_u64(0xc0de);
        let mut ctx = TraceContext::new();

        // start/end on a 1/8 grid: the transformed trace recomputes endpos
        // by interpolation even at fraction 1, and the consistency check
        // wants exact equality there
        let eighth = |rng: &mut StdRng| rng.gen_range(-40..=40) as f32 / 8.0;

        for iter in 0..200 {
            let start: Vec3 = [
                eighth(&mut rng),
                eighth(&mut rng),
                eighth(&mut rng),
            ];
            let end: Vec3 = [
                eighth(&mut rng),
                eighth(&mut rng),
                eighth(&mut rng),
            ];
            let half = rng.gen_range(0.0..1.0f32);
            let mins = [-half; 3];
            let maxs = [half; 3];
            let origin: Vec3 = [
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-2.0..2.0),
            ];
            let angles: Vec3 = [
                rng.gen_range(-180.0..180.0),
                rng.gen_range(-180.0..180.0),
                rng.gen_range(-180.0..180.0),
            ];

            let tr = cm.transformed_box_trace(
                &mut ctx,
                &start,
                &end,
                Some(&mins),
                Some(&maxs),
                ClipHandle::Model(0),
                CONTENTS_SOLID,
                0,
                &origin,
                &angles,
                TraceType::Aabb,
            );
            if let Err(e) = check_trace_consistency(&start, &end, CONTENTS_SOLID, 0, &tr) {
                panic!("iteration {iter}: {e} (trace {tr:?})");
            }
        }
    }
}
