// consistency.rs — Post-condition validation of trace results

use crate::math::{distance_squared, square, vector_compare, vector_length, vector_lerp, Vec3};
use crate::trace::Trace;
use thiserror::Error;

/// A structural inconsistency between a trace result and its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    #[error("fraction out of range")]
    FractionOutOfRange,
    #[error("allsolid without startsolid")]
    AllsolidWithoutStartsolid,
    #[error("with allsolid fraction should be 0")]
    AllsolidNonzeroFraction,
    #[error("should not have content flags with fraction == 1")]
    ContentsWithoutHit,
    #[error("should not have surface flags with fraction == 1")]
    SurfaceFlagsWithoutHit,
    #[error("trace has collision but no matching content flags")]
    ContentsNotInMask,
    #[error("skipmask not respected")]
    SkipmaskNotRespected,
    #[error("endpos not exactly equal to start with allsolid")]
    EndposNotStart,
    #[error("endpos not exactly equal to end with fraction == 1")]
    EndposNotEnd,
    #[error("endpos significantly different from expected")]
    EndposDrift,
    #[error("plane normal has wrong length")]
    BadPlaneNormal,
}

/// Checks that a trace result is consistent with itself and its arguments.
/// Meant for tests and optional production asserts; a violation means the
/// tracing kernel produced a structurally impossible result.
pub fn check_trace_consistency(
    start: &Vec3,
    end: &Vec3,
    contentmask: i32,
    skipmask: i32,
    tr: &Trace,
) -> Result<(), ConsistencyError> {
    if !(tr.fraction >= 0.0 && tr.fraction <= 1.0) {
        return Err(ConsistencyError::FractionOutOfRange);
    }

    if tr.allsolid {
        if !tr.startsolid {
            return Err(ConsistencyError::AllsolidWithoutStartsolid);
        }
        if tr.fraction != 0.0 {
            return Err(ConsistencyError::AllsolidNonzeroFraction);
        }
    }

    // check contents
    if tr.fraction == 1.0 {
        if tr.contents != 0 {
            return Err(ConsistencyError::ContentsWithoutHit);
        }
        if tr.surface_flags != 0 {
            return Err(ConsistencyError::SurfaceFlagsWithoutHit);
        }
    } else {
        if tr.contents & contentmask == 0 {
            return Err(ConsistencyError::ContentsNotInMask);
        }
        if tr.contents & skipmask != 0 {
            return Err(ConsistencyError::SkipmaskNotRespected);
        }
    }

    // check endpos, with exact equality in the special cases
    if tr.allsolid {
        if !vector_compare(&tr.endpos, start) {
            return Err(ConsistencyError::EndposNotStart);
        }
    } else if tr.fraction == 1.0 {
        if !vector_compare(&tr.endpos, end) {
            return Err(ConsistencyError::EndposNotEnd);
        }
    } else {
        let expected = vector_lerp(start, end, tr.fraction);
        if distance_squared(&tr.endpos, &expected) > square(0.001) {
            return Err(ConsistencyError::EndposDrift);
        }
    }

    // if the trace hit something (excluding allsolid), the plane is valid;
    // there is no way to verify surfaceFlags
    if !tr.allsolid && tr.fraction != 1.0 {
        let normal_length = vector_length(&tr.plane.normal);
        if !(0.999999..=1.000001).contains(&normal_length) {
            return Err(ConsistencyError::BadPlaneNormal);
        }
    }

    Ok(())
}
