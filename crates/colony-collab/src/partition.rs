use crate::session::{Assignment, SessionSnapshot, WorkArea};
use colony_core::Position;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Largest block coordinate a slice boundary can take and still be exact as `f64`.
const MAX_BLOCK_COORD: f64 = 9_007_199_254_740_992.0;

/// Assigns work to the participants of a session.
///
/// Returned assignments are keyed by agent id and replace the session's
/// previous ones wholesale. `options` are the caller's per-call settings.
pub trait Partitioner: Send + Sync {
    fn name(&self) -> &str;

    fn partition(
        &self,
        session: &SessionSnapshot,
        options: &Map<String, Value>,
    ) -> BTreeMap<String, Assignment>;
}

impl<F> Partitioner for F
where
    F: Fn(&SessionSnapshot, &Map<String, Value>) -> BTreeMap<String, Assignment> + Send + Sync,
{
    fn name(&self) -> &str {
        "custom"
    }

    fn partition(
        &self,
        session: &SessionSnapshot,
        options: &Map<String, Value>,
    ) -> BTreeMap<String, Assignment> {
        self(session, options)
    }
}

/// Slices the work area evenly along x, one slice per participant in order.
///
/// The area comes from `options.workArea`, falling back to the session's
/// `metadata.workArea`. Slices are whole blocks; when the width does not
/// divide evenly the first slices are one block wider. Participants beyond
/// the width, or every participant when there is no usable area, get only a
/// slot. An area is unusable when its x-bounds are not finite or lie beyond
/// the range where block coordinates stay exact.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpatialPartitioner;

impl Partitioner for SpatialPartitioner {
    fn name(&self) -> &str {
        "spatial"
    }

    fn partition(
        &self,
        session: &SessionSnapshot,
        options: &Map<String, Value>,
    ) -> BTreeMap<String, Assignment> {
        let area = options
            .get("workArea")
            .and_then(WorkArea::from_value)
            .or_else(|| session.work_area());
        let slices = match area {
            Some(area) => slice_x(&area, session.participants.len()),
            None => Vec::new(),
        };

        session
            .participants
            .iter()
            .enumerate()
            .map(|(slot, participant)| {
                let assignment = match slices.get(slot) {
                    Some(slice) => Assignment::slot(slot).with_area(*slice),
                    None => Assignment::slot(slot),
                };
                (participant.agent_id.clone(), assignment)
            })
            .collect()
    }
}

/// Split `area` into at most `parts` contiguous x-ranges covering it exactly.
///
/// Returns nothing when the x-range cannot be sliced in whole blocks.
fn slice_x(area: &WorkArea, parts: usize) -> Vec<WorkArea> {
    if parts == 0 {
        return Vec::new();
    }
    let (Some(x0), Some(x1)) = (
        block_coord(area.start.x.min(area.end.x)),
        block_coord(area.start.x.max(area.end.x)),
    ) else {
        return Vec::new();
    };
    let Some(width) = x1
        .checked_sub(x0)
        .and_then(|span| span.checked_add(1))
        .and_then(|w| usize::try_from(w).ok())
    else {
        return Vec::new();
    };
    let parts = parts.min(width);
    let base = width / parts;
    let extra = width % parts;

    let (y0, y1) = (area.start.y.min(area.end.y), area.start.y.max(area.end.y));
    let (z0, z1) = (area.start.z.min(area.end.z), area.start.z.max(area.end.z));

    let mut cursor = x0;
    (0..parts)
        .map(|i| {
            let len = (base + usize::from(i < extra)) as i64;
            let slice = WorkArea::new(
                Position::new(cursor as f64, y0, z0),
                Position::new((cursor + len - 1) as f64, y1, z1),
            );
            cursor += len;
            slice
        })
        .collect()
}

fn block_coord(x: f64) -> Option<i64> {
    let block = x.floor();
    (block.is_finite() && block.abs() <= MAX_BLOCK_COORD).then_some(block as i64)
}
