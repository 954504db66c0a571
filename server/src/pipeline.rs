//! Concurrent per-entity update pipeline
//!
//! Once per tick the driver snapshots the world and fans the entities out
//! over a fixed pool of scoped worker threads. Each worker builds the
//! synchronization delta for its assigned entities against the same immutable
//! snapshot, writes into its own disjoint slice of the output table, and
//! reports one barrier arrival per entity. The driver blocks on the barrier,
//! so no delta leaves the pipeline until every entity has been accounted for.
//!
//! A failed delta is logged and dropped; the arrival is still reported, so
//! one bad entity never stalls the tick for everyone else.

use log::error;
use std::thread;
use thiserror::Error;

use protocol::codec::{CodecError, Writer};

use crate::barrier::TickBarrier;
use crate::session::SessionId;
use crate::world::{EntityView, World, VIEW_DISTANCE};

/// Most entities one delta will describe besides the owner
const MAX_VISIBLE: usize = 255;

#[derive(Debug, Error)]
pub enum WorkerFailure {
    #[error("delta encoding failed: {0}")]
    Encode(#[from] CodecError),
}

/// Finished update frame payload for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDelta {
    pub session: SessionId,
    pub bytes: Vec<u8>,
}

pub struct UpdatePipeline {
    workers: usize,
}

impl UpdatePipeline {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Builds this tick's deltas, one per live entity. Returns only after
    /// every entity's arrival has been reported to the tick barrier.
    pub fn run(&self, world: &World) -> Vec<EntityDelta> {
        let views = world.snapshot();
        let count = views.len();
        if count == 0 {
            return Vec::new();
        }

        let barrier = TickBarrier::new(count);
        let mut outputs: Vec<Option<EntityDelta>> = Vec::with_capacity(count);
        outputs.resize_with(count, || None);
        let chunk = (count + self.workers - 1) / self.workers;

        thread::scope(|scope| {
            for (worker, slots) in outputs.chunks_mut(chunk).enumerate() {
                let views = &views;
                let barrier = &barrier;
                scope.spawn(move || {
                    let base = worker * chunk;
                    for (offset, slot) in slots.iter_mut().enumerate() {
                        let index = base + offset;
                        match build_delta(views, index) {
                            Ok(delta) => *slot = Some(delta),
                            Err(e) => {
                                error!("update worker {} failed on entity {}: {}", worker, index, e)
                            }
                        }
                        barrier.arrive();
                    }
                });
            }
            barrier.wait();
        });

        outputs.into_iter().flatten().collect()
    }
}

/// Encodes one entity's view of the tick.
///
/// Bit section: own movement (1-bit moved flag, then a 3-bit direction when
/// set), a 1-bit broadcast-block flag, then an 8-bit count of visible
/// neighbours followed by their positions as 11-bit coordinates local to the
/// view square. Byte section, present only when the flag was set: a mask
/// byte, an appearance block for `0x1`, a chat block for `0x2`.
fn build_delta(views: &[EntityView], index: usize) -> Result<EntityDelta, WorkerFailure> {
    let me = &views[index];
    let mut writer = Writer::new();

    writer.begin_bits();
    match me.last_step {
        Some(step) => {
            writer.put_bits(1, 1)?;
            writer.put_bits(3, step.value())?;
        }
        None => writer.put_bits(1, 0)?,
    }

    let has_block = me.appearance_dirty || me.chat.is_some();
    writer.put_bits(1, has_block as u32)?;

    let visible: Vec<&EntityView> = views
        .iter()
        .enumerate()
        .filter(|(other, view)| *other != index && in_view(me, view))
        .map(|(_, view)| view)
        .take(MAX_VISIBLE)
        .collect();
    writer.put_bits(8, visible.len() as u32)?;
    for other in &visible {
        writer.put_bits(11, local_coord(me.x, other.x))?;
        writer.put_bits(11, local_coord(me.y, other.y))?;
    }
    writer.end_bits()?;

    if has_block {
        let mut mask = 0u8;
        if me.appearance_dirty {
            mask |= 0x1;
        }
        if me.chat.is_some() {
            mask |= 0x2;
        }
        writer.put_u8(mask);
        if me.appearance_dirty {
            writer.put_cstring(&me.username);
            writer.put_u8(0); // head icon
        }
        if let Some(chat) = &me.chat {
            writer.put_cstring(chat);
        }
    }

    Ok(EntityDelta {
        session: me.session,
        bytes: writer.into_bytes(),
    })
}

fn in_view(me: &EntityView, other: &EntityView) -> bool {
    let dx = (me.x as i32 - other.x as i32).unsigned_abs() as u16;
    let dy = (me.y as i32 - other.y as i32).unsigned_abs() as u16;
    dx.max(dy) <= VIEW_DISTANCE
}

/// Coordinate relative to the view square's corner, always non-negative
fn local_coord(mine: u16, other: u16) -> u32 {
    (other as i32 - mine as i32 + VIEW_DISTANCE as i32) as u32
}
