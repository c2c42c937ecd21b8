// ── Client-side caches ──
//
// Object documents, simulated states and memoized request results.

mod memo;
mod objects;
mod states;

pub(crate) use memo::MemoCache;
pub(crate) use objects::{ObjectCache, ObjectUpdate};
pub(crate) use states::SimulatedStates;
