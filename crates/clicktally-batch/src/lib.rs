// clicktally-batch - In-memory accumulation of click counts
//
// Both structures take the current instant as an argument rather than reading a
// clock, so callers decide which time source drives them.

mod buffer;
mod cooldown;

pub use buffer::{BufferLimits, ClickBuffer};
pub use cooldown::CooldownTable;
