//! Pure state with no I/O: the pressed-input set and the refresh scheduler.

pub mod pacing;
pub mod pressed;

pub use pacing::{RefreshScheduler, RequestToken};
pub use pressed::{InputKind, PressedInput, PressedSet, MAX_PRESSED};
