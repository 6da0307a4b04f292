//! Post-mortem diagnostics: a ring of recent checkpoints plus a fatal-signal
//! handler that dumps it, together with a stack trace, to stderr.

pub mod checkpoint;
pub mod signal;

pub use checkpoint::{Checkpoint, CheckpointRing, CHECKPOINT_SLOTS};
pub use signal::{install_handlers, is_installed, FATAL_SIGNALS};
