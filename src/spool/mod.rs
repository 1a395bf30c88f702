//! The spool: an append-only intermediate file of raw samples.
//!
//! A sampling session writes every captured [`Sample`](crate::Sample) to the
//! spool as it goes; the post-pass reads them back in order and streams them
//! through the symbolizer into a renderer. The format is private and
//! versioned, and the reader tolerates a truncated tail so a spool from a
//! crashed session is still consumable.

pub mod format;
pub mod writer;

pub use writer::{SpoolReader, SpoolWriter};
