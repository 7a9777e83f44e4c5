//! Transfer bookkeeping shared between the deposit driver and storage backends.

pub mod progress;

pub use progress::{format_bytes, format_duration, format_speed, ProgressTracker, SharedProgress};
