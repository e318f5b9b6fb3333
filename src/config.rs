//! Tunable constants for the logger core.

/// Capacity of each producer thread's staging buffer, in bytes.
/// Must exceed the encoded size of any single log record.
pub const STAGING_BUFFER_SIZE: usize = 1024 * 1024;

/// Size of each half of the consumer's output double buffer, in bytes.
pub const DOUBLE_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Terminator appended to every formatted log line.
pub const END_OF_LOG: &str = "\r\n";
