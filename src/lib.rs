//! stagelog - a low-latency asynchronous logger.
//!
//! Worker threads never block on I/O or formatting. Each producing thread
//! owns a private lock-free staging buffer and deposits a compact binary
//! record into it; a single background consumer thread reclaims those
//! records, reconstructs human-readable lines against pre-analyzed format
//! descriptors, and performs file I/O through an asynchronous writer with
//! double-buffered output.
//!
//! ```text
//! [worker threads] -> [staging buffers] -> [consumer] -> [async writer] -> file
//!   stagelog!()        SPSC byte pipes      assembler      double buffer
//! ```
//!
//! # Quick start
//!
//! ```ignore
//! use stagelog::LogLevel;
//!
//! stagelog::set_output_file("app.log")?;
//! stagelog::set_severity_threshold(LogLevel::Debug);
//!
//! stagelog!(LogLevel::Info, "listening on %s:%u", "0.0.0.0", 8080u16);
//! stagelog!(LogLevel::Debug, "pool ready, %zu workers, load %.2f", workers, load);
//!
//! stagelog::sync();      // wait until everything above is on disk
//! ```
//!
//! Format strings use printf grammar (`%n` excluded) and are analyzed once
//! per callsite, at first use. Every line is emitted as
//!
//! ```text
//! YYYY-MM-DD HH:MM:SS.mmm <file>:<line> [<SEVERITY>][<producer_id>]: <body>\r\n
//! ```
//!
//! where the producer id is the zero-based index handed to the thread's
//! staging buffer on first use. Records from one thread keep their commit
//! order in the file; ordering across threads is only as good as their
//! timestamps.

pub mod assembler;
pub mod clock;
pub mod config;
pub mod format;
pub mod logger;
pub mod printf;
pub mod record;
pub mod registry;
pub mod staging_buffer;
pub mod writer;

pub use format::{FormatError, LogLevel, UNREGISTERED_LOG_ID};
pub use logger::{
    get_severity_threshold, live_buffer_count, set_output_file, set_severity_threshold, shutdown,
    sync, Callsite,
};
pub use record::{LogArg, Loggable};
pub use writer::WriteError;
