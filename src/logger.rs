//! The process-wide logger: producer API, per-thread staging buffer
//! management, and the background consumer loop.
//!
//! Producers never block on I/O or formatting. A [`stagelog!`] callsite
//! filters on severity, registers its descriptor on first use, computes the
//! exact encoded size of its record, reserves that many bytes from the
//! calling thread's staging buffer, writes the record and commits. The
//! single consumer thread polls every live staging buffer, re-inflates
//! records against their descriptors, and hands completed output halves to
//! the asynchronous writer.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use lazy_static::lazy_static;

use crate::assembler::{LogAssembler, RecordView};
use crate::clock;
use crate::config;
use crate::format::{analyze_format, LogLevel, ParamType, StaticLogInfo, UNREGISTERED_LOG_ID};
use crate::record::{self, LogArg};
use crate::registry::{LogRegistry, ShadowRegistry};
use crate::staging_buffer::{DestructGuard, StagingBuffer};
use crate::writer::{AsyncWriter, WriteError, WriterControl, WriterStats};

lazy_static! {
    static ref LOGGER: Logger = Logger::start();
}

thread_local! {
    /// Per-thread owner of the staging buffer. Its drop at thread exit
    /// marks the buffer for destruction by the consumer.
    static STAGING_GUARD: DestructGuard = DestructGuard::new();
}

struct ProducerList {
    buffers: Vec<Arc<StagingBuffer>>,
    next_buffer_id: u32,
}

/// Singleton state. Created lazily on first use; the consumer and writer
/// threads start with it.
pub struct Logger {
    current_log_level: AtomicU8,
    registry: LogRegistry,
    producers: Mutex<ProducerList>,
    should_exit: AtomicBool,
    consumer_thread: Mutex<Option<thread::JoinHandle<()>>>,
    writer_control: WriterControl,
    writer_stats: Arc<WriterStats>,
    /// Completed consumer passes, observed by [`sync`].
    passes: AtomicU64,
}

impl Logger {
    fn start() -> Logger {
        let (writer, control) = AsyncWriter::spawn();
        let stats = writer.stats();

        let handle = thread::Builder::new()
            .name("stagelog-consumer".into())
            .spawn(move || consumer_main(writer))
            .expect("failed to spawn log consumer thread");

        Logger {
            current_log_level: AtomicU8::new(LogLevel::Info as u8),
            registry: LogRegistry::new(),
            producers: Mutex::new(ProducerList {
                buffers: Vec::new(),
                next_buffer_id: 0,
            }),
            should_exit: AtomicBool::new(false),
            consumer_thread: Mutex::new(Some(handle)),
            writer_control: control,
            writer_stats: stats,
            passes: AtomicU64::new(0),
        }
    }

    fn allocate_staging_buffer(&self) -> Arc<StagingBuffer> {
        let buffer_id = {
            let mut list = self.producers.lock().unwrap();
            let id = list.next_buffer_id;
            list.next_buffer_id += 1;
            id
        };
        // Allocation happens outside the lock.
        let buffer = Arc::new(StagingBuffer::new(buffer_id, config::STAGING_BUFFER_SIZE));
        self.producers.lock().unwrap().buffers.push(buffer.clone());
        buffer
    }
}

/// Runs `f` against the calling thread's staging buffer, creating and
/// registering it on first use.
fn with_staging_buffer<R>(f: impl FnOnce(&StagingBuffer) -> R) -> R {
    STAGING_GUARD.with(|guard| {
        if let Some(buffer) = guard.buffer() {
            return f(&buffer);
        }
        let buffer = LOGGER.allocate_staging_buffer();
        guard.bind(buffer.clone());
        f(&buffer)
    })
}

/// Per-callsite identity generated by the [`stagelog!`] expansion: the
/// stable id slot plus the cached descriptor.
pub struct Callsite {
    id: AtomicI32,
    info: OnceLock<Arc<StaticLogInfo>>,
}

impl Callsite {
    pub const fn new() -> Callsite {
        Callsite {
            id: AtomicI32::new(UNREGISTERED_LOG_ID),
            info: OnceLock::new(),
        }
    }

    /// The registered id, or [`UNREGISTERED_LOG_ID`] before first use.
    pub fn log_id(&self) -> i32 {
        self.id.load(Ordering::Relaxed)
    }
}

impl Default for Callsite {
    fn default() -> Callsite {
        Callsite::new()
    }
}

/// Builds a callsite's descriptor, panicking on a malformed callsite: a
/// format string the analyzer rejects, or arguments that do not line up
/// with it. Both are programming errors the process should fail loudly on,
/// at first use of the callsite.
fn build_descriptor(
    filename: &'static str,
    line: u32,
    severity: LogLevel,
    fmt: &'static str,
    args: &[LogArg],
) -> StaticLogInfo {
    let analysis = match analyze_format(fmt) {
        Ok(a) => a,
        Err(e) => panic!("stagelog: bad format string at {}:{}: {}", filename, line, e),
    };

    if analysis.param_types.len() != args.len() {
        panic!(
            "stagelog: callsite {}:{} passes {} arguments but format {:?} consumes {}",
            filename,
            line,
            args.len(),
            fmt,
            analysis.param_types.len()
        );
    }
    for (index, (pt, arg)) in analysis.param_types.iter().zip(args).enumerate() {
        let ok = match pt {
            ParamType::DynamicWidth | ParamType::DynamicPrecision => !matches!(
                arg,
                LogArg::Str(_) | LogArg::WideStr(_) | LogArg::F32(_) | LogArg::F64(_)
            ),
            _ if pt.is_string() => matches!(arg, LogArg::Str(_) | LogArg::WideStr(_)),
            _ => true,
        };
        if !ok {
            panic!(
                "stagelog: callsite {}:{} argument {} does not fit parameter {:?} of format {:?}",
                filename, line, index, pt, fmt
            );
        }
    }

    let param_sizes = record::param_sizes_for(&analysis.param_types, args);
    StaticLogInfo {
        filename,
        line_number: line,
        severity,
        format: fmt,
        conversion_storage: analysis.conversion_storage.into_boxed_slice(),
        fragments: analysis.fragments.into_boxed_slice(),
        param_types: analysis.param_types.into_boxed_slice(),
        param_sizes: param_sizes.into_boxed_slice(),
    }
}

fn encode_into(buffer: &StagingBuffer, info: &StaticLogInfo, log_id: i32, args: &[LogArg], blocking: bool) -> bool {
    let info_size = record::record_size(&info.param_types, args);
    let timestamp = clock::unix_millis();

    let Some(write_pos) = buffer.reserve(info_size, blocking) else {
        return false;
    };
    unsafe {
        record::encode_record(
            write_pos,
            log_id as u64,
            info_size as u64,
            timestamp,
            &info.param_types,
            args,
        );
    }
    buffer.commit(info_size);
    true
}

/// Encodes and commits one record, blocking while the staging buffer is
/// full. Returns immediately when `severity` is above the configured
/// threshold. Normally invoked through [`stagelog!`].
pub fn log(
    callsite: &Callsite,
    filename: &'static str,
    line: u32,
    severity: LogLevel,
    fmt: &'static str,
    args: &[LogArg],
) {
    let logger = &*LOGGER;
    if severity as u8 > logger.current_log_level.load(Ordering::Relaxed) {
        return;
    }

    let info = callsite
        .info
        .get_or_init(|| logger.registry.register(&callsite.id, build_descriptor(filename, line, severity, fmt, args)).1);
    let log_id = callsite.id.load(Ordering::Relaxed);

    with_staging_buffer(|buffer| encode_into(buffer, info, log_id, args, true));
}

/// Like [`log`] but drops the record instead of blocking when the staging
/// buffer cannot take it. Returns whether the record was committed.
pub fn try_log(
    callsite: &Callsite,
    filename: &'static str,
    line: u32,
    severity: LogLevel,
    fmt: &'static str,
    args: &[LogArg],
) -> bool {
    let logger = &*LOGGER;
    if severity as u8 > logger.current_log_level.load(Ordering::Relaxed) {
        return false;
    }

    let info = callsite
        .info
        .get_or_init(|| logger.registry.register(&callsite.id, build_descriptor(filename, line, severity, fmt, args)).1);
    let log_id = callsite.id.load(Ordering::Relaxed);

    with_staging_buffer(|buffer| encode_into(buffer, info, log_id, args, false))
}

/// Sets the highest severity that still gets written. [`LogLevel::None`]
/// disables all output.
pub fn set_severity_threshold(level: LogLevel) {
    LOGGER.current_log_level.store(level as u8, Ordering::Relaxed);
}

pub fn get_severity_threshold() -> LogLevel {
    LogLevel::from_u8(LOGGER.current_log_level.load(Ordering::Relaxed))
}

/// Redirects output to `path`, opened create/append/read-write with
/// data-sync-on-write. On failure the current output target stays in place.
pub fn set_output_file<P: AsRef<Path>>(path: P) -> Result<(), WriteError> {
    let path = path.as_ref();
    let mut options = OpenOptions::new();
    options.create(true).append(true).read(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_DSYNC);
    }
    let file = options.open(path).map_err(|source| WriteError::Open {
        path: path.display().to_string(),
        source,
    })?;
    LOGGER.writer_control.set_target(file);
    Ok(())
}

/// Number of staging buffers currently owned by the logger, including those
/// awaiting destruction.
pub fn live_buffer_count() -> usize {
    LOGGER.producers.lock().unwrap().buffers.len()
}

const SYNC_POLL: Duration = Duration::from_micros(200);

/// Blocks until every record committed before this call has been handed to
/// the operating system: all staging buffers drained, the partial output
/// half flushed, and no asynchronous write outstanding.
pub fn sync() {
    let logger = &*LOGGER;
    loop {
        if logger.consumer_thread.lock().unwrap().is_none() {
            // Shut down already; the teardown path drained everything.
            return;
        }

        let all_empty = logger
            .producers
            .lock()
            .unwrap()
            .buffers
            .iter()
            .all(|b| b.is_empty());
        if !all_empty {
            thread::sleep(SYNC_POLL);
            continue;
        }

        // Two more full passes flush whatever the assembler had buffered
        // when we looked.
        let pass0 = logger.passes.load(Ordering::Acquire);
        while logger.passes.load(Ordering::Acquire) < pass0 + 2
            && !logger.should_exit.load(Ordering::Acquire)
        {
            thread::sleep(SYNC_POLL);
        }
        while !logger.writer_stats.idle() {
            thread::sleep(SYNC_POLL);
        }
        return;
    }
}

/// Drains all staging buffers, flushes outstanding output and joins the
/// consumer and writer threads. Idempotent. Records committed after this
/// call are never written.
pub fn shutdown() {
    let logger = &*LOGGER;
    logger.should_exit.store(true, Ordering::Release);
    let handle = logger.consumer_thread.lock().unwrap().take();
    if let Some(handle) = handle {
        let _ = handle.join();
    }
}

/// Waits for the outstanding write, exchanges the double-buffer halves,
/// submits the filled half and points the assembler at the fresh one.
fn swap_double_buffer(
    writer: &mut AsyncWriter,
    assembler: &mut LogAssembler,
    active: &mut Box<[u8]>,
    spare: &mut Option<Box<[u8]>>,
) {
    if let Some(recycled) = writer.wait_for_completion() {
        *spare = Some(recycled);
    }

    let filled_len = assembler.written_bytes();
    debug_assert!(filled_len > 0);
    let fresh = spare.take().expect("an idle double-buffer half");
    let filled = std::mem::replace(active, fresh);
    writer.submit(filled, filled_len);

    assembler.set_output(active.as_mut_ptr(), active.len());
}

fn reap_buffer(logger: &Logger, buffer: &Arc<StagingBuffer>) {
    let mut list = logger.producers.lock().unwrap();
    if let Some(pos) = list.buffers.iter().position(|b| Arc::ptr_eq(b, buffer)) {
        // Re-check under the lock; the flag and the drained condition were
        // observed outside it.
        if list.buffers[pos].is_destroyable() {
            list.buffers.remove(pos);
        }
    }
}

fn consumer_main(mut writer: AsyncWriter) {
    let logger = &*LOGGER;

    let mut assembler = LogAssembler::new();
    let mut shadow = ShadowRegistry::new();
    let mut active: Box<[u8]> = vec![0u8; config::DOUBLE_BUFFER_SIZE].into_boxed_slice();
    let mut spare: Option<Box<[u8]>> = Some(vec![0u8; config::DOUBLE_BUFFER_SIZE].into_boxed_slice());
    assembler.set_output(active.as_mut_ptr(), active.len());

    loop {
        let buffers: Vec<Arc<StagingBuffer>> = logger.producers.lock().unwrap().buffers.clone();
        let mut did_work = false;

        for buffer in &buffers {
            let (read_pos, peek_bytes) = buffer.peek();
            if peek_bytes == 0 {
                if buffer.is_destroyable() {
                    reap_buffer(logger, buffer);
                }
                continue;
            }
            did_work = true;

            let mut bytes_consumed = 0usize;
            while bytes_consumed < peek_bytes {
                // SAFETY: the producer only reuses these bytes after
                // consume(), which happens once the record is assembled.
                let record_bytes =
                    unsafe { std::slice::from_raw_parts(read_pos.add(bytes_consumed), peek_bytes - bytes_consumed) };
                let Some(view) = (unsafe { RecordView::parse(record_bytes) }) else {
                    break;
                };
                let info_size = view.header.info_size as usize;
                if info_size < record::HEADER_SIZE || info_size > record_bytes.len() {
                    // Corrupt length; drop everything peeked so far.
                    buffer.consume(peek_bytes - bytes_consumed);
                    break;
                }

                if view.header.log_id as usize >= shadow.len() {
                    shadow.refresh(&logger.registry);
                }
                match shadow.get(view.header.log_id) {
                    Some(info) => {
                        // SAFETY: args stay readable until consume() below.
                        unsafe { assembler.load(info, view, buffer.id()) };
                        while assembler.has_remaining() {
                            assembler.step();
                            if assembler.is_full() {
                                if assembler.written_bytes() == 0 {
                                    // A single piece larger than a whole
                                    // output half can never fit.
                                    eprintln!(
                                        "stagelog: log line fragment exceeds the output buffer, record truncated"
                                    );
                                    break;
                                }
                                swap_double_buffer(&mut writer, &mut assembler, &mut active, &mut spare);
                            }
                        }
                    }
                    None => {
                        // Unknown id even after a refresh: skip the record.
                    }
                }

                bytes_consumed += info_size;
                buffer.consume(info_size);
            }
        }

        if assembler.written_bytes() > 0 {
            swap_double_buffer(&mut writer, &mut assembler, &mut active, &mut spare);
        }
        logger.passes.fetch_add(1, Ordering::Release);

        if logger.should_exit.load(Ordering::Acquire) {
            let all_empty = logger
                .producers
                .lock()
                .unwrap()
                .buffers
                .iter()
                .all(|b| b.is_empty());
            if all_empty && assembler.written_bytes() == 0 {
                break;
            }
        }

        if !did_work {
            thread::yield_now();
        }
    }

    writer.shutdown();
}

/// Logs one record through the process-wide logger.
///
/// The first argument is the severity, the second a printf-style format
/// string literal; the rest must match the format's parameters. The format
/// is analyzed once per callsite and reused afterwards.
///
/// ```ignore
/// stagelog!(LogLevel::Info, "accepted %s:%d after %ld ms", host, port, elapsed);
/// ```
#[macro_export]
macro_rules! stagelog {
    ($severity:expr, $fmt:expr $(, $arg:expr)* $(,)?) => {{
        static CALLSITE: $crate::logger::Callsite = $crate::logger::Callsite::new();
        $crate::logger::log(
            &CALLSITE,
            file!(),
            line!(),
            $severity,
            $fmt,
            &[$($crate::record::Loggable::as_log_arg(&$arg)),*],
        );
    }};
}
