//! Resumable log-line assembler.
//!
//! The assembler turns `(descriptor, record, producer id)` into formatted
//! bytes, one sub-write at a time, and copes with the output region filling
//! up mid-record. Each completed sub-phase is recorded in a flag (or, for
//! the body, in the three walk indices), so a later [`LogAssembler::step`]
//! call against a fresh output region resumes exactly where the previous
//! one stopped. Phases run in fixed order:
//!
//! ```text
//! timestamp -> file:line -> severity -> producer id -> body -> "\r\n"
//! ```
//!
//! Prefix phases and the trailer are all-or-nothing. Literal format text is
//! copied byte-by-byte and may split across output regions. A specifier
//! expansion either fits completely or is rolled back (walk indices and the
//! argument read cursor restored) and retried after the caller swaps the
//! output buffer.

use std::fmt::Write as _;
use std::ptr;
use std::sync::Arc;

use crate::clock;
use crate::config;
use crate::format::{ConversionType, FormatFragment, ParamType, StaticLogInfo};
use crate::printf::{self, Value};
use crate::record::{self, RecordHeader};

/// One decoded record, pointing at its argument bytes inside a staging
/// buffer.
#[derive(Debug, Clone, Copy)]
pub struct RecordView {
    pub header: RecordHeader,
    /// Start of the argument bytes, `header.info_size - HEADER_SIZE` long.
    pub args: *const u8,
}

impl RecordView {
    /// Reads the record at the head of `bytes`.
    ///
    /// # Safety
    ///
    /// `bytes` must start at a committed record header, with the full
    /// `info_size` bytes present behind the pointer.
    pub unsafe fn parse(bytes: &[u8]) -> Option<RecordView> {
        let header = RecordHeader::read(bytes)?;
        Some(RecordView {
            header,
            args: bytes.as_ptr().add(record::HEADER_SIZE),
        })
    }
}

#[derive(Clone, Copy)]
enum PrefixField {
    FileAndLine,
    ProducerId,
}

/// Resumable formatter. Holds a raw output cursor installed by
/// [`LogAssembler::set_output`] and per-record state installed by
/// [`LogAssembler::load`].
pub struct LogAssembler {
    write_pos: *mut u8,
    buffer_size: usize,
    written_count: usize,
    bytes_last_written: usize,

    conversion_index: usize,
    parameter_index: usize,
    format_index: usize,

    info: Option<Arc<StaticLogInfo>>,
    args_read_pos: *const u8,

    timestamp_str: [u8; clock::TIMESTAMP_LEN],
    timestamp_len: usize,
    file_and_line: String,
    producer_id_str: String,
    scratch: Vec<u8>,

    is_full: bool,

    timestamp_written: bool,
    file_and_line_written: bool,
    severity_written: bool,
    producer_id_written: bool,
    end_of_log_written: bool,
}

impl LogAssembler {
    pub fn new() -> LogAssembler {
        LogAssembler {
            write_pos: ptr::null_mut(),
            buffer_size: 0,
            written_count: 0,
            bytes_last_written: 0,
            conversion_index: 0,
            parameter_index: 0,
            format_index: 0,
            info: None,
            args_read_pos: ptr::null(),
            timestamp_str: [0; clock::TIMESTAMP_LEN],
            timestamp_len: 0,
            file_and_line: String::new(),
            producer_id_str: String::from("[0]: "),
            scratch: Vec::new(),
            is_full: false,

            timestamp_written: false,
            file_and_line_written: false,
            severity_written: false,
            producer_id_written: false,
            end_of_log_written: false,
        }
    }

    /// Installs a fresh writable region and clears the full condition.
    pub fn set_output(&mut self, buf: *mut u8, size: usize) {
        self.write_pos = buf;
        self.buffer_size = size;
        self.written_count = 0;
        self.is_full = false;
    }

    /// Binds the next record and precomputes its prefix renderings.
    ///
    /// # Safety
    ///
    /// `record.args` must stay readable until the record is fully assembled
    /// (the caller consumes staging-buffer bytes only afterwards).
    pub unsafe fn load(&mut self, info: &Arc<StaticLogInfo>, record: RecordView, producer_id: u32) {
        self.info = Some(info.clone());
        self.args_read_pos = record.args;

        self.timestamp_len = clock::render_timestamp(record.header.ms_timestamp, &mut self.timestamp_str);

        self.file_and_line.clear();
        let _ = write!(self.file_and_line, "{}:{} ", info.filename, info.line_number);

        self.producer_id_str.clear();
        let _ = write!(self.producer_id_str, "[{}]: ", producer_id);

        self.reset_indices();
        self.reset_flags();
    }

    fn reset_indices(&mut self) {
        self.conversion_index = 0;
        self.parameter_index = 0;
        self.format_index = 0;
    }

    fn reset_flags(&mut self) {
        self.timestamp_written = false;
        self.file_and_line_written = false;
        self.severity_written = false;
        self.producer_id_written = false;
        self.end_of_log_written = false;
        self.is_full = false;
    }

    /// True while the loaded record has bytes left to emit.
    pub fn has_remaining(&self) -> bool {
        self.info.is_some() && !self.end_of_log_written
    }

    /// True when the last [`LogAssembler::step`] stopped on an exhausted
    /// output region.
    pub fn is_full(&self) -> bool {
        self.is_full
    }

    /// Bytes written into the current output region so far.
    pub fn written_bytes(&self) -> usize {
        self.written_count
    }

    pub fn free_bytes(&self) -> usize {
        self.buffer_size - self.written_count
    }

    fn finish_write(&mut self, n: usize) {
        self.bytes_last_written += n;
        self.written_count += n;
        self.write_pos = unsafe { self.write_pos.add(n) };
    }

    /// All-or-nothing write of a byte run that does not live in `self`.
    fn try_write_bytes(&mut self, src: &[u8]) -> bool {
        if src.len() > self.free_bytes() {
            self.is_full = true;
            return false;
        }
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.write_pos, src.len());
        }
        self.finish_write(src.len());
        true
    }

    /// All-or-nothing write of the precomputed prefix string selected by
    /// `field` (a borrow of a `self` field cannot cross the `&mut self`
    /// call, so the field is picked inside).
    fn try_write_prefix(&mut self, field: PrefixField) -> bool {
        let len = match field {
            PrefixField::FileAndLine => self.file_and_line.len(),
            PrefixField::ProducerId => self.producer_id_str.len(),
        };
        if len > self.free_bytes() {
            self.is_full = true;
            return false;
        }
        let src = match field {
            PrefixField::FileAndLine => self.file_and_line.as_ptr(),
            PrefixField::ProducerId => self.producer_id_str.as_ptr(),
        };
        unsafe {
            ptr::copy_nonoverlapping(src, self.write_pos, len);
        }
        self.finish_write(len);
        true
    }

    /// Copies a literal run of format text, collapsing `%%` escapes and
    /// splitting at the output boundary when needed. Returns the number of
    /// format bytes consumed; sets the full flag when the run did not fit.
    fn write_literal_run(&mut self, run: &[u8]) -> usize {
        let mut consumed = 0;
        while consumed < run.len() {
            // Any '%' inside a literal run starts a "%%" escape; a lone '%'
            // would have been parsed as a specifier.
            let plain_len = run[consumed..]
                .iter()
                .position(|&b| b == b'%')
                .unwrap_or(run.len() - consumed);

            let free = self.free_bytes();
            let n = plain_len.min(free);
            if n > 0 {
                unsafe {
                    ptr::copy_nonoverlapping(run.as_ptr().add(consumed), self.write_pos, n);
                }
                self.finish_write(n);
                consumed += n;
            }
            if n < plain_len {
                self.is_full = true;
                return consumed;
            }

            if consumed < run.len() {
                // At an escape: emit one '%', consume two bytes.
                if self.free_bytes() == 0 {
                    self.is_full = true;
                    return consumed;
                }
                unsafe {
                    *self.write_pos = b'%';
                }
                self.finish_write(1);
                consumed += 2;
            }
        }
        consumed
    }

    /// Decodes and expands the specifier at `fragment`, appending to
    /// `scratch`. Returns the argument bytes to advance past on success.
    unsafe fn expand_specifier(
        &mut self,
        info: &StaticLogInfo,
        fragment: &FormatFragment,
        dyn_width: Option<i64>,
        dyn_precision: Option<i64>,
    ) -> usize {
        let stencil = info.stencil(fragment);
        let arg_size = info.param_sizes[self.parameter_index];
        self.scratch.clear();

        match fragment.conversion_type {
            ConversionType::ByteString => {
                let len = record::load_usize(self.args_read_pos);
                let bytes = std::slice::from_raw_parts(self.args_read_pos.add(std::mem::size_of::<usize>()), len);
                printf::expand(stencil, dyn_width, dyn_precision, Value::Bytes(bytes), &mut self.scratch);
                std::mem::size_of::<usize>() + len + 1
            }
            ConversionType::WideString => {
                let byte_len = record::load_usize(self.args_read_pos);
                let mut units = Vec::with_capacity(byte_len / 4);
                let base = self.args_read_pos.add(std::mem::size_of::<usize>());
                for k in 0..byte_len / 4 {
                    units.push(record::load_unsigned(base.add(k * 4), 4) as u32);
                }
                printf::expand(stencil, dyn_width, dyn_precision, Value::Wide(&units), &mut self.scratch);
                std::mem::size_of::<usize>() + byte_len + 1
            }
            ConversionType::Pointer => {
                let v = record::load_unsigned(self.args_read_pos, arg_size);
                printf::expand(stencil, dyn_width, dyn_precision, Value::Pointer(v), &mut self.scratch);
                arg_size
            }
            t if t.is_float() => {
                let v = record::load_float(self.args_read_pos, arg_size);
                printf::expand(stencil, dyn_width, dyn_precision, Value::Float(v), &mut self.scratch);
                arg_size
            }
            t if t.is_unsigned_integer() => {
                let v = record::load_unsigned(self.args_read_pos, arg_size);
                printf::expand(stencil, dyn_width, dyn_precision, Value::Unsigned(v), &mut self.scratch);
                arg_size
            }
            _ => {
                let v = record::load_signed(self.args_read_pos, arg_size);
                printf::expand(stencil, dyn_width, dyn_precision, Value::Signed(v), &mut self.scratch);
                arg_size
            }
        }
    }

    /// Runs until the record is fully emitted or the output region cannot
    /// take the next sub-write. Returns the bytes written by this call.
    pub fn step(&mut self) -> usize {
        self.bytes_last_written = 0;
        if self.is_full {
            return 0;
        }
        let Some(info) = self.info.clone() else {
            return 0;
        };

        if !self.timestamp_written {
            let ts = self.timestamp_str;
            if !self.try_write_bytes(&ts[..self.timestamp_len]) {
                return self.bytes_last_written;
            }
            self.timestamp_written = true;
        }

        if !self.file_and_line_written {
            if !self.try_write_prefix(PrefixField::FileAndLine) {
                return self.bytes_last_written;
            }
            self.file_and_line_written = true;
        }

        if !self.severity_written {
            if !self.try_write_bytes(info.severity.tag().as_bytes()) {
                return self.bytes_last_written;
            }
            self.severity_written = true;
        }

        if !self.producer_id_written {
            if !self.try_write_prefix(PrefixField::ProducerId) {
                return self.bytes_last_written;
            }
            self.producer_id_written = true;
        }

        let format = info.format.as_bytes();
        while self.format_index < format.len() {
            let fragment = info.fragments.get(self.conversion_index).copied();

            match fragment {
                Some(fragment) if self.format_index >= fragment.format_pos => {
                    // Snapshot for rollback; dynamic width/precision reads
                    // advance the cursor before we know the expansion fits.
                    let saved_conversion = self.conversion_index;
                    let saved_parameter = self.parameter_index;
                    let saved_read_pos = self.args_read_pos;

                    let mut dyn_width = None;
                    let mut dyn_precision = None;

                    if info.param_types[self.parameter_index] == ParamType::DynamicWidth {
                        let size = info.param_sizes[self.parameter_index];
                        dyn_width = Some(unsafe { record::load_signed(self.args_read_pos, size) });
                        self.args_read_pos = unsafe { self.args_read_pos.add(size) };
                        self.parameter_index += 1;
                    }
                    if info.param_types[self.parameter_index] == ParamType::DynamicPrecision {
                        let size = info.param_sizes[self.parameter_index];
                        dyn_precision = Some(unsafe { record::load_signed(self.args_read_pos, size) });
                        self.args_read_pos = unsafe { self.args_read_pos.add(size) };
                        self.parameter_index += 1;
                    }

                    let advance = unsafe { self.expand_specifier(&info, &fragment, dyn_width, dyn_precision) };

                    if self.scratch.len() > self.free_bytes() {
                        self.conversion_index = saved_conversion;
                        self.parameter_index = saved_parameter;
                        self.args_read_pos = saved_read_pos;
                        self.is_full = true;
                        return self.bytes_last_written;
                    }

                    let n = self.scratch.len();
                    unsafe {
                        ptr::copy_nonoverlapping(self.scratch.as_ptr(), self.write_pos, n);
                    }
                    self.finish_write(n);

                    self.args_read_pos = unsafe { self.args_read_pos.add(advance) };
                    self.parameter_index += 1;
                    self.conversion_index += 1;
                    self.format_index += fragment.specifier_length;
                }
                _ => {
                    // Literal text up to the next specifier or the end.
                    let run_end = fragment.map_or(format.len(), |f| f.format_pos);
                    let run_start = self.format_index;
                    let consumed = self.write_literal_run(&format[run_start..run_end]);
                    self.format_index += consumed;
                    if self.is_full {
                        return self.bytes_last_written;
                    }
                }
            }
        }

        if !self.end_of_log_written {
            if !self.try_write_bytes(config::END_OF_LOG.as_bytes()) {
                return self.bytes_last_written;
            }
            self.end_of_log_written = true;
        }

        self.bytes_last_written
    }
}

impl Default for LogAssembler {
    fn default() -> LogAssembler {
        LogAssembler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{analyze_format, LogLevel};
    use crate::record::{encode_record, record_size, LogArg};

    fn make_info(
        filename: &'static str,
        line: u32,
        severity: LogLevel,
        fmt: &'static str,
        args: &[LogArg],
    ) -> Arc<StaticLogInfo> {
        let analysis = analyze_format(fmt).unwrap();
        let param_sizes = record::param_sizes_for(&analysis.param_types, args);
        Arc::new(StaticLogInfo {
            filename,
            line_number: line,
            severity,
            format: fmt,
            conversion_storage: analysis.conversion_storage.into_boxed_slice(),
            fragments: analysis.fragments.into_boxed_slice(),
            param_types: analysis.param_types.into_boxed_slice(),
            param_sizes: param_sizes.into_boxed_slice(),
        })
    }

    fn encode(info: &StaticLogInfo, args: &[LogArg], ts: i64) -> Vec<u8> {
        let size = record_size(&info.param_types, args);
        let mut buf = vec![0u8; size];
        unsafe {
            encode_record(buf.as_mut_ptr(), 0, size as u64, ts, &info.param_types, args);
        }
        buf
    }

    /// Assembles one record into a single large buffer.
    fn assemble(info: &Arc<StaticLogInfo>, record_bytes: &[u8], producer_id: u32) -> String {
        let mut out = vec![0u8; 4096];
        let mut assembler = LogAssembler::new();
        assembler.set_output(out.as_mut_ptr(), out.len());
        let view = unsafe { RecordView::parse(record_bytes) }.unwrap();
        unsafe { assembler.load(info, view, producer_id) };
        while assembler.has_remaining() {
            assembler.step();
            assert!(!assembler.is_full(), "4 KiB must fit a test line");
        }
        let n = assembler.written_bytes();
        String::from_utf8(out[..n].to_vec()).unwrap()
    }

    #[test]
    fn line_shape() {
        // Scenario: "Hello %d World\n" with 42, INFO, a.cc:10, producer 0.
        let args = [LogArg::I32(42)];
        let info = make_info("a.cc", 10, LogLevel::Info, "Hello %d World\n", &args);
        let record = encode(&info, &args, 1_700_000_000_000);

        let line = assemble(&info, &record, 0);
        assert_eq!(&line[clock::TIMESTAMP_LEN..], "a.cc:10 [INFO][0]: Hello 42 World\n\r\n");
        // Millisecond rendering is locale-independent.
        assert!(line[..clock::TIMESTAMP_LEN].ends_with(".000 "));
    }

    #[test]
    fn severity_tags_and_producer_ids() {
        let info = make_info("b.cc", 7, LogLevel::Warning, "w", &[]);
        let record = encode(&info, &[], 0);
        let line = assemble(&info, &record, 13);
        assert!(line.contains("b.cc:7 [WARNING][13]: w\r\n"));
    }

    #[test]
    fn dynamic_width_and_precision_body() {
        // Scenario: "a=%d b=%*.*lf" with (7, 8, 2, 3.14159).
        let args = [
            LogArg::I32(7),
            LogArg::I32(8),
            LogArg::I32(2),
            LogArg::F64(3.14159),
        ];
        let info = make_info("c.cc", 1, LogLevel::Info, "a=%d b=%*.*lf", &args);
        let record = encode(&info, &args, 0);
        let line = assemble(&info, &record, 0);
        assert!(line.ends_with("a=7 b=    3.14\r\n"), "line was {:?}", line);
    }

    #[test]
    fn string_bodies() {
        let args = [LogArg::I32(3), LogArg::Str("abcdef")];
        let info = make_info("s.cc", 2, LogLevel::Info, "val=%.*s|", &args);
        let record = encode(&info, &args, 0);
        let line = assemble(&info, &record, 0);
        assert!(line.ends_with("val=abc|\r\n"));

        // %.0s prints nothing.
        let args = [LogArg::Str("payload")];
        let info = make_info("s.cc", 3, LogLevel::Info, "<%.0s>", &args);
        let record = encode(&info, &args, 0);
        let line = assemble(&info, &record, 0);
        assert!(line.ends_with("<>\r\n"));
    }

    #[test]
    fn wide_string_body() {
        let wide = ['o' as u32, 'k' as u32];
        let args = [LogArg::WideStr(&wide)];
        let info = make_info("w.cc", 4, LogLevel::Info, "wide=%ls", &args);
        let record = encode(&info, &args, 0);
        let line = assemble(&info, &record, 0);
        assert!(line.ends_with("wide=ok\r\n"));
    }

    #[test]
    fn percent_escape_emits_single_percent() {
        let args = [LogArg::I32(99)];
        let info = make_info("e.cc", 5, LogLevel::Info, "100%% of %d", &args);
        let record = encode(&info, &args, 0);
        let line = assemble(&info, &record, 0);
        assert!(line.ends_with("100% of 99\r\n"), "line was {:?}", line);
    }

    /// Drives one record through output regions of `region_size` bytes and
    /// returns the per-region outputs.
    fn assemble_split(info: &Arc<StaticLogInfo>, record_bytes: &[u8], region_size: usize) -> Vec<Vec<u8>> {
        let mut regions = Vec::new();
        let mut out = vec![0u8; region_size];
        let mut assembler = LogAssembler::new();
        assembler.set_output(out.as_mut_ptr(), out.len());
        let view = unsafe { RecordView::parse(record_bytes) }.unwrap();
        unsafe { assembler.load(info, view, 0) };
        loop {
            assembler.step();
            if assembler.is_full() {
                regions.push(out[..assembler.written_bytes()].to_vec());
                assembler.set_output(out.as_mut_ptr(), out.len());
                continue;
            }
            if !assembler.has_remaining() {
                if assembler.written_bytes() > 0 {
                    regions.push(out[..assembler.written_bytes()].to_vec());
                }
                return regions;
            }
        }
    }

    #[test]
    fn output_exhaustion_splits_and_resumes() {
        // 42-byte prefix plus a 46-byte literal body plus the terminator:
        // a 90-byte line split across 64-byte halves as 64 + 26.
        let body: &'static str = "this literal body runs exactly forty-six chars";
        assert_eq!(body.len(), 46);
        let info = make_info("x.cc", 1, LogLevel::Info, body, &[]);
        let record = encode(&info, &[], 1_700_000_000_000);

        let reference = assemble(&info, &record, 0);
        assert_eq!(reference.len(), 90);

        let regions = assemble_split(&info, &record, 64);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].len(), 64);
        let joined: Vec<u8> = regions.concat();
        assert_eq!(String::from_utf8(joined).unwrap(), reference);
    }

    #[test]
    fn specifier_rollback_is_clean() {
        // A wide expansion lands on a region boundary: the specifier must
        // re-emit completely in the next region, never partially.
        let args = [LogArg::I64(1234567890123)];
        let info = make_info("r.cc", 9, LogLevel::Info, "n=%020lld;", &args);
        let record = encode(&info, &args, 0);

        let reference = assemble(&info, &record, 0);
        for region_size in 45..70 {
            let regions = assemble_split(&info, &record, region_size);
            let joined: Vec<u8> = regions.concat();
            assert_eq!(
                String::from_utf8(joined).unwrap(),
                reference,
                "split at region size {}",
                region_size
            );
        }
    }

    #[test]
    fn tiny_regions_still_make_progress() {
        let args = [LogArg::I32(5), LogArg::Str("abc")];
        let info = make_info("t.cc", 3, LogLevel::Debug, "v=%d s=%s end", &args);
        let record = encode(&info, &args, 0);

        let reference = assemble(&info, &record, 0);
        let regions = assemble_split(&info, &record, 26);
        let joined: Vec<u8> = regions.concat();
        assert_eq!(String::from_utf8(joined).unwrap(), reference);
    }
}
