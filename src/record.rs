//! Wire format shared by producers and the backend worker.
//!
//! A record is `[header | tail]` where the header is a fixed layout of
//! native-endian words: `timestamp:u64`, then the addresses of the static
//! metadata, the registry-owned logger and the argument decoder function.
//! The tail is the encoded argument blob for log-like records, the address
//! of the flush flag for flush records, and a single trailing level byte
//! when the call site uses a dynamic level. Producers publish only complete
//! records, so a reader that sees one byte can rely on the whole record
//! being present.

use std::fmt::Write as _;

use smallvec::SmallVec;

use crate::level::Level;

/// What a record asks the backend to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Log,
    Flush,
    InitBacktrace,
    FlushBacktrace,
}

/// Static descriptor of a log call site.
///
/// Lives for the whole process (`&'static`); its address is what travels
/// through the queues. `has_named_args` is derived once at construction so
/// the backend never re-scans the format string to classify a record.
#[derive(Debug)]
pub struct Metadata {
    message_format: &'static str,
    source_location: &'static str,
    log_level: Level,
    event_kind: EventKind,
    has_named_args: bool,
}

impl Metadata {
    pub const fn new(
        message_format: &'static str,
        source_location: &'static str,
        log_level: Level,
        event_kind: EventKind,
    ) -> Self {
        Self {
            message_format,
            source_location,
            log_level,
            event_kind,
            has_named_args: has_named_placeholder(message_format),
        }
    }

    pub const fn message_format(&self) -> &'static str {
        self.message_format
    }

    pub const fn source_location(&self) -> &'static str {
        self.source_location
    }

    pub const fn log_level(&self) -> Level {
        self.log_level
    }

    pub const fn event_kind(&self) -> EventKind {
        self.event_kind
    }

    pub const fn has_named_args(&self) -> bool {
        self.has_named_args
    }
}

/// A placeholder is named when `{` is followed by an identifier character.
/// `{{` is an escaped brace, `{}` and `{:spec}` are positional.
const fn has_named_placeholder(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if i + 1 < bytes.len() && bytes[i + 1] == b'{' {
                i += 2;
                continue;
            }
            if i + 1 < bytes.len()
                && (bytes[i + 1].is_ascii_alphabetic() || bytes[i + 1] == b'_')
            {
                return true;
            }
        }
        i += 1;
    }
    false
}

/// One argument as passed by a producer. Borrowed; encoding copies it into
/// the queue.
#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Char(char),
    Str(&'a str),
}

/// Decoded argument owned by the backend's reusable store.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Char(char),
    Str(String),
}

impl std::fmt::Display for ArgValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgValue::Bool(v) => write!(f, "{v}"),
            ArgValue::I64(v) => write!(f, "{v}"),
            ArgValue::U64(v) => write!(f, "{v}"),
            ArgValue::F64(v) => write!(f, "{v}"),
            ArgValue::Char(v) => write!(f, "{v}"),
            ArgValue::Str(v) => f.write_str(v),
        }
    }
}

/// Reusable storage the decoder function fills for every record.
#[derive(Debug, Default)]
pub struct ArgStore {
    values: SmallVec<[ArgValue; 8]>,
}

impl ArgStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn push(&mut self, value: ArgValue) {
        self.values.push(value);
    }

    pub fn values(&self) -> &[ArgValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Producer-supplied decoding of the argument payload. The function advances
/// the reader past exactly the bytes it consumed.
pub type DecoderFn = fn(&mut ByteReader<'_>, &mut ArgStore);

const TAG_BOOL: u8 = 0;
const TAG_I64: u8 = 1;
const TAG_U64: u8 = 2;
const TAG_F64: u8 = 3;
const TAG_CHAR: u8 = 4;
const TAG_STR: u8 = 5;

/// Cursor writing into a reserved queue region.
pub struct ByteWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ByteWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }

    pub fn put_u32(&mut self, v: u32) {
        self.put_bytes(&v.to_ne_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.put_bytes(&v.to_ne_bytes());
    }

    pub fn put_usize(&mut self, v: usize) {
        self.put_bytes(&v.to_ne_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    pub fn written(&self) -> usize {
        self.pos
    }
}

/// Cursor over a record inside a queue's readable region.
///
/// Producers publish only complete records, so running out of bytes here
/// means a corrupted stream; the resulting index panic is caught by the
/// worker's top-level guard and reported through the error notifier.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn get_u8(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }

    pub fn get_u32(&mut self) -> u32 {
        u32::from_ne_bytes(self.get_array())
    }

    pub fn get_u64(&mut self) -> u64 {
        u64::from_ne_bytes(self.get_array())
    }

    pub fn get_usize(&mut self) -> usize {
        usize::from_ne_bytes(self.get_array())
    }

    pub fn get_bytes(&mut self, len: usize) -> &'a [u8] {
        let v = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        v
    }

    /// Bytes consumed so far; the worker passes this to `finish_read`.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    fn get_array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }
}

pub(crate) const HEADER_SIZE: usize = 8 + 3 * std::mem::size_of::<usize>();

/// Fixed-layout front of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordHeader {
    pub timestamp: u64,
    pub metadata: usize,
    pub logger: usize,
    pub decoder: usize,
}

impl RecordHeader {
    pub(crate) fn encode(&self, w: &mut ByteWriter<'_>) {
        w.put_u64(self.timestamp);
        w.put_usize(self.metadata);
        w.put_usize(self.logger);
        w.put_usize(self.decoder);
    }

    pub(crate) fn decode(r: &mut ByteReader<'_>) -> Self {
        Self {
            timestamp: r.get_u64(),
            metadata: r.get_usize(),
            logger: r.get_usize(),
            decoder: r.get_usize(),
        }
    }
}

pub(crate) fn encoded_args_size(args: &[Arg<'_>]) -> usize {
    let mut size = 1;
    for arg in args {
        size += 1;
        size += match arg {
            Arg::Bool(_) => 1,
            Arg::I64(_) | Arg::U64(_) | Arg::F64(_) => 8,
            Arg::Char(_) => 4,
            Arg::Str(s) => 4 + s.len(),
        };
    }
    size
}

pub(crate) fn encode_args(args: &[Arg<'_>], w: &mut ByteWriter<'_>) {
    w.put_u8(args.len() as u8);
    for arg in args {
        match arg {
            Arg::Bool(v) => {
                w.put_u8(TAG_BOOL);
                w.put_u8(u8::from(*v));
            }
            Arg::I64(v) => {
                w.put_u8(TAG_I64);
                w.put_u64(*v as u64);
            }
            Arg::U64(v) => {
                w.put_u8(TAG_U64);
                w.put_u64(*v);
            }
            Arg::F64(v) => {
                w.put_u8(TAG_F64);
                w.put_u64(v.to_bits());
            }
            Arg::Char(v) => {
                w.put_u8(TAG_CHAR);
                w.put_u32(*v as u32);
            }
            Arg::Str(v) => {
                w.put_u8(TAG_STR);
                w.put_u32(v.len() as u32);
                w.put_bytes(v.as_bytes());
            }
        }
    }
}

/// The reference decoder; its address travels inside every record header.
pub fn decode_args(r: &mut ByteReader<'_>, store: &mut ArgStore) {
    let count = r.get_u8();
    for _ in 0..count {
        let value = match r.get_u8() {
            TAG_BOOL => ArgValue::Bool(r.get_u8() != 0),
            TAG_I64 => ArgValue::I64(r.get_u64() as i64),
            TAG_U64 => ArgValue::U64(r.get_u64()),
            TAG_F64 => ArgValue::F64(f64::from_bits(r.get_u64())),
            TAG_CHAR => ArgValue::Char(char::from_u32(r.get_u32()).unwrap_or('\u{fffd}')),
            TAG_STR => {
                let len = r.get_u32() as usize;
                ArgValue::Str(String::from_utf8_lossy(r.get_bytes(len)).into_owned())
            }
            _ => ArgValue::Str(String::from("<bad arg tag>")),
        };
        store.push(value);
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum MessageFormatError {
    #[error("unmatched '{{' in format string")]
    UnclosedBrace,
    #[error("unmatched '}}' in format string")]
    StrayCloseBrace,
    #[error("format string references argument {index} but only {provided} were provided")]
    MissingArgument { index: usize, provided: usize },
}

/// Expands positional placeholders against decoded arguments.
///
/// `{{` and `}}` emit literal braces. Placeholder contents (`{:>8}` and the
/// like) are ignored; every value renders through its `Display`.
pub(crate) fn format_message(
    fmt: &str,
    args: &[ArgValue],
    out: &mut String,
) -> Result<(), MessageFormatError> {
    let bytes = fmt.as_bytes();
    let mut i = 0;
    let mut lit_start = 0;
    let mut next_arg = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' => {
                if bytes.get(i + 1) == Some(&b'{') {
                    out.push_str(&fmt[lit_start..=i]);
                    i += 2;
                    lit_start = i;
                    continue;
                }
                out.push_str(&fmt[lit_start..i]);
                let close = bytes[i + 1..]
                    .iter()
                    .position(|&b| b == b'}')
                    .ok_or(MessageFormatError::UnclosedBrace)?;
                let arg = args
                    .get(next_arg)
                    .ok_or(MessageFormatError::MissingArgument {
                        index: next_arg,
                        provided: args.len(),
                    })?;
                let _ = write!(out, "{arg}");
                next_arg += 1;
                i += 2 + close;
                lit_start = i;
            }
            b'}' => {
                if bytes.get(i + 1) == Some(&b'}') {
                    out.push_str(&fmt[lit_start..=i]);
                    i += 2;
                    lit_start = i;
                    continue;
                }
                return Err(MessageFormatError::StrayCloseBrace);
            }
            _ => i += 1,
        }
    }

    out.push_str(&fmt[lit_start..]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = RecordHeader {
            timestamp: 123_456_789,
            metadata: 0xdead_beef,
            logger: 0xcafe,
            decoder: (decode_args as DecoderFn) as usize,
        };

        let mut buf = vec![0u8; HEADER_SIZE];
        let mut w = ByteWriter::new(&mut buf);
        header.encode(&mut w);
        assert_eq!(w.written(), HEADER_SIZE);

        let mut r = ByteReader::new(&buf);
        assert_eq!(RecordHeader::decode(&mut r), header);
        assert_eq!(r.consumed(), HEADER_SIZE);
    }

    #[test]
    fn args_round_trip() {
        let args = [
            Arg::Bool(true),
            Arg::I64(-42),
            Arg::U64(7),
            Arg::F64(2.5),
            Arg::Char('x'),
            Arg::Str("hello"),
        ];

        let mut buf = vec![0u8; encoded_args_size(&args)];
        let mut w = ByteWriter::new(&mut buf);
        encode_args(&args, &mut w);
        assert_eq!(w.written(), buf.len());

        let mut r = ByteReader::new(&buf);
        let mut store = ArgStore::new();
        decode_args(&mut r, &mut store);
        assert_eq!(r.consumed(), buf.len());

        assert_eq!(
            store.values(),
            &[
                ArgValue::Bool(true),
                ArgValue::I64(-42),
                ArgValue::U64(7),
                ArgValue::F64(2.5),
                ArgValue::Char('x'),
                ArgValue::Str("hello".to_string()),
            ]
        );
    }

    #[test]
    fn named_placeholder_detection() {
        const PLAIN: Metadata = Metadata::new("a {} b", "f.rs:1", Level::Info, EventKind::Log);
        const PADDED: Metadata = Metadata::new("{:>8}", "f.rs:2", Level::Info, EventKind::Log);
        const NAMED: Metadata = Metadata::new("user={user}", "f.rs:3", Level::Info, EventKind::Log);
        const ESCAPED: Metadata = Metadata::new("{{name}}", "f.rs:4", Level::Info, EventKind::Log);

        assert!(!PLAIN.has_named_args());
        assert!(!PADDED.has_named_args());
        assert!(NAMED.has_named_args());
        assert!(!ESCAPED.has_named_args());
    }

    #[test]
    fn format_positional() {
        let mut out = String::new();
        format_message(
            "x={} y={}",
            &[ArgValue::U64(1), ArgValue::Str("two".into())],
            &mut out,
        )
        .unwrap();
        assert_eq!(out, "x=1 y=two");
    }

    #[test]
    fn format_escaped_braces() {
        let mut out = String::new();
        format_message("literal {{ and }} text {}", &[ArgValue::U64(9)], &mut out).unwrap();
        assert_eq!(out, "literal { and } text 9");
    }

    #[test]
    fn format_missing_argument() {
        let mut out = String::new();
        let err = format_message("{} {}", &[ArgValue::U64(1)], &mut out).unwrap_err();
        assert!(matches!(
            err,
            MessageFormatError::MissingArgument { index: 1, provided: 1 }
        ));
    }

    #[test]
    fn format_stray_brace() {
        let mut out = String::new();
        assert!(matches!(
            format_message("oops }", &[], &mut out),
            Err(MessageFormatError::StrayCloseBrace)
        ));
        out.clear();
        assert!(matches!(
            format_message("oops {", &[], &mut out),
            Err(MessageFormatError::UnclosedBrace)
        ));
    }
}
