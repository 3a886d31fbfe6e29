//! Rendering of transit events into output lines.
//!
//! A [`PatternFormatter`] expands a logger's `%(attribute)` template once per
//! event into a caller-provided buffer. Formatters are shared: the worker
//! installs one per logger, looked up in a weak-reference cache keyed by
//! `(format_pattern, time_pattern, timezone)`, so loggers with identical
//! templates render through a single instance.
//!
//! Named-argument templates are parsed once per distinct format string and
//! cached; the per-value strings are recovered by formatting every value in
//! one pass joined by an unprintable delimiter and splitting the result.

use std::fmt::Write as _;
use std::sync::{Arc, Weak};

use fxhash::FxHashMap;
use time::format_description::OwnedFormatItem;
use time::{OffsetDateTime, UtcOffset};

use crate::record::{format_message, ArgValue, Metadata, MessageFormatError};

/// Reference timezone for rendered timestamps.
///
/// An enum rather than a zone name: cache-key equality is exact and no
/// case-sensitivity rules are inherited from a timezone database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timezone {
    Utc,
    /// The machine's UTC offset, resolved once when the formatter is built.
    /// Falls back to UTC when the platform cannot report it safely.
    Local,
}

pub const DEFAULT_PATTERN: &str =
    "%(time) [%(thread_id)] %(source_location) %(log_level) %(logger) %(message)";
pub const DEFAULT_TIME_PATTERN: &str =
    "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:9]";

#[derive(Debug, thiserror::Error)]
pub(crate) enum FormatPatternError {
    #[error("invalid time pattern: {0}")]
    InvalidTimePattern(#[from] time::error::InvalidFormatDescription),
    #[error("unknown format attribute `%({0})`")]
    UnknownAttribute(String),
    #[error("unclosed `%(` in format pattern")]
    UnclosedAttribute,
}

pub(crate) struct TimestampFormatter {
    items: OwnedFormatItem,
    offset: UtcOffset,
}

impl TimestampFormatter {
    pub(crate) fn new(time_pattern: &str, timezone: Timezone) -> Result<Self, FormatPatternError> {
        let items = time::format_description::parse_owned::<2>(time_pattern)?;
        let offset = match timezone {
            Timezone::Utc => UtcOffset::UTC,
            Timezone::Local => UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC),
        };
        Ok(Self { items, offset })
    }

    pub(crate) fn format(&self, timestamp_ns: u64, out: &mut String) {
        let odt = OffsetDateTime::from_unix_timestamp_nanos(timestamp_ns as i128)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
            .to_offset(self.offset);

        // SAFETY: format_into writes valid UTF-8 into the Vec backing the
        // String; the time crate only emits valid UTF-8.
        unsafe {
            odt.format_into(out.as_mut_vec(), &self.items).ok();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attr {
    Time,
    ThreadId,
    ThreadName,
    ProcessId,
    Logger,
    Level,
    Message,
    SourceLocation,
    NamedArgs,
}

enum Segment {
    Literal(String),
    Attr(Attr),
}

/// Renders one event per the logger's output template, e.g.
/// `"%(time) [%(thread_id)] %(log_level) %(logger) %(message)"`.
pub(crate) struct PatternFormatter {
    format_pattern: String,
    time_pattern: String,
    timezone: Timezone,
    segments: Vec<Segment>,
    timestamp: TimestampFormatter,
}

impl PatternFormatter {
    pub(crate) fn new(
        format_pattern: &str,
        time_pattern: &str,
        timezone: Timezone,
    ) -> Result<Self, FormatPatternError> {
        Ok(Self {
            format_pattern: format_pattern.to_string(),
            time_pattern: time_pattern.to_string(),
            timezone,
            segments: parse_pattern(format_pattern)?,
            timestamp: TimestampFormatter::new(time_pattern, timezone)?,
        })
    }

    pub(crate) fn matches(&self, format_pattern: &str, time_pattern: &str, timezone: Timezone) -> bool {
        self.format_pattern == format_pattern
            && self.time_pattern == time_pattern
            && self.timezone == timezone
    }

    /// Expands the template into `out`, appending the trailing newline.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn format(
        &self,
        timestamp: u64,
        thread_id: u64,
        thread_name: &str,
        process_id: &str,
        logger_name: &str,
        level_str: &str,
        metadata: &Metadata,
        named_args: Option<&[(String, String)]>,
        message: &str,
        out: &mut String,
    ) {
        out.clear();
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => out.push_str(lit),
                Segment::Attr(Attr::Time) => self.timestamp.format(timestamp, out),
                Segment::Attr(Attr::ThreadId) => {
                    let _ = write!(out, "{thread_id}");
                }
                Segment::Attr(Attr::ThreadName) => out.push_str(thread_name),
                Segment::Attr(Attr::ProcessId) => out.push_str(process_id),
                Segment::Attr(Attr::Logger) => out.push_str(logger_name),
                Segment::Attr(Attr::Level) => out.push_str(level_str),
                Segment::Attr(Attr::Message) => out.push_str(message),
                Segment::Attr(Attr::SourceLocation) => out.push_str(metadata.source_location()),
                Segment::Attr(Attr::NamedArgs) => {
                    if let Some(pairs) = named_args {
                        for (i, (name, value)) in pairs.iter().enumerate() {
                            if i > 0 {
                                out.push(' ');
                            }
                            let _ = write!(out, "{name}={value}");
                        }
                    }
                }
            }
        }
        out.push('\n');
    }
}

fn parse_pattern(pattern: &str) -> Result<Vec<Segment>, FormatPatternError> {
    let mut segments = Vec::new();
    let mut rest = pattern;

    while let Some(start) = rest.find("%(") {
        if start > 0 {
            segments.push(Segment::Literal(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after.find(')').ok_or(FormatPatternError::UnclosedAttribute)?;
        let name = &after[..end];
        let attr = match name {
            "time" => Attr::Time,
            "thread_id" => Attr::ThreadId,
            "thread_name" => Attr::ThreadName,
            "process_id" => Attr::ProcessId,
            "logger" => Attr::Logger,
            "log_level" => Attr::Level,
            "message" => Attr::Message,
            "source_location" => Attr::SourceLocation,
            "named_args" => Attr::NamedArgs,
            other => return Err(FormatPatternError::UnknownAttribute(other.to_string())),
        };
        segments.push(Segment::Attr(attr));
        rest = &after[end + 1..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    Ok(segments)
}

/// Weak-reference registry of shared pattern formatters.
///
/// The loggers hold the strong references; expired entries are swept during
/// the worker's idle cleanup after loggers were removed.
#[derive(Default)]
pub(crate) struct FormatterCache {
    entries: Vec<Weak<PatternFormatter>>,
}

impl FormatterCache {
    pub(crate) fn find_or_create(
        &mut self,
        format_pattern: &str,
        time_pattern: &str,
        timezone: Timezone,
    ) -> Result<Arc<PatternFormatter>, FormatPatternError> {
        for entry in &self.entries {
            if let Some(formatter) = entry.upgrade() {
                if formatter.matches(format_pattern, time_pattern, timezone) {
                    return Ok(formatter);
                }
            }
        }

        let formatter = Arc::new(PatternFormatter::new(format_pattern, time_pattern, timezone)?);
        self.entries.push(Arc::downgrade(&formatter));
        Ok(formatter)
    }

    pub(crate) fn sweep_expired(&mut self) {
        self.entries.retain(|entry| entry.strong_count() > 0);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// `(stripped_format, names)` per distinct named-argument format string,
/// keyed by the static string's identity so lookups avoid rehashing the
/// text beyond a pointer-length hash of the slice.
#[derive(Default)]
pub(crate) struct NamedArgTemplateCache {
    templates: FxHashMap<&'static str, (String, Vec<String>)>,
}

impl NamedArgTemplateCache {
    pub(crate) fn get_or_parse(&mut self, format: &'static str) -> &(String, Vec<String>) {
        self.templates
            .entry(format)
            .or_insert_with(|| parse_named_format(format))
    }
}

/// Splits `"user={user} n={count}"` into `("user={} n={}", ["user", "count"])`.
/// Adjacent `{{` / `}}` pairs are escapes and are copied through untouched.
pub(crate) fn parse_named_format(format: &str) -> (String, Vec<String>) {
    let bytes = format.as_bytes();
    let mut stripped = String::with_capacity(format.len());
    let mut names = Vec::new();
    let mut i = 0;
    let mut lit_start = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => i += 2,
            b'}' if bytes.get(i + 1) == Some(&b'}') => i += 2,
            b'{' => {
                let Some(off) = bytes[i + 1..].iter().position(|&b| b == b'}') else {
                    break;
                };
                let close = i + 1 + off;
                stripped.push_str(&format[lit_start..i]);
                stripped.push_str("{}");
                names.push(format[i + 1..close].to_string());
                i = close + 1;
                lit_start = i;
            }
            _ => i += 1,
        }
    }

    stripped.push_str(&format[lit_start..]);
    (stripped, names)
}

pub(crate) const NAMED_ARG_DELIMITER: &str = "\u{1}\u{2}\u{3}";

/// Fills the value half of `named_args` from the decoded arguments.
///
/// Formats all values once, joined by the three-byte unprintable delimiter,
/// then splits; this recovers per-field strings without a formatting call
/// per field.
pub(crate) fn format_and_split_arguments(
    named_args: &mut [(String, String)],
    args: &[ArgValue],
    fmt_buf: &mut String,
    split_buf: &mut String,
) -> Result<(), MessageFormatError> {
    fmt_buf.clear();
    for i in 0..named_args.len() {
        fmt_buf.push_str("{}");
        if i + 1 < named_args.len() {
            fmt_buf.push_str(NAMED_ARG_DELIMITER);
        }
    }

    split_buf.clear();
    format_message(fmt_buf, args, split_buf)?;

    let mut idx = 0;
    let mut rest: &str = split_buf;
    while let Some(p) = rest.find(NAMED_ARG_DELIMITER) {
        if idx < named_args.len() {
            named_args[idx].1.clear();
            named_args[idx].1.push_str(&rest[..p]);
            idx += 1;
        }
        rest = &rest[p + NAMED_ARG_DELIMITER.len()..];
    }
    if idx < named_args.len() {
        named_args[idx].1.clear();
        named_args[idx].1.push_str(rest);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::Level;
    use crate::record::EventKind;

    #[test]
    fn parse_named_format_basic() {
        let (stripped, names) = parse_named_format("user={user} count={count}");
        assert_eq!(stripped, "user={} count={}");
        assert_eq!(names, vec!["user", "count"]);
    }

    #[test]
    fn parse_named_format_escapes() {
        let (stripped, names) = parse_named_format("literal {{ and }} text {name}");
        assert_eq!(stripped, "literal {{ and }} text {}");
        assert_eq!(names, vec!["name"]);
    }

    #[test]
    fn parse_named_format_is_idempotent() {
        let fmt = "a={alpha} b={beta}";
        assert_eq!(parse_named_format(fmt), parse_named_format(fmt));
    }

    #[test]
    fn template_cache_parses_once() {
        let mut cache = NamedArgTemplateCache::default();
        let first = cache.get_or_parse("x={x}").clone();
        let second = cache.get_or_parse("x={x}").clone();
        assert_eq!(first, second);
        assert_eq!(first.0, "x={}");
    }

    #[test]
    fn format_and_split_recovers_values() {
        let mut named = vec![
            ("user".to_string(), String::new()),
            ("count".to_string(), String::new()),
        ];
        let args = [ArgValue::Str("alice".into()), ArgValue::U64(3)];
        let mut fmt_buf = String::new();
        let mut split_buf = String::new();
        format_and_split_arguments(&mut named, &args, &mut fmt_buf, &mut split_buf).unwrap();
        assert_eq!(named[0], ("user".to_string(), "alice".to_string()));
        assert_eq!(named[1], ("count".to_string(), "3".to_string()));
    }

    #[test]
    fn formatter_cache_shares_identical_keys() {
        let mut cache = FormatterCache::default();
        let a = cache
            .find_or_create(DEFAULT_PATTERN, DEFAULT_TIME_PATTERN, Timezone::Utc)
            .unwrap();
        let b = cache
            .find_or_create(DEFAULT_PATTERN, DEFAULT_TIME_PATTERN, Timezone::Utc)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = cache
            .find_or_create("%(message)", DEFAULT_TIME_PATTERN, Timezone::Utc)
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn formatter_cache_sweeps_expired_entries() {
        let mut cache = FormatterCache::default();
        let a = cache
            .find_or_create("%(message)", DEFAULT_TIME_PATTERN, Timezone::Utc)
            .unwrap();
        assert_eq!(cache.len(), 1);
        drop(a);
        cache.sweep_expired();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn pattern_formatter_renders_line() {
        static META: Metadata = Metadata::new("x={}", "main.rs:7", Level::Info, EventKind::Log);

        let formatter = PatternFormatter::new(
            "%(time) [%(thread_id)] %(source_location) %(log_level) %(logger) %(message)",
            "[year]-[month]-[day]",
            Timezone::Utc,
        )
        .unwrap();

        let mut out = String::new();
        formatter.format(
            0,
            42,
            "worker",
            "1234",
            "root",
            "INFO",
            &META,
            None,
            "x=9",
            &mut out,
        );
        assert_eq!(out, "1970-01-01 [42] main.rs:7 INFO root x=9\n");
    }

    #[test]
    fn pattern_formatter_named_args_attribute() {
        static META: Metadata = Metadata::new("", "f.rs:1", Level::Info, EventKind::Log);
        let formatter =
            PatternFormatter::new("%(message) %(named_args)", DEFAULT_TIME_PATTERN, Timezone::Utc)
                .unwrap();

        let named = vec![
            ("user".to_string(), "alice".to_string()),
            ("count".to_string(), "3".to_string()),
        ];
        let mut out = String::new();
        formatter.format(0, 1, "t", "1", "l", "INFO", &META, Some(&named), "msg", &mut out);
        assert_eq!(out, "msg user=alice count=3\n");
    }

    #[test]
    fn unknown_attribute_is_rejected() {
        assert!(matches!(
            PatternFormatter::new("%(bogus)", DEFAULT_TIME_PATTERN, Timezone::Utc),
            Err(FormatPatternError::UnknownAttribute(_))
        ));
    }
}
