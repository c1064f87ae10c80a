// Format engine: compiles a log-line template into a sequence of field
// emitters and renders records against it.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{OnceLock, RwLock};

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local, Timelike};

use crate::record::Record;

/// Default log-line template: timestamp, source basename, tags, message.
pub const DEFAULT_LOG_FORMAT: &str = "%t | %S | %T | %m";

/// Default timestamp template with six fractional digits.
pub const DEFAULT_DATE_FORMAT: &str = "%Y/%m/%d %H:%M:%S.$6";

/// ISO-8601-style timestamp preset.
pub const ISO_8601_DATE_FORMAT: &str = "%Y-%m-%dT%H-%M-%S.$6%z";

const DEFAULT_FRACTION_DIGITS: u32 = 6;
const MAX_FRACTION_DIGITS: u32 = 9;

/// One compiled step of the log-line template.
#[derive(Debug)]
enum Emitter {
    Timestamp,
    SourceFull,
    SourceBasename,
    Tags,
    Message,
    Literal(String),
}

/// A compiled format configuration.
///
/// The log-line template uses `%` tokens:
///
/// - `%t`: timestamp, rendered with the date-format template
/// - `%s`: source string unchanged
/// - `%S`: source stripped of any path elements
/// - `%T`: tags joined by `", "` (cached per source; tags are assumed
///   constant per call site)
/// - `%m`: message content
/// - `%%`: a literal percent sign
///
/// Unrecognized tokens are discarded silently.
///
/// The date-format template uses strftime-style placeholders plus a `$`
/// sentinel marking where fractional seconds go. A digit `1..9` directly
/// after `$` selects the number of decimal places (default 6); every `$` in
/// the template receives the same fractional value.
pub struct FormatConfig {
    emitters: Vec<Emitter>,
    date_segments: Vec<Vec<Item<'static>>>,
    fraction_digits: u32,
}

impl Default for FormatConfig {
    fn default() -> Self {
        let mut config = Self {
            emitters: Vec::new(),
            date_segments: Vec::new(),
            fraction_digits: DEFAULT_FRACTION_DIGITS,
        };
        config.set_format(DEFAULT_LOG_FORMAT, DEFAULT_DATE_FORMAT);
        config
    }
}

impl FormatConfig {
    pub fn new(log_format: &str, date_format: &str) -> Self {
        let mut config = Self::default();
        config.set_format(log_format, date_format);
        config
    }

    /// Recompile both templates. Replaces the previous configuration.
    pub fn set_format(&mut self, log_format: &str, date_format: &str) {
        let (segments, digits) = split_date_format(date_format);
        self.date_segments = segments.iter().map(|s| owned_items(s)).collect();
        self.fraction_digits = digits;

        self.emitters.clear();
        let mut rest = log_format;
        while !rest.is_empty() {
            match rest.find('%') {
                None => {
                    self.emitters.push(Emitter::Literal(rest.to_string()));
                    break;
                }
                Some(pos) => {
                    if pos > 0 {
                        self.emitters.push(Emitter::Literal(rest[..pos].to_string()));
                    }
                    let mut chars = rest[pos + 1..].chars();
                    match chars.next() {
                        Some('t') => self.emitters.push(Emitter::Timestamp),
                        Some('s') => self.emitters.push(Emitter::SourceFull),
                        Some('S') => self.emitters.push(Emitter::SourceBasename),
                        Some('T') => self.emitters.push(Emitter::Tags),
                        Some('m') => self.emitters.push(Emitter::Message),
                        Some('%') => self.emitters.push(Emitter::Literal("%".to_string())),
                        // Unknown token (or a trailing '%'): dropped.
                        _ => {}
                    }
                    rest = chars.as_str();
                }
            }
        }
    }

    /// Render `record` and append the result to `out`. The caller supplies
    /// the buffer so a batch of lines shares one allocation.
    pub fn append_line(&self, record: &Record, out: &mut String) {
        for emitter in &self.emitters {
            match emitter {
                Emitter::Timestamp => self.append_timestamp(&record.timestamp, out),
                Emitter::SourceFull => out.push_str(record.source),
                Emitter::SourceBasename => out.push_str(source_basename(record.source)),
                Emitter::Tags => {
                    with_joined_tags(record.source, &record.tags, |tags| out.push_str(tags))
                }
                Emitter::Message => out.push_str(&record.payload),
                Emitter::Literal(text) => out.push_str(text),
            }
        }
    }

    pub fn format_record(&self, record: &Record) -> String {
        let mut out = String::new();
        self.append_line(record, &mut out);
        out
    }

    fn append_timestamp(&self, timestamp: &DateTime<Local>, out: &mut String) {
        let fraction = fractional_seconds(timestamp, self.fraction_digits);
        for (i, segment) in self.date_segments.iter().enumerate() {
            if i > 0 {
                out.push_str(&fraction);
            }
            let _ = write!(out, "{}", timestamp.format_with_items(segment.iter()));
        }
    }
}

/// Split a date-format template at `$` sentinels, extracting the requested
/// fractional precision. A digit `1..9` immediately after a sentinel is
/// consumed as the precision (the last one wins); any other character stays
/// in the output as a literal and the default precision applies.
fn split_date_format(format: &str) -> (Vec<String>, u32) {
    let mut digits = DEFAULT_FRACTION_DIGITS;
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = format.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            current.push(c);
            continue;
        }
        segments.push(std::mem::take(&mut current));
        if let Some(parsed) = chars.peek().and_then(|next| next.to_digit(10)) {
            if parsed != 0 {
                digits = parsed;
                chars.next();
            }
        }
    }
    segments.push(current);

    (segments, clamp_fraction_digits(digits))
}

pub(crate) fn clamp_fraction_digits(digits: u32) -> u32 {
    digits.clamp(1, MAX_FRACTION_DIGITS)
}

/// The sub-second part of `timestamp`, zero-padded to `digits` places.
fn fractional_seconds(timestamp: &DateTime<Local>, digits: u32) -> String {
    // Leap seconds fold into the preceding second.
    let nanos = timestamp.nanosecond() % 1_000_000_000;
    let scaled = nanos / 10u32.pow(MAX_FRACTION_DIGITS - digits);
    format!("{:0width$}", scaled, width = digits as usize)
}

/// Parse a strftime segment into owned items, silently dropping anything
/// chrono cannot interpret.
fn owned_items(format: &str) -> Vec<Item<'static>> {
    StrftimeItems::new(format)
        .filter_map(|item| match item {
            Item::Literal(s) => Some(Item::OwnedLiteral(s.into())),
            Item::Space(s) => Some(Item::OwnedSpace(s.into())),
            Item::Numeric(numeric, pad) => Some(Item::Numeric(numeric, pad)),
            Item::Fixed(fixed) => Some(Item::Fixed(fixed)),
            _ => None,
        })
        .collect()
}

fn source_basename(source: &str) -> &str {
    match source.rfind(['/', '\\']) {
        Some(pos) => &source[pos + 1..],
        None => source,
    }
}

// The %T emitter joins a record's tags once per source and reuses the result
// for every later record from that source. Safe as long as tags are constant
// per call site, which the pipeline assumes throughout.
static TAG_LINE_CACHE: OnceLock<RwLock<HashMap<&'static str, String>>> = OnceLock::new();

fn tag_cache() -> &'static RwLock<HashMap<&'static str, String>> {
    TAG_LINE_CACHE.get_or_init(Default::default)
}

pub(crate) fn with_joined_tags<R>(
    source: &'static str,
    tags: &[&'static str],
    f: impl FnOnce(&str) -> R,
) -> R {
    {
        let cache = tag_cache().read().unwrap();
        if let Some(line) = cache.get(source) {
            return f(line);
        }
    }
    let joined = tags.join(", ");
    let mut cache = tag_cache().write().unwrap();
    let line = cache.entry(source).or_insert(joined);
    f(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(source: &'static str, tags: Vec<&'static str>, payload: &str) -> Record {
        Record::new(source, tags, payload.to_string())
    }

    #[test]
    fn test_message_only_format() {
        let config = FormatConfig::new("%m", DEFAULT_DATE_FORMAT);
        let r = record("src_a", vec![], "payload text");
        assert_eq!(config.format_record(&r), "payload text");
    }

    #[test]
    fn test_literal_and_percent_escape() {
        let config = FormatConfig::new("100%% -> %m", DEFAULT_DATE_FORMAT);
        let r = record("src_b", vec![], "done");
        assert_eq!(config.format_record(&r), "100% -> done");
    }

    #[test]
    fn test_unknown_token_dropped() {
        let config = FormatConfig::new("%q%m%", DEFAULT_DATE_FORMAT);
        let r = record("src_c", vec![], "body");
        assert_eq!(config.format_record(&r), "body");
    }

    #[test]
    fn test_source_tokens() {
        let config = FormatConfig::new("%s|%S", DEFAULT_DATE_FORMAT);
        let r = record("dir/sub/file.rs::42", vec![], "");
        assert_eq!(config.format_record(&r), "dir/sub/file.rs::42|file.rs::42");

        let backslash = record("dir\\file.rs::7", vec![], "");
        assert_eq!(config.format_record(&backslash), "dir\\file.rs::7|file.rs::7");
    }

    #[test]
    fn test_tags_joined_and_cached() {
        let config = FormatConfig::new("%T", DEFAULT_DATE_FORMAT);
        let first = record("tag_cache_src", vec!["LOG_INFO", "user"], "");
        assert_eq!(config.format_record(&first), "LOG_INFO, user");

        // Same source with different tags still renders the cached line.
        let second = record("tag_cache_src", vec!["other"], "");
        assert_eq!(config.format_record(&second), "LOG_INFO, user");
    }

    #[test]
    fn test_fraction_precision_parsing() {
        let (segments, digits) = split_date_format("%H:%M:%S.$3");
        assert_eq!(segments, vec!["%H:%M:%S.".to_string(), String::new()]);
        assert_eq!(digits, 3);

        // No sentinel: single segment, default precision.
        let (segments, digits) = split_date_format("%H:%M:%S");
        assert_eq!(segments.len(), 1);
        assert_eq!(digits, DEFAULT_FRACTION_DIGITS);

        // Invalid digit after the sentinel stays literal, default applies.
        let (segments, digits) = split_date_format("$0");
        assert_eq!(segments, vec![String::new(), "0".to_string()]);
        assert_eq!(digits, DEFAULT_FRACTION_DIGITS);

        // Multiple sentinels all split; the last precision wins.
        let (segments, digits) = split_date_format("$2-$4");
        assert_eq!(segments.len(), 3);
        assert_eq!(digits, 4);
    }

    #[test]
    fn test_fraction_digit_clamping() {
        assert_eq!(clamp_fraction_digits(0), 1);
        assert_eq!(clamp_fraction_digits(5), 5);
        assert_eq!(clamp_fraction_digits(15), 9);
    }

    #[test]
    fn test_timestamp_rendering() {
        let config = FormatConfig::new("%t", "%Y.$3.%Y");
        let r = record("src_ts", vec![], "");
        let rendered = config.format_record(&r);

        let year = r.timestamp.format("%Y").to_string();
        let parts: Vec<&str> = rendered.split('.').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], year);
        assert_eq!(parts[2], year);
        // Both sentinel positions receive the same three-digit fraction.
        assert_eq!(parts[1].len(), 3);
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_invalid_strftime_token_omitted() {
        let config = FormatConfig::new("%t", "a%Qb");
        let r = record("src_bad_fmt", vec![], "");
        // chrono cannot interpret %Q; the token disappears, the literals stay.
        assert_eq!(config.format_record(&r), "ab");
    }

    #[test]
    fn test_set_format_is_idempotent() {
        let mut config = FormatConfig::default();
        let r = record("src_idem", vec![], "same");
        let before = config.format_record(&r);
        config.set_format(DEFAULT_LOG_FORMAT, DEFAULT_DATE_FORMAT);
        assert_eq!(config.format_record(&r), before);
    }
}
