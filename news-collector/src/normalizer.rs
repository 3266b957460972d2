//! Feed markup to [`Item`] conversion.
//!
//! RSS 2.0 `<item>`, RSS 1.0 `<item>` and Atom `<entry>` elements are read
//! with a streaming reader that honours the document's declared encoding.

use crate::types::{AggregatorError, Batch, Item, Result, UndatedPolicy, ZERO_TIME};
use chrono::{DateTime, NaiveDateTime};
use quick_xml::encoding::Decoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Link,
    Description,
    Summary,
    Content,
    Date,
}

impl Field {
    fn from_local_name(name: &[u8]) -> Option<Self> {
        match name {
            b"title" => Some(Field::Title),
            b"link" => Some(Field::Link),
            b"description" => Some(Field::Description),
            b"summary" => Some(Field::Summary),
            b"content" | b"encoded" => Some(Field::Content),
            b"pubDate" | b"date" | b"published" | b"updated" => Some(Field::Date),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct EntryBuilder {
    title: Option<String>,
    link: Option<String>,
    alternate_link: Option<String>,
    description: Option<String>,
    summary: Option<String>,
    content: Option<String>,
    date: Option<String>,
}

impl EntryBuilder {
    fn set(&mut self, field: Field, value: String) {
        if value.trim().is_empty() {
            return;
        }
        let slot = match field {
            Field::Title => &mut self.title,
            Field::Link => &mut self.link,
            Field::Description => &mut self.description,
            Field::Summary => &mut self.summary,
            Field::Content => &mut self.content,
            Field::Date => &mut self.date,
        };
        if slot.is_none() {
            *slot = Some(value);
        }
    }

    /// Atom links carry the target in `href`; `rel="alternate"` (or no rel)
    /// points at the article itself.
    fn link_from_attributes(&mut self, start: &BytesStart<'_>, decoder: Decoder) {
        let mut href = None;
        let mut alternate = true;
        for attr in start.attributes().flatten() {
            match attr.key.local_name().as_ref() {
                b"href" => {
                    href = attr
                        .decode_and_unescape_value(decoder)
                        .ok()
                        .map(|v| v.into_owned())
                }
                b"rel" => alternate = attr.value.as_ref() == b"alternate",
                _ => {}
            }
        }
        if let Some(href) = href {
            if alternate && self.alternate_link.is_none() {
                self.alternate_link = Some(href);
            } else if self.link.is_none() {
                self.link = Some(href);
            }
        }
    }

    fn build(self, undated: UndatedPolicy) -> Option<Item> {
        let link = self
            .alternate_link
            .or(self.link)
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty());
        let Some(link) = link else {
            debug!("Skipping entry without link");
            return None;
        };

        let raw_date = self.date.unwrap_or_default();
        let pub_date = match parse_pub_date(&raw_date) {
            Some(ts) => ts,
            None => match undated {
                UndatedPolicy::ZeroTime => {
                    warn!(link = %link, date = %raw_date, "Unparseable publication date, using zero time");
                    ZERO_TIME
                }
                UndatedPolicy::Skip => {
                    warn!(link = %link, date = %raw_date, "Unparseable publication date, skipping entry");
                    return None;
                }
            },
        };

        let description = self
            .description
            .or(self.summary)
            .or(self.content)
            .map(|d| strip_html(&d))
            .unwrap_or_default();

        Some(Item {
            id: 0,
            title: collapse_whitespace(self.title.as_deref().unwrap_or_default()),
            pub_date,
            description,
            link,
        })
    }
}

/// Decodes a whole feed document into a batch of items.
pub fn parse_feed(xml: &[u8], undated: UndatedPolicy) -> Result<Batch> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut items = Vec::new();
    let mut entry: Option<EntryBuilder> = None;
    // field being read and how many nested elements deep we are inside it
    let mut field: Option<(Field, usize)> = None;
    let mut text = String::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| AggregatorError::Parse(format!("XML parse error at {}: {}", reader.buffer_position(), e)))?;

        match event {
            Event::Start(e) => {
                let local = e.local_name();
                let name = local.as_ref();
                if let Some((_, depth)) = field.as_mut() {
                    *depth += 1;
                } else if name == b"item" || name == b"entry" {
                    entry = Some(EntryBuilder::default());
                } else if let Some(current) = entry.as_mut() {
                    if let Some(f) = Field::from_local_name(name) {
                        if f == Field::Link {
                            current.link_from_attributes(&e, reader.decoder());
                        }
                        field = Some((f, 0));
                        text.clear();
                    }
                }
            }
            Event::Empty(e) => {
                if field.is_none() && e.local_name().as_ref() == b"link" {
                    if let Some(current) = entry.as_mut() {
                        current.link_from_attributes(&e, reader.decoder());
                    }
                }
            }
            Event::Text(e) => {
                if field.is_some() {
                    // feeds routinely use HTML entities such as &nbsp; that XML
                    // does not define
                    let chunk = match e.unescape_with(html_entity) {
                        Ok(s) => s.into_owned(),
                        Err(_) => {
                            let raw = reader
                                .decoder()
                                .decode(&e)
                                .map_err(|e| AggregatorError::Parse(e.to_string()))?;
                            decode_entities(&raw)
                        }
                    };
                    text.push_str(&chunk);
                }
            }
            Event::CData(e) => {
                if field.is_some() {
                    let chunk = reader
                        .decoder()
                        .decode(&e)
                        .map_err(|e| AggregatorError::Parse(e.to_string()))?;
                    text.push_str(&chunk);
                }
            }
            Event::End(e) => {
                let local = e.local_name();
                let name = local.as_ref();
                match field {
                    Some((_, ref mut depth)) if *depth > 0 => *depth -= 1,
                    Some((f, _)) => {
                        if let Some(current) = entry.as_mut() {
                            current.set(f, std::mem::take(&mut text));
                        }
                        field = None;
                    }
                    None if name == b"item" || name == b"entry" => {
                        if let Some(item) = entry.take().and_then(|b| b.build(undated)) {
                            items.push(item);
                        }
                    }
                    None => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    debug!("Parsed feed with {} entries", items.len());
    Ok(items)
}

#[derive(Debug, Clone, Copy)]
enum Zone {
    Numeric,
    Named,
    Utc,
}

struct Layout {
    name: &'static str,
    format: &'static str,
    zone: Zone,
}

/// Known publication date layouts, in priority order.
const LAYOUTS: &[Layout] = &[
    Layout { name: "RFC1123Z", format: "%a, %d %b %Y %H:%M:%S %z", zone: Zone::Numeric },
    Layout { name: "RFC1123", format: "%a, %d %b %Y %H:%M:%S %z", zone: Zone::Named },
    Layout { name: "UnixDate", format: "%a %b %d %H:%M:%S %z %Y", zone: Zone::Named },
    Layout { name: "DayMonthYear", format: "%d %b %Y %H:%M:%S %z", zone: Zone::Numeric },
    Layout { name: "ANSIC", format: "%a %b %d %H:%M:%S %Y", zone: Zone::Utc },
    Layout { name: "RFC850", format: "%A, %d-%b-%y %H:%M:%S %z", zone: Zone::Named },
    Layout { name: "RFC822", format: "%d %b %y %H:%M %z", zone: Zone::Named },
    Layout { name: "RFC822Z", format: "%d %b %y %H:%M %z", zone: Zone::Numeric },
];

/// Parses a feed timestamp into Unix seconds, trying every known layout in
/// order. Returns `None` when no layout matches.
pub fn parse_pub_date(value: &str) -> Option<i64> {
    let value = collapse_whitespace(value);
    if value.is_empty() {
        return None;
    }

    for layout in LAYOUTS {
        let candidate = match layout.zone {
            Zone::Named => match with_numeric_zone(&value) {
                Some(v) => v,
                None => continue,
            },
            Zone::Numeric | Zone::Utc => value.clone(),
        };
        let parsed = parse_exact(&candidate, layout.format, layout.zone)
            .or_else(|| parse_ignoring_weekday(&candidate, layout.format, layout.zone));
        if let Some(ts) = parsed {
            debug!(layout = layout.name, "Parsed publication date");
            return Some(ts);
        }
    }

    DateTime::parse_from_rfc3339(&value).ok().map(|ts| ts.timestamp())
}

fn parse_exact(value: &str, format: &str, zone: Zone) -> Option<i64> {
    match zone {
        Zone::Utc => NaiveDateTime::parse_from_str(value, format)
            .ok()
            .map(|naive| naive.and_utc().timestamp()),
        Zone::Numeric | Zone::Named => DateTime::parse_from_str(value, format)
            .ok()
            .map(|ts| ts.timestamp()),
    }
}

const WEEKDAYS: &[(&str, &str)] = &[
    ("Mon", "Monday"),
    ("Tue", "Tuesday"),
    ("Wed", "Wednesday"),
    ("Thu", "Thursday"),
    ("Fri", "Friday"),
    ("Sat", "Saturday"),
    ("Sun", "Sunday"),
];

/// Feeds often carry a weekday that does not match the date. The name must
/// still be a weekday, but only the date is used.
fn parse_ignoring_weekday(value: &str, format: &str, zone: Zone) -> Option<i64> {
    let (full_name, rest_format) = match format.strip_prefix("%a") {
        Some(rest) => (false, rest),
        None => (true, format.strip_prefix("%A")?),
    };
    let (token, rest) = value.split_once(' ')?;
    let name = if rest_format.starts_with(',') {
        token.strip_suffix(',')?
    } else {
        token
    };

    let known = WEEKDAYS.iter().any(|(short, long)| {
        let expected = if full_name { long } else { short };
        name.eq_ignore_ascii_case(expected)
    });
    if !known {
        return None;
    }

    let rest_format = rest_format.trim_start_matches(',').trim_start();
    parse_exact(rest, rest_format, zone)
}

const WEEKDAYS_AND_MONTHS: &[&str] = &[
    "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN", "JAN", "FEB", "MAR", "APR", "MAY", "JUN",
    "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

/// RFC 822 zone names. Unknown all-caps abbreviations read as UTC.
fn zone_offset(token: &str) -> Option<&'static str> {
    let offset = match token {
        "UT" | "UTC" | "GMT" | "Z" => "+0000",
        "EST" => "-0500",
        "EDT" => "-0400",
        "CST" => "-0600",
        "CDT" => "-0500",
        "MST" => "-0700",
        "MDT" => "-0600",
        "PST" => "-0800",
        "PDT" => "-0700",
        t if (3..=5).contains(&t.len())
            && t.bytes().all(|b| b.is_ascii_uppercase())
            && !WEEKDAYS_AND_MONTHS.contains(&t) =>
        {
            "+0000"
        }
        _ => return None,
    };
    Some(offset)
}

/// Replaces a zone abbreviation token with its numeric offset.
fn with_numeric_zone(value: &str) -> Option<String> {
    let mut replaced = false;
    let tokens: Vec<&str> = value
        .split(' ')
        .map(|token| match zone_offset(token) {
            Some(offset) if !replaced => {
                replaced = true;
                offset
            }
            _ => token,
        })
        .collect();
    replaced.then(|| tokens.join(" "))
}

/// Removes markup and decodes HTML entities, leaving single-spaced text.
pub fn strip_html(html: &str) -> String {
    let text = html
        .chars()
        .fold((String::new(), false), |(mut text, in_tag), c| match c {
            '<' => (text, true),
            '>' if in_tag => {
                text.push(' ');
                (text, false)
            }
            _ if !in_tag => {
                text.push(c);
                (text, in_tag)
            }
            _ => (text, in_tag),
        })
        .0;
    collapse_whitespace(&decode_entities(&text))
}

/// Named HTML entities common in feed markup. Unknown names are left as
/// they are.
fn html_entity(name: &str) -> Option<&'static str> {
    let text = match name {
        "amp" => "&",
        "lt" => "<",
        "gt" => ">",
        "quot" => "\"",
        "apos" => "'",
        "nbsp" => " ",
        "ndash" => "\u{2013}",
        "mdash" => "\u{2014}",
        "hellip" => "\u{2026}",
        "lsquo" => "\u{2018}",
        "rsquo" => "\u{2019}",
        "ldquo" => "\u{201c}",
        "rdquo" => "\u{201d}",
        "laquo" => "\u{ab}",
        "raquo" => "\u{bb}",
        "copy" => "\u{a9}",
        "reg" => "\u{ae}",
        "trade" => "\u{2122}",
        "euro" => "\u{20ac}",
        _ => return None,
    };
    Some(text)
}

fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail.find(';').filter(|&end| end <= 10).and_then(|end| {
            let entity = &tail[1..end];
            let text = match entity {
                e if e.starts_with("#x") || e.starts_with("#X") => u32::from_str_radix(&e[2..], 16)
                    .ok()
                    .and_then(char::from_u32)
                    .map(String::from),
                e if e.starts_with('#') => e[1..]
                    .parse()
                    .ok()
                    .and_then(char::from_u32)
                    .map(String::from),
                e => html_entity(e).map(str::to_string),
            };
            text.map(|t| (t, end))
        });
        match decoded {
            Some((text, end)) => {
                out.push_str(&text);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
