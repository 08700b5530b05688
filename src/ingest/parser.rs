//! Template parser.
//!
//! A template is an HTML-like document: `<meta name=".." content="..">`
//! entries in `<head>` carry the post metadata, and `<body>` is the post
//! itself. The tokenizer runs in a lenient mode so hand-written HTML
//! (unclosed `<meta>`, unquoted attributes, stray end tags) still parses.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use crate::domain::ContentRecord;

/// Layout of `post-date` / `edit-date` values
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Why a template was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("error parsing HTML content: {0}")]
    MalformedDocument(String),

    #[error("HTML tag <head> was not found")]
    MissingHead,

    #[error("no <meta> tags were found")]
    NoMetadataFound,

    #[error("HTML tag <body> was not found")]
    MissingBody,
}

/// Parse a template into a record.
///
/// The returned record has no identity, filename or defaulted timestamps;
/// the processor fills those in.
pub fn parse_template(markup: &str) -> Result<ContentRecord, ParseError> {
    let document = scan(markup)?;

    if !document.has_head {
        return Err(ParseError::MissingHead);
    }
    if document.metadata.is_empty() {
        return Err(ParseError::NoMetadataFound);
    }

    let mut record = ContentRecord::default();
    for (key, value) in document.metadata {
        match key.as_str() {
            "title" => record.title = value,
            "author" => record.author = value,
            "categories" => record.categories = value,
            "tags" => record.tags = value,
            "post-date" => {
                if let Some(ts) = parse_date(&value) {
                    record.created_at = Some(ts);
                }
            }
            "edit-date" => {
                if let Some(ts) = parse_date(&value) {
                    record.updated_at = Some(ts);
                }
            }
            _ => {}
        }
    }

    record.content = document.body.ok_or(ParseError::MissingBody)?;
    Ok(record)
}

/// Parse a metadata date, read as UTC. `None` if it does not match
/// [`DATE_FORMAT`].
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, DATE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Default)]
struct ScannedDocument {
    has_head: bool,
    metadata: HashMap<String, String>,
    body: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Outside,
    Head,
    Body { start: usize },
    AfterBody,
}

/// Single pass over the token stream collecting head metadata and the
/// byte span of the body element.
fn scan(markup: &str) -> Result<ScannedDocument, ParseError> {
    let mut reader = Reader::from_str(markup);
    let config = reader.config_mut();
    config.check_end_names = false;
    config.allow_unmatched_ends = true;

    let mut document = ScannedDocument::default();
    let mut region = Region::Outside;

    loop {
        let event_start = reader.buffer_position() as usize;
        let event = reader
            .read_event()
            .map_err(|e| ParseError::MalformedDocument(e.to_string()))?;

        match event {
            Event::Start(e) if is_tag(&e, b"body") => {
                if region != Region::AfterBody && !matches!(region, Region::Body { .. }) {
                    region = Region::Body { start: event_start };
                }
            }
            Event::Empty(e) if is_tag(&e, b"body") => {
                if region != Region::AfterBody && !matches!(region, Region::Body { .. }) {
                    let end = reader.buffer_position() as usize;
                    document.body = Some(markup[event_start..end].to_string());
                    region = Region::AfterBody;
                }
            }
            Event::Start(e) if is_tag(&e, b"head") => {
                document.has_head = true;
                if region == Region::Outside {
                    region = Region::Head;
                }
            }
            Event::Empty(e) if is_tag(&e, b"head") => {
                document.has_head = true;
            }
            Event::Start(e) | Event::Empty(e) if region == Region::Head && is_tag(&e, b"meta") => {
                if let Some((name, content)) = meta_entry(&e) {
                    document.metadata.insert(name, content);
                }
            }
            Event::End(e) => {
                let name = e.local_name();
                let name = name.as_ref();
                match region {
                    Region::Head if name.eq_ignore_ascii_case(b"head") => {
                        region = Region::Outside;
                    }
                    Region::Body { start } if name.eq_ignore_ascii_case(b"body") => {
                        let end = reader.buffer_position() as usize;
                        document.body = Some(markup[start..end].to_string());
                        region = Region::AfterBody;
                    }
                    Region::Body { start } if name.eq_ignore_ascii_case(b"html") => {
                        document.body = Some(close_body(&markup[start..event_start]));
                        region = Region::AfterBody;
                    }
                    _ => {}
                }
            }
            Event::Eof => {
                if let Region::Body { start } = region {
                    document.body = Some(close_body(&markup[start..]));
                }
                break;
            }
            _ => {}
        }
    }

    Ok(document)
}

fn is_tag(e: &BytesStart<'_>, tag: &[u8]) -> bool {
    e.local_name().as_ref().eq_ignore_ascii_case(tag)
}

fn close_body(open_body: &str) -> String {
    format!("{}</body>", open_body.trim_end())
}

/// `(name, content)` of a meta element; `None` unless both are non-empty.
fn meta_entry(e: &BytesStart<'_>) -> Option<(String, String)> {
    let mut name = String::new();
    let mut content = String::new();

    for attr in e.html_attributes().flatten() {
        let key = attr.key.local_name();
        let value = attr
            .unescape_value()
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());

        if key.as_ref().eq_ignore_ascii_case(b"name") {
            name = value;
        } else if key.as_ref().eq_ignore_ascii_case(b"content") {
            content = value;
        }
    }

    if name.is_empty() || content.is_empty() {
        return None;
    }
    Some((name, content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const FULL_TEMPLATE: &str = r#"
<head>
	<meta name="title" content="My First Blog Post"/>
	<meta name="author" content="John Doe"/>
	<meta name="post-date" content="2020-04-15 12:09:57"/>
	<meta name="edit-date" content="2020-04-15 12:19:05"/>
	<meta name="categories" content="Go Programming"/>
	<meta name="tags" content="go, programming, web"/>
<head>
<body>
	<h1>My First Blog Post</h1>
	<p>This is my first Blog post, just to try if templates are working OK.</p>
</body>
	"#;

    #[test]
    fn test_parse_full_template() {
        let record = parse_template(FULL_TEMPLATE).unwrap();

        assert_eq!(record.title, "My First Blog Post");
        assert_eq!(record.author, "John Doe");
        assert_eq!(record.categories, "Go Programming");
        assert_eq!(record.tags, "go, programming, web");
        assert_eq!(
            record.created_at,
            Some(Utc.with_ymd_and_hms(2020, 4, 15, 12, 9, 57).unwrap())
        );
        assert_eq!(
            record.updated_at,
            Some(Utc.with_ymd_and_hms(2020, 4, 15, 12, 19, 5).unwrap())
        );
        assert!(record.content.starts_with("<body>"));
        assert!(record.content.ends_with("</body>"));
        assert!(record.content.contains("<h1>My First Blog Post</h1>"));
        assert!(record.id.is_none());
    }

    #[test]
    fn test_parse_html_style_meta_without_self_closing() {
        let markup = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <meta name=title content=Hello>
  <meta name="author" content="Jo">
  <meta name="categories" content="go, web">
</head>
<body><p>x</p></body>
</html>"#;

        let record = parse_template(markup).unwrap();
        assert_eq!(record.title, "Hello");
        assert_eq!(record.author, "Jo");
        assert_eq!(record.categories, "go, web");
        assert_eq!(record.content, "<body><p>x</p></body>");
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let markup = r#"<head><meta name="mood" content="happy"/><meta name="title" content="T"/></head><body></body>"#;
        let record = parse_template(markup).unwrap();
        assert_eq!(record.title, "T");
        assert_eq!(record.author, "");
    }

    #[test]
    fn test_only_unknown_keys_still_parses() {
        let markup = r#"<head><meta name="mood" content="happy"/></head><body>b</body>"#;
        let record = parse_template(markup).unwrap();
        assert_eq!(record.title, "");
        assert_eq!(record.content, "<body>b</body>");
    }

    #[test]
    fn test_bad_dates_are_skipped() {
        let markup = r#"<head>
<meta name="title" content="T"/>
<meta name="post-date" content="15/04/2020"/>
<meta name="edit-date" content="2020-04-15T12:19:05"/>
</head><body></body>"#;

        let record = parse_template(markup).unwrap();
        assert!(record.created_at.is_none());
        assert!(record.updated_at.is_none());
    }

    #[test]
    fn test_missing_head() {
        let markup = r#"<html><body><p>x</p></body></html>"#;
        assert_eq!(parse_template(markup), Err(ParseError::MissingHead));
    }

    #[test]
    fn test_plain_text_has_no_head() {
        assert_eq!(parse_template("just some words"), Err(ParseError::MissingHead));
    }

    #[test]
    fn test_no_metadata() {
        let markup = r#"<head><title>x</title></head><body><p>x</p></body>"#;
        assert_eq!(parse_template(markup), Err(ParseError::NoMetadataFound));
    }

    #[test]
    fn test_meta_needs_name_and_content() {
        let markup = r#"<head><meta name="title" content=""/><meta content="x"/></head><body></body>"#;
        assert_eq!(parse_template(markup), Err(ParseError::NoMetadataFound));
    }

    #[test]
    fn test_meta_outside_head_is_ignored() {
        let markup = r#"<head></head><body><meta name="title" content="T"/></body>"#;
        assert_eq!(parse_template(markup), Err(ParseError::NoMetadataFound));
    }

    #[test]
    fn test_missing_body() {
        let markup = r#"<head><meta name="title" content="T"/></head>"#;
        assert_eq!(parse_template(markup), Err(ParseError::MissingBody));
    }

    #[test]
    fn test_head_checked_before_metadata_and_body() {
        // No head, no meta, no body: the head is reported first
        assert_eq!(parse_template("<div></div>"), Err(ParseError::MissingHead));
    }

    #[test]
    fn test_malformed_document() {
        let markup = r#"<head><meta name="title" content="T"/></head><body><p"#;
        assert!(matches!(
            parse_template(markup),
            Err(ParseError::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_unclosed_body_is_closed() {
        let markup = r#"<html><head><meta name="title" content="T"/></head><body><p>x</p>
</html>"#;
        let record = parse_template(markup).unwrap();
        assert_eq!(record.content, "<body><p>x</p></body>");
    }

    #[test]
    fn test_attribute_entities_are_unescaped() {
        let markup = r#"<head><meta name="title" content="Fish &amp; Chips"/></head><body></body>"#;
        let record = parse_template(markup).unwrap();
        assert_eq!(record.title, "Fish & Chips");
    }

    #[test]
    fn test_duplicate_keys_last_wins() {
        let markup = r#"<head><meta name="title" content="first"/><meta name="title" content="second"/></head><body></body>"#;
        let record = parse_template(markup).unwrap();
        assert_eq!(record.title, "second");
    }

    #[test]
    fn test_parse_date_format() {
        assert_eq!(
            parse_date("2021-12-31 23:59:59"),
            Some(Utc.with_ymd_and_hms(2021, 12, 31, 23, 59, 59).unwrap())
        );
        assert_eq!(parse_date("2021-12-31"), None);
        assert_eq!(parse_date(""), None);
    }
}
