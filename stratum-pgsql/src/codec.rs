//! Text-array codec for the backend's `{...}` literal syntax.
//!
//! Id arrays and tag/member arrays cross the wire in two places: as
//! column values inside tab-delimited COPY lines, and as literals coming
//! back from queries. The encoders append to a caller-supplied `String`
//! so a drain loop can reuse one buffer across rows; the parsers are the
//! exact inverse of the literal flavour.
//!
//! Escaping: inside a standalone literal, `"`, `\`, newline, carriage
//! return and tab are each introduced by a single backslash. Inside a
//! COPY line every such backslash is itself doubled, because COPY strips
//! one escaping layer before the array literal is parsed.

use stratum_core::OsmId;
use thiserror::Error;

/// Which escaping layer the encoder targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeMode {
    /// A standalone array literal (query parameter or query result).
    Literal,
    /// A value embedded in a tab-delimited COPY line.
    CopyLine,
}

/// Errors raised when decoding an array literal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArrayParseError {
    /// The literal ended before its closing `}`.
    #[error("array literal ended before closing brace: {literal:?}")]
    UnterminatedArray {
        /// The offending literal.
        literal: String,
    },
    /// An element could not be read as a 64-bit id.
    #[error("array element {element:?} is not a valid id")]
    InvalidId {
        /// The offending element text.
        element: String,
    },
}

/// Appends `{id,id,...}` to `buf`. An empty list encodes as `{}`.
pub fn append_id_array(buf: &mut String, ids: &[OsmId]) {
    use std::fmt::Write;

    buf.push('{');
    let mut first = true;
    for id in ids {
        if !first {
            buf.push(',');
        }
        // Writing an integer into a String cannot fail.
        let _ = write!(buf, "{id}");
        first = false;
    }
    buf.push('}');
}

/// Appends `{"item","item",...}` to `buf`, escaping for `mode`.
///
/// Every element is quoted; an empty sequence encodes as `{}`.
pub fn append_text_array<'a, I>(buf: &mut String, items: I, mode: EscapeMode)
where
    I: IntoIterator<Item = &'a str>,
{
    buf.push('{');
    let mut first = true;
    for item in items {
        if !first {
            buf.push(',');
        }
        buf.push('"');
        escape_into(buf, item, mode);
        buf.push('"');
        first = false;
    }
    buf.push('}');
}

fn escape_into(buf: &mut String, text: &str, mode: EscapeMode) {
    let doubled = mode == EscapeMode::CopyLine;
    for c in text.chars() {
        match c {
            '"' => {
                if doubled {
                    buf.push('\\');
                }
                buf.push_str("\\\"");
            }
            '\\' => {
                if doubled {
                    buf.push_str("\\\\");
                }
                buf.push_str("\\\\");
            }
            '\n' => {
                if doubled {
                    buf.push('\\');
                }
                buf.push_str("\\n");
            }
            '\r' => {
                if doubled {
                    buf.push('\\');
                }
                buf.push_str("\\r");
            }
            '\t' => {
                if doubled {
                    buf.push('\\');
                }
                buf.push_str("\\t");
            }
            other => buf.push(other),
        }
    }
}

/// Parses `{id,id,...}` into a vector of ids.
///
/// An empty string, or one that does not open with `{`, reads as the
/// empty list (a NULL column arrives here as an empty string).
pub fn parse_id_array(literal: &str) -> Result<Vec<OsmId>, ArrayParseError> {
    let elements = parse_elements(literal)?;
    elements
        .into_iter()
        .map(|e| {
            e.parse::<OsmId>()
                .map_err(|_| ArrayParseError::InvalidId { element: e })
        })
        .collect()
}

/// Parses `{elem,"elem",...}` into a vector of strings, unwinding the
/// literal-flavour escapes.
pub fn parse_text_array(literal: &str) -> Result<Vec<String>, ArrayParseError> {
    parse_elements(literal)
}

fn parse_elements(literal: &str) -> Result<Vec<String>, ArrayParseError> {
    let mut chars = literal.chars().peekable();
    if chars.next() != Some('{') {
        return Ok(Vec::new());
    }
    if chars.peek() == Some(&'}') {
        return Ok(Vec::new());
    }

    let unterminated = || ArrayParseError::UnterminatedArray {
        literal: literal.to_owned(),
    };

    let mut elements = Vec::new();
    loop {
        let mut element = String::new();
        let quoted = chars.peek() == Some(&'"');
        if quoted {
            chars.next();
        }
        loop {
            match chars.peek() {
                None => return Err(unterminated()),
                Some('"') if quoted => {
                    chars.next();
                    break;
                }
                Some(',' | '}') if !quoted => break,
                Some('\\') => {
                    chars.next();
                    match chars.next() {
                        Some('n') => element.push('\n'),
                        Some('r') => element.push('\r'),
                        Some('t') => element.push('\t'),
                        Some(other) => element.push(other),
                        None => return Err(unterminated()),
                    }
                }
                Some(_) => {
                    // Unwrap is safe: peek just returned Some.
                    element.push(chars.next().unwrap());
                }
            }
        }
        elements.push(element);

        match chars.next() {
            Some(',') => {}
            Some('}') => return Ok(elements),
            _ => return Err(unterminated()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    /// COPY strips one backslash layer from each escape sequence before
    /// the array literal itself is parsed; model that to check the
    /// doubled flavour lines up with the literal flavour.
    fn copy_unescape(line: &str) -> String {
        let mut out = String::new();
        let mut chars = line.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('r') => out.push('\r'),
                    Some('t') => out.push('\t'),
                    Some(other) => out.push(other),
                    None => {}
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    #[rstest]
    #[case(&[])]
    #[case(&[1])]
    #[case(&[-7, 0, 9_223_372_036_854_775_807])]
    fn id_arrays_round_trip(#[case] ids: &[OsmId]) {
        let mut buf = String::new();
        append_id_array(&mut buf, ids);
        assert_eq!(parse_id_array(&buf).unwrap(), ids);
    }

    #[rstest]
    fn id_array_encoding_is_plain() {
        let mut buf = String::new();
        append_id_array(&mut buf, &[1, 2, 3]);
        assert_eq!(buf, "{1,2,3}");
    }

    #[rstest]
    #[case(vec!["highway", "residential"])]
    #[case(vec!["name", "Quote \" and \\ backslash"])]
    #[case(vec!["note", "line\nbreak\ttab\rreturn"])]
    #[case(vec!["empty", ""])]
    #[case(vec!["comma,brace}", "{open"])]
    fn text_arrays_round_trip(#[case] items: Vec<&str>) {
        let mut buf = String::new();
        append_text_array(&mut buf, items.iter().copied(), EscapeMode::Literal);
        assert_eq!(parse_text_array(&buf).unwrap(), items);
    }

    #[rstest]
    fn copy_flavour_matches_literal_after_copy_unescaping() {
        let items = ["name", "Quote \" and \\ back\nslash\ttab\rcr"];
        let mut literal = String::new();
        append_text_array(&mut literal, items.iter().copied(), EscapeMode::Literal);
        let mut copy = String::new();
        append_text_array(&mut copy, items.iter().copied(), EscapeMode::CopyLine);

        assert_eq!(copy_unescape(&copy), literal);
        assert_eq!(parse_text_array(&literal).unwrap(), items);
    }

    #[rstest]
    fn copy_flavour_escaping_shape() {
        let mut buf = String::new();
        append_text_array(&mut buf, ["a\"b"], EscapeMode::CopyLine);
        assert_eq!(buf, r#"{"a\\"b"}"#);

        buf.clear();
        append_text_array(&mut buf, ["a\\b"], EscapeMode::CopyLine);
        assert_eq!(buf, r#"{"a\\\\b"}"#);
    }

    #[rstest]
    fn parses_unquoted_elements() {
        assert_eq!(
            parse_text_array("{abc,\"d,e\",f}").unwrap(),
            vec!["abc", "d,e", "f"]
        );
    }

    #[rstest]
    #[case("")]
    #[case("{}")]
    fn empty_inputs_read_as_empty(#[case] literal: &str) {
        assert_eq!(parse_text_array(literal).unwrap(), Vec::<String>::new());
        assert_eq!(parse_id_array(literal).unwrap(), Vec::<OsmId>::new());
    }

    #[rstest]
    #[case("{\"unterminated")]
    #[case("{1,2")]
    fn unterminated_literals_error(#[case] literal: &str) {
        assert!(matches!(
            parse_text_array(literal),
            Err(ArrayParseError::UnterminatedArray { .. })
        ));
    }

    #[rstest]
    fn non_numeric_id_errors() {
        assert!(matches!(
            parse_id_array("{1,x}"),
            Err(ArrayParseError::InvalidId { .. })
        ));
    }

    #[rstest]
    fn encoder_reuses_the_callers_buffer() {
        let mut buf = String::with_capacity(64);
        append_id_array(&mut buf, &[1]);
        let ptr = buf.as_ptr();
        buf.clear();
        append_id_array(&mut buf, &[2, 3]);
        assert_eq!(buf, "{2,3}");
        assert_eq!(buf.as_ptr(), ptr);
    }
}
