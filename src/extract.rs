//! Reading form fields out of the pages served by the heat pump.
//!
//! The PLC web server renders every value as an `<INPUT NAME="…" VALUE="…"/>` element. The
//! suffix of the `NAME` encodes the type of the value, which is used here to coerce the text
//! into something more useful. Extraction is best-effort: whatever was read before the markup
//! stops making sense is kept.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub type FieldMap = BTreeMap<String, FieldValue>;

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Coerce the raw `VALUE` based on the naming convention of the field `name`.
    ///
    /// Coercion never fails: unparsable floats become `0.0` and unparsable booleans `false`.
    pub fn coerce(name: &str, raw: String) -> Self {
        if name.ends_with("BOOL_i") {
            FieldValue::Bool(nonzero_integer(raw.trim()))
        } else if name.ends_with('f') {
            FieldValue::Float(raw.trim().parse::<f64>().unwrap_or(0.0))
        } else {
            FieldValue::Text(raw)
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Bool(_) => None,
            FieldValue::Text(v) => v.trim().parse().ok(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            FieldValue::Float(_) | FieldValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v),
            FieldValue::Bool(_) | FieldValue::Float(_) => None,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Text(v) => f.write_str(v),
        }
    }
}

/// Any integer other than zero, regardless of its magnitude.
fn nonzero_integer(raw: &str) -> bool {
    let digits = raw.strip_prefix(['+', '-']).unwrap_or(raw);
    !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && digits.bytes().any(|b| b != b'0')
}

/// Extract all `INPUT` fields of the page.
pub fn extract(markup: &str) -> FieldMap {
    let mut reader = Reader::from_str(markup);
    // The pages are only XML-ish, don't be picky about the structure.
    reader.config_mut().check_end_names = false;
    let mut fields = FieldMap::new();
    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    message = "page markup is malformed, keeping the fields read so far",
                    position = reader.error_position(),
                    fields = fields.len(),
                    error = (&e as &dyn std::error::Error)
                );
                break;
            }
        };
        match event {
            Event::Start(element) | Event::Empty(element)
                if element.local_name().as_ref().eq_ignore_ascii_case(b"INPUT") =>
            {
                let Some((name, raw)) = input_field(&element) else {
                    continue;
                };
                let value = FieldValue::coerce(&name, raw);
                fields.insert(name, value);
            }
            Event::Eof => break,
            _ => {}
        }
    }
    fields
}

fn input_field(element: &BytesStart<'_>) -> Option<(String, String)> {
    let mut name = None;
    let mut value = None;
    for attribute in element.attributes().with_checks(false) {
        let attribute = match attribute {
            Ok(a) => a,
            Err(e) => {
                debug!(error = %e, "skipping a malformed INPUT attribute");
                continue;
            }
        };
        let slot = match attribute.key.as_ref() {
            b"NAME" => &mut name,
            b"VALUE" => &mut value,
            _ => continue,
        };
        match attribute.unescape_value() {
            Ok(v) => *slot = Some(v.into_owned()),
            Err(e) => debug!(error = %e, "could not unescape an INPUT attribute"),
        }
    }
    match (name, value) {
        (Some(name), Some(value)) => Some((name, value)),
        (name, value) => {
            debug!(?name, has_value = value.is_some(), "INPUT without NAME or VALUE, skipping");
            None
        }
    }
}
