//! Structured output: schemas handed to the model, and incremental parsing of the
//! JSON text it streams back.
//!
//! `parse_partial_json` reads any prefix of a JSON document and returns the
//! largest value that prefix already commits to. Open strings are kept as far as
//! they go; numbers, literals and object keys are only reported once they are
//! complete. Every value it returns for a prefix `p` is therefore a prefix (in the
//! sense of [`is_prefix_of`]) of the value for any longer prefix of the same text.

use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StructuredError {
    #[error("Model output is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Model output does not match the schema: {0}")]
    SchemaMismatch(String),

    #[error("Model returned '{value}', expected one of: {}", .allowed.join(", "))]
    NotInEnum { value: String, allowed: Vec<String> },
}

struct Parsed {
    value: Option<Value>,
    complete: bool,
}

impl Parsed {
    fn complete(value: Value) -> Self {
        Self {
            value: Some(value),
            complete: true,
        }
    }

    fn partial(value: Option<Value>) -> Self {
        Self {
            value,
            complete: false,
        }
    }
}

struct PartialParser {
    chars: Vec<char>,
    pos: usize,
}

type ParseResult = Result<Parsed, ()>;

impl PartialParser {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn parse_value(&mut self) -> ParseResult {
        self.skip_whitespace();
        match self.peek() {
            None => Ok(Parsed::partial(None)),
            Some('{') => self.parse_object(),
            Some('[') => self.parse_array(),
            Some('"') => self.parse_string(),
            Some('t') => self.parse_literal("true", Value::Bool(true)),
            Some('f') => self.parse_literal("false", Value::Bool(false)),
            Some('n') => self.parse_literal("null", Value::Null),
            Some(c) if c == '-' || c.is_ascii_digit() => self.parse_number(),
            Some(_) => Err(()),
        }
    }

    fn parse_literal(&mut self, word: &str, value: Value) -> ParseResult {
        for expected in word.chars() {
            match self.peek() {
                None => return Ok(Parsed::partial(None)),
                Some(c) if c == expected => self.pos += 1,
                Some(_) => return Err(()),
            }
        }
        Ok(Parsed::complete(value))
    }

    fn parse_number(&mut self) -> ParseResult {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || "+-.eE".contains(c)) {
            self.pos += 1;
        }
        // Without a following delimiter more digits may still arrive
        if self.at_end() {
            return Ok(Parsed::partial(None));
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        serde_json::from_str::<Value>(&text)
            .map(Parsed::complete)
            .map_err(|_| ())
    }

    /// Four hex digits starting at `at`; `None` while they have not all arrived
    fn hex_escape(&self, at: usize) -> Result<Option<u32>, ()> {
        if self.chars.len() < at + 4 {
            return Ok(None);
        }
        let digits: String = self.chars[at..at + 4].iter().collect();
        u32::from_str_radix(&digits, 16).map(Some).map_err(|_| ())
    }

    fn parse_string(&mut self) -> ParseResult {
        // opening quote
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Ok(Parsed::partial(Some(Value::String(out)))),
                Some('"') => {
                    self.pos += 1;
                    return Ok(Parsed::complete(Value::String(out)));
                }
                Some('\\') => {
                    let Some(escaped) = self.chars.get(self.pos + 1).copied() else {
                        return Ok(Parsed::partial(Some(Value::String(out))));
                    };
                    match escaped {
                        '"' => out.push('"'),
                        '\\' => out.push('\\'),
                        '/' => out.push('/'),
                        'b' => out.push('\u{08}'),
                        'f' => out.push('\u{0c}'),
                        'n' => out.push('\n'),
                        'r' => out.push('\r'),
                        't' => out.push('\t'),
                        'u' => {
                            let Some(code) = self.hex_escape(self.pos + 2)? else {
                                return Ok(Parsed::partial(Some(Value::String(out))));
                            };
                            let decoded = match code {
                                0xD800..=0xDBFF => {
                                    // a high surrogate is only a character together with its pair
                                    if self.chars.len() < self.pos + 7 {
                                        return Ok(Parsed::partial(Some(Value::String(out))));
                                    }
                                    if self.chars[self.pos + 6] != '\\' {
                                        return Err(());
                                    }
                                    if self.chars.len() < self.pos + 8 {
                                        return Ok(Parsed::partial(Some(Value::String(out))));
                                    }
                                    if self.chars[self.pos + 7] != 'u' {
                                        return Err(());
                                    }
                                    let Some(low) = self.hex_escape(self.pos + 8)? else {
                                        return Ok(Parsed::partial(Some(Value::String(out))));
                                    };
                                    if !(0xDC00..=0xDFFF).contains(&low) {
                                        return Err(());
                                    }
                                    self.pos += 6;
                                    0x10000 + ((code - 0xD800) << 10) + (low - 0xDC00)
                                }
                                0xDC00..=0xDFFF => return Err(()),
                                _ => code,
                            };
                            out.push(char::from_u32(decoded).ok_or(())?);
                            self.pos += 4;
                        }
                        _ => return Err(()),
                    }
                    self.pos += 2;
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn parse_array(&mut self) -> ParseResult {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Ok(Parsed::partial(Some(Value::Array(items)))),
                Some(']') => {
                    self.pos += 1;
                    return Ok(Parsed::complete(Value::Array(items)));
                }
                _ => {}
            }

            let item = self.parse_value()?;
            if let Some(value) = item.value {
                items.push(value);
            }
            if !item.complete {
                return Ok(Parsed::partial(Some(Value::Array(items))));
            }

            self.skip_whitespace();
            match self.peek() {
                None => return Ok(Parsed::partial(Some(Value::Array(items)))),
                Some(',') => self.pos += 1,
                Some(']') => {}
                Some(_) => return Err(()),
            }
        }
    }

    fn parse_object(&mut self) -> ParseResult {
        self.pos += 1;
        let mut map = Map::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Ok(Parsed::partial(Some(Value::Object(map)))),
                Some('}') => {
                    self.pos += 1;
                    return Ok(Parsed::complete(Value::Object(map)));
                }
                Some('"') => {}
                Some(_) => return Err(()),
            }

            let key = self.parse_string()?;
            let key = match (key.value, key.complete) {
                (Some(Value::String(key)), true) => key,
                _ => return Ok(Parsed::partial(Some(Value::Object(map)))),
            };

            self.skip_whitespace();
            match self.peek() {
                None => return Ok(Parsed::partial(Some(Value::Object(map)))),
                Some(':') => self.pos += 1,
                Some(_) => return Err(()),
            }

            let value = self.parse_value()?;
            if let Some(inner) = value.value {
                map.insert(key, inner);
            }
            if !value.complete {
                return Ok(Parsed::partial(Some(Value::Object(map))));
            }

            self.skip_whitespace();
            match self.peek() {
                None => return Ok(Parsed::partial(Some(Value::Object(map)))),
                Some(',') => self.pos += 1,
                Some('}') => {}
                Some(_) => return Err(()),
            }
        }
    }
}

/// The largest value implied by a prefix of a JSON document, or `None` when the
/// prefix is empty or already malformed.
pub fn parse_partial_json(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }
    let mut parser = PartialParser::new(text);
    parser.parse_value().ok().and_then(|parsed| parsed.value)
}

/// Whether `partial` can grow into `full`: objects by adding keys or extending
/// values, arrays by extending the last element or appending, strings by appending.
pub fn is_prefix_of(partial: &Value, full: &Value) -> bool {
    match (partial, full) {
        (Value::Object(partial), Value::Object(full)) => partial
            .iter()
            .all(|(key, value)| full.get(key).is_some_and(|other| is_prefix_of(value, other))),
        (Value::Array(partial), Value::Array(full)) => {
            partial.len() <= full.len()
                && partial
                    .iter()
                    .zip(full.iter())
                    .all(|(a, b)| is_prefix_of(a, b))
        }
        (Value::String(partial), Value::String(full)) => full.starts_with(partial.as_str()),
        _ => partial == full,
    }
}

/// Accumulates streamed JSON text and reports each new partial object
#[derive(Debug, Default)]
pub struct PartialObjectStream {
    text: String,
    last: Option<Value>,
}

impl PartialObjectStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Feed a delta. Returns the new partial value when it changed and extends the
    /// previously reported one.
    pub fn push(&mut self, delta: &str) -> Option<Value> {
        self.text.push_str(delta);
        let value = parse_partial_json(&self.text)?;
        if let Some(last) = &self.last {
            if *last == value || !is_prefix_of(last, &value) {
                return None;
            }
        }
        self.last = Some(value.clone());
        Some(value)
    }

    /// Parse the complete text
    pub fn finish(self) -> Result<Value, StructuredError> {
        serde_json::from_str(&self.text).map_err(|e| StructuredError::InvalidJson(e.to_string()))
    }
}

/// Wraps an element schema so the model answers `{"elements": [...]}`
pub fn array_schema(element_schema: Value) -> Value {
    json!({
        "type": "object",
        "properties": {
            "elements": {"type": "array", "items": element_schema}
        },
        "required": ["elements"],
        "additionalProperties": false
    })
}

/// Releases array elements from streamed `{"elements": [...]}` text once they
/// can no longer change
#[derive(Debug, Default)]
pub struct ElementStream {
    text: String,
    emitted: usize,
}

impl ElementStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a delta and return any elements that became complete
    pub fn push(&mut self, delta: &str) -> Vec<Value> {
        self.text.push_str(delta);
        let Some(elements) = parse_partial_json(&self.text)
            .and_then(|value| value.get("elements").and_then(Value::as_array).cloned())
        else {
            return Vec::new();
        };

        // every element but the last is followed by a comma, so it is final
        let settled = elements.len().saturating_sub(1);
        self.take(elements, settled)
    }

    /// Parse the complete text and return the elements not yet released
    pub fn finish(mut self) -> Result<Vec<Value>, StructuredError> {
        let value: Value = serde_json::from_str(&self.text)
            .map_err(|e| StructuredError::InvalidJson(e.to_string()))?;
        let elements = value
            .get("elements")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| StructuredError::SchemaMismatch("missing 'elements' array".into()))?;
        let count = elements.len();
        Ok(self.take(elements, count))
    }

    fn take(&mut self, elements: Vec<Value>, settled: usize) -> Vec<Value> {
        if settled <= self.emitted {
            return Vec::new();
        }
        let fresh = elements[self.emitted..settled].to_vec();
        self.emitted = settled;
        fresh
    }
}

/// Wraps an enumeration so the model answers `{"result": "<choice>"}`
pub fn enum_schema(choices: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": {
            "result": {"type": "string", "enum": choices}
        },
        "required": ["result"],
        "additionalProperties": false
    })
}

/// Extract the classification from the model's answer, rejecting values outside `choices`
pub fn parse_enum_result(text: &str, choices: &[&str]) -> Result<String, StructuredError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| StructuredError::InvalidJson(e.to_string()))?;
    let result = value
        .get("result")
        .and_then(Value::as_str)
        .ok_or_else(|| StructuredError::SchemaMismatch("missing string 'result'".into()))?;

    if choices.contains(&result) {
        Ok(result.to_string())
    } else {
        Err(StructuredError::NotInEnum {
            value: result.to_string(),
            allowed: choices.iter().map(|c| c.to_string()).collect(),
        })
    }
}

/// Validate a finished object against its schema
pub fn validate_object(value: &Value, schema: &Value) -> Result<(), StructuredError> {
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| StructuredError::SchemaMismatch(format!("invalid schema: {}", e)))?;
    let result = compiled.validate(value).map_err(|errors| {
        StructuredError::SchemaMismatch(
            errors
                .take(3)
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        )
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECIPE: &str = r#"{"recipe":{"name":"Biryani","ingredients":[{"name":"rice","amount":"2 cups"},{"name":"chicken","amount":"500 g"}],"steps":["Soak the rice.","Cook \"dum\" style for 20 min."],"serves":4,"spicy":true,"notes":null}}"#;

    #[test]
    fn test_partial_object_drops_incomplete_tokens() {
        assert_eq!(parse_partial_json(""), None);
        assert_eq!(parse_partial_json("{"), Some(json!({})));
        assert_eq!(parse_partial_json(r#"{"na"#), Some(json!({})));
        assert_eq!(parse_partial_json(r#"{"name""#), Some(json!({})));
        assert_eq!(parse_partial_json(r#"{"name": "Bir"#), Some(json!({"name": "Bir"})));
        assert_eq!(parse_partial_json(r#"{"n": 12"#), Some(json!({})));
        assert_eq!(parse_partial_json(r#"{"n": 12,"#), Some(json!({"n": 12})));
        assert_eq!(parse_partial_json(r#"{"ok": tr"#), Some(json!({})));
        assert_eq!(parse_partial_json(r#"["a", "b"#), Some(json!(["a", "b"])));
        assert_eq!(parse_partial_json(r#"{"s": "a\"#), Some(json!({"s": "a"})));
        assert_eq!(parse_partial_json(r#"{"s": "\u00e"#), Some(json!({"s": ""})));
    }

    #[test]
    fn test_malformed_prefix() {
        assert_eq!(parse_partial_json("{]"), None);
        assert_eq!(parse_partial_json("hello"), None);
    }

    #[test]
    fn test_every_prefix_extends_the_previous_one() {
        let full: Value = serde_json::from_str(RECIPE).unwrap();
        let chars: Vec<char> = RECIPE.chars().collect();
        let mut previous: Option<Value> = None;

        for end in 0..=chars.len() {
            let prefix: String = chars[..end].iter().collect();
            let Some(value) = parse_partial_json(&prefix) else {
                continue;
            };
            assert!(is_prefix_of(&value, &full), "prefix {:?} gave {}", prefix, value);
            if let Some(previous) = &previous {
                assert!(is_prefix_of(previous, &value), "regressed at {:?}", prefix);
            }
            previous = Some(value);
        }
        assert_eq!(previous, Some(full));
    }

    #[test]
    fn test_surrogate_pair_escapes_split_per_char() {
        let text = r#"{"name": "Pika \ud83d\ude00 chu", "n": 1}"#;
        let full: Value = serde_json::from_str(text).unwrap();
        let mut stream = PartialObjectStream::new();
        let mut last = None;

        for c in text.chars() {
            if let Some(value) = stream.push(&c.to_string()) {
                assert!(is_prefix_of(&value, &full), "{} is not a prefix", value);
                assert!(!value.to_string().contains('\u{fffd}'));
                last = Some(value);
            }
        }
        assert_eq!(last, Some(full.clone()));
        assert_eq!(full["name"], "Pika 😀 chu");

        assert_eq!(
            parse_partial_json(r#"{"name": "Pika \ud83d\ude"#),
            Some(json!({"name": "Pika "}))
        );
        assert_eq!(parse_partial_json(r#"{"name": "\ud83d x"#), None);
        assert_eq!(parse_partial_json(r#"{"name": "\ude00"#), None);
    }

    #[test]
    fn test_is_prefix_of() {
        assert!(is_prefix_of(&json!({"a": "x"}), &json!({"a": "xy", "b": 1})));
        assert!(is_prefix_of(&json!([1]), &json!([1, 2])));
        assert!(!is_prefix_of(&json!({"a": 1}), &json!({"a": 2})));
        assert!(!is_prefix_of(&json!([1, 2]), &json!([1])));
        assert!(!is_prefix_of(&json!({"c": 1}), &json!({"a": 1})));
    }

    #[test]
    fn test_partial_object_stream_only_emits_growth() {
        let mut stream = PartialObjectStream::new();
        assert_eq!(
            stream.push(r#"{"recipe": {"name": "Ch"#),
            Some(json!({"recipe": {"name": "Ch"}}))
        );
        assert_eq!(
            stream.push(r#"ana""#),
            Some(json!({"recipe": {"name": "Chana"}}))
        );
        // whitespace and closing braces do not change the value
        assert_eq!(stream.push(" "), None);
        assert_eq!(stream.push("}}"), None);
        assert_eq!(stream.finish().unwrap(), json!({"recipe": {"name": "Chana"}}));
    }

    #[test]
    fn test_element_stream_releases_completed_elements() {
        let mut stream = ElementStream::new();
        assert!(stream.push(r#"{"elements": [{"name": "Pika"#).is_empty());
        let released = stream.push(r#"chu", "abilities": ["Static"]}, {"name": "Rai"#);
        assert_eq!(released, vec![json!({"name": "Pikachu", "abilities": ["Static"]})]);
        assert!(stream.push("chu\"").is_empty());
        assert!(stream.push(", \"abilities\": []}]}").is_empty());
        assert_eq!(
            stream.finish().unwrap(),
            vec![json!({"name": "Raichu", "abilities": []})]
        );
    }

    #[test]
    fn test_enum_result() {
        let choices = ["positive", "negative", "neutral"];
        assert_eq!(
            parse_enum_result(r#"{"result": "neutral"}"#, &choices).unwrap(),
            "neutral"
        );
        assert!(matches!(
            parse_enum_result(r#"{"result": "ecstatic"}"#, &choices),
            Err(StructuredError::NotInEnum { .. })
        ));
        assert!(matches!(
            parse_enum_result("positive", &choices),
            Err(StructuredError::InvalidJson(_))
        ));
        assert_eq!(enum_schema(&choices)["properties"]["result"]["enum"][2], json!("neutral"));
    }

    #[test]
    fn test_validate_object() {
        let schema = json!({
            "type": "object",
            "properties": {"dish": {"type": "string"}},
            "required": ["dish"]
        });
        assert!(validate_object(&json!({"dish": "Nihari"}), &schema).is_ok());
        assert!(validate_object(&json!({}), &schema).is_err());
    }
}
