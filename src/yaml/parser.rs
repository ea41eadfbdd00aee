//! Recursive-descent parser for the bounded YAML subset (spec.md §4.4).

use indexmap::IndexMap;

use super::value::Value;
use crate::error::{Error, Result};

const MAX_DEPTH: usize = 8;
const MAX_SIZE_BYTES: usize = 1024 * 1024;

/// Parses `input` into a [`Value`], rejecting anything outside the
/// bounded subset this contract allows.
pub fn parse(input: &str) -> Result<Value> {
    if input.len() > MAX_SIZE_BYTES {
        return Err(Error::MalformedOutput(format!(
            "document is {} bytes, exceeds the {MAX_SIZE_BYTES} byte limit",
            input.len()
        )));
    }

    let lines = strip_and_tokenize(input)?;
    if lines.is_empty() {
        return Ok(Value::Null);
    }

    let mut parser = Parser { lines, pos: 0 };
    let value = parser.parse_node(lines_indent(&parser.lines, 0), 1)?;
    if parser.pos != parser.lines.len() {
        return Err(Error::MalformedOutput(
            "trailing content after the first document".into(),
        ));
    }
    Ok(value)
}

fn lines_indent(lines: &[(usize, String)], pos: usize) -> usize {
    lines.get(pos).map(|(i, _)| *i).unwrap_or(0)
}

/// Strips comments and blank lines, validates forbidden top-level
/// markers, and returns `(indent, content)` pairs for the rest.
fn strip_and_tokenize(input: &str) -> Result<Vec<(usize, String)>> {
    let mut out = Vec::new();
    for raw_line in input.lines() {
        if raw_line.contains('\t') {
            return Err(Error::MalformedOutput(
                "tab characters are not permitted in indentation".into(),
            ));
        }
        let stripped = strip_comment(raw_line);
        let trimmed = stripped.trim_end();
        if trimmed.trim().is_empty() {
            continue;
        }
        let content = trimmed.trim();
        if content == "---" || content == "..." {
            return Err(Error::MalformedOutput(
                "multi-document streams are not supported".into(),
            ));
        }
        if content.starts_with('!') {
            return Err(Error::MalformedOutput("tags are not supported".into()));
        }
        let indent = trimmed.len() - trimmed.trim_start_matches(' ').len();
        out.push((indent, content.to_string()));
    }
    Ok(out)
}

/// Strips a trailing `#` comment, respecting single/double quotes.
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' if !in_double => in_single = !in_single,
            b'"' if !in_single => in_double = !in_double,
            b'#' if !in_single && !in_double => {
                if i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t' {
                    return &line[..i];
                }
            }
            _ => {}
        }
        i += 1;
    }
    line
}

struct Parser {
    lines: Vec<(usize, String)>,
    pos: usize,
}

impl Parser {
    fn current(&self) -> Option<(usize, &str)> {
        self.lines.get(self.pos).map(|(i, s)| (*i, s.as_str()))
    }

    fn parse_node(&mut self, indent: usize, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(Error::MalformedOutput(format!(
                "nesting exceeds the maximum depth of {MAX_DEPTH}"
            )));
        }
        let Some((line_indent, content)) = self.current() else {
            return Ok(Value::Null);
        };
        if line_indent < indent {
            return Ok(Value::Null);
        }
        if content == "-" || content.starts_with("- ") {
            self.parse_sequence(line_indent, depth)
        } else {
            self.parse_mapping(line_indent, depth)
        }
    }

    fn parse_sequence(&mut self, indent: usize, depth: usize) -> Result<Value> {
        let mut items = Vec::new();
        loop {
            let Some((line_indent, content)) = self.current() else {
                break;
            };
            if line_indent != indent {
                break;
            }
            if content != "-" && !content.starts_with("- ") {
                return Err(Error::MalformedOutput(
                    "mixed sequence and mapping entries at the same indentation".into(),
                ));
            }
            let content = content.to_string();
            self.pos += 1;
            let content = content.as_str();
            let rest = if content == "-" {
                ""
            } else {
                content[2..].trim_start()
            };

            if rest.is_empty() {
                let child_indent = self
                    .current()
                    .map(|(i, _)| i)
                    .filter(|i| *i > indent)
                    .unwrap_or(indent + 2);
                items.push(self.parse_node(child_indent, depth + 1)?);
            } else if let Some((key, val_opt)) = split_key_value(rest) {
                // "- key: value" starts an inline mapping for this item.
                let item_indent = indent + (content.len() - rest.len());
                items.push(self.parse_inline_mapping_item(item_indent, depth, key, val_opt)?);
            } else {
                items.push(parse_scalar(rest, depth)?);
            }
        }
        Ok(Value::Seq(items))
    }

    /// Parses `"- key: value"` sequence items, where the first key is
    /// on the dash's own line and any further keys are indented to
    /// align with it.
    fn parse_inline_mapping_item(
        &mut self,
        item_indent: usize,
        depth: usize,
        first_key: &str,
        first_val: Option<&str>,
    ) -> Result<Value> {
        if depth + 1 > MAX_DEPTH {
            return Err(Error::MalformedOutput(format!(
                "nesting exceeds the maximum depth of {MAX_DEPTH}"
            )));
        }
        let mut map = IndexMap::new();
        let key = parse_key(first_key)?;
        let value = match first_val {
            Some(v) if !v.is_empty() => parse_inline_value(v, depth + 1)?,
            _ => {
                let child_indent = self
                    .current()
                    .map(|(i, _)| i)
                    .filter(|i| *i > item_indent)
                    .unwrap_or(item_indent + 2);
                self.parse_node(child_indent, depth + 2)?
            }
        };
        map.insert(key, value);

        loop {
            let Some((line_indent, content)) = self.current() else {
                break;
            };
            if line_indent != item_indent {
                break;
            }
            if content.starts_with("- ") || content == "-" {
                break;
            }
            let Some((key, val_opt)) = split_key_value(content) else {
                break;
            };
            let key = key.to_string();
            let val_opt = val_opt.map(|v| v.to_string());
            self.pos += 1;
            let key = parse_key(&key)?;
            if map.contains_key(&key) {
                return Err(Error::MalformedOutput(format!("duplicate key '{key}'")));
            }
            let value = match val_opt {
                Some(ref v) if !v.is_empty() => parse_inline_value(v, depth + 1)?,
                _ => {
                    let child_indent = self
                        .current()
                        .map(|(i, _)| i)
                        .filter(|i| *i > item_indent)
                        .unwrap_or(item_indent + 2);
                    self.parse_node(child_indent, depth + 2)?
                }
            };
            map.insert(key, value);
        }
        Ok(Value::Map(map))
    }

    fn parse_mapping(&mut self, indent: usize, depth: usize) -> Result<Value> {
        let mut map = IndexMap::new();
        loop {
            let Some((line_indent, content)) = self.current() else {
                break;
            };
            if line_indent != indent {
                break;
            }
            if content.starts_with("- ") || content == "-" {
                return Err(Error::MalformedOutput(
                    "mixed sequence and mapping entries at the same indentation".into(),
                ));
            }
            let Some((key, val_opt)) = split_key_value(content) else {
                return Err(Error::MalformedOutput(format!(
                    "expected 'key: value' at '{content}'"
                )));
            };
            let key = key.to_string();
            let val_opt = val_opt.map(|v| v.to_string());
            self.pos += 1;
            let key = parse_key(&key)?;
            if map.contains_key(&key) {
                return Err(Error::MalformedOutput(format!("duplicate key '{key}'")));
            }
            let value = match val_opt {
                Some(ref v) if !v.is_empty() => parse_inline_value(v, depth + 1)?,
                _ => {
                    let child_indent = self
                        .current()
                        .map(|(i, _)| i)
                        .filter(|i| *i > indent)
                        .unwrap_or(indent + 2);
                    self.parse_node(child_indent, depth + 1)?
                }
            };
            map.insert(key, value);
        }
        Ok(Value::Map(map))
    }
}

/// Splits `"key: value"` or `"key:"` into `(key, Some(value)|None)`,
/// respecting quoted keys. Returns `None` if `content` has no
/// top-level, unquoted `:`  separator.
fn split_key_value(content: &str) -> Option<(&str, Option<&str>)> {
    let bytes = content.as_bytes();
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' if !in_double => in_single = !in_single,
            b'"' if !in_single => in_double = !in_double,
            b':' if !in_single && !in_double => {
                let followed_by_space_or_end = i + 1 == bytes.len() || bytes[i + 1] == b' ';
                if followed_by_space_or_end {
                    let key = content[..i].trim();
                    let val = content[i + 1..].trim();
                    return Some((key, if val.is_empty() { None } else { Some(val) }));
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn parse_key(raw: &str) -> Result<String> {
    match parse_scalar(raw, 0)? {
        Value::String(s) => Ok(s),
        Value::Int(i) => Ok(i.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(Error::MalformedOutput(format!(
            "unsupported key type {}",
            other.type_name()
        ))),
    }
}

/// Parses a value appearing after `key:` or as a sequence item,
/// including flow collections.
fn parse_inline_value(raw: &str, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(Error::MalformedOutput(format!(
            "nesting exceeds the maximum depth of {MAX_DEPTH}"
        )));
    }
    let trimmed = raw.trim();
    if let Some(inner) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        let items = split_flow_items(inner)?;
        let mut values = Vec::with_capacity(items.len());
        for item in items {
            if item.trim().is_empty() {
                continue;
            }
            values.push(parse_inline_value(item.trim(), depth + 1)?);
        }
        return Ok(Value::Seq(values));
    }
    if trimmed == "{}" {
        return Ok(Value::Map(IndexMap::new()));
    }
    if trimmed.starts_with('{') {
        return Err(Error::MalformedOutput(
            "non-empty flow mappings are not supported".into(),
        ));
    }
    parse_scalar(trimmed, depth)
}

fn split_flow_items(inner: &str) -> Result<Vec<&str>> {
    let bytes = inner.as_bytes();
    let mut items = Vec::new();
    let mut depth = 0i32;
    let mut in_single = false;
    let mut in_double = false;
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' if !in_double => in_single = !in_single,
            b'"' if !in_single => in_double = !in_double,
            b'[' | b'{' if !in_single && !in_double => depth += 1,
            b']' | b'}' if !in_single && !in_double => depth -= 1,
            b',' if !in_single && !in_double && depth == 0 => {
                items.push(&inner[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    if in_single || in_double {
        return Err(Error::MalformedOutput("unterminated quoted string".into()));
    }
    if start < inner.len() || !inner.is_empty() {
        items.push(&inner[start..]);
    }
    Ok(items)
}

fn parse_scalar(raw: &str, _depth: usize) -> Result<Value> {
    let s = raw.trim();
    if s.starts_with('&') {
        return Err(Error::MalformedOutput("anchors are not supported".into()));
    }
    if s.starts_with('*') {
        return Err(Error::MalformedOutput("aliases are not supported".into()));
    }
    if s.starts_with('!') {
        return Err(Error::MalformedOutput("tags are not supported".into()));
    }
    if s == "|" || s == ">" || s.starts_with("|-") || s.starts_with(">-") || s.starts_with("|+") {
        return Err(Error::MalformedOutput(
            "block scalars are not supported".into(),
        ));
    }

    if let Some(inner) = s.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        if s.len() < 2 {
            return Err(Error::MalformedOutput("unterminated string".into()));
        }
        return Ok(Value::String(unescape_double(inner)?));
    }
    if let Some(inner) = s.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        if s.len() < 2 {
            return Err(Error::MalformedOutput("unterminated string".into()));
        }
        return Ok(Value::String(inner.replace("''", "'")));
    }

    match s {
        "null" | "~" | "" => return Ok(Value::Null),
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        _ => {}
    }
    if let Ok(i) = s.parse::<i64>() {
        return Ok(Value::Int(i));
    }
    Ok(Value::String(s.to_string()))
}

fn unescape_double(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => return Err(Error::MalformedOutput("dangling escape in string".into())),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_mapping() {
        let v = parse("status: success\nsite: example.com\n").unwrap();
        let map = v.as_map().unwrap();
        assert_eq!(map.get("status").unwrap().as_str(), Some("success"));
        assert_eq!(map.get("site").unwrap().as_str(), Some("example.com"));
    }

    #[test]
    fn parses_nested_mapping_and_sequence() {
        let input = "status: success\nwarnings:\n  - one\n  - two\nmeta:\n  php: \"8.3\"\n  ports: [80, 443]\n";
        let v = parse(input).unwrap();
        let map = v.as_map().unwrap();
        let warnings = map.get("warnings").unwrap().as_seq().unwrap();
        assert_eq!(warnings.len(), 2);
        let meta = map.get("meta").unwrap().as_map().unwrap();
        assert_eq!(meta.get("php").unwrap().as_str(), Some("8.3"));
        let ports = meta.get("ports").unwrap().as_seq().unwrap();
        assert_eq!(ports[0].as_int(), Some(80));
    }

    #[test]
    fn parses_sequence_of_mappings() {
        let input = "sites:\n  - domain: a.com\n    php: \"8.2\"\n  - domain: b.com\n    php: \"8.3\"\n";
        let v = parse(input).unwrap();
        let sites = v.as_map().unwrap().get("sites").unwrap().as_seq().unwrap();
        assert_eq!(sites.len(), 2);
        assert_eq!(
            sites[0].as_map().unwrap().get("domain").unwrap().as_str(),
            Some("a.com")
        );
    }

    #[test]
    fn rejects_anchors() {
        assert!(parse("a: &anchor value\n").is_err());
    }

    #[test]
    fn rejects_aliases() {
        assert!(parse("a: *anchor\n").is_err());
    }

    #[test]
    fn rejects_tags() {
        assert!(parse("a: !!str value\n").is_err());
    }

    #[test]
    fn rejects_multi_document() {
        assert!(parse("a: 1\n---\nb: 2\n").is_err());
    }

    #[test]
    fn rejects_block_scalars() {
        assert!(parse("a: |\n  line1\n  line2\n").is_err());
    }

    #[test]
    fn rejects_duplicate_keys() {
        assert!(parse("a: 1\na: 2\n").is_err());
    }

    #[test]
    fn rejects_oversize_document() {
        let huge = format!("a: \"{}\"\n", "x".repeat(2 * 1024 * 1024));
        assert!(parse(&huge).is_err());
    }

    #[test]
    fn rejects_excess_nesting() {
        let mut input = String::new();
        for i in 0..10 {
            input.push_str(&"  ".repeat(i));
            input.push_str("a:\n");
        }
        input.push_str(&"  ".repeat(10));
        input.push_str("leaf: 1\n");
        assert!(parse(&input).is_err());
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let input = "# a top comment\nstatus: success # trailing\n\nsite: example.com\n";
        let v = parse(input).unwrap();
        let map = v.as_map().unwrap();
        assert_eq!(map.get("status").unwrap().as_str(), Some("success"));
    }
}
