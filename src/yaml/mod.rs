//! Bounded YAML Result Parser (spec.md §4.4).
//!
//! Playbooks report their outcome as a small YAML document written to
//! `output.yaml`. Rather than pull in a general-purpose YAML parser —
//! which would silently accept anchors, aliases, tags, multi-document
//! streams and block scalars that this contract explicitly forbids —
//! this module implements the bounded subset the contract allows and
//! rejects everything else with `Error::MalformedOutput`.
//!
//! Supported: block mappings and sequences, flow sequences (`[a, b]`),
//! the empty flow mapping (`{}`), plain/single/double-quoted scalars,
//! booleans, integers, `null`, comments, 2-space indentation. Rejected:
//! anchors (`&`), aliases (`*`), tags (`!`), multi-document markers
//! (`---`/`...`), block scalars (`|`/`>`), nesting past 8 levels,
//! documents over 1MiB, and duplicate mapping keys.

mod parser;
mod value;

pub use parser::parse;
pub use value::Value;

use crate::error::{Error, Result};

/// The playbook execution outcome, as surfaced through `output.yaml`
/// (spec.md §4.3/§4.4). `status` and `warnings` are the fields every
/// playbook must set; `data` carries whatever else it reports.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybookOutput {
    pub status: PlaybookStatus,
    pub warnings: Vec<String>,
    pub data: indexmap::IndexMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybookStatus {
    Success,
    Failure,
}

/// Parses a playbook's `output.yaml` content into a [`PlaybookOutput`].
pub fn parse_playbook_output(input: &str) -> Result<PlaybookOutput> {
    let value = parse(input)?;
    let mut map = match value {
        Value::Map(m) => m,
        other => {
            return Err(Error::MalformedOutput(format!(
                "expected a mapping at the document root, found {}",
                other.type_name()
            )))
        }
    };

    let status = match map.shift_remove("status") {
        Some(Value::String(s)) if s == "success" => PlaybookStatus::Success,
        Some(Value::String(s)) if s == "failure" => PlaybookStatus::Failure,
        Some(other) => {
            return Err(Error::MalformedOutput(format!(
                "'status' must be \"success\" or \"failure\", found {}",
                other.type_name()
            )))
        }
        None => return Err(Error::MalformedOutput("missing required 'status' field".into())),
    };

    let warnings = match map.shift_remove("warnings") {
        Some(Value::Seq(items)) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                other => Err(Error::MalformedOutput(format!(
                    "'warnings' entries must be strings, found {}",
                    other.type_name()
                ))),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(Value::Null) | None => Vec::new(),
        Some(other) => {
            return Err(Error::MalformedOutput(format!(
                "'warnings' must be a sequence, found {}",
                other.type_name()
            )))
        }
    };

    Ok(PlaybookOutput {
        status,
        warnings,
        data: map,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_success_output() {
        let out = parse_playbook_output("status: success\n").unwrap();
        assert_eq!(out.status, PlaybookStatus::Success);
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn parses_warnings_and_extra_data() {
        let input = "status: success\nwarnings:\n  - \"supervisor restart failed\"\nsite: example.com\n";
        let out = parse_playbook_output(input).unwrap();
        assert_eq!(out.warnings, vec!["supervisor restart failed"]);
        assert_eq!(
            out.data.get("site"),
            Some(&Value::String("example.com".into()))
        );
    }

    #[test]
    fn missing_status_is_malformed() {
        let err = parse_playbook_output("site: example.com\n").unwrap_err();
        assert!(matches!(err, Error::MalformedOutput(_)));
    }

    #[test]
    fn non_mapping_root_is_malformed() {
        let err = parse_playbook_output("- a\n- b\n").unwrap_err();
        assert!(matches!(err, Error::MalformedOutput(_)));
    }
}
