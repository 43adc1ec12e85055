use std::sync::OnceLock;

use regex::Regex;

use crate::model::{local_name_of, Element};

const CODE_NODE_NOT_FOUND: &str = "NODE_NOT_FOUND";
const CODE_INDEX_ERROR: &str = "INDEX_ERROR";
const CODE_TYPE_ERROR: &str = "TYPE_ERROR";
const CODE_EMPTY_PATH: &str = "EMPTY_PATH";
const CODE_INTERNAL_ERROR: &str = "INTERNAL_ERROR";

fn segment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // tag, optional [@attr='v'], optional [n]
        Regex::new(r"^([A-Za-z_][\w.\-:]*)(?:\[@([\w.\-:]+)='([^']*)'\])?(?:\[(\d+)\])?$")
            .unwrap_or_else(|e| panic!("path segment regex: {}", e))
    })
}

struct PathFailure {
    code: &'static str,
    message: String,
}

impl PathFailure {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

enum Cursor<'a> {
    One(&'a Element),
    Many(Vec<&'a Element>),
}

/// Evaluates a slash-separated path expression against a parsed tree and
/// returns a serialized XML result. Input-shape problems never surface as
/// errors to the caller; they come back as a structured `<error>` payload.
pub fn extract_path(root: &Element, path: &str) -> String {
    match evaluate(root, path) {
        Ok(xml) => xml,
        Err(failure) => error_xml(&failure, path),
    }
}

fn evaluate(root: &Element, path: &str) -> Result<String, PathFailure> {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Err(PathFailure::new(CODE_EMPTY_PATH, "path is empty"));
    }

    // Canonical paths are root-inclusive: a leading segment naming the
    // document root addresses the root itself, not a child of it.
    let mut segments = trimmed.split('/').peekable();
    if segments.peek() == Some(&root.local_name()) {
        segments.next();
    }

    let mut cursor = Cursor::One(root);
    for segment in segments {
        cursor = step(cursor, segment)?;
    }

    Ok(serialize(cursor))
}

fn step<'a>(cursor: Cursor<'a>, segment: &str) -> Result<Cursor<'a>, PathFailure> {
    // Bare integer: pure index into the current list.
    if let Ok(index) = segment.parse::<usize>() {
        return index_into(cursor, index, segment);
    }

    let caps = segment_re().captures(segment).ok_or_else(|| {
        PathFailure::new(
            CODE_INTERNAL_ERROR,
            format!("unrecognized path segment '{}'", segment),
        )
    })?;

    let tag = &caps[1];
    let attr_name = caps.get(2).map(|m| m.as_str());
    let attr_value = caps.get(3).map(|m| m.as_str());
    let index = caps.get(4).map(|m| m.as_str());

    let mut matches: Vec<&Element> = match &cursor {
        Cursor::One(el) => el.children_named(tag),
        Cursor::Many(els) => els.iter().flat_map(|el| el.children_named(tag)).collect(),
    };
    if matches.is_empty() {
        return Err(PathFailure::new(
            CODE_NODE_NOT_FOUND,
            format!("no child named '{}'", tag),
        ));
    }

    if let (Some(name), Some(value)) = (attr_name, attr_value) {
        matches.retain(|el| el.attr(name) == Some(value));
        if matches.is_empty() {
            return Err(PathFailure::new(
                CODE_NODE_NOT_FOUND,
                format!("no '{}' with @{}='{}'", tag, name, value),
            ));
        }
    }

    match index {
        Some(raw) => {
            let parsed = raw.parse::<usize>().map_err(|_| {
                PathFailure::new(
                    CODE_INTERNAL_ERROR,
                    format!("bad index in segment '{}'", segment),
                )
            })?;
            // An explicit index always applies to the list of matches,
            // even when the filter narrowed it to a single element.
            index_into(Cursor::Many(matches), parsed, segment)
        }
        None => Ok(if matches.len() == 1 {
            Cursor::One(matches[0])
        } else {
            Cursor::Many(matches)
        }),
    }
}

fn index_into<'a>(
    cursor: Cursor<'a>,
    index: usize,
    segment: &str,
) -> Result<Cursor<'a>, PathFailure> {
    match cursor {
        Cursor::Many(els) => {
            if index >= els.len() {
                return Err(PathFailure::new(
                    CODE_INDEX_ERROR,
                    format!(
                        "index {} out of range for list of {} (segment '{}')",
                        index,
                        els.len(),
                        segment
                    ),
                ));
            }
            Ok(Cursor::One(els[index]))
        }
        Cursor::One(_) => Err(PathFailure::new(
            CODE_TYPE_ERROR,
            format!("segment '{}' applies an index to a non-list node", segment),
        )),
    }
}

fn serialize(cursor: Cursor<'_>) -> String {
    match cursor {
        Cursor::One(el) => el.to_xml(),
        Cursor::Many(els) => {
            let tag = els
                .first()
                .map(|el| local_name_of(&el.name).to_string())
                .unwrap_or_else(|| "node".to_string());
            let mut wrapper = Element::new(format!("{}_list", tag));
            for el in els {
                wrapper.push((*el).clone());
            }
            wrapper.to_xml()
        }
    }
}

fn error_xml(failure: &PathFailure, path: &str) -> String {
    let mut error = Element::new("error");
    error.push(Element::with_text("code", failure.code));
    error.push(Element::with_text("path", path));
    error.push(Element::with_text("message", failure.message.clone()));
    error.to_xml()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Element {
        Element::parse(
            r#"<a>
  <b x="q">first</b>
  <b x="r">second</b>
  <c><d>deep</d></c>
</a>"#,
        )
        .unwrap()
    }

    fn code_of(output: &str) -> String {
        let parsed = Element::parse(output).unwrap();
        assert_eq!(parsed.local_name(), "error");
        parsed.child_text("code").unwrap_or_default().to_string()
    }

    #[test]
    fn plain_tag_walks_down() {
        let out = extract_path(&tree(), "c/d");
        let parsed = Element::parse(&out).unwrap();
        assert_eq!(parsed.text.as_deref(), Some("deep"));
    }

    #[test]
    fn repeated_tag_serializes_as_list() {
        let out = extract_path(&tree(), "b");
        let parsed = Element::parse(&out).unwrap();
        assert_eq!(parsed.local_name(), "b_list");
        assert_eq!(parsed.children_named("b").len(), 2);
    }

    #[test]
    fn attribute_filter_selects_one() {
        let out = extract_path(&tree(), "b[@x='r']");
        let parsed = Element::parse(&out).unwrap();
        assert_eq!(parsed.text.as_deref(), Some("second"));
    }

    #[test]
    fn index_out_of_range_is_structured() {
        assert_eq!(code_of(&extract_path(&tree(), "b[2]")), "INDEX_ERROR");
    }

    #[test]
    fn filter_without_match_is_structured() {
        assert_eq!(code_of(&extract_path(&tree(), "b[@x='zz']")), "NODE_NOT_FOUND");
    }

    #[test]
    fn index_on_non_list_is_type_error() {
        assert_eq!(code_of(&extract_path(&tree(), "c/1")), "TYPE_ERROR");
    }

    #[test]
    fn empty_path_is_reported() {
        assert_eq!(code_of(&extract_path(&tree(), "  ")), "EMPTY_PATH");
        assert_eq!(code_of(&extract_path(&tree(), "/")), "EMPTY_PATH");
    }

    #[test]
    fn bare_integer_indexes_a_list() {
        let out = extract_path(&tree(), "b/1");
        let parsed = Element::parse(&out).unwrap();
        assert_eq!(parsed.text.as_deref(), Some("second"));
    }

    #[test]
    fn unknown_node_is_structured_not_a_panic() {
        assert_eq!(code_of(&extract_path(&tree(), "zzz")), "NODE_NOT_FOUND");
    }

    #[test]
    fn leading_root_segment_is_skipped() {
        let out = extract_path(&tree(), "a/c/d");
        let parsed = Element::parse(&out).unwrap();
        assert_eq!(parsed.text.as_deref(), Some("deep"));

        // Out-of-range stays an index failure, not a missing node.
        assert_eq!(code_of(&extract_path(&tree(), "a/b[2]")), "INDEX_ERROR");
    }

    #[test]
    fn root_inclusive_filter_with_index_selects_the_match() {
        let doc = Element::parse(
            r#"<dt_asset xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <dt_elements xsi:type="dt_project"><element_id>p1</element_id></dt_elements>
  <dt_elements xsi:type="dt_file"><element_id>part.nc</element_id></dt_elements>
</dt_asset>"#,
        )
        .unwrap();
        let out = extract_path(&doc, "dt_asset/dt_elements[@xsi:type='dt_file'][0]");
        let parsed = Element::parse(&out).unwrap();
        assert_eq!(parsed.child_text("element_id"), Some("part.nc"));
    }
}
