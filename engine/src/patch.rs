//! JSON-Patch-style edits of a holder's working value.
//!
//! Paths are resolved through the kind, not the raw JSON: object segments
//! name fields (by field name or JSON name) and list segments are indices.
//! A patch runs against a copy of the working value and is committed only
//! when every operation succeeds.

use crate::field::FieldDescriptor;
use crate::{error::Result, Error, Holder, Kind};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeSet;
use std::str::FromStr;
use tracing::debug;

/// Patch operation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Test,
    Remove,
    Add,
    Replace,
    Move,
    Copy,
}

impl FromStr for Op {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "test" => Ok(Op::Test),
            "remove" => Ok(Op::Remove),
            "add" => Ok(Op::Add),
            "replace" => Ok(Op::Replace),
            "move" => Ok(Op::Move),
            "copy" => Ok(Op::Copy),
            other => Err(Error::InvalidOperation(other.to_string())),
        }
    }
}

/// One patch operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub op: Op,
    pub path: String,
    pub value: JsonValue,
    pub from: Option<String>,
}

#[derive(Deserialize)]
struct RawOperation {
    op: String,
    path: String,
    #[serde(default)]
    value: JsonValue,
    from: Option<String>,
}

/// Decode a patch payload: a JSON array of `{op, path, value?, from?}`.
pub fn parse_operations(raw: &[u8]) -> Result<Vec<Operation>> {
    let ops: Vec<RawOperation> =
        serde_json::from_slice(raw).map_err(|e| Error::Decode(e.to_string()))?;
    ops.into_iter()
        .map(|raw| {
            Ok(Operation {
                op: raw.op.parse()?,
                path: raw.path,
                value: raw.value,
                from: raw.from,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Index(usize),
    Append,
}

/// A path resolved against a kind.
#[derive(Debug)]
struct Target<'k> {
    path: String,
    segments: Vec<Segment>,
    /// Field at the end of the path
    field: &'k FieldDescriptor,
    /// Whether the path ends at one element of `field`
    element: bool,
    settable: bool,
}

impl Target<'_> {
    fn root(&self) -> &str {
        match self.segments.first() {
            Some(Segment::Field(name)) => name,
            _ => "",
        }
    }

    fn require_settable(&self) -> Result<()> {
        if self.settable {
            Ok(())
        } else {
            Err(Error::FieldNotSettable(self.path.clone()))
        }
    }

    fn normalize(&self, value: &JsonValue) -> Result<JsonValue> {
        self.field.normalize(value, self.element)
    }
}

fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

fn resolve<'k>(kind: &'k Kind, path: &str) -> Result<Target<'k>> {
    let invalid = || Error::InvalidPath(path.to_string());
    let rest = path.strip_prefix('/').ok_or_else(invalid)?;
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut segments = Vec::new();
    let mut current: Option<&FieldDescriptor> = None;
    let mut element = false;
    let mut settable = true;
    for raw in rest.split('/') {
        let part = unescape(raw);
        let field = match current {
            Some(field) if field.multiple && !element => {
                let segment = if part == "-" {
                    Segment::Append
                } else {
                    part.parse().map(Segment::Index).map_err(|_| invalid())?
                };
                segments.push(segment);
                element = true;
                continue;
            }
            Some(field) => field
                .nested_kind()
                .and_then(|nested| nested.lookup(&part))
                .ok_or_else(invalid)?,
            None => kind.lookup(&part).ok_or_else(invalid)?,
        };
        if segments.contains(&Segment::Append) {
            return Err(invalid());
        }
        settable &= field.is_settable();
        segments.push(Segment::Field(field.name.clone()));
        current = Some(field);
        element = false;
    }

    match current {
        Some(field) => Ok(Target {
            path: path.to_string(),
            segments,
            field,
            element,
            settable,
        }),
        None => Err(invalid()),
    }
}

/// Walk to the container holding the last segment of `target`.
fn parent_mut<'v>(
    root: &'v mut Map<String, JsonValue>,
    target: &Target<'_>,
) -> Result<&'v mut JsonValue> {
    let invalid = || Error::InvalidPath(target.path.clone());
    let (first, rest) = match target.segments.split_first() {
        Some((Segment::Field(name), rest)) if !rest.is_empty() => (name, rest),
        _ => return Err(invalid()),
    };
    let mut node = root.entry(first.clone()).or_insert(JsonValue::Null);
    for segment in &rest[..rest.len() - 1] {
        node = match segment {
            Segment::Field(name) => {
                if node.is_null() {
                    *node = JsonValue::Object(Map::new());
                }
                node.as_object_mut()
                    .ok_or_else(invalid)?
                    .entry(name.clone())
                    .or_insert(JsonValue::Null)
            }
            Segment::Index(i) => node
                .as_array_mut()
                .and_then(|items| items.get_mut(*i))
                .ok_or_else(invalid)?,
            Segment::Append => return Err(invalid()),
        };
    }
    Ok(node)
}

fn get(root: &Map<String, JsonValue>, target: &Target<'_>) -> Result<JsonValue> {
    let invalid = || Error::InvalidPath(target.path.clone());
    let mut node: Option<&JsonValue> = None;
    for segment in &target.segments {
        node = match (segment, node) {
            (Segment::Field(name), None) => root.get(name),
            (Segment::Field(name), Some(value)) => value.get(name),
            (Segment::Index(i), Some(value)) => {
                Some(value.get(*i).ok_or_else(invalid)?)
            }
            _ => return Err(invalid()),
        };
        if node.is_none() {
            break;
        }
    }
    Ok(node
        .cloned()
        .unwrap_or_else(|| target.field.zero_json(crate::Naming::Field)))
}

fn set(root: &mut Map<String, JsonValue>, target: &Target<'_>, value: JsonValue) -> Result<()> {
    let invalid = || Error::InvalidPath(target.path.clone());
    if let [Segment::Field(name)] = target.segments.as_slice() {
        root.insert(name.clone(), value);
        return Ok(());
    }
    let parent = parent_mut(root, target)?;
    match target.segments.last() {
        Some(Segment::Field(name)) => {
            if parent.is_null() {
                *parent = JsonValue::Object(Map::new());
            }
            parent
                .as_object_mut()
                .ok_or_else(invalid)?
                .insert(name.clone(), value);
        }
        Some(Segment::Index(i)) => {
            let slot = parent
                .as_array_mut()
                .and_then(|items| items.get_mut(*i))
                .ok_or_else(invalid)?;
            *slot = value;
        }
        Some(Segment::Append) | None => return Err(invalid()),
    }
    Ok(())
}

/// Mutable list holding the element `target` points at.
fn list_mut<'v>(
    root: &'v mut Map<String, JsonValue>,
    target: &Target<'_>,
) -> Result<&'v mut Vec<JsonValue>> {
    let invalid = || Error::InvalidPath(target.path.clone());
    let parent = parent_mut(root, target)?;
    if parent.is_null() {
        *parent = JsonValue::Array(Vec::new());
    }
    parent.as_array_mut().ok_or_else(invalid)
}

fn add(root: &mut Map<String, JsonValue>, target: &Target<'_>, value: &JsonValue) -> Result<()> {
    let invalid = || Error::InvalidPath(target.path.clone());
    match target.segments.last() {
        Some(Segment::Append) => {
            let item = target.normalize(value)?;
            list_mut(root, target)?.push(item);
        }
        Some(Segment::Index(i)) => {
            let item = target.normalize(value)?;
            let items = list_mut(root, target)?;
            if *i > items.len() {
                return Err(invalid());
            }
            items.insert(*i, item);
        }
        _ if target.field.multiple => {
            let values: Vec<&JsonValue> = match value {
                JsonValue::Array(values) => values.iter().collect(),
                single => vec![single],
            };
            let mut current = match get(root, target)? {
                JsonValue::Array(items) => items,
                _ => Vec::new(),
            };
            for value in values {
                current.push(target.field.normalize(value, true)?);
            }
            set(root, target, JsonValue::Array(current))?;
        }
        _ => {
            let value = target.normalize(value)?;
            set(root, target, value)?;
        }
    }
    Ok(())
}

fn remove(root: &mut Map<String, JsonValue>, target: &Target<'_>) -> Result<()> {
    match target.segments.last() {
        Some(Segment::Index(i)) => {
            let items = list_mut(root, target)?;
            if *i >= items.len() {
                return Err(Error::InvalidPath(target.path.clone()));
            }
            items.remove(*i);
            Ok(())
        }
        Some(Segment::Append) => Err(Error::InvalidPath(target.path.clone())),
        _ => set(root, target, target.field.zero_json(crate::Naming::Field)),
    }
}

fn replace(root: &mut Map<String, JsonValue>, target: &Target<'_>, value: &JsonValue) -> Result<()> {
    if target.segments.last() == Some(&Segment::Append) {
        return Err(Error::InvalidPath(target.path.clone()));
    }
    let value = target.normalize(value)?;
    set(root, target, value)
}

fn apply(
    kind: &Kind,
    root: &mut Map<String, JsonValue>,
    touched: &mut BTreeSet<String>,
    operation: &Operation,
) -> Result<()> {
    let target = resolve(kind, &operation.path)?;
    let source = match (operation.op, &operation.from) {
        (Op::Move | Op::Copy, Some(from)) => Some(resolve(kind, from)?),
        (Op::Move | Op::Copy, None) => {
            return Err(Error::InvalidOperation(format!(
                "{:?} requires 'from'",
                operation.op
            )))
        }
        _ => None,
    };

    match operation.op {
        Op::Test => {
            let current = get(root, &target)?;
            let expected = target
                .normalize(&operation.value)
                .map_err(|_| Error::TestFailed(target.path.clone()))?;
            if current != expected {
                return Err(Error::TestFailed(target.path.clone()));
            }
            return Ok(());
        }
        Op::Remove => {
            target.require_settable()?;
            remove(root, &target)?;
        }
        Op::Add => {
            target.require_settable()?;
            add(root, &target, &operation.value)?;
        }
        Op::Replace => {
            target.require_settable()?;
            replace(root, &target, &operation.value)?;
        }
        Op::Move | Op::Copy => {
            target.require_settable()?;
            // Checked above; both ops carry a source.
            let Some(source) = source else {
                return Err(Error::InvalidOperation(operation.path.clone()));
            };
            let value = get(root, &source)?;
            if operation.op == Op::Move {
                source.require_settable()?;
                remove(root, &source)?;
                touched.insert(source.root().to_string());
            }
            replace(root, &target, &value)?;
        }
    }
    touched.insert(target.root().to_string());
    Ok(())
}

impl Holder {
    /// Apply a patch payload to the working value.
    pub fn patch(&mut self, raw: &[u8]) -> Result<()> {
        let operations = parse_operations(raw)?;
        self.apply_patch(&operations)
    }

    /// Apply operations in order; on any failure the holder is unchanged.
    ///
    /// Touched top-level fields become supplied and are re-prepared.
    pub fn apply_patch(&mut self, operations: &[Operation]) -> Result<()> {
        let kind = self.kind().clone();
        let mut working = self.working.clone();
        let mut touched = BTreeSet::new();
        for (index, operation) in operations.iter().enumerate() {
            if let Err(e) = apply(&kind, &mut working, &mut touched, operation) {
                debug!(kind = %kind.name(), index, path = %operation.path, error = %e, "patch rejected");
                return Err(e);
            }
        }
        let mut supplied = self.supplied.clone();
        supplied.extend(touched);
        self.stage(working, supplied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Field, KindOptions, MetaRole, ValueType};
    use serde_json::json;
    use std::sync::Arc;

    fn kind() -> Arc<Kind> {
        Arc::new(
            Kind::dynamic(
                "Post",
                vec![
                    Field::string("title"),
                    Field::string("subtitle").json_name("sub"),
                    Field::list("tags", ValueType::String),
                    Field::int("score"),
                    Field::group(
                        "author",
                        vec![Field::string("name"), Field::string("email").read_only()],
                    ),
                    Field::group_list(
                        "links",
                        vec![Field::string("href"), Field::string("rel")],
                    ),
                    Field::timestamp("created").meta(MetaRole::CreatedAt),
                ],
                KindOptions::default(),
            )
            .unwrap(),
        )
    }

    fn holder() -> Holder {
        let mut holder = Holder::new(kind());
        holder
            .parse_input(
                json!({
                    "title": "old",
                    "tags": ["a", "b"],
                    "author": {"name": "Ann", "email": "ann@example.com"},
                    "links": [{"href": "/one"}],
                })
                .as_object()
                .unwrap(),
            )
            .unwrap();
        holder
    }

    #[test]
    fn replace_then_move() {
        let mut holder = holder();
        holder
            .patch(br#"[{"op": "replace", "path": "/title", "value": "new"}]"#)
            .unwrap();
        assert_eq!(holder.get("title"), Some(&json!("new")));
        assert_eq!(holder.get("tags"), Some(&json!(["a", "b"])));

        holder
            .patch(br#"[{"op": "move", "from": "/title", "path": "/subtitle"}]"#)
            .unwrap();
        assert_eq!(holder.get("title"), Some(&json!("")));
        assert_eq!(holder.get("subtitle"), Some(&json!("new")));
        assert!(holder.is_supplied("subtitle"));
    }

    #[test]
    fn add_appends_to_lists() {
        let mut holder = holder();
        holder
            .patch(
                br#"[
                    {"op": "add", "path": "/tags", "value": ["c", "d"]},
                    {"op": "add", "path": "/tags", "value": "e"},
                    {"op": "add", "path": "/tags/0", "value": "z"},
                    {"op": "add", "path": "/tags/-", "value": "end"}
                ]"#,
            )
            .unwrap();
        assert_eq!(
            holder.get("tags"),
            Some(&json!(["z", "a", "b", "c", "d", "e", "end"]))
        );
    }

    #[test]
    fn add_on_scalar_replaces() {
        let mut holder = holder();
        holder
            .patch(br#"[{"op": "add", "path": "/score", "value": 7}]"#)
            .unwrap();
        assert_eq!(holder.get("score"), Some(&json!(7)));
    }

    #[test]
    fn remove_zeroes_fields_and_drops_elements() {
        let mut holder = holder();
        holder
            .patch(
                br#"[
                    {"op": "remove", "path": "/title"},
                    {"op": "remove", "path": "/tags/0"}
                ]"#,
            )
            .unwrap();
        assert_eq!(holder.get("title"), Some(&json!("")));
        assert_eq!(holder.get("tags"), Some(&json!(["b"])));
    }

    #[test]
    fn nested_paths() {
        let mut holder = holder();
        holder
            .patch(
                br#"[
                    {"op": "replace", "path": "/author/name", "value": "Bob"},
                    {"op": "replace", "path": "/links/0/rel", "value": "self"},
                    {"op": "add", "path": "/links/-", "value": {"href": "/two"}},
                    {"op": "copy", "from": "/author/name", "path": "/sub"}
                ]"#,
            )
            .unwrap();
        assert_eq!(holder.get("author").unwrap()["name"], json!("Bob"));
        assert_eq!(
            holder.get("links"),
            Some(&json!([
                {"href": "/one", "rel": "self"},
                {"href": "/two", "rel": ""},
            ]))
        );
        assert_eq!(holder.get("subtitle"), Some(&json!("Bob")));
    }

    #[test]
    fn test_op() {
        let mut holder = holder();
        holder
            .patch(br#"[{"op": "test", "path": "/title", "value": "old"}]"#)
            .unwrap();
        let result = holder.patch(br#"[{"op": "test", "path": "/title", "value": "other"}]"#);
        assert!(matches!(result, Err(Error::TestFailed(p)) if p == "/title"));
    }

    #[test]
    fn failures_leave_holder_unchanged() {
        let mut holder = holder();
        let result = holder.patch(
            br#"[
                {"op": "replace", "path": "/title", "value": "changed"},
                {"op": "replace", "path": "/missing", "value": 1}
            ]"#,
        );
        assert!(matches!(result, Err(Error::InvalidPath(p)) if p == "/missing"));
        assert_eq!(holder.get("title"), Some(&json!("old")));
    }

    #[test]
    fn error_kinds() {
        let mut holder = holder();
        assert!(matches!(
            holder.patch(br#"[{"op": "swap", "path": "/title"}]"#),
            Err(Error::InvalidOperation(op)) if op == "swap"
        ));
        assert!(matches!(
            holder.patch(br#"{"op": "add"}"#),
            Err(Error::Decode(_))
        ));
        assert!(matches!(
            holder.patch(br#"[{"op": "replace", "path": "/created", "value": 1}]"#),
            Err(Error::FieldNotSettable(_))
        ));
        assert!(matches!(
            holder.patch(br#"[{"op": "replace", "path": "/author/email", "value": "x"}]"#),
            Err(Error::FieldNotSettable(_))
        ));
        assert!(matches!(
            holder.patch(br#"[{"op": "replace", "path": "/score", "value": "high"}]"#),
            Err(Error::FieldTypeInvalid { .. })
        ));
        assert!(matches!(
            holder.patch(br#"[{"op": "remove", "path": "/tags/9"}]"#),
            Err(Error::InvalidPath(_))
        ));
        assert!(matches!(
            holder.patch(br#"[{"op": "replace", "path": "title", "value": "x"}]"#),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn escaped_segments() {
        let kind = Arc::new(
            Kind::dynamic(
                "Odd",
                vec![Field::string("a").json_name("a/b~c")],
                KindOptions::default(),
            )
            .unwrap(),
        );
        let mut holder = Holder::new(kind);
        holder
            .patch(br#"[{"op": "replace", "path": "/a~1b~0c", "value": "x"}]"#)
            .unwrap();
        assert_eq!(holder.get("a"), Some(&json!("x")));
    }
}
