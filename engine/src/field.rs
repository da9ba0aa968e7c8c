//! Field declarations and resolved field descriptors.
//!
//! A [`Field`] is what a record type declares: a name, a shape, and the
//! tag-like modifiers (`storage`, `no_storage`, `json`, `no_json`, `meta`,
//! `label`, `required`, `no_index`, `read_only`). [`Kind`] resolves each
//! declaration into a [`FieldDescriptor`], which owns per-field validation,
//! coercion, and the conversion between JSON values and property trees.

use crate::property::{join_name, Property, PropertyTree, Value};
use crate::{error::Result, Error, Key, Kind, Record};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Scalar value types a field can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Int,
    Float,
    Bool,
    /// RFC 3339 string or integer milliseconds on input
    Timestamp,
    /// Base64 string on input and output
    Bytes,
    /// Encoded [`Key`] string
    Key,
    /// Arbitrary JSON, stored serialized and unindexed
    Json,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::String => write!(f, "String"),
            ValueType::Int => write!(f, "Int"),
            ValueType::Float => write!(f, "Float"),
            ValueType::Bool => write!(f, "Bool"),
            ValueType::Timestamp => write!(f, "Timestamp"),
            ValueType::Bytes => write!(f, "Bytes"),
            ValueType::Key => write!(f, "Key"),
            ValueType::Json => write!(f, "Json"),
        }
    }
}

impl ValueType {
    /// Convert a JSON input value into a stored value.
    pub fn coerce(self, field: &str, json: &JsonValue) -> Result<Value> {
        if json.is_null() {
            return Ok(Value::Null);
        }
        let mismatch = || Error::type_invalid(field, self, json_type_name(json));
        match self {
            ValueType::String => json
                .as_str()
                .map(|s| Value::String(s.to_string()))
                .ok_or_else(mismatch),
            ValueType::Int => json.as_i64().map(Value::Int).ok_or_else(mismatch),
            ValueType::Float => json.as_f64().map(Value::Float).ok_or_else(mismatch),
            ValueType::Bool => json.as_bool().map(Value::Bool).ok_or_else(mismatch),
            ValueType::Timestamp => match json {
                JsonValue::String(s) => parse_timestamp(s).ok_or_else(mismatch),
                JsonValue::Number(n) => n
                    .as_i64()
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .map(Value::Timestamp)
                    .ok_or_else(mismatch),
                _ => Err(mismatch()),
            },
            ValueType::Bytes => match json {
                JsonValue::String(s) => STANDARD
                    .decode(s)
                    .map(Value::Bytes)
                    .map_err(|_| mismatch()),
                JsonValue::Array(items) => items
                    .iter()
                    .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .collect::<Option<Vec<u8>>>()
                    .map(Value::Bytes)
                    .ok_or_else(mismatch),
                _ => Err(mismatch()),
            },
            ValueType::Key => match json {
                JsonValue::String(s) => Key::decode(s).map(Value::Key).map_err(|_| mismatch()),
                JsonValue::Array(_) => serde_json::from_value::<Key>(json.clone())
                    .map(Value::Key)
                    .map_err(|_| mismatch()),
                _ => Err(mismatch()),
            },
            ValueType::Json => Ok(Value::String(json.to_string())),
        }
    }

    /// Parse a value supplied as text, such as a query filter value.
    pub fn parse_str(self, field: &str, raw: &str) -> Result<Value> {
        let mismatch = || Error::type_invalid(field, self, format!("'{raw}'"));
        match self {
            ValueType::String => Ok(Value::String(raw.to_string())),
            ValueType::Int => raw.trim().parse().map(Value::Int).map_err(|_| mismatch()),
            ValueType::Float => raw.trim().parse().map(Value::Float).map_err(|_| mismatch()),
            ValueType::Bool => raw.trim().parse().map(Value::Bool).map_err(|_| mismatch()),
            ValueType::Timestamp => parse_timestamp(raw.trim()).ok_or_else(mismatch),
            ValueType::Bytes => STANDARD
                .decode(raw.trim())
                .map(Value::Bytes)
                .map_err(|_| mismatch()),
            ValueType::Key => Key::decode(raw).map(Value::Key).map_err(|_| mismatch()),
            ValueType::Json => Err(mismatch()),
        }
    }

    /// JSON form of a stored value of this type.
    ///
    /// Under [`Naming::Field`] bytes and keys take their serde form so the
    /// result deserializes into the record type; under [`Naming::Json`] they
    /// render as base64 and encoded key strings.
    pub fn render(self, value: &Value, naming: Naming) -> JsonValue {
        match (self, value, naming) {
            (_, Value::Null, _) => JsonValue::Null,
            (ValueType::Json, Value::String(raw), _) => {
                serde_json::from_str(raw).unwrap_or_else(|_| JsonValue::String(raw.clone()))
            }
            (_, Value::Bytes(bytes), Naming::Field) => JsonValue::from(bytes.clone()),
            (_, Value::Key(key), Naming::Field) => {
                serde_json::to_value(key).unwrap_or_else(|_| JsonValue::String(key.encode()))
            }
            _ => value.to_json(),
        }
    }

    /// JSON form of this type's zero value.
    pub fn zero_json(self) -> JsonValue {
        match self {
            ValueType::String => JsonValue::String(String::new()),
            ValueType::Int => JsonValue::from(0),
            ValueType::Float => JsonValue::from(0.0),
            ValueType::Bool => JsonValue::Bool(false),
            ValueType::Timestamp | ValueType::Bytes | ValueType::Key | ValueType::Json => {
                JsonValue::Null
            }
        }
    }

    fn indexed_by_default(self) -> bool {
        !matches!(self, ValueType::Bytes | ValueType::Json)
    }
}

fn parse_timestamp(raw: &str) -> Option<Value> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| Value::Timestamp(t.with_timezone(&Utc)))
}

pub(crate) fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "Null",
        JsonValue::Bool(_) => "Bool",
        JsonValue::Number(n) if n.is_i64() || n.is_u64() => "Int",
        JsonValue::Number(_) => "Float",
        JsonValue::String(_) => "String",
        JsonValue::Array(_) => "Array",
        JsonValue::Object(_) => "Object",
    }
}

/// Null, an empty string, or an empty array.
pub(crate) fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Role a field plays in entity metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetaRole {
    Id,
    CreatedAt,
    UpdatedAt,
    CreatedBy,
    UpdatedBy,
}

impl MetaRole {
    pub const ALL: [MetaRole; 5] = [
        MetaRole::Id,
        MetaRole::CreatedAt,
        MetaRole::UpdatedAt,
        MetaRole::CreatedBy,
        MetaRole::UpdatedBy,
    ];

    /// Whether a field of `value_type` can carry this role.
    pub fn accepts(self, value_type: ValueType) -> bool {
        match self {
            MetaRole::Id => matches!(value_type, ValueType::String | ValueType::Int),
            MetaRole::CreatedAt | MetaRole::UpdatedAt => value_type == ValueType::Timestamp,
            MetaRole::CreatedBy | MetaRole::UpdatedBy => {
                matches!(value_type, ValueType::Key | ValueType::String)
            }
        }
    }
}

impl fmt::Display for MetaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaRole::Id => write!(f, "id"),
            MetaRole::CreatedAt => write!(f, "createdAt"),
            MetaRole::UpdatedAt => write!(f, "updatedAt"),
            MetaRole::CreatedBy => write!(f, "createdBy"),
            MetaRole::UpdatedBy => write!(f, "updatedBy"),
        }
    }
}

impl FromStr for MetaRole {
    type Err = Error;

    /// Parse a meta tag, ignoring case.
    fn from_str(s: &str) -> Result<Self> {
        MetaRole::ALL
            .into_iter()
            .find(|role| role.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::InvalidSchema(format!("unknown meta role '{s}'")))
    }
}

/// Declared shape of a field.
#[derive(Debug, Clone)]
pub enum Shape {
    Scalar(ValueType),
    List(ValueType),
    Nested(Vec<Field>),
    NestedList(Vec<Field>),
}

/// A field declaration.
#[derive(Debug, Clone)]
pub struct Field {
    pub(crate) name: String,
    pub(crate) shape: Shape,
    pub(crate) storage_name: Option<String>,
    pub(crate) stored: bool,
    pub(crate) json_name: Option<String>,
    pub(crate) output: bool,
    pub(crate) meta_role: Option<MetaRole>,
    pub(crate) label: Option<String>,
    pub(crate) required: bool,
    pub(crate) indexed: Option<bool>,
    pub(crate) read_only: bool,
}

impl Field {
    /// Declare a field with an explicit shape.
    pub fn new(name: impl Into<String>, shape: Shape) -> Self {
        Self {
            name: name.into(),
            shape,
            storage_name: None,
            stored: true,
            json_name: None,
            output: true,
            meta_role: None,
            label: None,
            required: false,
            indexed: None,
            read_only: false,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, Shape::Scalar(ValueType::String))
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, Shape::Scalar(ValueType::Int))
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, Shape::Scalar(ValueType::Float))
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, Shape::Scalar(ValueType::Bool))
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, Shape::Scalar(ValueType::Timestamp))
    }

    pub fn bytes(name: impl Into<String>) -> Self {
        Self::new(name, Shape::Scalar(ValueType::Bytes))
    }

    pub fn key(name: impl Into<String>) -> Self {
        Self::new(name, Shape::Scalar(ValueType::Key))
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, Shape::Scalar(ValueType::Json))
    }

    /// A repeated scalar field.
    pub fn list(name: impl Into<String>, value_type: ValueType) -> Self {
        Self::new(name, Shape::List(value_type))
    }

    /// A field holding another record type.
    pub fn nested<R: Record>(name: impl Into<String>) -> Self {
        Self::new(name, Shape::Nested(R::fields()))
    }

    /// A field holding a list of another record type.
    pub fn nested_list<R: Record>(name: impl Into<String>) -> Self {
        Self::new(name, Shape::NestedList(R::fields()))
    }

    /// A nested field declared inline.
    pub fn group(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self::new(name, Shape::Nested(fields))
    }

    /// A nested list field declared inline.
    pub fn group_list(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self::new(name, Shape::NestedList(fields))
    }

    /// Override the storage name.
    pub fn storage(mut self, name: impl Into<String>) -> Self {
        self.storage_name = Some(name.into());
        self
    }

    /// Exclude the field from persistence.
    pub fn no_storage(mut self) -> Self {
        self.stored = false;
        self
    }

    /// Override the name used in generic input and output.
    pub fn json_name(mut self, name: impl Into<String>) -> Self {
        self.json_name = Some(name.into());
        self
    }

    /// Exclude the field from generic input and output.
    pub fn no_json(mut self) -> Self {
        self.output = false;
        self
    }

    /// Mark the field as holding an entity meta value.
    pub fn meta(mut self, role: MetaRole) -> Self {
        self.meta_role = Some(role);
        self
    }

    /// Human-readable label, kept for callers that render forms.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Reject blank input for the field, and reject saving an entity that
    /// has no value for it.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Store the field's properties unindexed, so queries cannot filter or
    /// order on it.
    pub fn no_index(mut self) -> Self {
        self.indexed = Some(false);
        self
    }

    /// Ignore the field in generic input and reject it in patches.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Resolved type of a field.
#[derive(Debug, Clone)]
pub enum FieldType {
    Value(ValueType),
    Nested(Arc<Kind>),
}

/// Which name keys a JSON object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Naming {
    /// Field names; the record type's own serialized form
    Field,
    /// JSON names; generic input and caller-facing output
    Json,
}

impl Naming {
    /// Key for `field` under this naming, or `None` if the field is hidden.
    pub fn key(self, field: &FieldDescriptor) -> Option<&str> {
        match self {
            Naming::Field => Some(&field.name),
            Naming::Json => field.json_name.as_deref(),
        }
    }
}

/// A field of a [`Kind`], resolved from its declaration.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    /// Field name in the record type
    pub name: String,
    /// Flat key used in the store
    pub storage_name: String,
    /// Name in generic input and output; `None` when hidden
    pub json_name: Option<String>,
    /// Display label
    pub label: String,
    pub required: bool,
    /// Whether the field holds repeated values
    pub multiple: bool,
    pub indexed: bool,
    /// Whether the field is written to the store at all
    pub stored: bool,
    pub read_only: bool,
    pub field_type: FieldType,
    pub meta_role: Option<MetaRole>,
}

impl FieldDescriptor {
    pub(crate) fn resolve(field: &Field, field_type: FieldType, kind_indexed: bool) -> Self {
        let multiple = matches!(field.shape, Shape::List(_) | Shape::NestedList(_));
        let type_indexed = match &field_type {
            FieldType::Value(value_type) => value_type.indexed_by_default(),
            FieldType::Nested(_) => true,
        };
        Self {
            name: field.name.clone(),
            storage_name: field
                .storage_name
                .clone()
                .unwrap_or_else(|| field.name.clone()),
            json_name: field
                .output
                .then(|| field.json_name.clone().unwrap_or_else(|| field.name.clone())),
            label: field.label.clone().unwrap_or_else(|| field.name.clone()),
            required: field.required,
            multiple,
            indexed: kind_indexed && field.indexed.unwrap_or(type_indexed),
            stored: field.stored,
            read_only: field.read_only,
            field_type,
            meta_role: field.meta_role,
        }
    }

    /// Whether the field is written as its own properties.
    ///
    /// Meta fields are derived from the key and the meta properties instead.
    pub fn is_persisted(&self) -> bool {
        self.stored && self.meta_role.is_none()
    }

    /// Whether input and patches may assign the field.
    pub fn is_settable(&self) -> bool {
        !self.read_only && self.meta_role.is_none()
    }

    /// Kind of a nested group field.
    pub fn nested_kind(&self) -> Option<&Arc<Kind>> {
        match &self.field_type {
            FieldType::Nested(kind) => Some(kind),
            FieldType::Value(_) => None,
        }
    }

    /// Scalar type of a value or list field; `None` for nested groups.
    pub fn value_type(&self) -> Option<ValueType> {
        match &self.field_type {
            FieldType::Value(value_type) => Some(*value_type),
            FieldType::Nested(_) => None,
        }
    }

    /// Human-readable shape, used in error messages.
    pub fn shape_name(&self) -> String {
        let element = match &self.field_type {
            FieldType::Value(value_type) => value_type.to_string(),
            FieldType::Nested(kind) => kind.name().to_string(),
        };
        if self.multiple {
            format!("List<{element}>")
        } else {
            element
        }
    }

    /// Convert a JSON value into this field's property tree.
    pub fn to_tree(&self, value: &JsonValue) -> Result<PropertyTree> {
        self.tree_at(&self.name, value)
    }

    /// Convert a JSON value into one element of this list field.
    pub fn element_to_tree(&self, value: &JsonValue) -> Result<PropertyTree> {
        self.element_at(&self.name, value)
    }

    fn tree_at(&self, path: &str, value: &JsonValue) -> Result<PropertyTree> {
        if !self.multiple {
            return self.element_at(path, value);
        }
        match value {
            JsonValue::Null => Ok(PropertyTree::List(Vec::new())),
            JsonValue::Array(items) => items
                .iter()
                .map(|item| self.element_at(path, item))
                .collect::<Result<Vec<_>>>()
                .map(PropertyTree::List),
            other => Err(Error::type_invalid(
                path,
                self.shape_name(),
                json_type_name(other),
            )),
        }
    }

    fn element_at(&self, path: &str, value: &JsonValue) -> Result<PropertyTree> {
        match &self.field_type {
            FieldType::Value(value_type) => value_type.coerce(path, value).map(PropertyTree::Scalar),
            FieldType::Nested(kind) => {
                let object = match value {
                    JsonValue::Null => None,
                    JsonValue::Object(map) => Some(map),
                    other => {
                        return Err(Error::type_invalid(
                            path,
                            kind.name(),
                            json_type_name(other),
                        ))
                    }
                };
                let mut children = BTreeMap::new();
                for child in kind.persisted_fields() {
                    let child_path = join_name(path, &child.name);
                    let raw = object
                        .and_then(|map| lookup(map, child))
                        .unwrap_or(&JsonValue::Null);
                    if child.required && object.is_some() && is_blank(raw) {
                        return Err(Error::FieldRequired(child_path));
                    }
                    children.insert(
                        child.storage_name.clone(),
                        child.tree_at(&child_path, raw)?,
                    );
                }
                Ok(PropertyTree::Nested(children))
            }
        }
    }

    /// Validate a JSON value against this field, or one of its elements,
    /// and return it in field-name form.
    pub fn normalize(&self, value: &JsonValue, element: bool) -> Result<JsonValue> {
        if element {
            let tree = self.element_to_tree(value)?;
            Ok(self.element_to_json(&tree, Naming::Field))
        } else {
            let tree = self.to_tree(value)?;
            Ok(self.tree_to_json(&tree, Naming::Field))
        }
    }

    /// Convert a property tree back into JSON.
    pub fn tree_to_json(&self, tree: &PropertyTree, naming: Naming) -> JsonValue {
        if self.multiple {
            let items: &[PropertyTree] = match tree {
                PropertyTree::List(items) => items,
                PropertyTree::Scalar(Value::Null) => &[],
                other => std::slice::from_ref(other),
            };
            return JsonValue::Array(
                items
                    .iter()
                    .map(|item| self.element_to_json(item, naming))
                    .collect(),
            );
        }
        match tree {
            PropertyTree::List(items) => items
                .first()
                .map(|item| self.element_to_json(item, naming))
                .unwrap_or_else(|| self.element_zero(naming)),
            other => self.element_to_json(other, naming),
        }
    }

    fn element_to_json(&self, tree: &PropertyTree, naming: Naming) -> JsonValue {
        match &self.field_type {
            FieldType::Value(value_type) => match tree {
                PropertyTree::Scalar(Value::Null) => value_type.zero_json(),
                PropertyTree::Scalar(value) => value_type.render(value, naming),
                _ => value_type.zero_json(),
            },
            FieldType::Nested(kind) => {
                let children = match tree {
                    PropertyTree::Nested(children) => Some(children),
                    _ => None,
                };
                let mut map = Map::new();
                for child in kind.fields() {
                    let Some(key) = naming.key(child) else {
                        continue;
                    };
                    let value = children
                        .filter(|_| child.is_persisted())
                        .and_then(|c| c.get(&child.storage_name))
                        .map(|t| child.tree_to_json(t, naming))
                        .unwrap_or_else(|| child.zero_json(naming));
                    map.insert(key.to_string(), value);
                }
                JsonValue::Object(map)
            }
        }
    }

    /// JSON form of this field's zero value.
    pub fn zero_json(&self, naming: Naming) -> JsonValue {
        if self.multiple {
            JsonValue::Array(Vec::new())
        } else {
            self.element_zero(naming)
        }
    }

    /// JSON form of the zero value of one element.
    pub fn element_zero(&self, naming: Naming) -> JsonValue {
        match &self.field_type {
            FieldType::Value(value_type) => value_type.zero_json(),
            FieldType::Nested(kind) => {
                let map = kind
                    .fields()
                    .iter()
                    .filter_map(|child| {
                        naming
                            .key(child)
                            .map(|key| (key.to_string(), child.zero_json(naming)))
                    })
                    .collect();
                JsonValue::Object(map)
            }
        }
    }

    /// Append this field's properties, named under `prefix`.
    pub(crate) fn flatten(
        &self,
        prefix: &str,
        tree: &PropertyTree,
        in_list: bool,
        out: &mut Vec<Property>,
    ) {
        let name = join_name(prefix, &self.storage_name);
        if !self.multiple {
            self.flatten_element(&name, tree, in_list, out);
            return;
        }
        let items: &[PropertyTree] = match tree {
            PropertyTree::List(items) => items,
            PropertyTree::Scalar(Value::Null) => &[],
            other => std::slice::from_ref(other),
        };
        for item in items {
            self.flatten_element(&name, item, true, out);
        }
    }

    fn flatten_element(
        &self,
        name: &str,
        tree: &PropertyTree,
        multiple: bool,
        out: &mut Vec<Property>,
    ) {
        match &self.field_type {
            FieldType::Value(_) => {
                let value = match tree {
                    PropertyTree::Scalar(value) => value.clone(),
                    _ => Value::Null,
                };
                out.push(
                    Property::new(name, value)
                        .multiple(multiple)
                        .no_index(!self.indexed),
                );
            }
            FieldType::Nested(kind) => {
                let null = PropertyTree::null();
                for child in kind.persisted_fields() {
                    let child_tree = match tree {
                        PropertyTree::Nested(children) => {
                            children.get(&child.storage_name).unwrap_or(&null)
                        }
                        _ => &null,
                    };
                    child.flatten(name, child_tree, multiple, out);
                }
            }
        }
    }

    /// Rebuild this field's tree from the stored properties named `name`
    /// or nested below it. Returns `None` when nothing was stored.
    pub(crate) fn unflatten(&self, name: &str, props: &[&Property]) -> Option<PropertyTree> {
        match (&self.field_type, self.multiple) {
            (FieldType::Value(_), false) => props
                .iter()
                .find(|p| p.name == name)
                .map(|p| PropertyTree::Scalar(p.value.clone())),
            (FieldType::Value(_), true) => {
                let items = scalar_column(name, props);
                (!items.is_empty()).then_some(PropertyTree::List(items))
            }
            (FieldType::Nested(kind), false) => {
                let children: BTreeMap<_, _> = kind
                    .persisted_fields()
                    .filter_map(|child| {
                        child
                            .unflatten(&join_name(name, &child.storage_name), props)
                            .map(|tree| (child.storage_name.clone(), tree))
                    })
                    .collect();
                (!children.is_empty()).then_some(PropertyTree::Nested(children))
            }
            (FieldType::Nested(kind), true) => {
                let items = nested_column(kind, name, props);
                (!items.is_empty()).then_some(PropertyTree::List(items))
            }
        }
    }

    /// Per-element trees of a field that sits inside a nested list.
    fn column(&self, name: &str, props: &[&Property]) -> Vec<PropertyTree> {
        match &self.field_type {
            FieldType::Value(_) => scalar_column(name, props),
            FieldType::Nested(kind) => nested_column(kind, name, props),
        }
    }
}

fn lookup<'a>(map: &'a Map<String, JsonValue>, field: &FieldDescriptor) -> Option<&'a JsonValue> {
    map.get(&field.name)
        .or_else(|| field.json_name.as_ref().and_then(|json| map.get(json)))
}

fn scalar_column(name: &str, props: &[&Property]) -> Vec<PropertyTree> {
    props
        .iter()
        .filter(|p| p.name == name)
        .map(|p| PropertyTree::Scalar(p.value.clone()))
        .collect()
}

/// Zip the children's columns back into one nested group per element.
fn nested_column(kind: &Kind, name: &str, props: &[&Property]) -> Vec<PropertyTree> {
    let columns: Vec<(String, Vec<PropertyTree>)> = kind
        .persisted_fields()
        .map(|child| {
            let column = child.column(&join_name(name, &child.storage_name), props);
            (child.storage_name.clone(), column)
        })
        .collect();
    let len = columns.iter().map(|(_, c)| c.len()).max().unwrap_or(0);
    (0..len)
        .map(|i| {
            PropertyTree::Nested(
                columns
                    .iter()
                    .filter_map(|(storage, column)| {
                        column.get(i).map(|tree| (storage.clone(), tree.clone()))
                    })
                    .collect(),
            )
        })
        .collect()
}
