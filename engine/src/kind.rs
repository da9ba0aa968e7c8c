//! Kinds: the schema of one entity type, and the registry that caches them.
//!
//! A [`Kind`] is built once per record type from its [`Field`] declarations
//! and never changes afterwards, so it is shared as `Arc<Kind>` across any
//! number of concurrent operations.

use crate::field::{Field, FieldDescriptor, FieldType, MetaRole, Naming, Shape};
use crate::property::{META_ROOT, SEPARATOR};
use crate::{error::Result, Error, Holder};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// A record type that can be stored as an entity.
///
/// The serialized form of a record must be a JSON object keyed by field
/// name. `fields` declares, in order, how each member is stored.
///
/// ```ignore
/// #[derive(Debug, Default, Serialize, Deserialize)]
/// struct Article {
///     title: String,
///     tags: Vec<String>,
/// }
///
/// impl Record for Article {
///     fn fields() -> Vec<Field> {
///         vec![
///             Field::string("title").required(),
///             Field::list("tags", ValueType::String),
///         ]
///     }
/// }
/// ```
pub trait Record: Serialize + DeserializeOwned + Default + Send + Sync + 'static {
    /// Kind name; defaults to the type's name without its module path.
    fn kind_name() -> String {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full).to_string()
    }

    /// Field declarations in declaration order.
    fn fields() -> Vec<Field>;
}

/// Lifecycle hooks run by the engine around writes.
///
/// Returning an error aborts the operation. The after-hooks run once the
/// entity is written but, for transactional writes, before the commit.
pub trait Hooks: Send + Sync {
    fn on_before_create(&self, _holder: &mut Holder) -> Result<()> {
        Ok(())
    }

    fn on_after_create(&self, _holder: &Holder) -> Result<()> {
        Ok(())
    }

    fn on_before_update(&self, _holder: &mut Holder) -> Result<()> {
        Ok(())
    }

    fn on_after_update(&self, _holder: &Holder) -> Result<()> {
        Ok(())
    }
}

/// Options applied when building a kind.
#[derive(Clone)]
pub struct KindOptions {
    /// Overrides the record type's kind name
    pub name: Option<String>,
    /// When false, no field of the kind is indexed
    pub indexed: bool,
    /// Marks the kind for an external search indexer
    pub searchable: bool,
    /// Sharded counter kept equal to the number of entities of this kind
    pub counter: Option<String>,
    pub hooks: Option<Arc<dyn Hooks>>,
}

impl Default for KindOptions {
    fn default() -> Self {
        Self {
            name: None,
            indexed: true,
            searchable: false,
            counter: None,
            hooks: None,
        }
    }
}

impl fmt::Debug for KindOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindOptions")
            .field("name", &self.name)
            .field("indexed", &self.indexed)
            .field("searchable", &self.searchable)
            .field("counter", &self.counter)
            .field("hooks", &self.hooks.is_some())
            .finish()
    }
}

impl KindOptions {
    /// Options that register the kind under `name` instead of the type name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Keep an entity count in the sharded counter `name`, updated in the
    /// same transaction as each create and delete.
    pub fn counter(mut self, name: impl Into<String>) -> Self {
        self.counter = Some(name.into());
        self
    }

    /// Attach lifecycle hooks.
    pub fn hooks(mut self, hooks: impl Hooks + 'static) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }

    /// Store every field unindexed.
    pub fn unindexed(mut self) -> Self {
        self.indexed = false;
        self
    }

    pub fn searchable(mut self) -> Self {
        self.searchable = true;
        self
    }
}

type DecodeFn = fn(&[u8]) -> Result<Map<String, JsonValue>>;

/// Schema of one entity type.
#[derive(Debug)]
pub struct Kind {
    name: String,
    type_id: Option<TypeId>,
    fields: Vec<FieldDescriptor>,
    by_name: HashMap<String, usize>,
    by_storage: HashMap<String, usize>,
    by_json: HashMap<String, usize>,
    meta: BTreeMap<MetaRole, usize>,
    template: Map<String, JsonValue>,
    decode: DecodeFn,
    options: KindOptions,
}

impl Kind {
    /// Build the kind of record type `T`.
    pub fn new<T: Record>(options: KindOptions) -> Result<Kind> {
        let name = options.name.clone().unwrap_or_else(T::kind_name);
        let template = match serde_json::to_value(T::default()) {
            Ok(JsonValue::Object(map)) => map,
            Ok(other) => {
                return Err(Error::InvalidSchema(format!(
                    "{name}: record must serialize to a map, got {}",
                    crate::field::json_type_name(&other)
                )))
            }
            Err(e) => return Err(Error::InvalidSchema(format!("{name}: {e}"))),
        };
        let mut kind = Self::build(name, T::fields(), options, true)?;
        kind.type_id = Some(TypeId::of::<T>());
        kind.decode = decode_record::<T>;
        for (name, value) in template {
            kind.template.insert(name, value);
        }
        Ok(kind)
    }

    /// Build a kind with no backing record type.
    pub fn dynamic(name: impl Into<String>, fields: Vec<Field>, options: KindOptions) -> Result<Kind> {
        let name = options.name.clone().unwrap_or_else(|| name.into());
        Self::build(name, fields, options, true)
    }

    fn build(name: String, declared: Vec<Field>, options: KindOptions, top_level: bool) -> Result<Kind> {
        let invalid = |msg: String| Error::InvalidSchema(format!("{name}: {msg}"));
        if name.is_empty() {
            return Err(Error::InvalidSchema("kind name is empty".into()));
        }
        if declared.is_empty() {
            return Err(invalid("no fields declared".into()));
        }

        let mut kind = Kind {
            name: name.clone(),
            type_id: None,
            fields: Vec::with_capacity(declared.len()),
            by_name: HashMap::new(),
            by_storage: HashMap::new(),
            by_json: HashMap::new(),
            meta: BTreeMap::new(),
            template: Map::new(),
            decode: decode_dynamic,
            options: KindOptions::default(),
        };

        for field in &declared {
            check_name(&field.name).map_err(|msg| invalid(format!("field '{}' {msg}", field.name)))?;
            if let Some(storage) = &field.storage_name {
                check_name(storage)
                    .map_err(|msg| invalid(format!("storage name '{storage}' {msg}")))?;
            }

            let field_type = match &field.shape {
                Shape::Scalar(value_type) | Shape::List(value_type) => FieldType::Value(*value_type),
                Shape::Nested(children) | Shape::NestedList(children) => {
                    let child_options = KindOptions {
                        indexed: options.indexed,
                        ..KindOptions::default()
                    };
                    let nested = Self::build(
                        format!("{name}{SEPARATOR}{}", field.name),
                        children.clone(),
                        child_options,
                        false,
                    )?;
                    if matches!(field.shape, Shape::NestedList(_)) && nested.contains_list() {
                        return Err(invalid(format!(
                            "nested list '{}' cannot contain lists",
                            field.name
                        )));
                    }
                    FieldType::Nested(Arc::new(nested))
                }
            };

            if let Some(role) = field.meta_role {
                if !top_level {
                    return Err(invalid(format!(
                        "meta field '{}' must be declared at the top level",
                        field.name
                    )));
                }
                match &field.shape {
                    Shape::Scalar(value_type) if role.accepts(*value_type) => {}
                    _ => {
                        return Err(invalid(format!(
                            "field '{}' cannot hold meta role {role}",
                            field.name
                        )))
                    }
                }
                if kind.meta.contains_key(&role) {
                    return Err(invalid(format!("duplicate meta role {role}")));
                }
                kind.meta.insert(role, kind.fields.len());
            }

            let descriptor = FieldDescriptor::resolve(field, field_type, options.indexed);
            let index = kind.fields.len();

            if top_level && descriptor.storage_name == META_ROOT && descriptor.is_persisted() {
                return Err(invalid(format!("storage name '{META_ROOT}' is reserved")));
            }
            if kind.by_name.insert(descriptor.name.clone(), index).is_some() {
                return Err(invalid(format!("duplicate field '{}'", descriptor.name)));
            }
            if descriptor.is_persisted()
                && kind
                    .by_storage
                    .insert(descriptor.storage_name.clone(), index)
                    .is_some()
            {
                return Err(invalid(format!(
                    "duplicate storage name '{}'",
                    descriptor.storage_name
                )));
            }
            if let Some(json) = &descriptor.json_name {
                if top_level && json == "id" && descriptor.meta_role != Some(MetaRole::Id) {
                    return Err(invalid("json name 'id' is reserved for the key".into()));
                }
                if kind.by_json.insert(json.clone(), index).is_some() {
                    return Err(invalid(format!("duplicate json name '{json}'")));
                }
            }
            kind.fields.push(descriptor);
        }

        kind.template = kind
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.zero_json(Naming::Field)))
            .collect();
        kind.options = options;
        Ok(kind)
    }

    fn contains_list(&self) -> bool {
        self.fields.iter().any(|f| {
            f.multiple || f.nested_kind().map(|k| k.contains_list()).unwrap_or(false)
        })
    }

    /// Registered kind name. Nested kinds are named `Parent.field`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type identity of the backing record, if any.
    pub fn type_id(&self) -> Option<TypeId> {
        self.type_id
    }

    /// All fields in declaration order.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Fields written as their own properties, in declaration order.
    pub fn persisted_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.is_persisted())
    }

    /// Look up a field by its field name.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.by_name.get(name).map(|&i| &self.fields[i])
    }

    /// Look up a field by the name its properties are stored under.
    pub fn field_by_storage(&self, storage_name: &str) -> Option<&FieldDescriptor> {
        self.by_storage.get(storage_name).map(|&i| &self.fields[i])
    }

    /// Look up a field by its JSON name.
    pub fn field_by_json(&self, json_name: &str) -> Option<&FieldDescriptor> {
        self.by_json.get(json_name).map(|&i| &self.fields[i])
    }

    /// Look up a path segment: a field name first, then a JSON name.
    pub fn lookup(&self, segment: &str) -> Option<&FieldDescriptor> {
        self.field(segment).or_else(|| self.field_by_json(segment))
    }

    /// Field holding `role`, if one is declared.
    pub fn meta_field(&self, role: MetaRole) -> Option<&FieldDescriptor> {
        self.meta.get(&role).map(|&i| &self.fields[i])
    }

    /// Resolve a dotted field path to its storage path and leaf field.
    ///
    /// Each segment may be a field name or a JSON name.
    pub fn resolve_path(&self, path: &str) -> Result<(String, &FieldDescriptor)> {
        let mut segments = path.split(SEPARATOR);
        let first = segments.next().unwrap_or_default();
        let mut field = self
            .lookup(first)
            .filter(|f| f.is_persisted())
            .ok_or_else(|| Error::InvalidQuery(format!("unknown field '{path}'")))?;
        let mut storage = field.storage_name.clone();
        for segment in segments {
            let nested = field
                .nested_kind()
                .ok_or_else(|| Error::InvalidQuery(format!("'{path}' is not a nested field")))?;
            field = nested
                .lookup(segment)
                .filter(|f| f.is_persisted())
                .ok_or_else(|| Error::InvalidQuery(format!("unknown field '{path}'")))?;
            storage = crate::property::join_name(&storage, &field.storage_name);
        }
        Ok((storage, field))
    }

    /// Options the kind was built with.
    pub fn options(&self) -> &KindOptions {
        &self.options
    }

    /// Lifecycle hooks, if any were attached.
    pub fn hooks(&self) -> Option<&Arc<dyn Hooks>> {
        self.options.hooks.as_ref()
    }

    /// Name of the sharded counter tracking this kind's entity count.
    pub fn counter(&self) -> Option<&str> {
        self.options.counter.as_deref()
    }

    /// Whether the kind was marked searchable in its options.
    pub fn is_searchable(&self) -> bool {
        self.options.searchable
    }

    /// Output key under which the encoded entity key is exposed.
    pub fn id_json_name(&self) -> &str {
        self.meta_field(MetaRole::Id)
            .and_then(|f| f.json_name.as_deref())
            .unwrap_or("id")
    }

    /// A working value with every field at its zero value.
    pub(crate) fn template(&self) -> Map<String, JsonValue> {
        self.template.clone()
    }

    /// Decode raw input into a working value.
    pub(crate) fn decode(&self, raw: &[u8]) -> Result<Map<String, JsonValue>> {
        (self.decode)(raw)
    }
}

fn check_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        Err("has an empty name")
    } else if name.contains(SEPARATOR) {
        Err("must not contain '.'")
    } else {
        Ok(())
    }
}

fn decode_record<T: Record>(raw: &[u8]) -> Result<Map<String, JsonValue>> {
    let record: T = serde_json::from_slice(raw).map_err(|e| Error::Decode(e.to_string()))?;
    match serde_json::to_value(record) {
        Ok(JsonValue::Object(map)) => Ok(map),
        Ok(_) => Err(Error::Decode("record did not serialize to a map".into())),
        Err(e) => Err(Error::Decode(e.to_string())),
    }
}

fn decode_dynamic(raw: &[u8]) -> Result<Map<String, JsonValue>> {
    match serde_json::from_slice(raw) {
        Ok(JsonValue::Object(map)) => Ok(map),
        Ok(other) => Err(Error::Decode(format!(
            "expected an object, got {}",
            crate::field::json_type_name(&other)
        ))),
        Err(e) => Err(Error::Decode(e.to_string())),
    }
}

/// Cache of kinds by record type and by name.
#[derive(Debug, Default)]
pub struct Registry {
    by_type: DashMap<TypeId, Arc<Kind>>,
    by_name: DashMap<String, Arc<Kind>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and cache the kind of `T`, or return the cached one.
    ///
    /// Options only apply on first registration.
    pub fn register<T: Record>(&self, options: KindOptions) -> Result<Arc<Kind>> {
        if let Some(kind) = self.by_type.get(&TypeId::of::<T>()) {
            return Ok(kind.clone());
        }
        let kind = Arc::new(Kind::new::<T>(options)?);
        self.insert(kind)
    }

    /// Build and cache a kind with no backing record type.
    pub fn register_dynamic(
        &self,
        name: impl Into<String>,
        fields: Vec<Field>,
        options: KindOptions,
    ) -> Result<Arc<Kind>> {
        let kind = Arc::new(Kind::dynamic(name, fields, options)?);
        self.insert(kind)
    }

    fn insert(&self, kind: Arc<Kind>) -> Result<Arc<Kind>> {
        match self.by_name.entry(kind.name().to_string()) {
            Entry::Occupied(existing) => {
                if kind.type_id().is_some() && existing.get().type_id() == kind.type_id() {
                    return Ok(existing.get().clone());
                }
                return Err(Error::InvalidSchema(format!(
                    "kind name '{}' is already registered",
                    kind.name()
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(kind.clone());
            }
        }
        if let Some(type_id) = kind.type_id() {
            self.by_type.insert(type_id, kind.clone());
        }
        tracing::debug!(kind = %kind.name(), fields = kind.fields().len(), "registered kind");
        Ok(kind)
    }

    /// Kind of `T`, registering it with default options when missing.
    pub fn kind<T: Record>(&self) -> Result<Arc<Kind>> {
        self.register::<T>(KindOptions::default())
    }

    /// Cached kind of `T`, if registered.
    pub fn get<T: Record>(&self) -> Option<Arc<Kind>> {
        self.by_type.get(&TypeId::of::<T>()).map(|k| k.clone())
    }

    /// Cached kind registered under `name`, typed or dynamic.
    pub fn by_name(&self, name: &str) -> Option<Arc<Kind>> {
        self.by_name.get(name).map(|k| k.clone())
    }

    /// Names of all registered kinds, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
