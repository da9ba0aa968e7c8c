//! Holders: one entity instance moving between caller input and storage.
//!
//! A holder keeps three views of an entity:
//!
//! - the working value, a JSON object keyed by field name that the caller
//!   reads and writes;
//! - the prepared trees, one per supplied field, built from the latest input;
//! - the loaded trees, rebuilt from the properties last read from the store.
//!
//! [`Holder::save`] merges prepared over loaded per field, so fields the
//! caller did not supply keep their stored value.

use crate::field::{is_blank, FieldDescriptor, MetaRole, Naming, ValueType};
use crate::property::{
    Property, PropertyTree, Value, META_CREATED_AT, META_CREATED_BY, META_UPDATED_AT,
    META_UPDATED_BY,
};
use crate::{error::Result, Error, Key, KeyId, Kind};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Meta values of a stored entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Meta {
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub created_by: Option<Key>,
    pub updated_by: Option<Key>,
}

impl Meta {
    fn from_properties(props: &[Property]) -> Self {
        let mut meta = Meta::default();
        for prop in props {
            match prop.name.as_str() {
                META_CREATED_AT => meta.created_at = prop.value.as_timestamp(),
                META_UPDATED_AT => meta.updated_at = prop.value.as_timestamp(),
                META_CREATED_BY => meta.created_by = prop.value.as_key().cloned(),
                META_UPDATED_BY => meta.updated_by = prop.value.as_key().cloned(),
                _ => {}
            }
        }
        meta
    }
}

/// A single entity bound to its kind.
///
/// Not shared between tasks: each operation owns its holder.
#[derive(Debug, Clone)]
pub struct Holder {
    kind: Arc<Kind>,
    key: Option<Key>,
    parent: Option<Key>,
    actor: Option<Key>,
    pub(crate) working: Map<String, JsonValue>,
    pub(crate) supplied: BTreeSet<String>,
    prepared: HashMap<String, PropertyTree>,
    loaded: BTreeMap<String, PropertyTree>,
    has_loaded: bool,
    meta: Meta,
}

impl Holder {
    /// Create an empty holder with every field at its zero value.
    pub fn new(kind: Arc<Kind>) -> Self {
        let working = kind.template();
        Self {
            kind,
            key: None,
            parent: None,
            actor: None,
            working,
            supplied: BTreeSet::new(),
            prepared: HashMap::new(),
            loaded: BTreeMap::new(),
            has_loaded: false,
            meta: Meta::default(),
        }
    }

    /// Scope new keys under `parent`.
    pub fn with_parent(mut self, parent: Key) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Record `actor` as the creator or updater on save.
    pub fn with_actor(mut self, actor: Key) -> Self {
        self.actor = Some(actor);
        self
    }

    /// Kind this holder maps.
    pub fn kind(&self) -> &Arc<Kind> {
        &self.kind
    }

    /// Complete or assigned key, once the entity has one.
    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    /// Parent a new entity will be created under.
    pub fn parent(&self) -> Option<&Key> {
        self.parent.as_ref()
    }

    /// Key recorded as `createdBy` / `updatedBy` on save.
    pub fn actor(&self) -> Option<&Key> {
        self.actor.as_ref()
    }

    /// Replace the acting user for later saves.
    pub fn set_actor(&mut self, actor: Option<Key>) {
        self.actor = actor;
    }

    /// Meta values from the last load or save.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Whether stored properties have been loaded.
    pub fn has_loaded(&self) -> bool {
        self.has_loaded
    }

    /// Whether the latest input supplied the field.
    pub fn is_supplied(&self, field: &str) -> bool {
        self.supplied.contains(field)
    }

    /// The working value, keyed by field name.
    pub fn working(&self) -> &Map<String, JsonValue> {
        &self.working
    }

    /// Prepared tree for a storage name.
    pub fn prepared(&self, storage_name: &str) -> Option<&PropertyTree> {
        self.prepared.get(storage_name)
    }

    /// Loaded tree for a storage name.
    pub fn loaded(&self, storage_name: &str) -> Option<&PropertyTree> {
        self.loaded.get(storage_name)
    }

    /// Bind the holder to `key`.
    pub fn set_key(&mut self, key: Key) -> Result<()> {
        if key.kind() != self.kind.name() {
            return Err(Error::KindMismatch {
                expected: self.kind.name().to_string(),
                got: key.kind().to_string(),
            });
        }
        self.key = Some(key);
        self.refresh_meta_fields();
        Ok(())
    }

    /// Bind the holder to a named key under its parent.
    pub fn assign_name(&mut self, name: impl Into<String>) -> Result<()> {
        let key = Key::new(
            self.kind.name(),
            KeyId::Name(name.into()),
            self.parent.as_ref(),
        )?;
        self.set_key(key)
    }

    /// Decode raw record input and replace the working value with it.
    ///
    /// Every persisted field counts as supplied.
    pub fn parse(&mut self, raw: &[u8]) -> Result<()> {
        let decoded = self.kind.decode(raw)?;
        self.replace(decoded)
    }

    /// Replace the working value with a typed record.
    pub fn set_value<T: Serialize>(&mut self, value: &T) -> Result<()> {
        match serde_json::to_value(value) {
            Ok(JsonValue::Object(map)) => self.replace(map),
            Ok(_) => Err(Error::Decode("record did not serialize to a map".into())),
            Err(e) => Err(Error::Decode(e.to_string())),
        }
    }

    fn replace(&mut self, decoded: Map<String, JsonValue>) -> Result<()> {
        let mut working = self.kind.template();
        working.extend(decoded);
        let supplied = self
            .kind
            .persisted_fields()
            .map(|f| f.name.clone())
            .collect();
        self.stage(working, supplied)
    }

    /// Apply generic input keyed by JSON name.
    ///
    /// Only the keys present are supplied; everything else keeps its stored
    /// value on save. Unknown keys, meta fields, and read-only fields are
    /// ignored.
    pub fn parse_input(&mut self, input: &Map<String, JsonValue>) -> Result<()> {
        let mut working = self.working.clone();
        let mut supplied = self.supplied.clone();
        for (name, value) in input {
            let Some(field) = self.kind.field_by_json(name) else {
                debug!(kind = %self.kind.name(), key = %name, "ignoring unknown input key");
                continue;
            };
            if !field.is_settable() {
                debug!(kind = %self.kind.name(), field = %field.name, "ignoring input for unsettable field");
                continue;
            }
            working.insert(field.name.clone(), value.clone());
            supplied.insert(field.name.clone());
        }
        self.stage(working, supplied)
    }

    /// Decode a JSON object and apply it as generic input.
    pub fn parse_input_bytes(&mut self, raw: &[u8]) -> Result<()> {
        match serde_json::from_slice(raw) {
            Ok(JsonValue::Object(input)) => self.parse_input(&input),
            Ok(_) => Err(Error::Decode("input must be a JSON object".into())),
            Err(e) => Err(Error::Decode(e.to_string())),
        }
    }

    /// Swap in a candidate working value, keeping the old one if it does not
    /// prepare cleanly.
    pub(crate) fn stage(
        &mut self,
        working: Map<String, JsonValue>,
        supplied: BTreeSet<String>,
    ) -> Result<()> {
        let previous_working = std::mem::replace(&mut self.working, working);
        let previous_supplied = std::mem::replace(&mut self.supplied, supplied);
        if let Err(e) = self.prepare() {
            self.working = previous_working;
            self.supplied = previous_supplied;
            return Err(e);
        }
        Ok(())
    }

    /// Convert every supplied field into its property tree.
    ///
    /// Supplied values are normalized in the working value. A required field
    /// supplied as null or empty fails here; a required field that was never
    /// supplied is only checked on save, where the stored fallback is known.
    pub fn prepare(&mut self) -> Result<()> {
        let mut prepared = HashMap::new();
        let mut normalized = Vec::new();
        for name in &self.supplied {
            let Some(field) = self.kind.field(name) else {
                continue;
            };
            let raw = self.working.get(name).unwrap_or(&JsonValue::Null);
            if field.required && is_blank(raw) {
                return Err(Error::FieldRequired(field.name.clone()));
            }
            let tree = field.to_tree(raw)?;
            normalized.push((field.name.clone(), field.tree_to_json(&tree, Naming::Field)));
            if field.is_persisted() {
                prepared.insert(field.storage_name.clone(), tree);
            }
        }
        self.working.extend(normalized);
        self.prepared = prepared;
        Ok(())
    }

    /// Load stored properties.
    ///
    /// Fields the caller has not supplied are refreshed from the stored state.
    pub fn load(&mut self, props: &[Property]) {
        self.has_loaded = true;
        self.meta = Meta::from_properties(props);

        let mut groups: HashMap<&str, Vec<&Property>> = HashMap::new();
        for prop in props {
            groups.entry(prop.root()).or_default().push(prop);
        }

        self.loaded = self
            .kind
            .persisted_fields()
            .filter_map(|field| {
                let group = groups.get(field.storage_name.as_str())?;
                field
                    .unflatten(&field.storage_name, group)
                    .map(|tree| (field.storage_name.clone(), tree))
            })
            .collect();

        for field in self.kind.persisted_fields() {
            if self.supplied.contains(&field.name) {
                continue;
            }
            let value = self
                .loaded
                .get(&field.storage_name)
                .map(|tree| field.tree_to_json(tree, Naming::Field))
                .unwrap_or_else(|| field.zero_json(Naming::Field));
            self.working.insert(field.name.clone(), value);
        }
        self.refresh_meta_fields();
    }

    /// Merge prepared input over the loaded state into the properties to
    /// write, followed by the meta properties.
    ///
    /// A prepared tree with no data (null, an empty list, or an empty group)
    /// keeps the loaded tree.
    pub fn save(&mut self, now: DateTime<Utc>) -> Result<Vec<Property>> {
        let mut props = Vec::new();
        let mut merged = BTreeMap::new();
        for field in self.kind.persisted_fields() {
            let tree = match self
                .prepared
                .get(&field.storage_name)
                .filter(|tree| !tree.is_empty())
                .or_else(|| self.loaded.get(&field.storage_name))
            {
                Some(tree) => tree,
                None if field.required => return Err(Error::FieldRequired(field.name.clone())),
                None => continue,
            };
            field.flatten("", tree, false, &mut props);
            merged.insert(field.storage_name.clone(), tree.clone());
        }

        let created_at = self.meta.created_at.unwrap_or(now);
        let created_by = if self.has_loaded {
            self.meta.created_by.clone()
        } else {
            self.actor.clone()
        };
        props.push(Property::new(META_CREATED_AT, Value::Timestamp(created_at)));
        if let Some(creator) = &created_by {
            props.push(Property::new(META_CREATED_BY, Value::Key(creator.clone())));
        }
        props.push(Property::new(META_UPDATED_AT, Value::Timestamp(now)));
        if let Some(actor) = &self.actor {
            props.push(Property::new(META_UPDATED_BY, Value::Key(actor.clone())));
        }

        self.loaded = merged;
        self.meta = Meta {
            created_at: Some(created_at),
            updated_at: Some(now),
            created_by,
            updated_by: self.actor.clone(),
        };
        self.refresh_meta_fields();
        debug!(kind = %self.kind.name(), properties = props.len(), "saved holder");
        Ok(props)
    }

    /// Caller-facing object keyed by JSON name, with the encoded key as `id`.
    pub fn output(&self) -> Map<String, JsonValue> {
        let mut out = Map::new();
        for field in self.kind.fields() {
            let Some(json_name) = &field.json_name else {
                continue;
            };
            let value = match field.meta_role {
                Some(role) => self.meta_value(field, role, Naming::Json),
                None => {
                    let raw = self.working.get(&field.name).unwrap_or(&JsonValue::Null);
                    // Values that no longer fit the schema are passed through.
                    field
                        .to_tree(raw)
                        .map(|tree| field.tree_to_json(&tree, Naming::Json))
                        .unwrap_or_else(|_| raw.clone())
                }
            };
            out.insert(json_name.clone(), value);
        }
        if let Some(key) = &self.key {
            if self.kind.meta_field(MetaRole::Id).is_none() {
                out.insert("id".to_string(), JsonValue::String(key.encode()));
            }
        }
        out
    }

    /// Typed view of the working value.
    pub fn value<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(JsonValue::Object(self.working.clone()))
            .map_err(|e| Error::Decode(e.to_string()))
    }

    /// Current value of one field in the working value.
    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.working.get(field)
    }

    fn refresh_meta_fields(&mut self) {
        let values: Vec<(String, JsonValue)> = self
            .kind
            .fields()
            .iter()
            .filter_map(|field| {
                field
                    .meta_role
                    .map(|role| (field.name.clone(), self.meta_value(field, role, Naming::Field)))
            })
            .collect();
        self.working.extend(values);
    }

    fn meta_value(&self, field: &FieldDescriptor, role: MetaRole, naming: Naming) -> JsonValue {
        let render_key = |key: Option<&Key>| match key {
            None => field.zero_json(naming),
            Some(key) if field.value_type() == Some(ValueType::String) => {
                JsonValue::String(key.encode())
            }
            Some(key) => ValueType::Key.render(&Value::Key(key.clone()), naming),
        };
        let render_time = |time: Option<DateTime<Utc>>| {
            time.map(|t| ValueType::Timestamp.render(&Value::Timestamp(t), naming))
                .unwrap_or(JsonValue::Null)
        };
        match role {
            MetaRole::Id => match (&self.key, naming) {
                (None, _) => field.zero_json(naming),
                (Some(key), Naming::Json) => JsonValue::String(key.encode()),
                (Some(key), Naming::Field) => match key.id() {
                    KeyId::Name(name) => JsonValue::String(name.clone()),
                    KeyId::Id(id) if field.value_type() == Some(ValueType::Int) => {
                        JsonValue::from(*id)
                    }
                    KeyId::Id(id) => JsonValue::String(id.to_string()),
                    KeyId::Incomplete => field.zero_json(naming),
                },
            },
            MetaRole::CreatedAt => render_time(self.meta.created_at),
            MetaRole::UpdatedAt => render_time(self.meta.updated_at),
            MetaRole::CreatedBy => render_key(self.meta.created_by.as_ref()),
            MetaRole::UpdatedBy => render_key(self.meta.updated_by.as_ref()),
        }
    }
}
