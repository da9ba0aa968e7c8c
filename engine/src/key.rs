//! Entity keys.
//!
//! A key is an immutable path of `(kind, id)` elements. The last element
//! identifies the entity itself; the elements before it form the ancestor
//! chain. Only the last element may be incomplete, and an incomplete key is
//! only meaningful as input to a create.

use crate::{error::Result, Error};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::form_urlencoded::byte_serialize;

/// Identifier part of a key element.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyId {
    /// No identifier yet; the datastore assigns one on write.
    Incomplete,
    /// Store-generated numeric identifier.
    Id(i64),
    /// Caller-supplied name.
    Name(String),
}

/// One `(kind, id)` element of a key path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PathElement {
    pub kind: String,
    pub id: KeyId,
}

/// Key of a stored entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<PathElement>", into = "Vec<PathElement>")]
pub struct Key {
    path: Vec<PathElement>,
}

impl Key {
    /// Create an incomplete root key.
    pub fn incomplete(kind: impl Into<String>) -> Self {
        Self::root(kind, KeyId::Incomplete)
    }

    /// Create a named root key.
    pub fn named(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::root(kind, KeyId::Name(name.into()))
    }

    /// Create a root key with a numeric id.
    pub fn with_int_id(kind: impl Into<String>, id: i64) -> Self {
        Self::root(kind, KeyId::Id(id))
    }

    fn root(kind: impl Into<String>, id: KeyId) -> Self {
        Self {
            path: vec![PathElement {
                kind: kind.into(),
                id,
            }],
        }
    }

    /// Create a key scoped under this key.
    ///
    /// Fails if this key is incomplete: an entity cannot have an unsaved parent.
    pub fn child(&self, kind: impl Into<String>, id: KeyId) -> Result<Key> {
        if !self.is_complete() {
            return Err(Error::IncompleteKey(self.to_string()));
        }
        let mut path = self.path.clone();
        path.push(PathElement {
            kind: kind.into(),
            id,
        });
        Ok(Key { path })
    }

    /// Create a key of `kind` with `id`, optionally scoped under `parent`.
    pub fn new(kind: impl Into<String>, id: KeyId, parent: Option<&Key>) -> Result<Key> {
        match parent {
            Some(parent) => parent.child(kind, id),
            None => Ok(Self::root(kind, id)),
        }
    }

    fn last(&self) -> &PathElement {
        // A key path always has at least one element.
        &self.path[self.path.len() - 1]
    }

    /// Kind of the entity this key identifies.
    pub fn kind(&self) -> &str {
        &self.last().kind
    }

    /// Identifier of the entity this key identifies.
    pub fn id(&self) -> &KeyId {
        &self.last().id
    }

    /// Caller-supplied name, if this is a named key.
    pub fn name(&self) -> Option<&str> {
        match self.id() {
            KeyId::Name(name) => Some(name),
            _ => None,
        }
    }

    /// Store-generated id, if this is a numeric key.
    pub fn int_id(&self) -> Option<i64> {
        match self.id() {
            KeyId::Id(id) => Some(*id),
            _ => None,
        }
    }

    /// Whether the key carries an identifier.
    pub fn is_complete(&self) -> bool {
        !matches!(self.id(), KeyId::Incomplete)
    }

    /// The full path, root first.
    pub fn path(&self) -> &[PathElement] {
        &self.path
    }

    /// Parent key, if any.
    pub fn parent(&self) -> Option<Key> {
        if self.path.len() < 2 {
            return None;
        }
        Some(Key {
            path: self.path[..self.path.len() - 1].to_vec(),
        })
    }

    /// Whether `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &Key) -> bool {
        other.path.len() > self.path.len() && other.path.starts_with(&self.path)
    }

    /// Complete an incomplete key with a store-generated id.
    pub fn with_allocated_id(&self, id: i64) -> Key {
        let mut path = self.path.clone();
        let last = path.len() - 1;
        path[last].id = KeyId::Id(id);
        Key { path }
    }

    /// Encode the key as an opaque URL-safe string.
    pub fn encode(&self) -> String {
        // Serializing a Vec of plain structs cannot fail.
        let bytes = serde_json::to_vec(&self.path).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Decode a key produced by [`Key::encode`].
    pub fn decode(encoded: &str) -> Result<Key> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| Error::InvalidKey(format!("{encoded}: {e}")))?;
        let path: Vec<PathElement> = serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidKey(format!("{encoded}: {e}")))?;
        Self::from_path(path)
    }

    /// Build a key from a raw path, validating its shape.
    pub fn from_path(path: Vec<PathElement>) -> Result<Key> {
        if path.is_empty() {
            return Err(Error::InvalidKey("empty key path".into()));
        }
        let ancestors = &path[..path.len() - 1];
        if ancestors.iter().any(|e| e.id == KeyId::Incomplete) {
            return Err(Error::InvalidKey("incomplete ancestor in key path".into()));
        }
        if path.iter().any(|e| e.kind.is_empty()) {
            return Err(Error::InvalidKey("empty kind in key path".into()));
        }
        Ok(Key { path })
    }

    /// Canonical path string.
    ///
    /// Every descendant's path string starts with its ancestor's path string
    /// followed by `/`, which lets backends answer ancestor queries with a
    /// prefix match.
    pub fn to_path_string(&self) -> String {
        let mut out = String::new();
        for element in &self.path {
            out.push('/');
            out.extend(byte_serialize(element.kind.as_bytes()));
            out.push(',');
            match &element.id {
                KeyId::Incomplete => out.push('?'),
                KeyId::Id(id) => out.push_str(&id.to_string()),
                KeyId::Name(name) => {
                    out.push('\'');
                    out.extend(byte_serialize(name.as_bytes()));
                    out.push('\'');
                }
            }
        }
        out
    }
}

impl TryFrom<Vec<PathElement>> for Key {
    type Error = Error;

    fn try_from(path: Vec<PathElement>) -> Result<Self> {
        Key::from_path(path)
    }
}

impl From<Key> for Vec<PathElement> {
    fn from(key: Key) -> Self {
        key.path
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_path_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_and_numeric_keys() {
        let key = Key::named("Article", "hello");
        assert_eq!(key.kind(), "Article");
        assert_eq!(key.name(), Some("hello"));
        assert!(key.is_complete());
        assert!(key.parent().is_none());

        let key = Key::with_int_id("Article", 42);
        assert_eq!(key.int_id(), Some(42));
        assert_eq!(key.to_string(), "/Article,42");
    }

    #[test]
    fn incomplete_key_cannot_be_parent() {
        let parent = Key::incomplete("Blog");
        let result = parent.child("Article", KeyId::Name("a".into()));
        assert!(matches!(result, Err(Error::IncompleteKey(_))));
    }

    #[test]
    fn ancestor_chain() {
        let blog = Key::named("Blog", "tech");
        let article = blog.child("Article", KeyId::Id(7)).unwrap();
        let comment = article.child("Comment", KeyId::Name("c1".into())).unwrap();

        assert_eq!(comment.parent(), Some(article.clone()));
        assert!(blog.is_ancestor_of(&comment));
        assert!(article.is_ancestor_of(&comment));
        assert!(!comment.is_ancestor_of(&comment));
        assert!(!comment.is_ancestor_of(&blog));
        assert_eq!(comment.to_string(), "/Blog,'tech'/Article,7/Comment,'c1'");
    }

    #[test]
    fn path_string_escapes_separators() {
        let key = Key::named("Article", "a/b,c'd");
        let path = key.to_path_string();
        assert_eq!(path.matches('/').count(), 1);
        assert_eq!(path.matches(',').count(), 1);
    }

    #[test]
    fn encode_decode() {
        let key = Key::named("Blog", "tech")
            .child("Article", KeyId::Id(3))
            .unwrap();
        let encoded = key.encode();
        assert!(!encoded.contains('='));
        assert_eq!(Key::decode(&encoded).unwrap(), key);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(Key::decode("%%%"), Err(Error::InvalidKey(_))));
        let empty = URL_SAFE_NO_PAD.encode(b"[]");
        assert!(matches!(Key::decode(&empty), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn allocate_id() {
        let parent = Key::named("Blog", "tech");
        let key = parent.child("Article", KeyId::Incomplete).unwrap();
        assert!(!key.is_complete());
        let done = key.with_allocated_id(9);
        assert_eq!(done.int_id(), Some(9));
        assert_eq!(done.parent(), Some(parent));
    }
}
