//! Query parameters, pagination, and `Link` headers.
//!
//! Callers hand over the raw parameters of a list request:
//!
//! ```text
//! order=-createdAt&limit=20&offset=40&ancestor=<key>
//! filters[0][filterStr]=age >=&filters[0][value]=18
//! id=<key>&id=<key>
//! ```
//!
//! [`QueryParams::build`] checks them against a kind and produces a
//! datastore [`Query`]; [`Pagination`] turns the offset, limit, and total
//! into `next`/`prev`/`first`/`last` relations.

use crate::datastore::{FilterOp, Query};
use crate::{error::Result, Error, Key, Kind};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use url::form_urlencoded;

pub const DEFAULT_LIMIT: usize = 20;
pub const MAX_LIMIT: usize = 1000;

/// One `filters[N]` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterParam {
    /// `"<field> <op>"`; the op defaults to `=`
    pub filter: String,
    pub value: String,
}

/// Raw list-request parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pub order: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Encoded ancestor key
    pub ancestor: Option<String>,
    pub filters: Vec<FilterParam>,
    /// Encoded keys for a lookup by id
    pub ids: Vec<String>,
    /// Parameters this module does not interpret, kept for links
    pub extra: Vec<(String, String)>,
}

impl QueryParams {
    /// Collect parameters from decoded `(name, value)` pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut params = QueryParams::default();
        let mut filters: BTreeMap<usize, FilterParam> = BTreeMap::new();
        for (name, value) in pairs {
            let (name, value) = (name.as_ref(), value.as_ref());
            match name {
                "order" => params.order = Some(value.to_string()).filter(|v| !v.is_empty()),
                "limit" => params.limit = Some(parse_number("limit", value)?),
                "offset" => params.offset = Some(parse_number("offset", value)?),
                "ancestor" => params.ancestor = Some(value.to_string()).filter(|v| !v.is_empty()),
                "id" => params.ids.push(value.to_string()),
                _ => match parse_filter_name(name) {
                    Some((index, FilterPart::Filter)) => {
                        filters.entry(index).or_default().filter = value.to_string();
                    }
                    Some((index, FilterPart::Value)) => {
                        filters.entry(index).or_default().value = value.to_string();
                    }
                    None => params.extra.push((name.to_string(), value.to_string())),
                },
            }
        }
        params.filters = filters.into_values().collect();
        Ok(params)
    }

    /// Parse an URL query string.
    pub fn from_query_string(query: &str) -> Result<Self> {
        Self::from_pairs(form_urlencoded::parse(query.trim_start_matches('?').as_bytes()))
    }

    pub fn is_id_lookup(&self) -> bool {
        !self.ids.is_empty()
    }

    /// Effective page size.
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
    }

    pub fn offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }

    /// Reject an id lookup combined with any listing parameter, naming each.
    pub fn check_conflicts(&self) -> Result<()> {
        if self.ids.is_empty() {
            return Ok(());
        }
        let mut conflicts = Vec::new();
        for (name, present) in [
            ("order", self.order.is_some()),
            ("limit", self.limit.is_some()),
            ("offset", self.offset.is_some()),
            ("filters", !self.filters.is_empty()),
        ] {
            if present {
                conflicts.push(format!("id cannot be combined with {name}"));
            }
        }
        if conflicts.is_empty() {
            Ok(())
        } else {
            Err(Error::ConflictingParameters(conflicts))
        }
    }

    /// Decode the id list.
    pub fn keys(&self, kind: &Kind) -> Result<Vec<Key>> {
        self.ids
            .iter()
            .map(|id| {
                let key = Key::decode(id)?;
                if key.kind() != kind.name() {
                    return Err(Error::KindMismatch {
                        expected: kind.name().to_string(),
                        got: key.kind().to_string(),
                    });
                }
                Ok(key)
            })
            .collect()
    }

    /// Build the datastore query for `kind`.
    pub fn build(&self, kind: &Kind) -> Result<Query> {
        self.check_conflicts()?;
        if self.limit == Some(0) {
            return Err(Error::InvalidQuery("limit must be positive".into()));
        }
        let mut query = Query::new(kind.name())
            .limit(self.limit())
            .offset(self.offset());

        if let Some(ancestor) = &self.ancestor {
            query = query.ancestor(Key::decode(ancestor)?);
        }

        for param in &self.filters {
            let (path, op) = parse_filter(&param.filter)?;
            let (storage, field) = kind.resolve_path(path)?;
            let value_type = queryable(path, field)?;
            let value = value_type.parse_str(&field.name, &param.value)?;
            query = query.filter(storage, op, value);
        }

        if let Some(order) = &self.order {
            for part in order.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let (path, descending) = match part.strip_prefix('-') {
                    Some(path) => (path, true),
                    None => (part, false),
                };
                let (storage, field) = kind.resolve_path(path)?;
                queryable(path, field)?;
                query = query.order(storage, descending);
            }
        }
        Ok(query)
    }

    /// Pairs to repeat in pagination links, without the offset.
    fn link_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(order) = &self.order {
            pairs.push(("order".to_string(), order.clone()));
        }
        pairs.push(("limit".to_string(), self.limit().to_string()));
        if let Some(ancestor) = &self.ancestor {
            pairs.push(("ancestor".to_string(), ancestor.clone()));
        }
        for (i, filter) in self.filters.iter().enumerate() {
            pairs.push((format!("filters[{i}][filterStr]"), filter.filter.clone()));
            pairs.push((format!("filters[{i}][value]"), filter.value.clone()));
        }
        pairs.extend(self.extra.iter().cloned());
        pairs
    }
}

enum FilterPart {
    Filter,
    Value,
}

/// Recognize `filters[N][filterStr]` and `filters[N][value]`.
fn parse_filter_name(name: &str) -> Option<(usize, FilterPart)> {
    let rest = name.strip_prefix("filters[")?;
    let (index, rest) = rest.split_once(']')?;
    let index = index.parse().ok()?;
    match rest {
        "[filterStr]" => Some((index, FilterPart::Filter)),
        "[value]" => Some((index, FilterPart::Value)),
        _ => None,
    }
}

fn parse_number(name: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidQuery(format!("{name} must be a non-negative integer, got '{value}'")))
}

/// Split `"<field> <op>"`.
fn parse_filter(filter: &str) -> Result<(&str, FilterOp)> {
    let mut parts = filter.split_whitespace();
    let field = parts
        .next()
        .ok_or_else(|| Error::InvalidQuery("empty filter".into()))?;
    let op = match parts.next() {
        Some(op) => op.parse()?,
        None => FilterOp::Eq,
    };
    if parts.next().is_some() {
        return Err(Error::InvalidQuery(format!("malformed filter '{filter}'")));
    }
    Ok((field, op))
}

fn queryable(path: &str, field: &crate::FieldDescriptor) -> Result<crate::ValueType> {
    match field.value_type() {
        Some(value_type) if field.indexed && value_type != crate::ValueType::Json => Ok(value_type),
        Some(_) => Err(Error::InvalidQuery(format!("field '{path}' is not indexed"))),
        None => Err(Error::InvalidQuery(format!("field '{path}' is not a scalar"))),
    }
}

/// Offsets of the neighbouring pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Pagination {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<usize>,
}

impl Pagination {
    pub fn compute(offset: usize, limit: usize, total: usize) -> Self {
        if limit == 0 {
            return Self::default();
        }
        let end = offset.saturating_add(limit);
        let has_more = end < total;
        let last = total.saturating_sub(1) / limit * limit;
        Self {
            next: has_more.then_some(end),
            prev: (offset > 0).then(|| offset.saturating_sub(limit)),
            first: (offset > 0).then_some(0),
            last: has_more.then_some(last),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn relations(&self) -> impl Iterator<Item = (&'static str, usize)> {
        [
            ("next", self.next),
            ("prev", self.prev),
            ("first", self.first),
            ("last", self.last),
        ]
        .into_iter()
        .filter_map(|(rel, offset)| offset.map(|o| (rel, o)))
    }

    /// `Link` header value, or `None` when there is no other page.
    pub fn link_header(&self, base_url: &str, params: &QueryParams) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let base = base_url.split('?').next().unwrap_or(base_url);
        let pairs = params.link_pairs();
        let links: Vec<String> = self
            .relations()
            .map(|(rel, offset)| {
                let mut query = form_urlencoded::Serializer::new(String::new());
                for (name, value) in &pairs {
                    query.append_pair(name, value);
                }
                query.append_pair("offset", &offset.to_string());
                format!("<{base}?{}>; rel=\"{rel}\"", query.finish())
            })
            .collect();
        Some(links.join(", "))
    }
}

/// One page of entities.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    /// Caller-facing objects, as produced by `Holder::output`
    pub items: Vec<Map<String, JsonValue>>,
    /// Matching entities ignoring limit and offset
    pub total: usize,
    /// Entities on this page
    pub count: usize,
    pub pagination: Pagination,
    /// Value for a `Link` response header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}
