//! Row mapping and SQL for the entities table.

use chrono::SecondsFormat;
use kindstore_engine::{Entity, Filter, FilterOp, Key, KeyId, Property, Query, Value};
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::Row;

/// Columns read back for every entity.
pub const ENTITY_COLUMNS: &str = "encoded_key, properties";

/// A stored entity row from the database.
#[derive(Debug)]
pub struct StoredEntity {
    pub encoded_key: String,
    pub properties: Vec<Property>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for StoredEntity {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let Json(properties) = row.try_get::<Json<Vec<Property>>, _>("properties")?;
        Ok(StoredEntity {
            encoded_key: row.try_get("encoded_key")?,
            properties,
        })
    }
}

impl StoredEntity {
    /// Convert a database row to an engine entity.
    pub fn into_entity(self) -> kindstore_engine::Result<Entity> {
        let key = Key::decode(&self.encoded_key)?;
        Ok(Entity::new(key, self.properties))
    }
}

/// Indexed values by property name, as stored in the `fields` column.
///
/// Unindexed properties are left out, so filters cannot reach them.
pub fn fields_index(properties: &[Property]) -> JsonValue {
    let mut fields: Map<String, JsonValue> = Map::new();
    for prop in properties.iter().filter(|p| !p.no_index) {
        let entry = fields
            .entry(prop.name.clone())
            .or_insert_with(|| JsonValue::Array(Vec::new()));
        if let JsonValue::Array(values) = entry {
            values.push(index_value(&prop.value));
        }
    }
    JsonValue::Object(fields)
}

/// JSON form of a value inside the `fields` index.
///
/// Numbers, strings, and booleans are stored plainly. Values that render as
/// strings are wrapped in a single-key object naming their type, so a string
/// filter never matches a key or a timestamp.
pub fn index_value(value: &Value) -> JsonValue {
    let tagged = |tag: &str, inner: JsonValue| {
        let mut map = Map::new();
        map.insert(tag.to_string(), inner);
        JsonValue::Object(map)
    };
    match value {
        Value::Bytes(_) => tagged("bytes", value.to_json()),
        Value::Timestamp(t) => tagged(
            "timestamp",
            JsonValue::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        ),
        Value::Key(_) => tagged("key", value.to_json()),
        other => other.to_json(),
    }
}

/// Byte string whose order matches [`Key`]'s ordering.
///
/// Each path element is `0x01`, the kind, then the id: `0x00` when
/// incomplete, `0x01` and the sign-flipped big-endian integer, or `0x02` and
/// the name. Strings end in `00 01` with inner zero bytes written as `00 ff`.
pub fn sort_key(key: &Key) -> Vec<u8> {
    let mut out = Vec::new();
    for element in key.path() {
        out.push(0x01);
        push_terminated(&mut out, element.kind.as_bytes());
        match &element.id {
            KeyId::Incomplete => out.push(0x00),
            KeyId::Id(id) => {
                out.push(0x01);
                out.extend_from_slice(&((*id as u64) ^ (1 << 63)).to_be_bytes());
            }
            KeyId::Name(name) => {
                out.push(0x02);
                push_terminated(&mut out, name.as_bytes());
            }
        }
    }
    out
}

fn push_terminated(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b == 0 {
            out.extend_from_slice(&[0x00, 0xff]);
        } else {
            out.push(b);
        }
    }
    out.extend_from_slice(&[0x00, 0x01]);
}

/// Integers beyond this lose precision when compared against floats.
const EXACT_INT: u64 = 1 << 53;

/// Whether `fields @>` containment decides the filter exactly.
fn is_exact_in_sql(filter: &Filter) -> bool {
    if filter.op != FilterOp::Eq {
        return false;
    }
    match &filter.value {
        Value::Bool(_) | Value::String(_) | Value::Bytes(_) | Value::Timestamp(_) | Value::Key(_) => true,
        Value::Int(i) => i.unsigned_abs() <= EXACT_INT,
        Value::Null | Value::Float(_) => false,
    }
}

/// Whether SQL alone settles the query: no orders and only exact filters.
///
/// Rows then come back in key order, already paged.
pub fn is_fully_pushed(query: &Query) -> bool {
    query.orders.is_empty() && query.filters.iter().all(is_exact_in_sql)
}

/// A query parameter bound positionally.
#[derive(Debug, Clone, PartialEq)]
pub enum Bind {
    Text(String),
    Json(JsonValue),
    Int(i64),
}

/// SQL text with its binds in order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub binds: Vec<Bind>,
}

impl SqlQuery {
    fn push(&mut self, bind: Bind) -> usize {
        self.binds.push(bind);
        self.binds.len()
    }
}

/// `<head> FROM entities WHERE ...` for the kind, ancestor, and exact filters.
fn filtered(head: &str, query: &Query) -> SqlQuery {
    let mut out = SqlQuery {
        sql: format!("{head} FROM entities WHERE kind = $1"),
        binds: vec![Bind::Text(query.kind.clone())],
    };

    if let Some(ancestor) = &query.ancestor {
        let path = ancestor.to_path_string();
        let exact = out.push(Bind::Text(path.clone()));
        let prefix = out.push(Bind::Text(format!("{}/%", escape_like(&path))));
        out.sql
            .push_str(&format!(" AND (key_path = ${exact} OR key_path LIKE ${prefix})"));
    }

    for filter in query.filters.iter().filter(|f| is_exact_in_sql(f)) {
        let mut contained = Map::new();
        contained.insert(
            filter.property.clone(),
            JsonValue::Array(vec![index_value(&filter.value)]),
        );
        let n = out.push(Bind::Json(JsonValue::Object(contained)));
        out.sql.push_str(&format!(" AND fields @> ${n}"));
    }
    out
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Rows for `query`.
///
/// When [`is_fully_pushed`] holds the result is final, limit and offset
/// included. Otherwise the rows are candidates and the caller applies the
/// full query to them.
pub fn select_sql(query: &Query) -> SqlQuery {
    let mut out = filtered(&format!("SELECT {ENTITY_COLUMNS}"), query);
    out.sql.push_str(" ORDER BY sort_key");
    if is_fully_pushed(query) {
        if let Some(limit) = query.limit {
            let n = out.push(Bind::Int(to_i64(limit)));
            out.sql.push_str(&format!(" LIMIT ${n}"));
        }
        if query.offset > 0 {
            let n = out.push(Bind::Int(to_i64(query.offset)));
            out.sql.push_str(&format!(" OFFSET ${n}"));
        }
    }
    out
}

/// `COUNT(*)` of the query's matches, ignoring limit and offset, or `None`
/// when SQL cannot decide every filter.
pub fn count_sql(query: &Query) -> Option<SqlQuery> {
    is_fully_pushed(query).then(|| filtered("SELECT COUNT(*)", query))
}

/// Escape `LIKE` wildcards with the default backslash escape.
fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindstore_engine::KeyId;
    use serde_json::json;

    #[test]
    fn fields_index_groups_values_and_skips_unindexed() {
        let owner = Key::named("User", "ann");
        let props = vec![
            Property::new("tags", Value::String("a".into())).multiple(true),
            Property::new("tags", Value::String("b".into())).multiple(true),
            Property::new("age", Value::Int(3)),
            Property::new("owner", Value::Key(owner.clone())),
            Property::new("bio", Value::String("long".into())).no_index(true),
        ];
        assert_eq!(
            fields_index(&props),
            json!({"tags": ["a", "b"], "age": [3], "owner": [{"key": owner.encode()}]})
        );
    }

    #[test]
    fn string_filters_cannot_match_tagged_values() {
        let owner = Key::named("User", "ann");
        assert_ne!(
            index_value(&Value::String(owner.encode())),
            index_value(&Value::Key(owner))
        );
        assert_eq!(index_value(&Value::Int(3)), json!(3));
    }

    #[test]
    fn partial_pushdown_leaves_paging_to_the_caller() {
        let parent = Key::named("Blog", "my_blog");
        let query = Query::new("Post")
            .ancestor(parent.clone())
            .filter("author", FilterOp::Eq, Value::String("ann".into()))
            .filter("views", FilterOp::Gt, Value::Int(10))
            .filter("draft", FilterOp::Eq, Value::Null)
            .order("views", true)
            .limit(5);
        assert!(!is_fully_pushed(&query));
        let sql = select_sql(&query);
        assert_eq!(
            sql.sql,
            "SELECT encoded_key, properties FROM entities WHERE kind = $1 \
             AND (key_path = $2 OR key_path LIKE $3) AND fields @> $4 ORDER BY sort_key"
        );
        assert_eq!(
            sql.binds,
            vec![
                Bind::Text("Post".into()),
                Bind::Text("/Blog,'my_blog'".into()),
                Bind::Text("/Blog,'my\\_blog'/%".into()),
                Bind::Json(json!({"author": ["ann"]})),
            ]
        );
        assert!(count_sql(&query).is_none());
    }

    #[test]
    fn full_pushdown_pages_and_counts_in_sql() {
        let query = Query::new("Post")
            .filter("author", FilterOp::Eq, Value::String("ann".into()))
            .limit(20)
            .offset(40);
        assert!(is_fully_pushed(&query));
        let sql = select_sql(&query);
        assert_eq!(
            sql.sql,
            "SELECT encoded_key, properties FROM entities WHERE kind = $1 \
             AND fields @> $2 ORDER BY sort_key LIMIT $3 OFFSET $4"
        );
        assert_eq!(sql.binds[2..], [Bind::Int(20), Bind::Int(40)]);

        let count = count_sql(&query.unbounded()).unwrap();
        assert_eq!(
            count.sql,
            "SELECT COUNT(*) FROM entities WHERE kind = $1 AND fields @> $2"
        );

        let huge = select_sql(&Query::new("Post").offset(usize::MAX));
        assert_eq!(huge.binds[1], Bind::Int(i64::MAX));
    }

    #[test]
    fn inexact_filters_stay_in_memory() {
        let float = Query::new("Item").filter("score", FilterOp::Eq, Value::Float(1.5));
        let big = Query::new("Item").filter("n", FilterOp::Eq, Value::Int(i64::MAX));
        assert!(!is_fully_pushed(&float));
        assert!(!is_fully_pushed(&big));
        assert!(!select_sql(&float).sql.contains("fields @>"));
    }

    #[test]
    fn sort_key_follows_key_order() {
        let blog = Key::named("Blog", "b");
        let mut keys = vec![
            Key::with_int_id("Item", 10),
            Key::with_int_id("Item", 9),
            Key::with_int_id("Item", -3),
            Key::named("Item", "a"),
            Key::named("Item", "a\0"),
            Key::named("Item", "ab"),
            Key::named("It", "z"),
            Key::named("Item\0", "a"),
            blog.clone(),
            blog.child("Post", KeyId::Id(2)).unwrap(),
            blog.child("Post", KeyId::Name("x".into())).unwrap(),
            Key::named("Blog", "a").child("Post", KeyId::Id(1)).unwrap(),
        ];
        let mut by_bytes = keys.clone();
        keys.sort();
        by_bytes.sort_by_key(sort_key);
        assert_eq!(by_bytes, keys);
    }

    #[test]
    fn stored_row_decodes_key() {
        let key = Key::named("Blog", "b").child("Post", KeyId::Id(4)).unwrap();
        let row = StoredEntity {
            encoded_key: key.encode(),
            properties: vec![Property::new("title", Value::String("t".into()))],
        };
        let entity = row.into_entity().unwrap();
        assert_eq!(entity.key, key);
        assert_eq!(entity.value("title"), Some(&Value::String("t".into())));

        let bad = StoredEntity {
            encoded_key: "***".into(),
            properties: vec![],
        };
        assert!(bad.into_entity().is_err());
    }
}
