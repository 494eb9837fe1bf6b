//! Query matching and hit ordering.

use std::cmp::Ordering;

use quarry_types::{Query, Sort, SortOrder};
use serde_json::Value;

/// A query reduced to the forms the matcher understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Matcher {
    All,
    /// Exact scalar match on one field.
    Exact { field: String, value: String },
    /// Analyzed match on one field: exact or any whitespace token.
    Field { field: String, value: String },
    /// Field must be present.
    Exists { field: String },
    /// Analyzed match on any top-level or nested field.
    AnyField { value: String },
}

impl Matcher {
    pub(crate) fn from_query(query: &Query) -> Self {
        match query {
            Query::MatchAll => Self::All,
            Query::Term { field, value } => Self::Exact {
                field: field.clone(),
                value: value.clone(),
            },
            Query::QueryString(q) => parse_query_string(q),
        }
    }

    pub(crate) fn matches(&self, doc: &Value) -> bool {
        match self {
            Self::All => true,
            Self::Exact { field, value } => {
                lookup(doc, field).is_some_and(|v| scalar_matches(v, value, false))
            }
            Self::Field { field, value } => {
                lookup(doc, field).is_some_and(|v| scalar_matches(v, value, true))
            }
            Self::Exists { field } => lookup(doc, field).is_some_and(|v| !v.is_null()),
            Self::AnyField { value } => any_field_matches(doc, value),
        }
    }
}

/// Parses `*`, `*:*`, `field:value`, `field:*` or a bare value.
pub(crate) fn parse_query_string(q: &str) -> Matcher {
    let q = q.trim();
    if q.is_empty() || q == "*" || q == "*:*" {
        return Matcher::All;
    }
    match q.split_once(':') {
        Some((field, value)) if !field.is_empty() => {
            let value = value.trim().trim_matches('"');
            if value == "*" {
                Matcher::Exists {
                    field: field.to_string(),
                }
            } else {
                Matcher::Field {
                    field: field.to_string(),
                    value: value.to_string(),
                }
            }
        }
        _ => Matcher::AnyField {
            value: q.trim_matches('"').to_string(),
        },
    }
}

/// Resolves a dotted field path.
fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, part| current.get(part))
}

fn scalar_matches(value: &Value, expected: &str, analyzed: bool) -> bool {
    match value {
        Value::Array(items) => items.iter().any(|v| scalar_matches(v, expected, analyzed)),
        Value::String(s) => {
            s == expected
                || (analyzed
                    && s.split_whitespace()
                        .any(|token| token.eq_ignore_ascii_case(expected)))
        }
        Value::Number(n) => n.to_string() == expected,
        Value::Bool(b) => b.to_string() == expected,
        Value::Null | Value::Object(_) => false,
    }
}

fn any_field_matches(value: &Value, expected: &str) -> bool {
    match value {
        Value::Object(map) => map.values().any(|v| any_field_matches(v, expected)),
        Value::Array(items) => items.iter().any(|v| any_field_matches(v, expected)),
        other => scalar_matches(other, expected, true),
    }
}

// ============================================================================
// Sorting
// ============================================================================

/// Sort key of one document; numbers sort before strings, missing values last.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SortKey {
    Number(f64),
    Text(String),
    Missing,
}

impl SortKey {
    pub(crate) fn extract(doc: &Value, field: &str) -> Self {
        match lookup(doc, field) {
            Some(Value::Number(n)) => n.as_f64().map_or(Self::Missing, Self::Number),
            Some(Value::String(s)) => Self::Text(s.clone()),
            Some(Value::Bool(b)) => Self::Text(b.to_string()),
            Some(Value::Array(items)) => items
                .first()
                .map_or(Self::Missing, Self::extract_scalar),
            _ => Self::Missing,
        }
    }

    fn extract_scalar(value: &Value) -> Self {
        match value {
            Value::Number(n) => n.as_f64().map_or(Self::Missing, Self::Number),
            Value::String(s) => Self::Text(s.clone()),
            Value::Bool(b) => Self::Text(b.to_string()),
            _ => Self::Missing,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Number(_) => 0,
            Self::Text(_) => 1,
            Self::Missing => 2,
        }
    }
}

/// Compares two keys under `order`; missing values stay last either way.
pub(crate) fn compare_keys(a: &SortKey, b: &SortKey, order: SortOrder) -> Ordering {
    let natural = match (a, b) {
        (SortKey::Missing, SortKey::Missing) => return Ordering::Equal,
        (SortKey::Missing, _) => return Ordering::Greater,
        (_, SortKey::Missing) => return Ordering::Less,
        (SortKey::Number(x), SortKey::Number(y)) => x.total_cmp(y),
        (SortKey::Text(x), SortKey::Text(y)) => x.cmp(y),
        _ => a.rank().cmp(&b.rank()),
    };
    match order {
        SortOrder::Asc => natural,
        SortOrder::Desc => natural.reverse(),
    }
}

/// Sorts `items` in place by the `sort` field of the document `doc_of` returns.
pub(crate) fn sort_hits<T>(items: &mut [T], sort: &Sort, doc_of: impl Fn(&T) -> &Value) {
    items.sort_by_cached_key(|item| {
        OrderedKey(SortKey::extract(doc_of(item), &sort.field), sort.order)
    });
}

/// Adapter so cached sort keys can use [`compare_keys`].
struct OrderedKey(SortKey, SortOrder);

impl PartialEq for OrderedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedKey {}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(&self.0, &other.0, self.1)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    fn doc() -> Value {
        json!({
            "id": "7",
            "msg": "test 7",
            "order": 7,
            "meta": { "tag": "alpha" },
            "labels": ["x", "y"]
        })
    }

    #[test_case("", Matcher::All; "empty")]
    #[test_case("*", Matcher::All; "star")]
    #[test_case("*:*", Matcher::All; "star colon star")]
    #[test_case("msg:*", Matcher::Exists { field: "msg".into() }; "exists")]
    #[test_case("msg:test", Matcher::Field { field: "msg".into(), value: "test".into() }; "field")]
    #[test_case("alpha", Matcher::AnyField { value: "alpha".into() }; "bare")]
    fn query_strings_parse(q: &str, expected: Matcher) {
        assert_eq!(parse_query_string(q), expected);
    }

    #[test]
    fn term_is_exact() {
        let doc = doc();
        assert!(Matcher::from_query(&Query::term("msg", "test 7")).matches(&doc));
        assert!(!Matcher::from_query(&Query::term("msg", "test")).matches(&doc));
        assert!(Matcher::from_query(&Query::term("order", 7)).matches(&doc));
    }

    #[test]
    fn query_string_matches_tokens_and_nested_fields() {
        let doc = doc();
        assert!(parse_query_string("msg:test").matches(&doc));
        assert!(parse_query_string("meta.tag:alpha").matches(&doc));
        assert!(parse_query_string("labels:y").matches(&doc));
        assert!(parse_query_string("alpha").matches(&doc));
        assert!(!parse_query_string("missing:*").matches(&doc));
        assert!(!parse_query_string("beta").matches(&doc));
    }

    #[test]
    fn sort_numbers_before_strings_and_missing_last() {
        let mut docs = vec![
            json!({"v": "b"}),
            json!({}),
            json!({"v": 2}),
            json!({"v": "a"}),
            json!({"v": 1}),
        ];
        sort_hits(&mut docs, &Sort::field("v"), |d| d);
        assert_eq!(
            docs,
            vec![json!({"v": 1}), json!({"v": 2}), json!({"v": "a"}), json!({"v": "b"}), json!({})]
        );

        sort_hits(&mut docs, &Sort::field("v").order(SortOrder::Desc), |d| d);
        assert_eq!(docs[0], json!({"v": "b"}));
        assert_eq!(docs[4], json!({}));
    }

    proptest! {
        #[test]
        fn sorted_numbers_are_ordered_with_missing_last(
            values in prop::collection::vec(prop::option::of(-1000i64..1000), 0..40),
            descending in any::<bool>(),
        ) {
            let mut docs: Vec<Value> = values
                .iter()
                .map(|v| v.map_or_else(|| json!({}), |v| json!({"v": v})))
                .collect();
            let order = if descending { SortOrder::Desc } else { SortOrder::Asc };
            sort_hits(&mut docs, &Sort::field("v").order(order), |d| d);

            let present: Vec<i64> = docs.iter().filter_map(|d| d["v"].as_i64()).collect();
            let missing = values.iter().filter(|v| v.is_none()).count();
            prop_assert!(docs[present.len()..].iter().all(|d| d.get("v").is_none()));
            prop_assert_eq!(docs.len() - present.len(), missing);
            for pair in present.windows(2) {
                if descending {
                    prop_assert!(pair[0] >= pair[1]);
                } else {
                    prop_assert!(pair[0] <= pair[1]);
                }
            }
        }
    }
}
