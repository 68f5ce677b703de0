//! Document filter expressions.
//!
//! A [`Filter`] is the predicate passed to the store for queries, counts and
//! deletes. The same tree can be evaluated in memory with [`Filter::matches`],
//! which is how post-materialization filters and batched lazy relations work.

use crate::document::Document;
use crate::error::{Error, Result};
use serde_json::Value;
use std::cmp::Ordering;

/// A predicate over documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Filter {
    /// Matches every document
    #[default]
    All,
    /// Field equals value (or an array field contains it)
    Eq(String, Value),
    /// Field does not equal value
    Ne(String, Value),
    /// Field equals one of the values
    In(String, Vec<Value>),
    /// Field equals none of the values
    Nin(String, Vec<Value>),
    /// Field is less than value
    Lt(String, Value),
    /// Field is less than or equal to value
    Lte(String, Value),
    /// Field is greater than value
    Gt(String, Value),
    /// Field is greater than or equal to value
    Gte(String, Value),
    /// Field presence check
    Exists(String, bool),
    /// String field matches a regular expression
    Regex(String, Pattern),
    /// All sub-filters match
    And(Vec<Filter>),
    /// Any sub-filter matches
    Or(Vec<Filter>),
    /// Sub-filter does not match
    Not(Box<Filter>),
}

/// A regular expression compiled once, when the filter is built.
///
/// An invalid pattern is kept along with its compile error so that
/// [`Filter::validate`] can reject the filter before it reaches a store.
/// Equality compares the source text.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    compiled: std::result::Result<regex::Regex, regex::Error>,
}

impl Pattern {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let compiled = regex::Regex::new(&source);
        Self { source, compiled }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_valid(&self) -> bool {
        self.compiled.is_ok()
    }

    /// The compile error of an invalid pattern.
    pub fn error(&self) -> Option<&regex::Error> {
        self.compiled.as_ref().err()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.compiled.as_ref().is_ok_and(|re| re.is_match(text))
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Filter {
    /// Field equality.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    /// Field inequality.
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ne(field.into(), value.into())
    }

    /// Field membership in a list of values.
    pub fn in_list<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Filter::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    /// Field absence from a list of values.
    pub fn not_in_list<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Filter::Nin(field.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lt(field.into(), value.into())
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lte(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gt(field.into(), value.into())
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gte(field.into(), value.into())
    }

    /// Field presence.
    pub fn exists(field: impl Into<String>) -> Self {
        Filter::Exists(field.into(), true)
    }

    /// Regular expression match on a string field.
    ///
    /// An invalid pattern is reported by [`validate`](Self::validate); use
    /// [`try_regex`](Self::try_regex) to fail at construction instead.
    pub fn regex(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Filter::Regex(field.into(), Pattern::new(pattern))
    }

    /// Regular expression match, rejecting an invalid pattern up front.
    pub fn try_regex(field: impl Into<String>, pattern: impl Into<String>) -> Result<Self> {
        let filter = Self::regex(field, pattern);
        filter.validate()?;
        Ok(filter)
    }

    /// Match documents by id.
    pub fn id(id: impl Into<String>) -> Self {
        Filter::Eq(crate::document::ID_FIELD.to_string(), Value::String(id.into()))
    }

    /// Match documents whose id is in the given set.
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::In(
            crate::document::ID_FIELD.to_string(),
            ids.into_iter().map(|id| Value::String(id.into())).collect(),
        )
    }

    /// Combine with another filter using AND.
    ///
    /// `All` is the identity, and nested `And` nodes are flattened.
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut left), Filter::And(right)) => {
                left.extend(right);
                Filter::And(left)
            }
            (Filter::And(mut left), f) => {
                left.push(f);
                Filter::And(left)
            }
            (f, Filter::And(mut right)) => {
                right.insert(0, f);
                Filter::And(right)
            }
            (left, right) => Filter::And(vec![left, right]),
        }
    }

    /// Combine with another filter using OR.
    pub fn or(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, _) | (_, Filter::All) => Filter::All,
            (Filter::Or(mut left), Filter::Or(right)) => {
                left.extend(right);
                Filter::Or(left)
            }
            (Filter::Or(mut left), f) => {
                left.push(f);
                Filter::Or(left)
            }
            (left, right) => Filter::Or(vec![left, right]),
        }
    }

    /// Negate this filter.
    pub fn not(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Does this filter leave every document unconstrained?
    pub fn is_all(&self) -> bool {
        match self {
            Filter::All => true,
            Filter::And(parts) => parts.iter().all(Filter::is_all),
            _ => false,
        }
    }

    /// Check that every regular expression in the tree compiled.
    ///
    /// Queries, counts and deletes call this before touching the store: a
    /// pattern that matches nothing turns into one that matches everything
    /// under [`not`](Self::not).
    pub fn validate(&self) -> Result<()> {
        match self {
            Filter::Regex(field, pattern) => match pattern.error() {
                Some(e) => Err(Error::Argument(format!(
                    "invalid regular expression for `{}`: {}",
                    field, e
                ))),
                None => Ok(()),
            },
            Filter::And(parts) | Filter::Or(parts) => parts.iter().try_for_each(Filter::validate),
            Filter::Not(inner) => inner.validate(),
            _ => Ok(()),
        }
    }

    /// Evaluate this filter against a document in memory.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, value) => lookup(doc, field).is_some_and(|v| value_eq(v, value)),
            Filter::Ne(field, value) => !lookup(doc, field).is_some_and(|v| value_eq(v, value)),
            Filter::In(field, values) => lookup(doc, field)
                .is_some_and(|v| values.iter().any(|candidate| value_eq(v, candidate))),
            Filter::Nin(field, values) => !lookup(doc, field)
                .is_some_and(|v| values.iter().any(|candidate| value_eq(v, candidate))),
            Filter::Lt(field, value) => compare_field(doc, field, value, |o| o == Ordering::Less),
            Filter::Lte(field, value) => {
                compare_field(doc, field, value, |o| o != Ordering::Greater)
            }
            Filter::Gt(field, value) => {
                compare_field(doc, field, value, |o| o == Ordering::Greater)
            }
            Filter::Gte(field, value) => compare_field(doc, field, value, |o| o != Ordering::Less),
            Filter::Exists(field, expected) => lookup(doc, field).is_some() == *expected,
            Filter::Regex(field, pattern) => match lookup(doc, field) {
                Some(Value::String(s)) => pattern.is_match(s),
                _ => false,
            },
            Filter::And(parts) => parts.iter().all(|f| f.matches(doc)),
            Filter::Or(parts) => parts.iter().any(|f| f.matches(doc)),
            Filter::Not(inner) => !inner.matches(doc),
        }
    }
}

/// Resolve a dotted field path inside a document.
fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn value_eq(field: &Value, expected: &Value) -> bool {
    if let (Value::Array(items), false) = (field, expected.is_array()) {
        return items.iter().any(|item| value_eq(item, expected));
    }
    match (field, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => field == expected,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn compare_field(doc: &Document, field: &str, value: &Value, pred: impl Fn(Ordering) -> bool) -> bool {
    lookup(doc, field)
        .and_then(|v| compare_values(v, value))
        .is_some_and(pred)
}
