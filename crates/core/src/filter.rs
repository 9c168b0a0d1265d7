//! Metadata filter AST
//!
//! Filters are evaluated against chunks after the index produces candidates.
//! Predicates address either the chunk's `document_id` or one metadata key;
//! combinators compose them.
//!
//! String-array fields match element-wise: `Eq` on a `StringList` holds if
//! the list contains the string, `Prefix` if any element has the prefix.

use crate::metadata::MetadataValue;
use crate::types::{Chunk, DocumentId};
use serde::{Deserialize, Serialize};

/// A metadata filter: predicate tree over chunk fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// The chunk belongs to the given document.
    Document(DocumentId),
    /// Metadata key equals the value.
    Eq {
        /// Metadata key.
        key: String,
        /// Expected value.
        value: MetadataValue,
    },
    /// Metadata key is present and differs from the value.
    Ne {
        /// Metadata key.
        key: String,
        /// Excluded value.
        value: MetadataValue,
    },
    /// Metadata key equals one of the values.
    In {
        /// Metadata key.
        key: String,
        /// Accepted values.
        values: Vec<MetadataValue>,
    },
    /// Metadata key is numeric and inside the inclusive range.
    Range {
        /// Metadata key.
        key: String,
        /// Inclusive lower bound; unbounded when `None`.
        min: Option<f64>,
        /// Inclusive upper bound; unbounded when `None`.
        max: Option<f64>,
    },
    /// Metadata key is a string (or string list) with the given prefix.
    Prefix {
        /// Metadata key.
        key: String,
        /// Required prefix.
        prefix: String,
    },
    /// All sub-filters hold. Empty `And` matches everything.
    And(Vec<Filter>),
    /// At least one sub-filter holds. Empty `Or` matches nothing.
    Or(Vec<Filter>),
    /// The sub-filter does not hold.
    Not(Box<Filter>),
}

impl Filter {
    /// Equality predicate on a metadata key.
    pub fn eq(key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Filter::Eq {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Evaluate the filter against a chunk.
    pub fn matches(&self, chunk: &Chunk) -> bool {
        match self {
            Filter::Document(doc) => chunk.document_id == Some(*doc),
            Filter::Eq { key, value } => chunk
                .metadata
                .get(key)
                .is_some_and(|actual| value_eq(actual, value)),
            Filter::Ne { key, value } => chunk
                .metadata
                .get(key)
                .is_some_and(|actual| !value_eq(actual, value)),
            Filter::In { key, values } => chunk
                .metadata
                .get(key)
                .is_some_and(|actual| values.iter().any(|v| value_eq(actual, v))),
            Filter::Range { key, min, max } => chunk
                .metadata
                .get(key)
                .and_then(MetadataValue::as_f64)
                .is_some_and(|v| min.map_or(true, |m| v >= m) && max.map_or(true, |m| v <= m)),
            Filter::Prefix { key, prefix } => {
                chunk.metadata.get(key).is_some_and(|actual| match actual {
                    MetadataValue::String(s) => s.starts_with(prefix),
                    MetadataValue::StringList(list) => {
                        list.iter().any(|s| s.starts_with(prefix))
                    }
                    _ => false,
                })
            }
            Filter::And(filters) => filters.iter().all(|f| f.matches(chunk)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(chunk)),
            Filter::Not(filter) => !filter.matches(chunk),
        }
    }
}

/// Equality with string-list membership: a scalar string equals a list field
/// when the list contains it.
fn value_eq(actual: &MetadataValue, expected: &MetadataValue) -> bool {
    match (actual, expected) {
        (MetadataValue::StringList(list), MetadataValue::String(s)) => {
            list.iter().any(|item| item == s)
        }
        _ => actual == expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataMap;
    use crate::types::{ChunkId, LibraryId};
    use chrono::Utc;

    fn chunk(metadata: MetadataMap, document_id: Option<DocumentId>) -> Chunk {
        let now = Utc::now();
        Chunk {
            id: ChunkId::new(),
            library_id: LibraryId::new(),
            content: "text".into(),
            embedding: vec![0.0; 4],
            document_id,
            position: 0,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    fn tagged(key: &str, value: MetadataValue) -> Chunk {
        let mut meta = MetadataMap::new();
        meta.insert(key.into(), value);
        chunk(meta, None)
    }

    #[test]
    fn test_eq_and_ne() {
        let c = tagged("color", "red".into());
        assert!(Filter::eq("color", "red").matches(&c));
        assert!(!Filter::eq("color", "blue").matches(&c));
        assert!(Filter::Ne {
            key: "color".into(),
            value: "blue".into()
        }
        .matches(&c));
        // Ne on a missing key does not match.
        assert!(!Filter::Ne {
            key: "missing".into(),
            value: "blue".into()
        }
        .matches(&c));
    }

    #[test]
    fn test_in() {
        let c = tagged("lang", "en".into());
        assert!(Filter::In {
            key: "lang".into(),
            values: vec!["de".into(), "en".into()]
        }
        .matches(&c));
        assert!(!Filter::In {
            key: "lang".into(),
            values: vec!["de".into(), "fr".into()]
        }
        .matches(&c));
    }

    #[test]
    fn test_range() {
        let c = tagged("pages", MetadataValue::Int(25));
        let range = |min, max| Filter::Range {
            key: "pages".into(),
            min,
            max,
        };
        assert!(range(Some(10.0), Some(30.0)).matches(&c));
        assert!(range(Some(25.0), None).matches(&c));
        assert!(range(None, Some(25.0)).matches(&c));
        assert!(!range(Some(26.0), None).matches(&c));
        // Non-numeric field never matches a range.
        let s = tagged("pages", "many".into());
        assert!(!range(None, None).matches(&s));
    }

    #[test]
    fn test_prefix() {
        let c = tagged("path", "docs/guide".into());
        assert!(Filter::Prefix {
            key: "path".into(),
            prefix: "docs/".into()
        }
        .matches(&c));
        assert!(!Filter::Prefix {
            key: "path".into(),
            prefix: "img/".into()
        }
        .matches(&c));
    }

    #[test]
    fn test_string_list_membership() {
        let c = tagged(
            "tags",
            MetadataValue::StringList(vec!["rust".into(), "db".into()]),
        );
        assert!(Filter::eq("tags", "rust").matches(&c));
        assert!(!Filter::eq("tags", "go").matches(&c));
        assert!(Filter::Prefix {
            key: "tags".into(),
            prefix: "ru".into()
        }
        .matches(&c));
    }

    #[test]
    fn test_document_filter() {
        let doc = DocumentId::new();
        let c = chunk(MetadataMap::new(), Some(doc));
        assert!(Filter::Document(doc).matches(&c));
        assert!(!Filter::Document(DocumentId::new()).matches(&c));
        assert!(!Filter::Document(doc).matches(&chunk(MetadataMap::new(), None)));
    }

    #[test]
    fn test_combinators() {
        let c = tagged("color", "red".into());
        assert!(Filter::And(vec![
            Filter::eq("color", "red"),
            Filter::Not(Box::new(Filter::eq("color", "blue"))),
        ])
        .matches(&c));
        assert!(Filter::Or(vec![
            Filter::eq("color", "blue"),
            Filter::eq("color", "red"),
        ])
        .matches(&c));
        assert!(Filter::And(vec![]).matches(&c));
        assert!(!Filter::Or(vec![]).matches(&c));
    }
}
