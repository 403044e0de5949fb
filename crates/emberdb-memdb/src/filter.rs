//! Tag filter expressions.
//!
//! The query planner lives outside this crate; what reaches the store is an
//! already-parsed filter tree over tag keys and values. Leaves resolve to
//! series bitmaps inside one tag index, combinators fold them.

/// A filter over tag values, evaluated per tag index into a series bitmap.
#[derive(Debug, Clone, PartialEq)]
pub enum TagFilter {
    /// Exact value match on one key.
    Eq { key: String, value: String },
    /// Any of the values on one key.
    In { key: String, values: Vec<String> },
    /// Prefix match on the values of one key.
    Like { key: String, prefix: String },
    /// Regular-expression match on the values of one key.
    Regex { key: String, pattern: String },
    /// Complement within the live series of the index.
    Not(Box<TagFilter>),
    And(Vec<TagFilter>),
    Or(Vec<TagFilter>),
}

impl TagFilter {
    pub fn eq(key: &str, value: &str) -> TagFilter {
        TagFilter::Eq {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    pub fn like(key: &str, prefix: &str) -> TagFilter {
        TagFilter::Like {
            key: key.to_string(),
            prefix: prefix.to_string(),
        }
    }
}
