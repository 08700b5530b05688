//! Content records and their category/tag associations.
//!
//! A record is built by the parser from one template file, completed by the
//! processor, and then written to the store as an immutable snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A post extracted from one template file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    /// Identity assigned by the store on insert
    pub id: Option<i64>,

    /// Creation timestamp (`post-date`, or ingestion time)
    pub created_at: Option<DateTime<Utc>>,

    /// Last edit timestamp (`edit-date`, or ingestion time)
    pub updated_at: Option<DateTime<Utc>>,

    pub title: String,

    pub author: String,

    /// Full `<body>` markup, tags included
    pub content: String,

    /// Comma-joined category names, as written in the template
    pub categories: String,

    /// Comma-joined tag names, as written in the template
    pub tags: String,

    /// Base name of the source file, kept for traceability only
    #[serde(skip)]
    pub original_filename: String,
}

impl ContentRecord {
    /// Fill in anything the template did not provide before persisting.
    ///
    /// Timestamps already set by the parser are left untouched.
    pub fn finalize(&mut self, original_filename: impl Into<String>, now: DateTime<Utc>) {
        self.original_filename = original_filename.into();
        if self.created_at.is_none() {
            self.created_at = Some(now);
        }
        if self.updated_at.is_none() {
            self.updated_at = Some(now);
        }
    }

    /// Category names, one per comma-separated segment
    pub fn category_names(&self) -> Vec<String> {
        split_names(&self.categories)
    }

    /// Tag names, one per comma-separated segment
    pub fn tag_names(&self) -> Vec<String> {
        split_names(&self.tags)
    }
}

/// Which association table a name belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationKind {
    Category,
    Tag,
}

impl AssociationKind {
    pub fn table(self) -> &'static str {
        match self {
            AssociationKind::Category => "post_category",
            AssociationKind::Tag => "post_tag",
        }
    }
}

/// A category or tag name linked to a stored record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    pub record_id: i64,
    pub kind: AssociationKind,
    pub name: String,
}

/// Split a comma-joined list into whitespace-trimmed names.
///
/// An empty list yields nothing. Empty segments are kept (`"a,,b"` gives
/// three names) and duplicates are not removed.
pub fn split_names(list: &str) -> Vec<String> {
    if list.is_empty() {
        return Vec::new();
    }
    list.split(',').map(|name| name.trim().to_string()).collect()
}
