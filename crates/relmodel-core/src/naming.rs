//! Naming conventions.
//!
//! Column names follow lowerCamelCase (`userId`, `deletedAt`). Foreign keys
//! are inferred from singularized table names and discriminator columns from
//! their foreign key.

use heck::ToLowerCamelCase;
use regex::Regex;
use std::sync::OnceLock;

/// Column-name conventions shared by every model in a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingConfig {
    /// Primary-key column
    pub primary_key: String,
    /// Soft-delete timestamp column
    pub deleted_at: String,
    /// Single-table-inheritance discriminator column
    pub sti_column: String,
    pub created_at: String,
    pub updated_at: String,
    /// Suffix appended to inferred foreign keys
    pub foreign_key_suffix: String,
    /// Suffix that replaces `foreign_key_suffix` on discriminator columns
    pub discriminator_suffix: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            primary_key: "id".to_string(),
            deleted_at: "deletedAt".to_string(),
            sti_column: "type".to_string(),
            created_at: "createdAt".to_string(),
            updated_at: "updatedAt".to_string(),
            foreign_key_suffix: "Id".to_string(),
            discriminator_suffix: "Type".to_string(),
        }
    }
}

impl NamingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    pub fn deleted_at(mut self, column: impl Into<String>) -> Self {
        self.deleted_at = column.into();
        self
    }

    pub fn sti_column(mut self, column: impl Into<String>) -> Self {
        self.sti_column = column.into();
        self
    }

    pub fn timestamps(mut self, created_at: impl Into<String>, updated_at: impl Into<String>) -> Self {
        self.created_at = created_at.into();
        self.updated_at = updated_at.into();
        self
    }

    /// `lowerCamel(singular(table)) + suffix`, e.g. `users` -> `userId`.
    pub fn foreign_key_for_table(&self, table: &str) -> String {
        format!(
            "{}{}",
            singularize(table).to_lower_camel_case(),
            self.foreign_key_suffix
        )
    }

    /// `<name>Id` for a polymorphic BelongsTo, whose target table varies.
    pub fn foreign_key_for_name(&self, name: &str) -> String {
        format!("{}{}", name.to_lower_camel_case(), self.foreign_key_suffix)
    }

    /// Replace a trailing foreign-key suffix with the discriminator suffix:
    /// `commentableId` -> `commentableType`. Keys without the suffix get the
    /// discriminator suffix appended.
    pub fn discriminator_for(&self, foreign_key: &str) -> String {
        let stem = foreign_key
            .strip_suffix(self.foreign_key_suffix.as_str())
            .filter(|_| !self.foreign_key_suffix.is_empty())
            .unwrap_or(foreign_key);
        format!("{}{}", stem, self.discriminator_suffix)
    }
}

/// Singular form of a word (`posts` -> `post`, `categories` -> `category`).
pub fn singularize(word: &str) -> String {
    pluralizer::pluralize(word, 1, false)
}

/// Plural form of a word.
pub fn pluralize(word: &str) -> String {
    pluralizer::pluralize(word, 2, false)
}

fn identifier_regex() -> Option<&'static Regex> {
    static IDENT: OnceLock<Option<Regex>> = OnceLock::new();
    IDENT
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

/// Whether `name` is usable as a model, table, column or association name.
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_regex().is_some_and(|re| re.is_match(name))
}
