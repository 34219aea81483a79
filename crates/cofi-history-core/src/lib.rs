//! Brew history domain model.
//!
//! A [`BrewHistoryRecord`] is a passive value describing one brew of a recipe.
//! Identity is owned by the storage layer: a record starts [`PersistenceState::Transient`]
//! and becomes [`PersistenceState::Persisted`] exactly once, when a store calls
//! [`BrewHistoryRecord::assign_id`]. How the record maps onto durable storage is
//! described separately by [`HistorySchema`].

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

const MAX_IDENTIFIER_LEN: usize = 64;
const NAIVE_TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

/// Share of all brews, in percent, at which a recipe counts as frequently brewed.
pub const FREQUENT_RECIPE_PERCENT: u64 = 20;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum HistoryError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("identity error: {0}")]
    Identity(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Surrogate identity assigned by the storage backend on insert.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a recipe owned elsewhere in the application.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecipeId(pub i64);

impl Display for RecipeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceState {
    Transient,
    Persisted,
}

impl PersistenceState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Persisted => "persisted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "transient" => Some(Self::Transient),
            "persisted" => Some(Self::Persisted),
            _ => None,
        }
    }
}

/// One brew of a recipe: when it happened, how many grams of beans went in,
/// and free-form notes.
///
/// Fields other than `id` are fixed at construction. `beans_used` is not
/// checked here; range and referential constraints belong to the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrewHistoryRecord {
    id: Option<RecordId>,
    recipe_id: RecipeId,
    #[serde(with = "rfc3339_utc")]
    brew_date: OffsetDateTime,
    beans_used: f64,
    notes: Option<String>,
}

/// RFC3339 serde for timestamps that must stay in UTC, whatever offset the input carried.
mod rfc3339_utc {
    use serde::{Deserializer, Serializer};
    use time::{OffsetDateTime, UtcOffset};

    pub fn serialize<S: Serializer>(
        value: &OffsetDateTime,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        time::serde::rfc3339::serialize(&value.to_offset(UtcOffset::UTC), serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<OffsetDateTime, D::Error> {
        time::serde::rfc3339::deserialize(deserializer)
            .map(|value| value.to_offset(UtcOffset::UTC))
    }
}

impl BrewHistoryRecord {
    /// Builds a transient record. `brew_date` is normalized to UTC.
    #[must_use]
    pub fn new(
        recipe_id: RecipeId,
        brew_date: OffsetDateTime,
        beans_used: f64,
        notes: Option<String>,
    ) -> Self {
        Self {
            id: None,
            recipe_id,
            brew_date: brew_date.to_offset(UtcOffset::UTC),
            beans_used,
            notes,
        }
    }

    /// Rebuilds a record that a store has already persisted under `id`.
    #[must_use]
    pub fn restore(
        id: RecordId,
        recipe_id: RecipeId,
        brew_date: OffsetDateTime,
        beans_used: f64,
        notes: Option<String>,
    ) -> Self {
        let mut record = Self::new(recipe_id, brew_date, beans_used, notes);
        record.id = Some(id);
        record
    }

    #[must_use]
    pub fn id(&self) -> Option<RecordId> {
        self.id
    }

    #[must_use]
    pub fn recipe_id(&self) -> RecipeId {
        self.recipe_id
    }

    #[must_use]
    pub fn brew_date(&self) -> OffsetDateTime {
        self.brew_date
    }

    #[must_use]
    pub fn beans_used(&self) -> f64 {
        self.beans_used
    }

    #[must_use]
    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    #[must_use]
    pub fn state(&self) -> PersistenceState {
        if self.id.is_some() {
            PersistenceState::Persisted
        } else {
            PersistenceState::Transient
        }
    }

    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    /// Fills the identity slot. Only storage backends should call this.
    ///
    /// # Errors
    /// Returns [`HistoryError::Identity`] when the record already has an
    /// identity; the existing identity is kept.
    pub fn assign_id(&mut self, id: RecordId) -> Result<(), HistoryError> {
        if let Some(existing) = self.id {
            return Err(HistoryError::Identity(format!(
                "record already persisted as {existing}; cannot reassign to {id}"
            )));
        }

        self.id = Some(id);
        Ok(())
    }
}

/// Aggregate of all brews of one recipe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RecipeBrewSummary {
    pub recipe_id: RecipeId,
    pub brew_count: u64,
    pub total_beans_used: f64,
    #[serde(with = "rfc3339_utc")]
    pub last_brew_date: OffsetDateTime,
}

/// Brewing habits across every recipe with history.
///
/// `recipes` is ordered by `brew_count` descending, then `recipe_id`.
/// `unused_recipes` is only known when the store maps a recipe table; it
/// lists recipes in that table that have never been brewed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HistorySummary {
    pub total_brews: u64,
    pub recipes: Vec<RecipeBrewSummary>,
    pub frequent_recipes: Vec<RecipeId>,
    pub unused_recipes: Option<Vec<RecipeId>>,
}

impl HistorySummary {
    /// Builds the summary from per-recipe aggregates. A recipe is frequent when
    /// it accounts for at least [`FREQUENT_RECIPE_PERCENT`] of all brews.
    #[must_use]
    pub fn from_recipes(
        mut recipes: Vec<RecipeBrewSummary>,
        unused_recipes: Option<Vec<RecipeId>>,
    ) -> Self {
        recipes.sort_by(|left, right| {
            right
                .brew_count
                .cmp(&left.brew_count)
                .then(left.recipe_id.cmp(&right.recipe_id))
        });

        let total_brews: u64 = recipes.iter().map(|recipe| recipe.brew_count).sum();
        let frequent_recipes = recipes
            .iter()
            .filter(|recipe| {
                recipe.brew_count.saturating_mul(100)
                    >= total_brews.saturating_mul(FREQUENT_RECIPE_PERCENT)
            })
            .map(|recipe| recipe.recipe_id)
            .collect();

        Self {
            total_brews,
            recipes,
            frequent_recipes,
            unused_recipes,
        }
    }

    #[must_use]
    pub fn most_brewed(&self) -> Option<&RecipeBrewSummary> {
        self.recipes.first()
    }
}

/// Table/column names used by a store for brew history rows.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HistorySchema {
    pub schema_version: u32,
    pub table: String,
    pub id_column: String,
    pub recipe_id_column: String,
    pub brew_date_column: String,
    pub beans_used_column: String,
    pub notes_column: String,
    pub recipe_reference: Option<RecipeReference>,
}

/// Existing recipe table that `recipe_id` values must point into.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RecipeReference {
    pub table: String,
    pub column: String,
}

impl Default for HistorySchema {
    fn default() -> Self {
        Self::v1()
    }
}

impl HistorySchema {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            schema_version: 1,
            table: "brew_history".to_string(),
            id_column: "id".to_string(),
            recipe_id_column: "recipe_id".to_string(),
            brew_date_column: "brew_date".to_string(),
            beans_used_column: "beans_used".to_string(),
            notes_column: "notes".to_string(),
            recipe_reference: None,
        }
    }

    #[must_use]
    pub fn with_recipe_reference(mut self, table: &str, column: &str) -> Self {
        self.recipe_reference = Some(RecipeReference {
            table: table.to_string(),
            column: column.to_string(),
        });
        self
    }

    /// Columns in insert/select order, excluding the identity column.
    #[must_use]
    pub fn data_columns(&self) -> [&str; 4] {
        [
            self.recipe_id_column.as_str(),
            self.brew_date_column.as_str(),
            self.beans_used_column.as_str(),
            self.notes_column.as_str(),
        ]
    }

    /// Validates identifiers before they are interpolated into SQL.
    ///
    /// # Errors
    /// Returns [`HistoryError::Configuration`] when the version is zero, an
    /// identifier is malformed, or two columns share a name.
    pub fn validate(&self) -> Result<(), HistoryError> {
        if self.schema_version == 0 {
            return Err(HistoryError::Configuration(
                "schema_version MUST be >= 1".to_string(),
            ));
        }

        ensure_identifier("table", &self.table)?;
        if self.table.to_ascii_lowercase().starts_with("sqlite_") {
            return Err(HistoryError::Configuration(format!(
                "table name `{}` uses the reserved sqlite_ prefix",
                self.table
            )));
        }

        let mut seen = BTreeSet::new();
        for (name, value) in [
            ("id_column", &self.id_column),
            ("recipe_id_column", &self.recipe_id_column),
            ("brew_date_column", &self.brew_date_column),
            ("beans_used_column", &self.beans_used_column),
            ("notes_column", &self.notes_column),
        ] {
            ensure_identifier(name, value)?;
            if !seen.insert(value.to_ascii_lowercase()) {
                return Err(HistoryError::Configuration(format!(
                    "column `{value}` is mapped more than once"
                )));
            }
        }

        if let Some(reference) = &self.recipe_reference {
            ensure_identifier("recipe_reference.table", &reference.table)?;
            ensure_identifier("recipe_reference.column", &reference.column)?;
            if reference.table.eq_ignore_ascii_case(&self.table) {
                return Err(HistoryError::Configuration(
                    "recipe_reference.table cannot be the history table".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Decodes and validates a mapping from JSON. Missing fields fall back to [`HistorySchema::v1`].
    ///
    /// # Errors
    /// Returns [`HistoryError::Configuration`] when JSON decoding fails
    /// or the decoded mapping is invalid.
    pub fn from_json(value: &Value) -> Result<Self, HistoryError> {
        let schema: Self = serde_json::from_value(value.clone()).map_err(|err| {
            HistoryError::Configuration(format!("failed to decode schema mapping JSON: {err}"))
        })?;
        schema.validate()?;
        Ok(schema)
    }
}

fn ensure_identifier(name: &str, value: &str) -> Result<(), HistoryError> {
    let mut chars = value.chars();
    let valid_start = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_');
    let valid_rest = chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_');

    if !valid_start || !valid_rest || value.len() > MAX_IDENTIFIER_LEN {
        return Err(HistoryError::Configuration(format!(
            "{name} `{value}` MUST match [A-Za-z_][A-Za-z0-9_]* (max {MAX_IDENTIFIER_LEN} chars)"
        )));
    }

    Ok(())
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`HistoryError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, HistoryError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| HistoryError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(HistoryError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Parses a brew timestamp: RFC3339 in UTC, or `YYYY-MM-DDTHH:MM:SS` read as UTC.
///
/// # Errors
/// Returns [`HistoryError::Validation`] when the input matches neither form
/// or carries a non-UTC offset.
pub fn parse_brew_timestamp(value: &str) -> Result<OffsetDateTime, HistoryError> {
    if let Ok(parsed) =
        OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
    {
        if parsed.offset() != UtcOffset::UTC {
            return Err(HistoryError::Validation(
                "timestamp MUST use UTC offset Z".to_string(),
            ));
        }
        return Ok(parsed);
    }

    let naive = PrimitiveDateTime::parse(value, NAIVE_TIMESTAMP_FORMAT).map_err(|err| {
        HistoryError::Validation(format!("invalid brew timestamp `{value}`: {err}"))
    })?;

    Ok(naive.assume_utc())
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`HistoryError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, HistoryError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            HistoryError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
