#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use cofi_history_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, BrewHistoryRecord, HistorySchema, HistorySummary,
    RecipeBrewSummary, RecipeId, RecipeReference, RecordId,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

const MIGRATIONS_TABLE: &str = "cofi_history_migrations";

/// Fixed-width RFC3339 so that text ordering in SQLite matches time ordering.
const STORAGE_TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z");

/// Years RFC3339 can represent; anything else could not be read back.
const STORABLE_YEARS: std::ops::RangeInclusive<i32> = 0..=9999;

pub struct SqliteHistoryStore {
    conn: Connection,
    schema: HistorySchema,
    statements: HistoryStatements,
}

/// SQL rendered once from the schema mapping.
#[derive(Debug, Clone)]
struct HistoryStatements {
    insert: String,
    select_by_id: String,
    select_by_recipe: String,
    delete_by_id: String,
    recipe_summary: String,
    unused_recipes: Option<String>,
}

impl HistoryStatements {
    fn render(schema: &HistorySchema) -> Self {
        let table = quoted(&schema.table);
        let id = quoted(&schema.id_column);
        let [recipe_id, brew_date, beans_used, notes] = schema.data_columns().map(quoted);
        let select = format!(
            "SELECT {id}, {recipe_id}, {brew_date}, {beans_used}, {notes} FROM {table}"
        );

        Self {
            insert: format!(
                "INSERT INTO {table} ({recipe_id}, {brew_date}, {beans_used}, {notes})
                 VALUES (?1, ?2, ?3, ?4)"
            ),
            select_by_id: format!("{select} WHERE {id} = ?1"),
            select_by_recipe: format!(
                "{select} WHERE {recipe_id} = ?1 ORDER BY {brew_date} ASC, {id} ASC LIMIT ?2"
            ),
            delete_by_id: format!("DELETE FROM {table} WHERE {id} = ?1"),
            recipe_summary: format!(
                "SELECT {recipe_id}, COUNT(*), TOTAL({beans_used}), MAX({brew_date})
                 FROM {table}
                 GROUP BY {recipe_id}
                 ORDER BY COUNT(*) DESC, {recipe_id} ASC"
            ),
            unused_recipes: schema.recipe_reference.as_ref().map(|reference| {
                let parent = quoted(&reference.table);
                let key = quoted(&reference.column);
                format!(
                    "SELECT recipe.{key} FROM {parent} AS recipe
                     WHERE recipe.{key} IS NOT NULL
                       AND NOT EXISTS (
                         SELECT 1 FROM {table} AS brew WHERE brew.{recipe_id} = recipe.{key}
                       )
                     ORDER BY recipe.{key} ASC"
                )
            }),
        }
    }
}

impl SqliteHistoryStore {
    pub fn open(path: &Path, schema: HistorySchema) -> Result<Self> {
        schema
            .validate()
            .map_err(|err| anyhow!("invalid schema mapping: {err}"))?;

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        let statements = HistoryStatements::render(&schema);
        Ok(Self {
            conn,
            schema,
            statements,
        })
    }

    #[must_use]
    pub fn schema(&self) -> &HistorySchema {
        &self.schema
    }

    /// Creates the history table and its index if they do not exist yet.
    /// Safe to run on every startup.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
                    table_name TEXT NOT NULL,
                    schema_version INTEGER NOT NULL,
                    applied_at TEXT NOT NULL,
                    PRIMARY KEY (table_name, schema_version)
                );"
            ))
            .context("failed to ensure migrations table exists")?;

        if let Some(reference) = &self.schema.recipe_reference {
            ensure_recipe_reference_compatibility(&self.conn, reference)?;
        }

        self.conn
            .execute_batch(&render_history_schema(&self.schema))
            .with_context(|| format!("failed to apply history schema to {}", self.schema.table))?;
        ensure_table_has_columns(&self.conn, &self.schema.table, &self.mapped_columns())?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let inserted = self
            .conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO {MIGRATIONS_TABLE}(table_name, schema_version, applied_at)
                     VALUES (?1, ?2, ?3)"
                ),
                params![
                    self.schema.table,
                    i64::from(self.schema.schema_version),
                    now
                ],
            )
            .context("failed to register history schema migration")?;

        tracing::debug!(
            table = %self.schema.table,
            schema_version = self.schema.schema_version,
            newly_applied = inserted > 0,
            "history schema ready"
        );

        Ok(())
    }

    /// Persists a transient record and writes the assigned identity back into it.
    pub fn insert(&mut self, record: &mut BrewHistoryRecord) -> Result<RecordId> {
        if let Some(existing) = record.id() {
            return Err(anyhow!(
                "record is already persisted as {existing}; insert requires a transient record"
            ));
        }

        if !record.beans_used().is_finite() {
            return Err(anyhow!(
                "beans_used must be a finite number of grams, got {}",
                record.beans_used()
            ));
        }
        let brew_date = format_storage_timestamp(record.brew_date())?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start insert transaction")?;

        tx.execute(
            &self.statements.insert,
            params![
                record.recipe_id().0,
                brew_date,
                record.beans_used(),
                record.notes()
            ],
        )
        .with_context(|| {
            format!(
                "failed to insert brew history for recipe {}",
                record.recipe_id()
            )
        })?;

        let id = RecordId(tx.last_insert_rowid());
        tx.commit().context("failed to commit insert transaction")?;

        record
            .assign_id(id)
            .map_err(|err| anyhow!("failed to assign identity: {err}"))?;

        tracing::debug!(
            record_id = %id,
            recipe_id = %record.recipe_id(),
            table = %self.schema.table,
            "inserted brew history record"
        );

        Ok(id)
    }

    pub fn get(&self, id: RecordId) -> Result<Option<BrewHistoryRecord>> {
        self.conn
            .query_row(&self.statements.select_by_id, params![id.0], parse_history_row)
            .optional()
            .with_context(|| format!("failed to load brew history record {id}"))
    }

    /// Records for one recipe, oldest brew first.
    pub fn list_for_recipe(
        &self,
        recipe_id: RecipeId,
        limit: Option<usize>,
    ) -> Result<Vec<BrewHistoryRecord>> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = match limit {
            Some(raw) => i64::try_from(raw).with_context(|| format!("limit too large: {raw}"))?,
            None => -1,
        };

        let mut stmt = self.conn.prepare(&self.statements.select_by_recipe)?;
        let rows = stmt.query_map(params![recipe_id.0, limit], parse_history_row)?;
        collect_rows(rows)
            .with_context(|| format!("failed to list brew history for recipe {recipe_id}"))
    }

    /// Returns whether a row was removed.
    pub fn delete(&mut self, id: RecordId) -> Result<bool> {
        let removed = self
            .conn
            .execute(&self.statements.delete_by_id, params![id.0])
            .with_context(|| format!("failed to delete brew history record {id}"))?;

        tracing::debug!(
            record_id = %id,
            removed = removed > 0,
            table = %self.schema.table,
            "deleted brew history record"
        );

        Ok(removed > 0)
    }

    /// Brew count, total beans and latest brew per recipe, most brewed first.
    pub fn recipe_summary(&self) -> Result<Vec<RecipeBrewSummary>> {
        let mut stmt = self.conn.prepare(&self.statements.recipe_summary)?;
        let rows = stmt.query_map([], parse_summary_row)?;
        collect_rows(rows).context("failed to summarize brew history by recipe")
    }

    /// Recipes in the referenced recipe table that have never been brewed.
    /// `None` when the mapping has no recipe reference.
    pub fn unused_recipes(&self) -> Result<Option<Vec<RecipeId>>> {
        let Some(sql) = &self.statements.unused_recipes else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0).map(RecipeId))?;
        collect_rows(rows)
            .map(Some)
            .context("failed to list unused recipes")
    }

    pub fn summary(&self) -> Result<HistorySummary> {
        let summary = HistorySummary::from_recipes(self.recipe_summary()?, self.unused_recipes()?);

        tracing::debug!(
            total_brews = summary.total_brews,
            recipes = summary.recipes.len(),
            table = %self.schema.table,
            "summarized brew history"
        );

        Ok(summary)
    }

    fn mapped_columns(&self) -> Vec<&str> {
        let mut columns = vec![self.schema.id_column.as_str()];
        columns.extend(self.schema.data_columns());
        columns
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// DDL for the history table described by `schema`.
#[must_use]
pub fn render_history_schema(schema: &HistorySchema) -> String {
    let table = quoted(&schema.table);
    let id = quoted(&schema.id_column);
    let [recipe_id, brew_date, beans_used, notes] = schema.data_columns().map(quoted);
    let index = quoted(&format!("idx_{}_recipe_brew_date", schema.table));

    let foreign_key = schema
        .recipe_reference
        .as_ref()
        .map(|reference| {
            format!(
                ",\n  FOREIGN KEY ({recipe_id}) REFERENCES {}({})",
                quoted(&reference.table),
                quoted(&reference.column)
            )
        })
        .unwrap_or_default();

    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
  {id} INTEGER PRIMARY KEY AUTOINCREMENT,
  {recipe_id} INTEGER NOT NULL,
  {brew_date} TEXT NOT NULL,
  {beans_used} REAL NOT NULL,
  {notes} TEXT{foreign_key}
);

CREATE INDEX IF NOT EXISTS {index}
  ON {table}({recipe_id}, {brew_date});
"
    )
}

fn format_storage_timestamp(value: OffsetDateTime) -> Result<String> {
    let value = value.to_offset(UtcOffset::UTC);
    if !STORABLE_YEARS.contains(&value.year()) {
        return Err(anyhow!(
            "brew_date year {} is outside the storable range 0000-9999",
            value.year()
        ));
    }

    value
        .format(STORAGE_TIMESTAMP_FORMAT)
        .context("failed to format brew_date for storage")
}

fn brew_date_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(idx)?;
    parse_rfc3339_utc(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid brew_date {raw}: {err}"),
            )),
        )
    })
}

fn parse_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BrewHistoryRecord> {
    Ok(BrewHistoryRecord::restore(
        RecordId(row.get(0)?),
        RecipeId(row.get(1)?),
        brew_date_at(row, 2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn parse_summary_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecipeBrewSummary> {
    let brew_count: i64 = row.get(1)?;
    let brew_count = u64::try_from(brew_count).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid brew count: {brew_count}"),
            )),
        )
    })?;

    Ok(RecipeBrewSummary {
        recipe_id: RecipeId(row.get(0)?),
        brew_count,
        total_beans_used: row.get(2)?,
        last_brew_date: brew_date_at(row, 3)?,
    })
}

fn ensure_recipe_reference_compatibility(
    conn: &Connection,
    reference: &RecipeReference,
) -> Result<()> {
    if !table_exists(conn, &reference.table)? {
        return Err(anyhow!(
            "recipe reference check failed: expected table {}",
            reference.table
        ));
    }

    ensure_table_has_columns(conn, &reference.table, &[reference.column.as_str()])?;
    ensure_unique_key(conn, &reference.table, &reference.column)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let available = table_columns(conn, table_name)?;

    for required in columns {
        if !available
            .iter()
            .any(|(candidate, _)| candidate.eq_ignore_ascii_case(required))
        {
            return Err(anyhow!(
                "schema check failed: missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}

/// `(name, primary key position)` for every column of `table_name`.
fn table_columns(conn: &Connection, table_name: &str) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quoted(table_name)))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push((row.get::<_, String>(1)?, row.get::<_, i64>(5)?));
    }

    Ok(columns)
}

/// A foreign key parent must be the sole primary key or carry a single-column unique index.
fn ensure_unique_key(conn: &Connection, table_name: &str, column: &str) -> Result<()> {
    let columns = table_columns(conn, table_name)?;
    let primary_key: Vec<&str> = columns
        .iter()
        .filter(|(_, pk)| *pk > 0)
        .map(|(name, _)| name.as_str())
        .collect();
    if primary_key.len() == 1 && primary_key[0].eq_ignore_ascii_case(column) {
        return Ok(());
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA index_list({})", quoted(table_name)))
        .with_context(|| format!("failed to inspect index_list for {table_name}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let index_name: String = row.get(1)?;
        let is_unique: i64 = row.get(2)?;
        if is_unique != 1 {
            continue;
        }

        let indexed_columns = index_columns(conn, &index_name)?;
        if let [only] = indexed_columns.as_slice() {
            if only.eq_ignore_ascii_case(column) {
                return Ok(());
            }
        }
    }

    Err(anyhow!(
        "recipe reference check failed: expected PRIMARY KEY or UNIQUE({column}) on {table_name}"
    ))
}

fn index_columns(conn: &Connection, index_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_info({})", quoted(index_name)))
        .with_context(|| format!("failed to inspect index_info for {index_name}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(2)?);
    }

    Ok(columns)
}

fn quoted(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

/// Creates a bare recipe table (if missing) and a row for `recipe_id`, so a
/// history store with a recipe reference has something to point at.
pub fn seed_minimal_recipe(
    conn: &Connection,
    reference: &RecipeReference,
    recipe_id: RecipeId,
) -> Result<()> {
    let table = quoted(&reference.table);
    let column = quoted(&reference.column);

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            {column} INTEGER PRIMARY KEY,
            name TEXT NOT NULL DEFAULT ''
         );"
    ))
    .context("failed to create minimal recipe table")?;

    conn.execute(
        &format!("INSERT OR IGNORE INTO {table}({column}) VALUES (?1)"),
        params![recipe_id.0],
    )
    .context("failed to seed recipe row")?;

    Ok(())
}
