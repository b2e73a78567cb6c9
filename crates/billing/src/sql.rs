//! Partial-update SQL assembly
//!
//! Provider events carry whatever fields they carry, so subscription
//! updates are partial by nature. `UpdateBuilder` compiles an ordered list
//! of column/value pairs into `$n` placeholders; the set of updatable
//! columns stays fixed and explicit at each call site.

use time::OffsetDateTime;
use uuid::Uuid;

/// A value bindable into a compiled update statement.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Text(String),
    Bool(bool),
    Int(i32),
    Uuid(Uuid),
    Timestamp(OffsetDateTime),
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl From<OffsetDateTime> for SqlValue {
    fn from(v: OffsetDateTime) -> Self {
        SqlValue::Timestamp(v)
    }
}

/// Ordered column/value pairs compiled to a parameterized UPDATE.
#[derive(Debug, Default)]
pub struct UpdateBuilder {
    sets: Vec<(&'static str, SqlValue)>,
}

impl UpdateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one column assignment. Columns are static identifiers chosen
    /// by the call site, never derived from input.
    pub fn set(mut self, column: &'static str, value: impl Into<SqlValue>) -> Self {
        self.sets.push((column, value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Compile the SET clause starting at placeholder `$1`.
    ///
    /// Returns the clause text and the index of the next free placeholder,
    /// so the caller can append its WHERE condition with correct numbering.
    /// `updated_at = NOW()` is always appended; every partial update bumps
    /// the row's timestamp.
    pub fn compile(&self) -> (String, usize) {
        let mut clause = String::from("SET ");
        for (i, (column, _)) in self.sets.iter().enumerate() {
            if i > 0 {
                clause.push_str(", ");
            }
            clause.push_str(column);
            clause.push_str(" = $");
            clause.push_str(&(i + 1).to_string());
        }
        if self.sets.is_empty() {
            clause.push_str("updated_at = NOW()");
        } else {
            clause.push_str(", updated_at = NOW()");
        }
        (clause, self.sets.len() + 1)
    }

    /// Bind the collected values, in order, onto a query.
    pub fn bind_values_as<'q, O>(
        &'q self,
        mut query: sqlx::query::QueryAs<'q, sqlx::Postgres, O, sqlx::postgres::PgArguments>,
    ) -> sqlx::query::QueryAs<'q, sqlx::Postgres, O, sqlx::postgres::PgArguments> {
        for (_, value) in &self.sets {
            query = match value {
                SqlValue::Text(v) => query.bind(v),
                SqlValue::Bool(v) => query.bind(v),
                SqlValue::Int(v) => query.bind(v),
                SqlValue::Uuid(v) => query.bind(v),
                SqlValue::Timestamp(v) => query.bind(v),
            };
        }
        query
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_ordered_placeholders() {
        let builder = UpdateBuilder::new()
            .set("status", "active")
            .set("cancel_at_period_end", false)
            .set("pet_count", 2);
        let (clause, next) = builder.compile();
        assert_eq!(
            clause,
            "SET status = $1, cancel_at_period_end = $2, pet_count = $3, updated_at = NOW()"
        );
        assert_eq!(next, 4);
    }

    #[test]
    fn empty_builder_still_touches_updated_at() {
        let builder = UpdateBuilder::new();
        let (clause, next) = builder.compile();
        assert_eq!(clause, "SET updated_at = NOW()");
        assert_eq!(next, 1);
        assert!(builder.is_empty());
    }

    #[test]
    fn where_clause_numbering_continues_after_sets() {
        let builder = UpdateBuilder::new().set("status", "past_due");
        let (clause, next) = builder.compile();
        let sql = format!(
            "UPDATE subscriptions {clause} WHERE provider_subscription_id = ${next} RETURNING id"
        );
        assert_eq!(
            sql,
            "UPDATE subscriptions SET status = $1, updated_at = NOW() \
             WHERE provider_subscription_id = $2 RETURNING id"
        );
    }
}
