//! Cursor-style selects used by paginated reads.

use std::cmp::Ordering;

use crate::value::{Row, Value, ID_FIELD};

/// A single comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `field == value`
    Equals(String, Value),
    /// `field > value`
    GreaterThan(String, Value),
    /// `field < value`
    LessThan(String, Value),
}

impl Condition {
    /// Field the condition applies to.
    pub fn field(&self) -> &str {
        match self {
            Condition::Equals(f, _) | Condition::GreaterThan(f, _) | Condition::LessThan(f, _) => f,
        }
    }

    /// Evaluate against a row. Missing fields compare as null.
    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.get(self.field()).unwrap_or(&Value::Null);
        match self {
            Condition::Equals(_, v) => actual.total_cmp(v) == Ordering::Equal,
            Condition::GreaterThan(_, v) => !actual.is_null() && actual.total_cmp(v) == Ordering::Greater,
            Condition::LessThan(_, v) => !actual.is_null() && actual.total_cmp(v) == Ordering::Less,
        }
    }
}

/// A select over one table: conjunction of conditions, ordered by `id`
/// ascending, optionally limited.
///
/// ```
/// use shardline_core::driver::Select;
///
/// let page = Select::new().where_field("id").greater_than(100).limit(50);
/// assert_eq!(page.limit_value(), Some(50));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Select {
    conditions: Vec<Condition>,
    limit: Option<usize>,
}

/// Pending condition on a field, completed by a comparison.
#[derive(Debug)]
pub struct FieldCondition {
    select: Select,
    field: String,
}

impl Select {
    /// Select every row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a condition on `field`.
    pub fn where_field(self, field: impl Into<String>) -> FieldCondition {
        FieldCondition {
            select: self,
            field: field.into(),
        }
    }

    /// Add a ready-made condition.
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Limit the number of rows returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The configured limit.
    pub fn limit_value(&self) -> Option<usize> {
        self.limit
    }

    /// Conditions in declaration order.
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Whether a row satisfies every condition.
    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }

    /// Filter, order by id and limit an arbitrary row source.
    ///
    /// Drivers without native range scans use this.
    pub fn apply(&self, rows: impl IntoIterator<Item = Row>) -> Vec<Row> {
        let mut selected: Vec<Row> = rows.into_iter().filter(|r| self.matches(r)).collect();
        sort_by_id(&mut selected);
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

impl FieldCondition {
    /// `field == value`
    pub fn equals(self, value: impl Into<Value>) -> Select {
        self.select
            .with_condition(Condition::Equals(self.field, value.into()))
    }

    /// `field > value`
    pub fn greater_than(self, value: impl Into<Value>) -> Select {
        self.select
            .with_condition(Condition::GreaterThan(self.field, value.into()))
    }

    /// `field < value`
    pub fn less_than(self, value: impl Into<Value>) -> Select {
        self.select
            .with_condition(Condition::LessThan(self.field, value.into()))
    }
}

/// Sort rows by `id` ascending.
pub fn sort_by_id(rows: &mut [Row]) {
    rows.sort_by(|a, b| {
        let a = a.get(ID_FIELD).unwrap_or(&Value::Null);
        let b = b.get(ID_FIELD).unwrap_or(&Value::Null);
        a.total_cmp(b)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;

    #[test]
    fn test_select_page() {
        let rows: Vec<Row> = (1..=10).rev().map(|i| row! { "id" => i, "even" => i % 2 == 0 }).collect();

        let page = Select::new().where_field("id").greater_than(3).limit(4).apply(rows.clone());
        let ids: Vec<i64> = page.iter().map(|r| r["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![4, 5, 6, 7]);

        let evens = Select::new()
            .where_field("even")
            .equals(true)
            .where_field("id")
            .less_than(7)
            .apply(rows);
        let ids: Vec<i64> = evens.iter().map(|r| r["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![2, 4, 6]);
    }

    #[test]
    fn test_null_never_in_range() {
        let r = row! { "id" => 1 };
        assert!(!Condition::GreaterThan("score".into(), Value::Int(-5)).matches(&r));
        assert!(!Condition::LessThan("score".into(), Value::Int(5)).matches(&r));
        assert!(Condition::Equals("score".into(), Value::Null).matches(&r));
    }
}
