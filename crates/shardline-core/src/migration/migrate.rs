//! The `Migrate` job.

use serde::Serialize;

use super::mover::Plan;
use crate::database::Database;
use crate::error::Error;
use crate::job::Job;
use crate::value::Value;

/// Move a segment to its draft topology in one pass.
#[derive(Debug, Clone)]
pub struct Migrate {
    /// Segment name.
    pub name: String,
    /// Rows per page; the database default when `None`.
    pub page_size: Option<usize>,
}

/// Outcome of a [`Migrate`] run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrateResult {
    /// Segment name.
    pub name: String,
    /// Version migrated from.
    pub from: u64,
    /// Version now ready.
    pub to: u64,
    /// Rows copied.
    pub rows: usize,
    /// Captured changes replayed.
    pub changes: usize,
}

impl Migrate {
    /// Migrate the named segment.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            page_size: None,
        }
    }

    /// Set the page size.
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size.max(1));
        self
    }
}

impl Job for Migrate {
    type Output = MigrateResult;

    fn run(&self, db: &Database) -> Result<MigrateResult, Error> {
        let plan = Plan::prepare(db, &self.name)?;
        let page_size = self.page_size.unwrap_or(db.config().page_size);

        let mut rows = 0;
        for source in &plan.sources {
            for table in plan.segment.tables() {
                let mut after = Value::Null;
                while let Some((last, count)) = plan.copy_page(source, &table, &after, page_size)? {
                    rows += count;
                    after = last;
                    if count < page_size {
                        break;
                    }
                }
            }
        }

        let changes = plan.drain()?;
        let pending = plan.pending()?;
        if pending > 0 {
            return Err(Error::MigrationChangesNotApplied { count: pending });
        }
        let (next, replayed) = plan.finalize()?;
        Ok(MigrateResult {
            name: self.name.clone(),
            from: plan.current.version,
            to: next.version,
            rows,
            changes: changes + replayed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::registry::{EntityRef, FieldDef, FieldType, Model, Registry, Segment};
    use crate::row;
    use crate::topology::{Configure, Topology, TopologyStatus};
    use crate::value::Row;

    fn open(storages: usize) -> Database {
        let mut registry = Registry::new();
        registry
            .register(
                Segment::new("app", "posts")
                    .with_model(
                        Model::new("Post").with_field(FieldDef::new("title", FieldType::String)),
                    )
                    .with_model(
                        Model::new("Comment")
                            .with_field(FieldDef::new("post", FieldType::Int))
                            .with_key_field("post"),
                    ),
            )
            .unwrap();
        let db = Database::open(DatabaseConfig::default().with_page_size(3), registry).unwrap();
        for i in 0..storages {
            db.register_storage("memory", &format!("m{}", i), 1).unwrap();
        }
        db
    }

    #[test]
    fn test_requires_two_versions() {
        let db = open(2);
        assert!(matches!(
            db.run(&Migrate::new("posts")),
            Err(Error::InsufficientTopology(_))
        ));
        db.run(&Configure::new("posts")).unwrap();
        assert!(matches!(
            db.run(&Migrate::new("posts")),
            Err(Error::InsufficientTopology(_))
        ));
    }

    #[test]
    fn test_migrate_reshards_every_table() {
        let db = open(4);
        let posts = EntityRef::class("Post");
        let comments = EntityRef::class("Comment");
        for i in 1..=7i64 {
            db.create(&posts, row! { "id" => i, "title" => format!("post {}", i) })
                .unwrap();
            db.create(&comments, row! { "id" => i, "post" => i % 3 }).unwrap();
        }
        db.run(&Configure::new("posts").shards(2)).unwrap();

        let result = db.run(&Migrate::new("posts")).unwrap();
        assert_eq!(result.from, 1);
        assert_eq!(result.to, 2);
        assert_eq!(result.rows, 14);

        let current = Topology::current(db.core().as_ref(), "posts").unwrap().unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(
            Topology::find_version(db.core().as_ref(), "posts", 1)
                .unwrap()
                .unwrap()
                .status,
            TopologyStatus::Stale
        );

        assert_eq!(db.find(&posts, &Row::new()).unwrap().len(), 7);
        let found = db.find(&comments, &row! { "post" => 2 }).unwrap();
        assert_eq!(found.len(), 2);
        let post = db.find_one(&posts, &row! { "id" => 5 }).unwrap().unwrap();
        assert_eq!(post["title"], Value::from("post 5"));

        // the draft is gone, migrating again has nothing to do
        assert!(matches!(
            db.run(&Migrate::new("posts")),
            Err(Error::TopologyNotDraft { .. })
        ));
    }
}
