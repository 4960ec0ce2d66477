//! The resumable `Upgrade` job.

use serde::Serialize;

use super::cursor::MigrationCursor;
use super::mover::Plan;
use crate::database::Database;
use crate::error::Error;
use crate::job::Job;
use crate::value::Value;

/// Move a segment to its draft topology in bounded, resumable steps.
///
/// Each pass copies one page and replays the changes captured so far; the
/// position is saved after every pass. Running out of `iterations` is a
/// pause, not a failure: run the job again to continue.
#[derive(Debug, Clone)]
pub struct Upgrade {
    /// Segment name.
    pub name: String,
    /// Passes per run; unbounded when `None`.
    pub iterations: Option<usize>,
    /// Rows per page; the database default when `None`.
    pub page_size: Option<usize>,
}

/// Outcome of an [`Upgrade`] run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeResult {
    /// Segment name.
    pub name: String,
    /// Target version.
    pub version: u64,
    /// Whether the target version is now ready.
    pub complete: bool,
    /// Rows copied by this run.
    pub rows: usize,
    /// Non-empty pages copied by this run.
    pub pages: usize,
    /// Captured changes replayed by this run.
    pub changes: usize,
}

impl Upgrade {
    /// Upgrade the named segment.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            iterations: None,
            page_size: None,
        }
    }

    /// Bound the passes of one run.
    pub fn iterations(mut self, iterations: usize) -> Self {
        self.iterations = Some(iterations);
        self
    }

    /// Set the page size.
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size.max(1));
        self
    }
}

impl Job for Upgrade {
    type Output = UpgradeResult;

    fn run(&self, db: &Database) -> Result<UpgradeResult, Error> {
        let plan = Plan::prepare(db, &self.name)?;
        let core = db.core();
        let page_size = self.page_size.unwrap_or(db.config().page_size);
        let tables = plan.segment.tables();

        let mut cursor = MigrationCursor::load(core.as_ref(), &self.name, plan.next.version)?
            .unwrap_or_else(|| MigrationCursor::start(self.name.as_str(), plan.next.version));
        let position = plan
            .sources
            .iter()
            .position(|b| b.id == cursor.bucket)
            .zip(tables.iter().position(|t| *t == cursor.table));
        let (mut source, mut table) = match position {
            Some(position) => position,
            None => {
                cursor.key = Value::Null;
                (0, 0)
            }
        };

        let mut result = UpgradeResult {
            name: self.name.clone(),
            version: plan.next.version,
            complete: false,
            rows: 0,
            pages: 0,
            changes: 0,
        };
        let mut finished = plan.sources.is_empty() || tables.is_empty();
        let mut passes = 0;
        while !finished && self.iterations.map_or(true, |limit| passes < limit) {
            passes += 1;
            let bucket = &plan.sources[source];
            cursor.bucket = bucket.id;
            cursor.table = tables[table].clone();

            let copied = plan.copy_page(bucket, &tables[table], &cursor.key, page_size)?;
            let exhausted = match copied {
                Some((last, count)) => {
                    result.rows += count;
                    result.pages += 1;
                    cursor.key = last;
                    count < page_size
                }
                None => true,
            };
            if exhausted {
                if table + 1 < tables.len() {
                    table += 1;
                    cursor.key = Value::Null;
                } else if source + 1 < plan.sources.len() {
                    source += 1;
                    table = 0;
                    cursor.key = Value::Null;
                } else {
                    finished = true;
                }
                if !finished {
                    cursor.bucket = plan.sources[source].id;
                    cursor.table = tables[table].clone();
                }
            }

            result.changes += plan.drain()?;
            cursor.save(core.as_ref())?;
        }

        if finished {
            result.changes += plan.drain()?;
            if plan.pending()? == 0 {
                let (_, replayed) = plan.finalize()?;
                result.changes += replayed;
                cursor.remove(core.as_ref())?;
                result.complete = true;
            }
        }
        tracing::info!(
            segment = %self.name,
            version = result.version,
            complete = result.complete,
            rows = result.rows,
            pages = result.pages,
            changes = result.changes,
            "upgrade run"
        );
        Ok(result)
    }
}
