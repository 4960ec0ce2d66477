//! Jobs: independent units of work run against a [`Database`].

use crate::database::Database;
use crate::error::Error;

/// A synchronous unit of work.
///
/// Jobs hold their parameters and are run through [`Database::run`] or
/// directly. Everything they need comes from the database handle.
pub trait Job {
    /// Result of a successful run.
    type Output;

    /// Run the job to completion (or until its own bound is reached).
    fn run(&self, db: &Database) -> Result<Self::Output, Error>;
}
