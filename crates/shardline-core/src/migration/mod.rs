//! Moving data between topology versions while online.
//!
//! Both jobs follow the same steps: prepare the next version's buckets and
//! register the `migration` listener on the current primaries, copy every
//! table page by page ordered by id, replay the changes captured meanwhile
//! and finally promote the next version. [`Upgrade`] persists its position
//! after every page and can be resumed; [`Migrate`] runs in one pass.

mod cursor;
mod migrate;
mod mover;
mod upgrade;

pub use cursor::{MigrationCursor, MIGRATION_TABLE};
pub use migrate::{Migrate, MigrateResult};
pub use upgrade::{Upgrade, UpgradeResult};
