//! Database module: entity models and SQL repositories.
//!
//! This module is split into three submodules:
//! - `model`: view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//! - `error`: the typed failure of the publish transaction.
//!
//! Everything above this layer talks to storage through `site_publisher::db`;
//! no SQL lives outside `repo`.

pub mod error;
pub mod model;
pub mod repo;

pub use repo::*;

pub use error::PublishError;
pub use model::{CoveredResource, DueResource, RecordedBuild, UnnotifiedBuild};
