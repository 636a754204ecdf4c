//! Scheduled publishing and build-status reconciliation for a multi-tenant
//! site CMS.

pub mod build;
pub mod config;
pub mod context;
pub mod db;
pub mod flags;
pub mod model;
pub mod notify;
pub mod publish;
pub mod scheduler;
pub mod site_build;
pub mod webhook;
