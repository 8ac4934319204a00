//! Satellite pass ingestion.
//!
//! Classifies decoder output folders into passes, labels their images,
//! and reconciles the result into an SQLite catalog. Runs are gated by a
//! single-flight scheduler with a cooldown and a hard timeout.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod prefs;
pub mod scanner;
pub mod tasks;
