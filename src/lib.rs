//! Marketplace rankings engine
//!
//! Scores and ranks artists, artworks and taxonomy entries over rolling
//! time windows, publishes each ranking set atomically and serves pages
//! through a read-through cache.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod event_processor;
pub mod ranking;

pub use config::Config;
pub use database::Database;
pub use error::{Error, Result};
pub use ranking::{RankingService, RecomputeOrchestrator};
