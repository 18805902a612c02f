pub mod cascade;
pub mod config;
pub mod destination;
pub mod engine;
pub mod error;
pub mod io;
pub mod logging;
pub mod model;
pub mod normalize;
pub mod plan;
pub mod schema;
pub mod upsert;

pub use error::{Result, SyncError};
