//! Core library for the pmis-sync command line application.
//!
//! The library reconciles a PMIS workbook into a PostgreSQL database in one
//! direction. Workbook reading lives under [`pmis::sync::io`], the data
//! representations inside [`pmis::sync::model`], schema reflection in
//! [`pmis::sync::schema`], and the per-table planning and writing in
//! [`pmis::sync::plan`] and [`pmis::sync::upsert`]. [`pmis::sync::engine`]
//! ties them together and runs the orphan cascade last.

pub mod pmis;

pub use pmis::sync::{
    Result, SyncError, cascade, config, destination, engine, error, io, logging, model, normalize,
    plan, schema, upsert,
};
