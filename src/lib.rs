//! # asset-catalog
//!
//! An in-memory catalog of content assets: which assets exist, where they
//! live, their class and tags, and how packages depend on each other.
//!
//! ## Architecture
//!
//! - **state**: the index itself, records plus lookup maps, package data and the dependency graph
//! - **registry**: the live catalog around a state, with budgeted ingestion and change events
//! - **filter**: query filters and their validation
//! - **dependency**: typed dependency edges between asset identifiers
//! - **manage**: manage-edge propagation from managers to what they reach
//! - **class_tree** / **path_tree**: class inheritance and folder caches used to expand queries
//! - **serialization**: versioned binary catalog format
//! - **scanner**: contract for whatever feeds the registry
//! - **gatherer**: reference scanner over `*.pkg.json` package manifests
//! - **scan_cache**: LMDB cache of parsed manifests keyed by mtime
//! - **config**: TOML configuration and path resolution

pub mod asset;
pub mod class_tree;
pub mod cli;
pub mod config;
pub mod dependency;
pub mod error;
pub mod filter;
pub mod gatherer;
pub mod identifier;
pub mod manage;
pub mod path_tree;
pub mod registry;
pub mod scan_cache;
pub mod scanner;
pub mod serialization;
pub mod state;
