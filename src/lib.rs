//! strata analyses the commit history of a Git repository and produces
//! quantitative reports about how code, authorship, and team activity evolved
//! over time.
//!
//! The crate is organised around a commit-DAG execution engine:
//!
//! - [`planner`] linearises a possibly-forked commit graph into an ordered
//!   *run-plan* of emerge/commit/fork/merge/delete actions, with optional
//!   hibernate/boot pairs around idle branches;
//! - [`pipeline`] drives a plan through an ordered dependency graph of
//!   stateful *analysis items*, forking and merging their per-branch
//!   instances as the plan dictates;
//! - [`attribution`] maintains, for every live line of every file, the
//!   `(author, tick)` pair that last touched it; most of the built-in
//!   analyses consume its output;
//! - [`hibernation`] spills idle branch state to bound memory on large
//!   histories.
//!
//! The built-in analyses live under [`items`]; everything they know about the
//! engine flows through the [`item::AnalysisItem`] contract and the
//! per-commit bag.

pub mod attribution;
pub mod blobs;
pub mod commits;
pub mod dag;
pub mod errors;
pub mod extractor;
pub mod hibernation;
pub mod identity;
pub mod item;
pub mod items;
pub mod line_index;
pub mod pipeline;
pub mod plan;
pub mod planner;
pub mod progress;
pub mod registry;
pub mod report;
pub mod ticks;
pub mod tree_changes;
