//! The built-in analysis items: the plumbing every run needs, and the leaf
//! analyses selectable from the command line.

pub mod burndown;
pub mod couples;
pub mod devs;
pub mod file_history;
pub mod plumbing;
pub mod shotness;
pub mod typos;
