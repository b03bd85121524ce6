//! esdfs shared library.
//!
//! A stackable filesystem that emulates an SD card on top of an arbitrary lower directory,
//! presenting every object with ownership and permissions derived from its position in the tree
//! and from the installed package list.

pub mod control;
pub mod cred;
pub mod derive;
pub mod drop_ward;
/// Stacked filesystem core and its FUSE bridge.
pub mod fs;
pub mod link;
pub mod lower;
pub mod options;
pub mod pkgdb;
/// Synchronization shims for loom model checking.
pub mod sync;
