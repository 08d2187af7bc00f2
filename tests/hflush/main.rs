//! hflush visibility suite.
//!
//! Each scenario writes a file in sections, calls hflush after every
//! section, and checks that a freshly opened reader sees exactly the
//! flushed prefix before the file is closed.

#[path = "../common/mod.rs"]
mod common;

mod geometry;
mod sections;
mod visibility;
