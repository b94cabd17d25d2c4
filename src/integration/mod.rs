//! End-to-end tests and the media fixtures they run on

pub mod fixtures;

mod e2e;
