#![allow(dead_code)]

pub mod assertions;
pub mod fixtures;
pub mod logging;

pub use assertions::assert_contains;
pub use fixtures::{HookProject, HookRun};
pub use logging::init_test_logging;
