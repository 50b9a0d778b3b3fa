//! End-to-end pipeline tests against a real store on disk.

mod common;

mod build_tests;
mod dynamic_tests;
mod history_tests;
#[cfg(unix)]
mod plan_file_tests;
