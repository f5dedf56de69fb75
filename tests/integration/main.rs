//! Integration tests for snapcache

mod cli_tests;
mod common;
mod export_tests;
mod prune_tests;
mod ref_tests;
