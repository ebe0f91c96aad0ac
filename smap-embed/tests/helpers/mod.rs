//! Test Helper Utilities
//!
//! Shared fixtures and mock collaborators for smap-embed integration tests

#![allow(dead_code)]

pub mod audio_fixtures;
pub mod mocks;

pub use audio_fixtures::{write_corrupt_file, write_test_wav, write_metadata_tsv, AudioFixture};
pub use mocks::{
    test_environment, FetchBehavior, MockFetcher, MockModel, MockSearch, TestEnvironment,
    TEST_EMBEDDING_DIM,
};
