//! Merging iterator integration tests

mod property_tests;
