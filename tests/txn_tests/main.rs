//! Transaction test suite

mod locking_tests;
