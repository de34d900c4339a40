// Integration tests

mod fake_store_test;
mod recovery_test;
mod support;
