//! Library-level scenario tests.

mod fail_fast;
mod orchestration;
mod planning;
mod splitting;
