/// CPU construction, tracing setup and polling helpers.
pub mod harness;
