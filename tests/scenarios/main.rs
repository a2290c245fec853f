//! Scenario tests for pipeline execution


mod aggregation;
mod async_flow;
mod conditions;
mod error_policy;
mod failures;
mod loops;
mod nested;
mod shaping;
