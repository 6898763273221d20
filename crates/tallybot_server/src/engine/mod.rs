#![forbid(unsafe_code)]

pub mod cache_backend;
pub mod commands;
pub mod connections;
pub mod eligibility;
pub mod eligibility_cache;
pub mod milestones;
pub mod monitoring;
pub mod rules;
pub mod sinks;
pub mod subscriptions;

#[cfg(test)]
mod fakes;

#[cfg(test)]
mod commands_tests;






#[cfg(test)]
mod subscriptions_tests;
