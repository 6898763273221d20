#![forbid(unsafe_code)]

pub mod chat;
pub mod health;
pub mod notifier;
pub mod overlay;
