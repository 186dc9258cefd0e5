//! Process utilities.

pub mod bootstrap;
