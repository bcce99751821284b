//! Kiln CLI - declarative container image builds.

pub mod commands;
