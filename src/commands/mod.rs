//! CLI subcommand implementations

pub mod check_config;
pub mod run;
pub mod status;
