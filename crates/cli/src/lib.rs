pub mod commands;
pub mod file_logging;
