pub mod commands;
pub mod tui;
