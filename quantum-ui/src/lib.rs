pub mod app;
pub mod commands;
pub mod editor;
pub mod error;
pub mod event_bus;
pub mod events;
pub mod explorer;
pub mod git;
pub mod keybindings;
pub mod search;
pub mod session;
pub mod settings;
pub mod status_bar;
pub mod terminal;

#[cfg(test)]
mod testing;
