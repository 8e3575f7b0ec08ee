pub mod commands;
pub mod cycle;
pub mod discord;
pub mod messenger;
pub mod notification;
pub mod scheduler;
pub mod settings;
#[cfg(test)]
mod testing;
pub mod timetable;
