//! Source code for Antispam Devilbot, a Telegram bot that punishes people for
//! mentioning those who asked not to be mentioned, and sends operator
//! announcements to every chat it's in.

/// Errors of this bot.
mod error;
pub use error::{Error, Result};

/// Optional configuration file.
pub mod config;

/// Interfaces to the things that hold the bot's state.
pub mod store;

/// The database.
pub mod database;

/// Violation accounting and punishment escalation.
pub mod sanctions;

/// Announcement broadcasting.
pub mod broadcast;

/// Who is `@someone`.
pub mod usernames;

/// Sending announcements via Telegram.
pub mod transport;

/// Functions that perform stuff via the bot.
mod actions;

/// Things shared by all update handlers.
mod app;

/// Functions that handle events from Telegram.
mod handlers;

/// Entry function that starts the bot.
mod entry;
pub use entry::*;
