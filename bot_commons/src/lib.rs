//! Things every bot in this workspace needs: starting up the logger and
//! the runtime, and poking at chat members and mentions.

use std::future::Future;

use teloxide::prelude::*;

pub mod mentions;

/// Log filter to use: `RUST_LOG` if it's set to anything, `default_filter` otherwise.
fn pick_log_filter(from_env: Option<String>, default_filter: &str) -> String {
    from_env
        .filter(|x| !x.trim().is_empty())
        .unwrap_or_else(|| default_filter.to_string())
}

/// Set up [pretty_env_logger][] with the given filter.
///
/// [pretty_env_logger]: https://docs.rs/pretty_env_logger
fn init_logging(filter: &str) {
    // journald stamps lines on its own.
    let mut builder = if std::env::var_os("JOURNAL_STREAM").is_some() {
        pretty_env_logger::formatted_builder()
    } else {
        pretty_env_logger::formatted_timed_builder()
    };

    builder.parse_filters(filter);

    if builder.try_init().is_err() {
        log::error!("Logger was already set up, keeping the old one");
    }
}

/// Start logging and run `bot` to completion in a multithreaded tokio runtime.
///
/// `default_filter` is the log filter, in `env_logger` syntax like
/// `"warn,my_bot=debug"`, used unless `RUST_LOG` overrides it.
///
/// # Panics
///
/// Panics if the tokio runtime could not be built.
pub fn start_everything(default_filter: &str, bot: impl Future<Output = ()>) {
    let filter = pick_log_filter(std::env::var("RUST_LOG").ok(), default_filter);
    init_logging(&filter);

    log::info!("Starting up with log filter \"{filter}\"");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build the tokio runtime!")
        .block_on(bot);
}

/// Returns `true` if the user is the owner or an administrator of the chat.
pub async fn is_chat_admin(
    bot: &Bot,
    chat: ChatId,
    user: UserId,
) -> Result<bool, teloxide::RequestError> {
    let member = bot.get_chat_member(chat, user).await?;
    Ok(member.kind.is_privileged())
}
