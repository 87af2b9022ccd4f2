use std::{fs, sync::Arc};
use teloxide::{dptree::deps, prelude::*};
use tokio::sync::watch;

use crate::{
    actions::reapply_media_bans_spinloop,
    app::App,
    broadcast::{BroadcastLoop, Shutdown},
    config::Config,
    database::Database,
    handlers::{generate_bot_commands, ReportingErrorHandler},
    transport::TelegramTransport,
};

/// # Panics
///
/// Panics if there's no key file, or the config or the database are broken.
pub async fn entry() {
    log::info!("ASYNC WOOOO");
    let key = fs::read_to_string(match cfg!(debug_assertions) {
        true => "key_debug",
        false => "key",
    })
    .expect("Could not load bot key file!");

    let config = Config::load().expect("Could not load the config!");

    let bot = Bot::new(key.trim());

    bot.set_my_commands(generate_bot_commands())
        .await
        .expect("Failed to set bot commands!");

    let database: Arc<Database> = Database::new(&config.database_path)
        .await
        .expect("Failed to create database!");

    // Dropping the sender tells the background loops to stop.
    let (shutdown_sender, shutdown_receiver) = watch::channel(());

    let media_bans = tokio::spawn(reapply_media_bans_spinloop(
        bot.clone(),
        database.clone(),
        Shutdown::new(shutdown_receiver.clone()),
    ));

    let broadcast = BroadcastLoop::new(
        database.clone(),
        database.clone(),
        Arc::new(TelegramTransport::new(bot.clone())),
        database.clone(),
        config.broadcast.settings(),
        shutdown_receiver,
    );
    let broadcast = tokio::spawn(broadcast.run());

    let app = Arc::new(App::new(config, database.clone()));

    log::info!("Creating the handler...");

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(crate::handlers::handle_message));

    log::info!("Dispatching the dispatcher!");

    Dispatcher::builder(bot, handler)
        .default_handler(|_| async {})
        .error_handler(ReportingErrorHandler::new(database))
        .dependencies(deps![app])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    log::info!("it appears we have been bonked.");

    drop(shutdown_sender);
    if let Err(e) = broadcast.await {
        log::error!("Broadcast loop died: {e}");
    }
    if let Err(e) = media_bans.await {
        log::error!("Media ban loop died: {e}");
    }
}
