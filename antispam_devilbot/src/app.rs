use std::sync::Arc;

use crate::{
    config::Config, database::Database, sanctions::SanctionEngine, usernames::UsernameCache,
};

/// Everything the update handlers need, built once on startup.
pub struct App {
    pub config: Config,
    pub database: Arc<Database>,
    pub engine: SanctionEngine<Database>,
    pub usernames: UsernameCache<Database>,
}

impl App {
    pub fn new(config: Config, database: Arc<Database>) -> Self {
        Self {
            engine: SanctionEngine::new(database.clone()),
            usernames: UsernameCache::new(database.clone(), config.username_cache_capacity),
            config,
            database,
        }
    }
}
