use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;

use crate::books_repository::{
    BookRepository, BookRepositoryImpl, BookStore, InMemoryBookStore, PostgresBookStore,
    PostgresBookStoreConfig,
};

const ENV_PREFIX: &str = "READLY";
const CONFIG_FILE: &str = "readly";

#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
pub struct DatabaseSettings {
    pub hostname: String,
    pub username: String,
    pub password: String,
    pub pool_size: usize,
}

impl From<DatabaseSettings> for PostgresBookStoreConfig {
    fn from(settings: DatabaseSettings) -> Self {
        PostgresBookStoreConfig {
            hostname: settings.hostname,
            username: settings.username,
            password: settings.password,
            pool_size: settings.pool_size,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
pub struct AppConfig {
    pub use_in_memory_db: bool,
    pub log_filter: String,
    pub database: DatabaseSettings,
}

impl AppConfig {
    /// Defaults, overridden by an optional `readly.*` file,
    /// overridden by `READLY__*` environment variables (e.g. `READLY__DATABASE__HOSTNAME`)
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(
            Some(CONFIG_FILE),
            config::Environment::with_prefix(ENV_PREFIX),
        )
    }

    fn load_from(
        config_file: Option<&str>,
        environment: config::Environment,
    ) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("use_in_memory_db", false)?
            .set_default("log_filter", "info")?
            .set_default("database.hostname", "127.0.0.1")?
            .set_default("database.username", "postgres")?
            .set_default("database.password", "postgres")?
            .set_default("database.pool_size", 16)?;

        if let Some(config_file) = config_file {
            builder = builder.add_source(config::File::with_name(config_file).required(false));
        }

        builder
            .add_source(environment.separator("__").try_parsing(true))
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    pub async fn build_book_repository(&self) -> anyhow::Result<Arc<dyn BookRepository>> {
        let store: Arc<dyn BookStore> = if self.use_in_memory_db {
            tracing::info!("Using in-memory book store");
            Arc::new(InMemoryBookStore::default())
        } else {
            Arc::new(
                PostgresBookStore::init(self.database.clone().into())
                    .await
                    .context("Failed to init postgres")?,
            )
        };
        Ok(Arc::new(BookRepositoryImpl::new(store)))
    }
}
