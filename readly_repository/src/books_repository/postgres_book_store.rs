use anyhow::Context;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::{Client, NoTls, Row, Statement};

use crate::api::{BookId, Dictionary, DictionaryEntry, ReadingHistory, ReadingStatus, UserId};
use crate::books_repository::{
    BookRepositoryError, BookRow, BookStore, NewBook, NewReadingHistory, Queries,
    ReadingHistoryUpdate, UnitOfWork,
};

const BOOK_COLUMNS: &str = "id, title, description, cover_image_url, url, author_name, \
     publisher_name, published_date, isbn, created_at, updated_at";

const HISTORY_COLUMNS: &str =
    "user_id, book_id, status, start_date, end_date, created_at, updated_at";

const SCHEMA: &str = "
        CREATE TABLE IF NOT EXISTS authors (
            id              BIGSERIAL PRIMARY KEY,
            name            VARCHAR(255) NOT NULL UNIQUE,
            created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
            );
        CREATE TABLE IF NOT EXISTS publishers (
            id              BIGSERIAL PRIMARY KEY,
            name            VARCHAR(255) NOT NULL UNIQUE,
            created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
            );
        CREATE TABLE IF NOT EXISTS genres (
            id              BIGSERIAL PRIMARY KEY,
            name            VARCHAR(255) NOT NULL UNIQUE,
            created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
            );
        CREATE TABLE IF NOT EXISTS books (
            id              BIGSERIAL PRIMARY KEY,
            title           VARCHAR(255) NOT NULL,
            description     TEXT,
            cover_image_url TEXT,
            url             TEXT,
            author_name     VARCHAR(255),
            publisher_name  VARCHAR(255),
            published_date  TIMESTAMPTZ,
            isbn            VARCHAR(32),
            created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
            );
        CREATE TABLE IF NOT EXISTS book_genres (
            book_id         BIGINT NOT NULL REFERENCES books (id),
            genre_name      VARCHAR(255) NOT NULL REFERENCES genres (name),
            PRIMARY KEY (book_id, genre_name)
            );
        CREATE TABLE IF NOT EXISTS reading_histories (
            user_id         BIGINT NOT NULL,
            book_id         BIGINT NOT NULL REFERENCES books (id),
            status          VARCHAR(16) NOT NULL CHECK (status IN ('unread', 'reading', 'read')),
            start_date      TIMESTAMPTZ,
            end_date        TIMESTAMPTZ,
            created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (user_id, book_id)
            );
        ";

pub struct PostgresBookStoreConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
    /// Upper bound of connections held by units of work, further callers wait for one
    pub pool_size: usize,
}

impl PostgresBookStoreConfig {
    fn connection_str(&self) -> String {
        format!(
            "postgresql://{}:{}@{}",
            self.username, self.password, self.hostname
        )
    }
}

/// Store backed by postgres. Reads share one connection, every unit of work
/// runs its transaction on a connection taken from a bounded pool
pub struct PostgresBookStore {
    client: Client,
    pool: Pool,
}

async fn connect(connection_str: &str) -> Result<Client, tokio_postgres::Error> {
    let (client, connection) = tokio_postgres::connect(connection_str, NoTls).await?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("connection error: {}", e);
        }
    });

    Ok(client)
}

impl PostgresBookStore {
    pub async fn init(config: PostgresBookStoreConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(config.pool_size > 0, "Pool size must be at least 1");
        tracing::info!(
            "Connecting to postgres at {} as {}, pool size {}",
            config.hostname,
            config.username,
            config.pool_size
        );
        let connection_str = config.connection_str();
        let client = connect(&connection_str)
            .await
            .context("Failed to start postgres")?;

        client
            .batch_execute(SCHEMA)
            .await
            .context("Failed to setup tables")?;

        let pg_config: tokio_postgres::Config = connection_str
            .parse()
            .context("Invalid postgres connection string")?;
        // A unit of work dropped mid transaction hands its connection back with the
        // transaction still open, recycling rolls it back before the next checkout
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Custom("ROLLBACK".to_string()),
            },
        );
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .context("Failed to build connection pool")?;

        Ok(Self { client, pool })
    }
}

struct PostgresUnitOfWork {
    client: deadpool_postgres::Object,
}

#[async_trait::async_trait]
impl BookStore for PostgresBookStore {
    fn queries(&self) -> &dyn Queries {
        &self.client
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, BookRepositoryError> {
        // waits while every pooled connection is taken
        let client = self.pool.get().await?;
        client.batch_execute("BEGIN").await?;
        Ok(Box::new(PostgresUnitOfWork { client }))
    }
}

#[async_trait::async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    fn queries(&self) -> &dyn Queries {
        &**self.client
    }

    async fn commit(self: Box<Self>) -> Result<(), BookRepositoryError> {
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), BookRepositoryError> {
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }
}

fn dictionary_entry(row: &Row) -> Result<DictionaryEntry, BookRepositoryError> {
    Ok(DictionaryEntry {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn book_row(row: &Row) -> Result<BookRow, BookRepositoryError> {
    Ok(BookRow {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        cover_image_url: row.try_get("cover_image_url")?,
        url: row.try_get("url")?,
        author_name: row.try_get("author_name")?,
        publisher_name: row.try_get("publisher_name")?,
        publish_date: row.try_get("published_date")?,
        isbn: row.try_get("isbn")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn reading_history(row: &Row) -> Result<ReadingHistory, BookRepositoryError> {
    let status: String = row.try_get("status")?;
    Ok(ReadingHistory {
        user_id: row.try_get("user_id")?,
        book_id: row.try_get("book_id")?,
        status: status.parse().map_err(BookRepositoryError::InvalidData)?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait::async_trait]
impl Queries for Client {
    async fn get_dictionary_entry(
        &self,
        dictionary: Dictionary,
        name: &str,
    ) -> Result<Option<DictionaryEntry>, BookRepositoryError> {
        let stmt: Statement = self
            .prepare(&format!(
                "SELECT id, name, created_at FROM {} WHERE name = ($1)",
                dictionary.table_name()
            ))
            .await?;

        let rows = self.query(&stmt, &[&name]).await?;
        rows.first().map(dictionary_entry).transpose()
    }

    async fn create_dictionary_entry(
        &self,
        dictionary: Dictionary,
        name: &str,
    ) -> Result<Option<DictionaryEntry>, BookRepositoryError> {
        // Waits for a concurrent insert of the same name and then inserts nothing
        let stmt: Statement = self
            .prepare(&format!(
                "INSERT INTO {} (name) VALUES ($1) ON CONFLICT (name) DO NOTHING \
                 RETURNING id, name, created_at",
                dictionary.table_name()
            ))
            .await?;

        let rows = self.query(&stmt, &[&name]).await?;
        rows.first().map(dictionary_entry).transpose()
    }

    async fn list_dictionary_entries(
        &self,
        dictionary: Dictionary,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DictionaryEntry>, BookRepositoryError> {
        let stmt: Statement = self
            .prepare(&format!(
                "SELECT id, name, created_at FROM {} ORDER BY name LIMIT $1 OFFSET $2",
                dictionary.table_name()
            ))
            .await?;

        let rows = self.query(&stmt, &[&limit, &offset]).await?;
        rows.iter().map(dictionary_entry).collect()
    }

    async fn create_book(&self, book: &NewBook) -> Result<BookRow, BookRepositoryError> {
        let stmt: Statement = self
            .prepare(&format!(
                "INSERT INTO books (title, description, cover_image_url, url, author_name, \
                 publisher_name, published_date, isbn) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {}",
                BOOK_COLUMNS
            ))
            .await?;

        let rows = self
            .query(
                &stmt,
                &[
                    &book.title,
                    &book.description,
                    &book.cover_image_url,
                    &book.url,
                    &book.author_name,
                    &book.publisher_name,
                    &book.publish_date,
                    &book.isbn,
                ],
            )
            .await?;

        book_row(
            rows.first()
                .ok_or_else(|| BookRepositoryError::Other("Id not returned".to_string()))?,
        )
    }

    async fn get_book_by_id(
        &self,
        book_id: BookId,
    ) -> Result<Option<BookRow>, BookRepositoryError> {
        let stmt: Statement = self
            .prepare(&format!("SELECT {} FROM books WHERE id = ($1)", BOOK_COLUMNS))
            .await?;

        let rows = self.query(&stmt, &[&book_id]).await?;
        rows.first().map(book_row).transpose()
    }

    async fn delete_book(&self, book_id: BookId) -> Result<u64, BookRepositoryError> {
        let stmt: Statement = self.prepare("DELETE FROM books WHERE id = ($1)").await?;
        Ok(self.execute(&stmt, &[&book_id]).await?)
    }

    async fn create_book_genre(
        &self,
        book_id: BookId,
        genre_name: &str,
    ) -> Result<(), BookRepositoryError> {
        let stmt: Statement = self
            .prepare("INSERT INTO book_genres (book_id, genre_name) VALUES ($1, $2)")
            .await?;
        self.execute(&stmt, &[&book_id, &genre_name]).await?;
        Ok(())
    }

    async fn get_genres_by_book_id(
        &self,
        book_id: BookId,
    ) -> Result<Vec<String>, BookRepositoryError> {
        let stmt: Statement = self
            .prepare("SELECT genre_name FROM book_genres WHERE book_id = $1 ORDER BY genre_name")
            .await?;
        let rows = self.query(&stmt, &[&book_id]).await?;
        rows.iter().map(|row| Ok(row.try_get(0)?)).collect()
    }

    async fn delete_book_genre(
        &self,
        book_id: BookId,
        genre_name: &str,
    ) -> Result<u64, BookRepositoryError> {
        let stmt: Statement = self
            .prepare("DELETE FROM book_genres WHERE book_id = $1 AND genre_name = $2")
            .await?;
        Ok(self.execute(&stmt, &[&book_id, &genre_name]).await?)
    }

    async fn create_reading_history(
        &self,
        history: &NewReadingHistory,
    ) -> Result<ReadingHistory, BookRepositoryError> {
        let stmt: Statement = self
            .prepare(&format!(
                "INSERT INTO reading_histories (user_id, book_id, status, start_date, end_date) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING {}",
                HISTORY_COLUMNS
            ))
            .await?;

        let rows = self
            .query(
                &stmt,
                &[
                    &history.user_id,
                    &history.book_id,
                    &history.status.as_str(),
                    &history.start_date,
                    &history.end_date,
                ],
            )
            .await?;

        reading_history(
            rows.first()
                .ok_or_else(|| BookRepositoryError::Other("History not returned".to_string()))?,
        )
    }

    async fn get_reading_history(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<Option<ReadingHistory>, BookRepositoryError> {
        let stmt: Statement = self
            .prepare(&format!(
                "SELECT {} FROM reading_histories WHERE user_id = $1 AND book_id = $2",
                HISTORY_COLUMNS
            ))
            .await?;

        let rows = self.query(&stmt, &[&user_id, &book_id]).await?;
        rows.first().map(reading_history).transpose()
    }

    async fn list_reading_histories_by_user(
        &self,
        user_id: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReadingHistory>, BookRepositoryError> {
        let stmt: Statement = self
            .prepare(&format!(
                "SELECT {} FROM reading_histories WHERE user_id = $1 \
                 ORDER BY book_id LIMIT $2 OFFSET $3",
                HISTORY_COLUMNS
            ))
            .await?;

        let rows = self.query(&stmt, &[&user_id, &limit, &offset]).await?;
        rows.iter().map(reading_history).collect()
    }

    async fn list_reading_histories_by_user_and_status(
        &self,
        user_id: UserId,
        status: ReadingStatus,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReadingHistory>, BookRepositoryError> {
        let stmt: Statement = self
            .prepare(&format!(
                "SELECT {} FROM reading_histories WHERE user_id = $1 AND status = $2 \
                 ORDER BY book_id LIMIT $3 OFFSET $4",
                HISTORY_COLUMNS
            ))
            .await?;

        let rows = self
            .query(&stmt, &[&user_id, &status.as_str(), &limit, &offset])
            .await?;
        rows.iter().map(reading_history).collect()
    }

    async fn update_reading_history(
        &self,
        update: &ReadingHistoryUpdate,
    ) -> Result<Option<ReadingHistory>, BookRepositoryError> {
        let stmt: Statement = self
            .prepare(&format!(
                "UPDATE reading_histories \
                 SET status = $3, start_date = $4, end_date = $5, updated_at = now() \
                 WHERE user_id = $1 AND book_id = $2 RETURNING {}",
                HISTORY_COLUMNS
            ))
            .await?;

        let rows = self
            .query(
                &stmt,
                &[
                    &update.user_id,
                    &update.book_id,
                    &update.status.as_str(),
                    &update.start_date,
                    &update.end_date,
                ],
            )
            .await?;
        rows.first().map(reading_history).transpose()
    }

    async fn delete_reading_history(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<u64, BookRepositoryError> {
        let stmt: Statement = self
            .prepare("DELETE FROM reading_histories WHERE user_id = $1 AND book_id = $2")
            .await?;
        Ok(self.execute(&stmt, &[&user_id, &book_id]).await?)
    }
}
