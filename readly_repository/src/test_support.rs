//! Wrappers injecting storage faults into otherwise healthy stores.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::api::{BookId, Dictionary, DictionaryEntry, ReadingHistory, ReadingStatus, UserId};
use crate::books_repository::{
    BookRepositoryError, BookRow, BookStore, NewBook, NewReadingHistory, Queries,
    ReadingHistoryUpdate, UnitOfWork,
};

pub trait AsQueries: Send + Sync {
    fn as_queries(&self) -> &dyn Queries;
}

impl<'a> AsQueries for &'a dyn Queries {
    fn as_queries(&self) -> &dyn Queries {
        *self
    }
}

impl<'a> AsQueries for Box<dyn UnitOfWork + 'a> {
    fn as_queries(&self) -> &dyn Queries {
        self.queries()
    }
}

/// Delegates to `inner` except for the configured faults
pub struct FaultyQueries<I> {
    inner: I,
    hidden_lookups: AtomicUsize,
    // names looked up once already, `None` when lookups are never stale
    stale_lookups: Option<Mutex<HashSet<(Dictionary, String)>>>,
    failing_genre: Option<String>,
}

impl<I: AsQueries> FaultyQueries<I> {
    /// The first `count` dictionary lookups miss even if the row exists,
    /// the way a concurrent uncommitted insert looks to another transaction
    pub fn hiding_lookups(inner: I, count: usize) -> Self {
        Self {
            inner,
            hidden_lookups: AtomicUsize::new(count),
            stale_lookups: None,
            failing_genre: None,
        }
    }

    /// The first lookup of every name misses, as if the row was committed by another
    /// writer right after it. Later lookups of the name see it
    pub fn stale_first_lookups(inner: I) -> Self {
        Self {
            inner,
            hidden_lookups: AtomicUsize::new(0),
            stale_lookups: Some(Mutex::new(HashSet::new())),
            failing_genre: None,
        }
    }

    /// Linking the given genre to a book fails
    pub fn failing_genre_link(inner: I, genre: &str) -> Self {
        Self {
            inner,
            hidden_lookups: AtomicUsize::new(0),
            stale_lookups: None,
            failing_genre: Some(genre.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl<I: AsQueries> Queries for FaultyQueries<I> {
    async fn get_dictionary_entry(
        &self,
        dictionary: Dictionary,
        name: &str,
    ) -> Result<Option<DictionaryEntry>, BookRepositoryError> {
        let hidden = self
            .hidden_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if hidden {
            return Ok(None);
        }
        if let Some(seen) = &self.stale_lookups {
            if seen.lock().insert((dictionary, name.to_string())) {
                return Ok(None);
            }
        }
        self.inner
            .as_queries()
            .get_dictionary_entry(dictionary, name)
            .await
    }

    async fn create_dictionary_entry(
        &self,
        dictionary: Dictionary,
        name: &str,
    ) -> Result<Option<DictionaryEntry>, BookRepositoryError> {
        self.inner
            .as_queries()
            .create_dictionary_entry(dictionary, name)
            .await
    }

    async fn list_dictionary_entries(
        &self,
        dictionary: Dictionary,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DictionaryEntry>, BookRepositoryError> {
        self.inner
            .as_queries()
            .list_dictionary_entries(dictionary, limit, offset)
            .await
    }

    async fn create_book(&self, book: &NewBook) -> Result<BookRow, BookRepositoryError> {
        self.inner.as_queries().create_book(book).await
    }

    async fn get_book_by_id(
        &self,
        book_id: BookId,
    ) -> Result<Option<BookRow>, BookRepositoryError> {
        self.inner.as_queries().get_book_by_id(book_id).await
    }

    async fn delete_book(&self, book_id: BookId) -> Result<u64, BookRepositoryError> {
        self.inner.as_queries().delete_book(book_id).await
    }

    async fn create_book_genre(
        &self,
        book_id: BookId,
        genre_name: &str,
    ) -> Result<(), BookRepositoryError> {
        if self.failing_genre.as_deref() == Some(genre_name) {
            return Err(BookRepositoryError::Other(format!(
                "injected failure linking genre {}",
                genre_name
            )));
        }
        self.inner
            .as_queries()
            .create_book_genre(book_id, genre_name)
            .await
    }

    async fn get_genres_by_book_id(
        &self,
        book_id: BookId,
    ) -> Result<Vec<String>, BookRepositoryError> {
        self.inner.as_queries().get_genres_by_book_id(book_id).await
    }

    async fn delete_book_genre(
        &self,
        book_id: BookId,
        genre_name: &str,
    ) -> Result<u64, BookRepositoryError> {
        self.inner
            .as_queries()
            .delete_book_genre(book_id, genre_name)
            .await
    }

    async fn create_reading_history(
        &self,
        history: &NewReadingHistory,
    ) -> Result<ReadingHistory, BookRepositoryError> {
        self.inner.as_queries().create_reading_history(history).await
    }

    async fn get_reading_history(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<Option<ReadingHistory>, BookRepositoryError> {
        self.inner
            .as_queries()
            .get_reading_history(user_id, book_id)
            .await
    }

    async fn list_reading_histories_by_user(
        &self,
        user_id: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReadingHistory>, BookRepositoryError> {
        self.inner
            .as_queries()
            .list_reading_histories_by_user(user_id, limit, offset)
            .await
    }

    async fn list_reading_histories_by_user_and_status(
        &self,
        user_id: UserId,
        status: ReadingStatus,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReadingHistory>, BookRepositoryError> {
        self.inner
            .as_queries()
            .list_reading_histories_by_user_and_status(user_id, status, limit, offset)
            .await
    }

    async fn update_reading_history(
        &self,
        update: &ReadingHistoryUpdate,
    ) -> Result<Option<ReadingHistory>, BookRepositoryError> {
        self.inner.as_queries().update_reading_history(update).await
    }

    async fn delete_reading_history(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<u64, BookRepositoryError> {
        self.inner
            .as_queries()
            .delete_reading_history(user_id, book_id)
            .await
    }
}

#[async_trait::async_trait]
impl<'a> UnitOfWork for FaultyQueries<Box<dyn UnitOfWork + 'a>> {
    fn queries(&self) -> &dyn Queries {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), BookRepositoryError> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), BookRepositoryError> {
        self.inner.rollback().await
    }
}

/// Store whose units of work fail to link one particular genre
pub struct FailingGenreLinkStore<S> {
    inner: S,
    genre: String,
}

impl<S: BookStore> FailingGenreLinkStore<S> {
    pub fn new(inner: S, genre: &str) -> Self {
        Self {
            inner,
            genre: genre.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl<S: BookStore> BookStore for FailingGenreLinkStore<S> {
    fn queries(&self) -> &dyn Queries {
        self.inner.queries()
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, BookRepositoryError> {
        let unit = self.inner.begin().await?;
        Ok(Box::new(FaultyQueries::failing_genre_link(unit, &self.genre)))
    }
}

/// Store whose units of work see every dictionary name only on the second lookup,
/// so a name another registration already created takes the lost insert race path
pub struct StaleLookupStore<S> {
    inner: S,
    units_begun: AtomicUsize,
}

impl<S: BookStore> StaleLookupStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            units_begun: AtomicUsize::new(0),
        }
    }

    /// Units of work begun so far
    pub fn units_begun(&self) -> usize {
        self.units_begun.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl<S: BookStore> BookStore for StaleLookupStore<S> {
    fn queries(&self) -> &dyn Queries {
        self.inner.queries()
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, BookRepositoryError> {
        let unit = self.inner.begin().await?;
        self.units_begun.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FaultyQueries::stale_first_lookups(unit)))
    }
}

/// Store whose units of work fail to roll back
pub struct BrokenRollbackStore<S> {
    inner: S,
}

impl<S: BookStore> BrokenRollbackStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

struct BrokenRollbackUnit<'a> {
    inner: Box<dyn UnitOfWork + 'a>,
}

#[async_trait::async_trait]
impl<'a> UnitOfWork for BrokenRollbackUnit<'a> {
    fn queries(&self) -> &dyn Queries {
        self.inner.queries()
    }

    async fn commit(self: Box<Self>) -> Result<(), BookRepositoryError> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), BookRepositoryError> {
        Err(BookRepositoryError::Other("connection lost".to_string()))
    }
}

#[async_trait::async_trait]
impl<S: BookStore> BookStore for BrokenRollbackStore<S> {
    fn queries(&self) -> &dyn Queries {
        self.inner.queries()
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, BookRepositoryError> {
        let inner = self.inner.begin().await?;
        Ok(Box::new(BrokenRollbackUnit { inner }))
    }
}

#[cfg(feature = "postgres_tests")]
pub mod postgres {
    use testcontainers::core::IntoContainerPort;
    use testcontainers::runners::AsyncRunner;
    use testcontainers::{ContainerAsync, GenericImage, ImageExt};

    use crate::books_repository::{PostgresBookStore, PostgresBookStoreConfig};

    pub async fn start_postgres_container_and_init_store(
    ) -> (ContainerAsync<GenericImage>, PostgresBookStore) {
        start_postgres_container_with_pool_size(16).await
    }

    pub async fn start_postgres_container_with_pool_size(
        pool_size: usize,
    ) -> (ContainerAsync<GenericImage>, PostgresBookStore) {
        let _pg_container = GenericImage::new("postgres", "latest")
            .with_mapped_port(5432, 5432.tcp())
            .with_env_var("POSTGRES_USER", "postgres")
            .with_env_var("POSTGRES_PASSWORD", "postgres")
            .start()
            .await
            .expect("Failed to start postgres");

        for _ in 0..10 {
            if let Ok(store) = PostgresBookStore::init(PostgresBookStoreConfig {
                hostname: "127.0.0.1".to_string(),
                username: "postgres".to_string(),
                password: "postgres".to_string(),
                pool_size,
            })
            .await
            {
                return (_pg_container, store);
            }
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        }
        panic!("Failed to setup postgres container")
    }
}
