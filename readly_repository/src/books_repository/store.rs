use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;

use crate::api::{
    Book, BookId, Dictionary, DictionaryEntry, ReadingHistory, ReadingStatus, UserId,
};
use crate::books_repository::BookRepositoryError;

/// How many times a unit of work is attempted when it keeps losing races
pub const MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Eq, PartialEq)]
/// Row of the books table. Author and publisher are kept by name, not by id
pub struct BookRow {
    pub id: BookId,
    pub title: String,
    pub description: Option<String>,
    pub cover_image_url: Option<String>,
    pub url: Option<String>,
    pub author_name: Option<String>,
    pub publisher_name: Option<String>,
    pub publish_date: Option<DateTime<Utc>>,
    pub isbn: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BookRow {
    pub fn into_book(self, genres: Vec<String>) -> Book {
        Book {
            id: self.id,
            title: self.title,
            genres,
            description: self.description,
            cover_image_url: self.cover_image_url,
            url: self.url,
            author_name: self.author_name,
            publisher_name: self.publisher_name,
            publish_date: self.publish_date,
            isbn: self.isbn,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct NewBook {
    pub title: String,
    pub description: Option<String>,
    pub cover_image_url: Option<String>,
    pub url: Option<String>,
    pub author_name: Option<String>,
    pub publisher_name: Option<String>,
    pub publish_date: Option<DateTime<Utc>>,
    pub isbn: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewReadingHistory {
    pub user_id: UserId,
    pub book_id: BookId,
    pub status: ReadingStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReadingHistoryUpdate {
    pub user_id: UserId,
    pub book_id: BookId,
    pub status: ReadingStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

/// Point reads and writes against the normalized tables.
///
/// A missing row is reported as `None` (or zero affected rows), never as an error,
/// so callers can tell "not there" apart from a failing storage engine.
#[async_trait::async_trait]
pub trait Queries: Send + Sync {
    async fn get_dictionary_entry(
        &self,
        dictionary: Dictionary,
        name: &str,
    ) -> Result<Option<DictionaryEntry>, BookRepositoryError>;

    /// Inserts the name unless it is already present.
    /// Returns `None` when another writer holds the name
    async fn create_dictionary_entry(
        &self,
        dictionary: Dictionary,
        name: &str,
    ) -> Result<Option<DictionaryEntry>, BookRepositoryError>;

    async fn list_dictionary_entries(
        &self,
        dictionary: Dictionary,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DictionaryEntry>, BookRepositoryError>;

    async fn create_book(&self, book: &NewBook) -> Result<BookRow, BookRepositoryError>;

    async fn get_book_by_id(&self, book_id: BookId)
        -> Result<Option<BookRow>, BookRepositoryError>;

    async fn delete_book(&self, book_id: BookId) -> Result<u64, BookRepositoryError>;

    async fn create_book_genre(
        &self,
        book_id: BookId,
        genre_name: &str,
    ) -> Result<(), BookRepositoryError>;

    /// Genre names linked to the book, ordered by name
    async fn get_genres_by_book_id(
        &self,
        book_id: BookId,
    ) -> Result<Vec<String>, BookRepositoryError>;

    async fn delete_book_genre(
        &self,
        book_id: BookId,
        genre_name: &str,
    ) -> Result<u64, BookRepositoryError>;

    async fn create_reading_history(
        &self,
        history: &NewReadingHistory,
    ) -> Result<ReadingHistory, BookRepositoryError>;

    async fn get_reading_history(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<Option<ReadingHistory>, BookRepositoryError>;

    /// Reading histories of the user ordered by book id, i.e. in registration order
    async fn list_reading_histories_by_user(
        &self,
        user_id: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReadingHistory>, BookRepositoryError>;

    /// Same order as `list_reading_histories_by_user`, restricted to one status
    async fn list_reading_histories_by_user_and_status(
        &self,
        user_id: UserId,
        status: ReadingStatus,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReadingHistory>, BookRepositoryError>;

    async fn update_reading_history(
        &self,
        update: &ReadingHistoryUpdate,
    ) -> Result<Option<ReadingHistory>, BookRepositoryError>;

    async fn delete_reading_history(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<u64, BookRepositoryError>;
}

/// Open transaction. Nothing done through `queries` is visible to others until `commit`.
/// Dropping it without committing discards every write
#[async_trait::async_trait]
pub trait UnitOfWork: Send + Sync {
    fn queries(&self) -> &dyn Queries;

    async fn commit(self: Box<Self>) -> Result<(), BookRepositoryError>;

    async fn rollback(self: Box<Self>) -> Result<(), BookRepositoryError>;
}

/// Storage engine handle injected into the repository
#[async_trait::async_trait]
pub trait BookStore: Send + Sync {
    /// Non transactional handle used for single user scoped reads
    fn queries(&self) -> &dyn Queries;

    async fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, BookRepositoryError>;
}

/// Runs `operation` inside one unit of work.
///
/// Commits when the operation succeeds and rolls back otherwise. When rollback fails
/// as well, both errors are returned together. Retryable failures (lost races on
/// unique names, deadlocks) re-run the whole operation on a fresh unit of work,
/// at most [`MAX_ATTEMPTS`] times.
pub async fn run_atomic<T, F>(store: &dyn BookStore, operation: F) -> Result<T, BookRepositoryError>
where
    T: Send,
    F: for<'u> Fn(&'u dyn Queries) -> BoxFuture<'u, Result<T, BookRepositoryError>> + Send + Sync,
{
    let mut attempt = 1;
    loop {
        let unit = store.begin().await?;
        let outcome = operation(unit.queries()).await;

        let err = match outcome {
            Ok(value) => match unit.commit().await {
                Ok(()) => return Ok(value),
                Err(commit_err) => commit_err,
            },
            Err(err) => {
                if let Err(rollback_err) = unit.rollback().await {
                    tracing::error!(
                        "Rollback failed: {}, original error: {}",
                        rollback_err,
                        err
                    );
                    return Err(BookRepositoryError::RollbackFailed {
                        cause: Box::new(err),
                        rollback: Box::new(rollback_err),
                    });
                }
                err
            }
        };

        if err.is_retryable() && attempt < MAX_ATTEMPTS {
            tracing::warn!(attempt, "Retrying unit of work after conflict: {}", err);
            attempt += 1;
            continue;
        }
        return Err(err);
    }
}
