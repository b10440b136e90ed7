use std::sync::Arc;

use deadpool_postgres::PoolError;
use tokio_postgres::error::SqlState;

pub use in_memory_book_store::InMemoryBookStore;
pub use postgres_book_store::{PostgresBookStore, PostgresBookStoreConfig};
pub use store::{
    run_atomic, BookRow, BookStore, NewBook, NewReadingHistory, Queries, ReadingHistoryUpdate,
    UnitOfWork, MAX_ATTEMPTS,
};

use crate::api::{
    Book, BookId, DeleteRequest, Dictionary, DictionaryEntry, ListByStatusRequest, ListRequest,
    ReadingHistory, RegisterRequest, UpdateReadingStatusRequest, UserId,
};

mod deleter;
mod dictionary;
mod in_memory_book_store;
mod postgres_book_store;
mod reader;
mod store;
mod writer;

#[derive(thiserror::Error, Debug)]
pub enum BookRepositoryError {
    #[error("Book {0} not found")]
    BookNotFound(BookId),

    #[error("Reading history of book {book_id} for user {user_id} not found")]
    ReadingHistoryNotFound { user_id: UserId, book_id: BookId },

    #[error("Conflicting concurrent write: {0}")]
    Conflict(String),

    #[error("Transaction failed: {cause}, rollback failed: {rollback}")]
    RollbackFailed {
        cause: Box<BookRepositoryError>,
        rollback: Box<BookRepositoryError>,
    },

    #[error("Database failure: {}", describe_postgres_error(.0))]
    DatabaseFailure(#[source] tokio_postgres::Error),

    #[error("Connection pool failure: {0}")]
    PoolFailure(#[source] PoolError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid data in storage: {0}")]
    InvalidData(String),

    #[error("Other error {0}")]
    Other(String),
}

impl BookRepositoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BookRepositoryError::BookNotFound(..) | BookRepositoryError::ReadingHistoryNotFound { .. }
        )
    }

    /// True when re-running the whole unit of work may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, BookRepositoryError::Conflict(..))
    }
}

/// Server side errors carry severity, SQLSTATE and message, client side ones only their kind
fn describe_postgres_error(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db_error) => {
            let mut description = format!(
                "{} {}: {}",
                db_error.severity(),
                db_error.code().code(),
                db_error.message()
            );
            if let Some(detail) = db_error.detail() {
                description.push_str(&format!(" ({})", detail));
            }
            description
        }
        None => err.to_string(),
    }
}

impl From<PoolError> for BookRepositoryError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Backend(err) => err.into(),
            other => BookRepositoryError::PoolFailure(other),
        }
    }
}

impl From<tokio_postgres::Error> for BookRepositoryError {
    fn from(err: tokio_postgres::Error) -> Self {
        match err.code() {
            Some(code)
                if code == &SqlState::UNIQUE_VIOLATION
                    || code == &SqlState::T_R_DEADLOCK_DETECTED
                    || code == &SqlState::T_R_SERIALIZATION_FAILURE =>
            {
                BookRepositoryError::Conflict(err.to_string())
            }
            _ => BookRepositoryError::DatabaseFailure(err),
        }
    }
}

#[async_trait::async_trait]
pub trait BookRepository: Send + Sync {
    /// Registers a book for the user together with its genres and an unread reading history.
    /// Either everything is stored or nothing is
    async fn register(&self, request: RegisterRequest) -> Result<Book, BookRepositoryError>;
    /// Retrieves the book aggregate
    async fn get(&self, book_id: BookId) -> Result<Book, BookRepositoryError>;
    /// Lists books the user has registered, paged by limit/offset
    async fn list(&self, request: ListRequest) -> Result<Vec<Book>, BookRepositoryError>;
    /// Lists books the user has in the given reading status, e.g. everything finished
    async fn list_by_status(
        &self,
        request: ListByStatusRequest,
    ) -> Result<Vec<Book>, BookRepositoryError>;
    /// Removes the user's reading history for the book, then the book and its genre links
    async fn delete(&self, request: DeleteRequest) -> Result<(), BookRepositoryError>;
    async fn get_reading_history(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<ReadingHistory, BookRepositoryError>;
    /// Moves the reading history to a new status, e.g. from unread to reading
    async fn update_reading_status(
        &self,
        request: UpdateReadingStatusRequest,
    ) -> Result<ReadingHistory, BookRepositoryError>;
    /// Lists names known to the dictionary, ordered by name
    async fn list_dictionary(
        &self,
        dictionary: Dictionary,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DictionaryEntry>, BookRepositoryError>;
}

pub struct BookRepositoryImpl {
    store: Arc<dyn BookStore>,
}

impl BookRepositoryImpl {
    pub fn new(store: Arc<dyn BookStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl BookRepository for BookRepositoryImpl {
    #[tracing::instrument(
        name = "Register book",
        skip(self, request),
        fields(user_id = request.user_id, title = %request.title)
    )]
    async fn register(&self, request: RegisterRequest) -> Result<Book, BookRepositoryError> {
        writer::register(self.store.as_ref(), request).await
    }

    #[tracing::instrument(name = "Get book", skip(self))]
    async fn get(&self, book_id: BookId) -> Result<Book, BookRepositoryError> {
        reader::get(self.store.queries(), book_id).await
    }

    #[tracing::instrument(name = "List books", skip(self))]
    async fn list(&self, request: ListRequest) -> Result<Vec<Book>, BookRepositoryError> {
        reader::list(self.store.queries(), request).await
    }

    #[tracing::instrument(name = "List books by status", skip(self))]
    async fn list_by_status(
        &self,
        request: ListByStatusRequest,
    ) -> Result<Vec<Book>, BookRepositoryError> {
        reader::list_by_status(self.store.queries(), request).await
    }

    #[tracing::instrument(name = "Delete book", skip(self))]
    async fn delete(&self, request: DeleteRequest) -> Result<(), BookRepositoryError> {
        deleter::delete(self.store.as_ref(), request).await
    }

    #[tracing::instrument(name = "Get reading history", skip(self))]
    async fn get_reading_history(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<ReadingHistory, BookRepositoryError> {
        self.store
            .queries()
            .get_reading_history(user_id, book_id)
            .await?
            .ok_or(BookRepositoryError::ReadingHistoryNotFound { user_id, book_id })
    }

    #[tracing::instrument(name = "Update reading status", skip(self))]
    async fn update_reading_status(
        &self,
        request: UpdateReadingStatusRequest,
    ) -> Result<ReadingHistory, BookRepositoryError> {
        let update = ReadingHistoryUpdate {
            user_id: request.user_id,
            book_id: request.book_id,
            status: request.status,
            start_date: request.start_date,
            end_date: request.end_date,
        };
        self.store
            .queries()
            .update_reading_history(&update)
            .await?
            .ok_or(BookRepositoryError::ReadingHistoryNotFound {
                user_id: request.user_id,
                book_id: request.book_id,
            })
    }

    #[tracing::instrument(name = "List dictionary", skip(self))]
    async fn list_dictionary(
        &self,
        dictionary: Dictionary,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DictionaryEntry>, BookRepositoryError> {
        reader::check_page(limit, offset)?;
        self.store
            .queries()
            .list_dictionary_entries(dictionary, limit, offset)
            .await
    }
}
