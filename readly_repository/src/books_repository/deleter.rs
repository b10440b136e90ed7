use crate::api::DeleteRequest;
use crate::books_repository::{run_atomic, BookRepositoryError, BookStore, Queries};

/// Removes the user's link to the book, the genre links and the book itself.
/// Dictionary names stay, they are shared by other books
pub async fn delete(store: &dyn BookStore, request: DeleteRequest) -> Result<(), BookRepositoryError> {
    run_atomic(store, |queries| Box::pin(delete_in(queries, request))).await?;
    tracing::info!(book_id = request.book_id, "Deleted book");
    Ok(())
}

async fn delete_in(queries: &dyn Queries, request: DeleteRequest) -> Result<(), BookRepositoryError> {
    let DeleteRequest { user_id, book_id } = request;

    if queries.delete_reading_history(user_id, book_id).await? == 0 {
        return Err(BookRepositoryError::ReadingHistoryNotFound { user_id, book_id });
    }

    for genre in queries.get_genres_by_book_id(book_id).await? {
        queries.delete_book_genre(book_id, &genre).await?;
    }

    if queries.delete_book(book_id).await? == 0 {
        return Err(BookRepositoryError::BookNotFound(book_id));
    }
    Ok(())
}
