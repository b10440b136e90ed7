use crate::api::{Book, BookId, ListByStatusRequest, ListRequest, ReadingHistory};
use crate::books_repository::{BookRepositoryError, Queries};

pub fn check_page(limit: i64, offset: i64) -> Result<(), BookRepositoryError> {
    if limit < 0 || offset < 0 {
        return Err(BookRepositoryError::InvalidRequest(format!(
            "limit {} and offset {} must not be negative",
            limit, offset
        )));
    }
    Ok(())
}

/// Assembles the book aggregate from the book row and its genre links
pub async fn get(queries: &dyn Queries, book_id: BookId) -> Result<Book, BookRepositoryError> {
    let book = queries
        .get_book_by_id(book_id)
        .await?
        .ok_or(BookRepositoryError::BookNotFound(book_id))?;
    let genres = queries.get_genres_by_book_id(book_id).await?;
    Ok(book.into_book(genres))
}

/// Books of the user in registration order, one aggregate fetch per reading history
pub async fn list(
    queries: &dyn Queries,
    request: ListRequest,
) -> Result<Vec<Book>, BookRepositoryError> {
    check_page(request.limit, request.offset)?;

    let histories = queries
        .list_reading_histories_by_user(request.user_id, request.limit, request.offset)
        .await?;
    books_of(queries, histories).await
}

/// Books of the user with the requested reading status, in registration order
pub async fn list_by_status(
    queries: &dyn Queries,
    request: ListByStatusRequest,
) -> Result<Vec<Book>, BookRepositoryError> {
    check_page(request.limit, request.offset)?;

    let histories = queries
        .list_reading_histories_by_user_and_status(
            request.user_id,
            request.status,
            request.limit,
            request.offset,
        )
        .await?;
    books_of(queries, histories).await
}

async fn books_of(
    queries: &dyn Queries,
    histories: Vec<ReadingHistory>,
) -> Result<Vec<Book>, BookRepositoryError> {
    let mut books = Vec::with_capacity(histories.len());
    for history in histories {
        books.push(get(queries, history.book_id).await?);
    }
    Ok(books)
}
