use crate::api::{Book, Dictionary, ReadingStatus, RegisterRequest};
use crate::books_repository::dictionary::{distinct_names, present_name, resolve};
use crate::books_repository::{
    run_atomic, BookRepositoryError, BookStore, NewBook, NewReadingHistory, Queries,
};

/// Registers the book aggregate in one unit of work
pub async fn register(
    store: &dyn BookStore,
    request: RegisterRequest,
) -> Result<Book, BookRepositoryError> {
    let genres = distinct_names(&request.genres);

    let book = run_atomic(store, |queries| {
        let request = request.clone();
        let genres = genres.clone();
        Box::pin(async move { register_in(queries, &request, &genres).await })
    })
    .await?;

    tracing::info!(book_id = book.id, "Registered book");
    Ok(book)
}

async fn register_in(
    queries: &dyn Queries,
    request: &RegisterRequest,
    genres: &[String],
) -> Result<Book, BookRepositoryError> {
    let author_name = present_name(&request.author_name);
    let publisher_name = present_name(&request.publisher_name);

    if let Some(name) = author_name {
        resolve(queries, Dictionary::Author, name).await?;
    }
    if let Some(name) = publisher_name {
        resolve(queries, Dictionary::Publisher, name).await?;
    }
    for genre in genres {
        resolve(queries, Dictionary::Genre, genre).await?;
    }

    let book = queries
        .create_book(&NewBook {
            title: request.title.clone(),
            description: request.description.clone(),
            cover_image_url: request.cover_image_url.clone(),
            url: request.url.clone(),
            author_name: author_name.map(str::to_string),
            publisher_name: publisher_name.map(str::to_string),
            publish_date: request.publish_date,
            isbn: request.isbn.clone(),
        })
        .await?;

    for genre in genres {
        queries.create_book_genre(book.id, genre).await?;
    }

    // status is always unread at registration, see update_reading_status
    queries
        .create_reading_history(&NewReadingHistory {
            user_id: request.user_id,
            book_id: book.id,
            status: ReadingStatus::Unread,
            start_date: None,
            end_date: None,
        })
        .await?;

    let stored_genres = queries.get_genres_by_book_id(book.id).await?;
    Ok(book.into_book(stored_genres))
}
