use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;

use crate::api::{BookId, Dictionary, DictionaryEntry, ReadingHistory, ReadingStatus, UserId};
use crate::books_repository::{
    BookRepositoryError, BookRow, BookStore, NewBook, NewReadingHistory, Queries,
    ReadingHistoryUpdate, UnitOfWork,
};

#[derive(Clone, Default)]
struct Tables {
    dictionary_sequence_generator: i64,
    book_sequence_generator: BookId,
    authors: BTreeMap<String, DictionaryEntry>,
    publishers: BTreeMap<String, DictionaryEntry>,
    genres: BTreeMap<String, DictionaryEntry>,
    books: BTreeMap<BookId, BookRow>,
    book_genres: BTreeSet<(BookId, String)>,
    reading_histories: BTreeMap<(UserId, BookId), ReadingHistory>,
}

impl Tables {
    fn dictionary(&self, dictionary: Dictionary) -> &BTreeMap<String, DictionaryEntry> {
        match dictionary {
            Dictionary::Author => &self.authors,
            Dictionary::Publisher => &self.publishers,
            Dictionary::Genre => &self.genres,
        }
    }

    fn dictionary_mut(&mut self, dictionary: Dictionary) -> &mut BTreeMap<String, DictionaryEntry> {
        match dictionary {
            Dictionary::Author => &mut self.authors,
            Dictionary::Publisher => &mut self.publishers,
            Dictionary::Genre => &mut self.genres,
        }
    }
}

/// Converts limit/offset into a range over an ordered collection
fn page(limit: i64, offset: i64) -> Result<(usize, usize), BookRepositoryError> {
    let limit = usize::try_from(limit)
        .map_err(|_| BookRepositoryError::InvalidRequest(format!("negative limit {}", limit)))?;
    let offset = usize::try_from(offset)
        .map_err(|_| BookRepositoryError::InvalidRequest(format!("negative offset {}", offset)))?;
    Ok((limit, offset))
}

/// Set of tables behaving like a single database session
#[derive(Default)]
pub struct InMemoryTables {
    tables: parking_lot::Mutex<Tables>,
}

impl InMemoryTables {
    fn snapshot(&self) -> Self {
        Self {
            tables: parking_lot::Mutex::new(self.tables.lock().clone()),
        }
    }
}

#[async_trait::async_trait]
impl Queries for InMemoryTables {
    async fn get_dictionary_entry(
        &self,
        dictionary: Dictionary,
        name: &str,
    ) -> Result<Option<DictionaryEntry>, BookRepositoryError> {
        Ok(self.tables.lock().dictionary(dictionary).get(name).cloned())
    }

    async fn create_dictionary_entry(
        &self,
        dictionary: Dictionary,
        name: &str,
    ) -> Result<Option<DictionaryEntry>, BookRepositoryError> {
        let mut tables = self.tables.lock();
        if tables.dictionary(dictionary).contains_key(name) {
            return Ok(None);
        }
        tables.dictionary_sequence_generator += 1;
        let entry = DictionaryEntry {
            id: tables.dictionary_sequence_generator,
            name: name.to_string(),
            created_at: Utc::now(),
        };
        tables
            .dictionary_mut(dictionary)
            .insert(name.to_string(), entry.clone());
        Ok(Some(entry))
    }

    async fn list_dictionary_entries(
        &self,
        dictionary: Dictionary,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DictionaryEntry>, BookRepositoryError> {
        let (limit, offset) = page(limit, offset)?;
        Ok(self
            .tables
            .lock()
            .dictionary(dictionary)
            .values()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_book(&self, book: &NewBook) -> Result<BookRow, BookRepositoryError> {
        let mut tables = self.tables.lock();
        tables.book_sequence_generator += 1;
        let now = Utc::now();
        let row = BookRow {
            id: tables.book_sequence_generator,
            title: book.title.clone(),
            description: book.description.clone(),
            cover_image_url: book.cover_image_url.clone(),
            url: book.url.clone(),
            author_name: book.author_name.clone(),
            publisher_name: book.publisher_name.clone(),
            publish_date: book.publish_date,
            isbn: book.isbn.clone(),
            created_at: now,
            updated_at: now,
        };
        tables.books.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_book_by_id(
        &self,
        book_id: BookId,
    ) -> Result<Option<BookRow>, BookRepositoryError> {
        Ok(self.tables.lock().books.get(&book_id).cloned())
    }

    async fn delete_book(&self, book_id: BookId) -> Result<u64, BookRepositoryError> {
        let mut tables = self.tables.lock();
        let still_referenced = tables.book_genres.iter().any(|(id, _)| *id == book_id)
            || tables.reading_histories.keys().any(|(_, id)| *id == book_id);
        if still_referenced {
            return Err(BookRepositoryError::Other(format!(
                "Book {} is still referenced",
                book_id
            )));
        }
        Ok(tables.books.remove(&book_id).map_or(0, |_| 1))
    }

    async fn create_book_genre(
        &self,
        book_id: BookId,
        genre_name: &str,
    ) -> Result<(), BookRepositoryError> {
        let mut tables = self.tables.lock();
        if !tables.books.contains_key(&book_id) {
            return Err(BookRepositoryError::BookNotFound(book_id));
        }
        if !tables.genres.contains_key(genre_name) {
            return Err(BookRepositoryError::Other(format!(
                "Genre '{}' is not registered",
                genre_name
            )));
        }
        if !tables.book_genres.insert((book_id, genre_name.to_string())) {
            return Err(BookRepositoryError::Conflict(format!(
                "Book {} already has genre '{}'",
                book_id, genre_name
            )));
        }
        Ok(())
    }

    async fn get_genres_by_book_id(
        &self,
        book_id: BookId,
    ) -> Result<Vec<String>, BookRepositoryError> {
        Ok(self
            .tables
            .lock()
            .book_genres
            .range((book_id, String::new())..)
            .take_while(|(id, _)| *id == book_id)
            .map(|(_, genre_name)| genre_name.clone())
            .collect())
    }

    async fn delete_book_genre(
        &self,
        book_id: BookId,
        genre_name: &str,
    ) -> Result<u64, BookRepositoryError> {
        let removed = self
            .tables
            .lock()
            .book_genres
            .remove(&(book_id, genre_name.to_string()));
        Ok(u64::from(removed))
    }

    async fn create_reading_history(
        &self,
        history: &NewReadingHistory,
    ) -> Result<ReadingHistory, BookRepositoryError> {
        let mut tables = self.tables.lock();
        if !tables.books.contains_key(&history.book_id) {
            return Err(BookRepositoryError::BookNotFound(history.book_id));
        }
        let key = (history.user_id, history.book_id);
        if tables.reading_histories.contains_key(&key) {
            return Err(BookRepositoryError::Conflict(format!(
                "User {} already has history of book {}",
                history.user_id, history.book_id
            )));
        }
        let now = Utc::now();
        let record = ReadingHistory {
            user_id: history.user_id,
            book_id: history.book_id,
            status: history.status,
            start_date: history.start_date,
            end_date: history.end_date,
            created_at: now,
            updated_at: now,
        };
        tables.reading_histories.insert(key, record.clone());
        Ok(record)
    }

    async fn get_reading_history(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<Option<ReadingHistory>, BookRepositoryError> {
        Ok(self
            .tables
            .lock()
            .reading_histories
            .get(&(user_id, book_id))
            .cloned())
    }

    async fn list_reading_histories_by_user(
        &self,
        user_id: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReadingHistory>, BookRepositoryError> {
        let (limit, offset) = page(limit, offset)?;
        Ok(self
            .tables
            .lock()
            .reading_histories
            .range((user_id, BookId::MIN)..=(user_id, BookId::MAX))
            .skip(offset)
            .take(limit)
            .map(|(_, history)| history.clone())
            .collect())
    }

    async fn list_reading_histories_by_user_and_status(
        &self,
        user_id: UserId,
        status: ReadingStatus,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReadingHistory>, BookRepositoryError> {
        let (limit, offset) = page(limit, offset)?;
        Ok(self
            .tables
            .lock()
            .reading_histories
            .range((user_id, BookId::MIN)..=(user_id, BookId::MAX))
            .map(|(_, history)| history)
            .filter(|history| history.status == status)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_reading_history(
        &self,
        update: &ReadingHistoryUpdate,
    ) -> Result<Option<ReadingHistory>, BookRepositoryError> {
        let mut tables = self.tables.lock();
        Ok(tables
            .reading_histories
            .get_mut(&(update.user_id, update.book_id))
            .map(|history| {
                history.status = update.status;
                history.start_date = update.start_date;
                history.end_date = update.end_date;
                history.updated_at = Utc::now();
                history.clone()
            }))
    }

    async fn delete_reading_history(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<u64, BookRepositoryError> {
        let removed = self
            .tables
            .lock()
            .reading_histories
            .remove(&(user_id, book_id));
        Ok(removed.map_or(0, |_| 1))
    }
}

/// In-process store. Units of work run one at a time on a private copy of the
/// tables which replaces the committed tables on commit
#[derive(Default)]
pub struct InMemoryBookStore {
    committed: InMemoryTables,
    writer: tokio::sync::Mutex<()>,
}

struct InMemoryUnitOfWork<'s> {
    committed: &'s InMemoryTables,
    _writer: tokio::sync::MutexGuard<'s, ()>,
    staged: InMemoryTables,
}

#[async_trait::async_trait]
impl BookStore for InMemoryBookStore {
    fn queries(&self) -> &dyn Queries {
        &self.committed
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, BookRepositoryError> {
        let writer = self.writer.lock().await;
        Ok(Box::new(InMemoryUnitOfWork {
            committed: &self.committed,
            _writer: writer,
            staged: self.committed.snapshot(),
        }))
    }
}

#[async_trait::async_trait]
impl<'s> UnitOfWork for InMemoryUnitOfWork<'s> {
    fn queries(&self) -> &dyn Queries {
        &self.staged
    }

    async fn commit(self: Box<Self>) -> Result<(), BookRepositoryError> {
        let InMemoryUnitOfWork {
            committed,
            _writer,
            staged,
        } = *self;
        *committed.tables.lock() = staged.tables.into_inner();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), BookRepositoryError> {
        Ok(())
    }
}
