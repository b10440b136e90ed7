use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type BookId = i64;
pub type UserId = i64;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
/// Book aggregate: the book row together with the names of its genres
pub struct Book {
    pub id: BookId,
    pub title: String,
    pub genres: Vec<String>,
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

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
/// Everything needed to register a book for a user.
/// Input is expected to be validated by the caller (non-empty title etc.)
pub struct RegisterRequest {
    pub user_id: UserId,
    pub title: String,
    pub genres: Vec<String>,
    pub description: Option<String>,
    pub cover_image_url: Option<String>,
    pub url: Option<String>,
    pub author_name: Option<String>,
    pub publisher_name: Option<String>,
    pub publish_date: Option<DateTime<Utc>>,
    pub isbn: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ListRequest {
    pub user_id: UserId,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
/// Books of the user whose reading history is in `status`
pub struct ListByStatusRequest {
    pub user_id: UserId,
    pub status: ReadingStatus,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct DeleteRequest {
    pub user_id: UserId,
    pub book_id: BookId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ReadingStatus {
    Unread,
    Reading,
    Read,
}

impl ReadingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingStatus::Unread => "unread",
            ReadingStatus::Reading => "reading",
            ReadingStatus::Read => "read",
        }
    }
}

impl fmt::Display for ReadingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadingStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "unread" => Ok(ReadingStatus::Unread),
            "reading" => Ok(ReadingStatus::Reading),
            "read" => Ok(ReadingStatus::Read),
            other => Err(format!("unknown reading status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
/// Personal relationship of a user to a book, exactly one per (user, book)
pub struct ReadingHistory {
    pub user_id: UserId,
    pub book_id: BookId,
    pub status: ReadingStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UpdateReadingStatusRequest {
    pub user_id: UserId,
    pub book_id: BookId,
    pub status: ReadingStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "lowercase")]
/// Shared vocabularies of names. Rows are created on first use and never removed by registration
pub enum Dictionary {
    Author,
    Publisher,
    Genre,
}

impl Dictionary {
    pub fn table_name(&self) -> &'static str {
        match self {
            Dictionary::Author => "authors",
            Dictionary::Publisher => "publishers",
            Dictionary::Genre => "genres",
        }
    }
}

impl fmt::Display for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dictionary::Author => "author",
            Dictionary::Publisher => "publisher",
            Dictionary::Genre => "genre",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DictionaryEntry {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}
