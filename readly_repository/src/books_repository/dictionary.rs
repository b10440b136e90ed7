use crate::api::{Dictionary, DictionaryEntry};
use crate::books_repository::{BookRepositoryError, Queries};

/// Get-or-create of a dictionary name.
///
/// Two writers registering the same new name both miss the lookup and both try to
/// insert. The insert of the loser reports `None` (it waits for the winner to commit),
/// and the row is then fetched again. Should the row still be invisible the race is
/// reported as a retryable [`BookRepositoryError::Conflict`].
pub async fn resolve(
    queries: &dyn Queries,
    dictionary: Dictionary,
    name: &str,
) -> Result<DictionaryEntry, BookRepositoryError> {
    if let Some(entry) = queries.get_dictionary_entry(dictionary, name).await? {
        return Ok(entry);
    }

    if let Some(entry) = queries.create_dictionary_entry(dictionary, name).await? {
        tracing::debug!("Created {} '{}'", dictionary, name);
        return Ok(entry);
    }

    tracing::debug!("{} '{}' was created concurrently, fetching it", dictionary, name);
    queries
        .get_dictionary_entry(dictionary, name)
        .await?
        .ok_or_else(|| {
            BookRepositoryError::Conflict(format!(
                "{} '{}' was inserted concurrently but is not visible",
                dictionary, name
            ))
        })
}

/// Drops empty names and duplicates, returns the rest sorted.
/// A fixed order makes concurrent writers lock dictionary rows in the same sequence
pub fn distinct_names(names: &[String]) -> Vec<String> {
    let mut distinct: Vec<String> = names
        .iter()
        .filter(|name| !name.is_empty())
        .cloned()
        .collect();
    distinct.sort();
    distinct.dedup();
    distinct
}

/// Absent and empty names are both treated as "no name"
pub fn present_name(name: &Option<String>) -> Option<&str> {
    name.as_deref().filter(|name| !name.is_empty())
}

#[cfg(test)]
mod dictionary_tests {
    use super::*;
    use crate::books_repository::{BookStore, InMemoryBookStore};
    use crate::test_support::FaultyQueries;

    #[tokio::test]
    async fn test_resolve_creates_once_and_reuses() {
        let store = InMemoryBookStore::default();
        let queries = store.queries();

        let created = resolve(queries, Dictionary::Publisher, "Penguin")
            .await
            .expect("Failed to resolve");
        let reused = resolve(queries, Dictionary::Publisher, "Penguin")
            .await
            .expect("Failed to resolve");
        assert_eq!(created, reused);

        let listed = queries
            .list_dictionary_entries(Dictionary::Publisher, 10, 0)
            .await
            .unwrap();
        assert_eq!(listed, vec![created]);

        // Same name in another dictionary is a separate row
        resolve(queries, Dictionary::Author, "Penguin").await.unwrap();
        assert_eq!(
            queries
                .list_dictionary_entries(Dictionary::Author, 10, 0)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    /// Simulates the loser of an insert race: lookup misses, insert reports the name as taken
    async fn test_resolve_absorbs_lost_insert_race() {
        let store = InMemoryBookStore::default();
        let queries = FaultyQueries::hiding_lookups(store.queries(), 1);

        // the winner's row
        store
            .queries()
            .create_dictionary_entry(Dictionary::Genre, "fantasy")
            .await
            .unwrap();

        let entry = resolve(&queries, Dictionary::Genre, "fantasy")
            .await
            .expect("Lost race must not fail");
        assert_eq!(entry.name, "fantasy");
        assert_eq!(
            store
                .queries()
                .list_dictionary_entries(Dictionary::Genre, 10, 0)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_resolve_reports_invisible_winner_as_conflict() {
        let store = InMemoryBookStore::default();
        let queries = FaultyQueries::hiding_lookups(store.queries(), 2);
        store
            .queries()
            .create_dictionary_entry(Dictionary::Genre, "fantasy")
            .await
            .unwrap();

        let result = resolve(&queries, Dictionary::Genre, "fantasy").await;
        assert!(matches!(result, Err(BookRepositoryError::Conflict(..))));
        assert!(result.unwrap_err().is_retryable());
    }

    #[test]
    fn test_distinct_names() {
        let names = vec![
            "b".to_string(),
            "a".to_string(),
            "".to_string(),
            "b".to_string(),
        ];
        assert_eq!(distinct_names(&names), vec!["a".to_string(), "b".to_string()]);
        assert!(distinct_names(&[]).is_empty());
    }

    #[test]
    fn test_present_name() {
        assert_eq!(present_name(&Some("x".to_string())), Some("x"));
        assert_eq!(present_name(&Some("".to_string())), None);
        assert_eq!(present_name(&None), None);
    }
}
