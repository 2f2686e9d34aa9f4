//! Index bootstrap.
//!
//! Makes sure the questions collection exists before the consumer starts
//! writing to it. Safe to run on every start: a "not found" lookup is the
//! expected signal to create the collection, anything else is a no-op.

use super::{CollectionSchema, Field, FieldType, IndexError, SearchIndex};
use tracing::{debug, info};

/// What [`ensure_schema`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// The collection was already there
    Existing,
    /// The collection was created by this call
    Created,
}

/// The questions collection, sorted by creation time by default.
pub fn question_schema(name: &str) -> CollectionSchema {
    CollectionSchema {
        name: name.to_string(),
        fields: vec![
            Field::indexed("id", FieldType::String),
            Field::indexed("title", FieldType::String),
            Field::indexed("content", FieldType::String),
            Field::indexed("tags", FieldType::StringArray),
            Field::indexed("createdAt", FieldType::Int64),
            Field::indexed("hasAcceptedAnswer", FieldType::Bool),
            Field::indexed("answerCount", FieldType::Int32),
        ],
        default_sorting_field: Some("createdAt".to_string()),
    }
}

/// Create `schema` unless a collection with that name already exists.
pub async fn ensure_schema(
    index: &dyn SearchIndex,
    schema: &CollectionSchema,
) -> Result<BootstrapOutcome, IndexError> {
    match index.retrieve_collection(&schema.name).await {
        Ok(_) => {
            info!(collection = %schema.name, "Search collection already exists");
            return Ok(BootstrapOutcome::Existing);
        }
        Err(IndexError::NotFound(_)) => {
            info!(collection = %schema.name, "Search collection not found, creating it");
        }
        Err(e) => return Err(e),
    }

    match index.create_collection(schema).await {
        Ok(()) => {
            info!(
                collection = %schema.name,
                fields = schema.fields.len(),
                "Search collection created"
            );
            Ok(BootstrapOutcome::Created)
        }
        // Another replica won the race
        Err(IndexError::AlreadyExists(_)) => {
            debug!(collection = %schema.name, "Search collection created concurrently");
            Ok(BootstrapOutcome::Existing)
        }
        Err(e) => Err(e),
    }
}
