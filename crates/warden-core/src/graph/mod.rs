//! Payload graphs: JSON in to tracked entities, query results out to JSON.

mod builder;
mod serializer;

pub use builder::{GraphBuilder, DELETED_TAG, ID_TAG, REF_TAG};
pub use serializer::Serializer;
