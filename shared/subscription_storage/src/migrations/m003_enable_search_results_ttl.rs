//! Migration 3: expire search results through the store's TTL

use super::{Migration, SchemaOperation};
use crate::models::SearchResultsAttribute;
use crate::schema::TableConfig;

/// Enables TTL on `ExpiredAt` of the search results table
pub struct EnableSearchResultsTtl;

impl Migration for EnableSearchResultsTtl {
    fn id(&self) -> u32 {
        3
    }

    fn name(&self) -> &'static str {
        "enable_search_results_ttl"
    }

    fn source(&self) -> &'static str {
        module_path!()
    }

    fn operations(&self, tables: &TableConfig) -> Vec<SchemaOperation> {
        vec![SchemaOperation::EnableTtl {
            table: tables.search_results.clone(),
            attribute: SearchResultsAttribute::ExpiredAt.to_string(),
        }]
    }
}
