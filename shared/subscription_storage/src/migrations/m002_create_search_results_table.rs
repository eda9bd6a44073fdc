//! Migration 2: search results table

use super::{Migration, SchemaOperation};
use crate::schema::TableConfig;

/// Creates the search results table
pub struct CreateSearchResultsTable;

impl Migration for CreateSearchResultsTable {
    fn id(&self) -> u32 {
        2
    }

    fn name(&self) -> &'static str {
        "create_search_results_table"
    }

    fn source(&self) -> &'static str {
        module_path!()
    }

    fn operations(&self, tables: &TableConfig) -> Vec<SchemaOperation> {
        vec![SchemaOperation::CreateTable(tables.search_results_table())]
    }
}
