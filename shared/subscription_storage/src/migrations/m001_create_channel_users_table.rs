//! Migration 1: users, channels and subscriptions table with its user index

use super::{Migration, SchemaOperation};
use crate::schema::TableConfig;

/// Creates the channel users table
pub struct CreateChannelUsersTable;

impl Migration for CreateChannelUsersTable {
    fn id(&self) -> u32 {
        1
    }

    fn name(&self) -> &'static str {
        "create_channel_users_table"
    }

    fn source(&self) -> &'static str {
        module_path!()
    }

    fn operations(&self, tables: &TableConfig) -> Vec<SchemaOperation> {
        vec![SchemaOperation::CreateTable(tables.channel_users_table())]
    }
}
