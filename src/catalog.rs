//! Seam to the tool/scope/user store.
//!
//! Catalog records are plain CRUD owned by an external system; the
//! orchestration core only ever reads them. The trait exists so tests can
//! substitute a canned catalog without touching SQLite.

use anyhow::Result;
use async_trait::async_trait;

use crate::db::DbHandle;
use crate::models::{Scope, Tool, User};

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Look up a tool by slug or id.
    async fn get_tool(&self, slug_or_id: &str) -> Result<Option<Tool>>;

    async fn get_scope(&self, id: &str) -> Result<Option<Scope>>;

    async fn get_user(&self, id: &str) -> Result<Option<User>>;
}

/// Catalog backed by the vigil database.
#[derive(Clone)]
pub struct SqliteCatalog {
    db: DbHandle,
}

impl SqliteCatalog {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CatalogStore for SqliteCatalog {
    async fn get_tool(&self, slug_or_id: &str) -> Result<Option<Tool>> {
        let key = slug_or_id.to_string();
        self.db.call(move |db| db.get_tool(&key)).await
    }

    async fn get_scope(&self, id: &str) -> Result<Option<Scope>> {
        let key = id.to_string();
        self.db.call(move |db| db.get_scope(&key)).await
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let key = id.to_string();
        self.db.call(move |db| db.get_user(&key)).await
    }
}
