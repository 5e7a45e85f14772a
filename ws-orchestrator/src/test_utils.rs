use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::workspace::{CreateWorkspaceRequest, Workspace, WorkspaceStore};

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    // Every connection to `sqlite::memory:` is a separate database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Insert a pending workspace owned by `user_id`
pub async fn create_test_workspace(store: &WorkspaceStore, user_id: &str) -> Workspace {
    store
        .create_workspace(CreateWorkspaceRequest {
            user_id: user_id.to_string(),
            name: "test-workspace".to_string(),
            storage_gb: 20,
            ssh_public_key: None,
        })
        .await
        .expect("Failed to create workspace")
}
