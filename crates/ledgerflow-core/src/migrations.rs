// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded database migrations.
//!
//! The store constructors run these themselves. Services that manage the
//! database separately can apply them up front.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use ledgerflow_core::migrations;
//!
//! let pool = SqlitePool::connect("sqlite:.data/flows.db?mode=rwc").await?;
//! migrations::run_sqlite(&pool).await?;
//! ```

#[cfg(any(feature = "sqlite", feature = "postgres"))]
use sqlx::migrate::MigrateError;

/// PostgreSQL migrator with the checkpoint store schema embedded.
#[cfg(feature = "postgres")]
pub static POSTGRES: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// SQLite migrator with the checkpoint store schema embedded.
#[cfg(feature = "sqlite")]
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run PostgreSQL migrations. Already-applied migrations are skipped.
#[cfg(feature = "postgres")]
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}

/// Run SQLite migrations. Already-applied migrations are skipped.
#[cfg(feature = "sqlite")]
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
