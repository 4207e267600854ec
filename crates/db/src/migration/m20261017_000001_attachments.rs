//! Attachments migration.
//!
//! Creates the attachments table: file metadata plus the processing flag
//! and the list of processed styles.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();
        db.execute_unprepared(ATTACHMENTS_SQL).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();
        db.execute_unprepared("DROP TABLE IF EXISTS attachments CASCADE;")
            .await?;
        Ok(())
    }
}

const ATTACHMENTS_SQL: &str = r"
-- One row per record owning an attachment
CREATE TABLE attachments (
    id UUID PRIMARY KEY,
    file_name TEXT,
    content_type TEXT,
    file_size BIGINT,
    file_updated_at TIMESTAMPTZ,
    processing BOOLEAN NOT NULL DEFAULT FALSE,
    processed_styles JSONB NOT NULL DEFAULT '[]'::jsonb,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT chk_processed_styles_array CHECK (jsonb_typeof(processed_styles) = 'array'),
    CONSTRAINT chk_file_size_non_negative CHECK (file_size IS NULL OR file_size >= 0)
);

-- Rows still being processed, oldest first (for stuck-job sweeps)
CREATE INDEX idx_attachments_processing ON attachments(updated_at) WHERE processing;
";
