//! Attachment repository for database operations.
//!
//! [`AttachmentRow`] is the loaded instance of one `attachments` row. It
//! implements the record port of the attachment engine: file and
//! processing columns are edited in memory and written by [`AttachmentRow::save`],
//! while the processing columns can also be written straight to the row.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QuerySelect, Set, TransactionTrait,
};
use serde_json::Value as Json;
use tracing::debug;
use vellum_core::attachment::{AttachmentRecord, FileMetadata, ProcessingUpdate, RecordError};
use vellum_shared::types::RecordId;

use crate::entities::attachments;

/// Attachment repository.
#[derive(Debug, Clone)]
pub struct AttachmentRepository {
    db: DatabaseConnection,
}

impl AttachmentRepository {
    /// Creates a new attachment repository.
    #[must_use]
    pub const fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// A new, unsaved row with a fresh id.
    #[must_use]
    pub fn build(&self) -> AttachmentRow {
        AttachmentRow::new(self.db.clone())
    }

    /// Loads a row by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn find(&self, id: RecordId) -> Result<Option<AttachmentRow>, DbErr> {
        let model = attachments::Entity::find_by_id(id.into_inner())
            .one(&self.db)
            .await?;
        Ok(model.map(|model| AttachmentRow::from_model(self.db.clone(), &model)))
    }

    /// Deletes a row by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete(&self, id: RecordId) -> Result<bool, DbErr> {
        let result = attachments::Entity::delete_by_id(id.into_inner())
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }
}

#[derive(Debug, Default)]
struct RowState {
    new_record: bool,
    file: Option<FileMetadata>,
    processing: ProcessingUpdate,
}

/// One loaded `attachments` row.
#[derive(Debug)]
pub struct AttachmentRow {
    db: DatabaseConnection,
    id: RecordId,
    state: Mutex<RowState>,
}

impl AttachmentRow {
    /// A row that has not been inserted yet.
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            id: RecordId::new(),
            state: Mutex::new(RowState {
                new_record: true,
                ..RowState::default()
            }),
        }
    }

    /// A row loaded from `model`.
    #[must_use]
    pub fn from_model(db: DatabaseConnection, model: &attachments::Model) -> Self {
        Self {
            db,
            id: RecordId::from_uuid(model.id),
            state: Mutex::new(RowState {
                new_record: false,
                file: file_from_model(model),
                processing: ProcessingUpdate {
                    processing: model.processing,
                    processed_styles: styles_from_json(&model.processed_styles),
                },
            }),
        }
    }

    /// Row id.
    #[must_use]
    pub const fn record_id(&self) -> RecordId {
        self.id
    }

    /// Insert or update the row with every in-memory column.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::NotFound`] when updating a row that is gone.
    pub async fn save(&self) -> Result<(), RecordError> {
        let (new_record, file, processing) = {
            let state = self.lock();
            (state.new_record, state.file.clone(), state.processing.clone())
        };
        let now = Utc::now();

        let mut model = attachments::ActiveModel {
            id: Set(self.id.into_inner()),
            file_name: Set(file.as_ref().map(|f| f.file_name.clone())),
            content_type: Set(file.as_ref().and_then(|f| f.content_type.clone())),
            file_size: Set(file.as_ref().map(|f| f.file_size)),
            file_updated_at: Set(file.as_ref().map(|f| f.updated_at.into())),
            processing: Set(processing.processing),
            processed_styles: Set(styles_to_json(&processing.processed_styles)),
            updated_at: Set(now.into()),
            ..Default::default()
        };

        if new_record {
            model.created_at = Set(now.into());
            model.insert(&self.db).await.map_err(database)?;
            self.lock().new_record = false;
            debug!(id = %self.id, "attachment row inserted");
        } else {
            model.update(&self.db).await.map_err(|e| match e {
                DbErr::RecordNotUpdated => self.not_found(),
                other => database(other),
            })?;
            debug!(id = %self.id, "attachment row updated");
        }
        Ok(())
    }

    /// Delete the row.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn destroy(&self) -> Result<bool, RecordError> {
        let result = attachments::Entity::delete_by_id(self.id.into_inner())
            .exec(&self.db)
            .await
            .map_err(database)?;
        Ok(result.rows_affected > 0)
    }

    async fn write_processing<C: ConnectionTrait>(
        &self,
        conn: &C,
        update: &ProcessingUpdate,
    ) -> Result<(), RecordError> {
        let result = attachments::Entity::update_many()
            .col_expr(attachments::Column::Processing, Expr::value(update.processing))
            .col_expr(
                attachments::Column::ProcessedStyles,
                Expr::value(styles_to_json(&update.processed_styles)),
            )
            .col_expr(attachments::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(attachments::Column::Id.eq(self.id.into_inner()))
            .exec(conn)
            .await
            .map_err(database)?;

        if result.rows_affected == 0 {
            return Err(self.not_found());
        }
        Ok(())
    }

    fn not_found(&self) -> RecordError {
        RecordError::NotFound { id: self.id }
    }

    fn lock(&self) -> MutexGuard<'_, RowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AttachmentRecord for AttachmentRow {
    fn id(&self) -> Option<RecordId> {
        Some(self.id)
    }

    fn is_new_record(&self) -> bool {
        self.lock().new_record
    }

    fn file(&self) -> Option<FileMetadata> {
        self.lock().file.clone()
    }

    fn assign_file(&self, file: Option<FileMetadata>) {
        self.lock().file = file;
    }

    fn processed_styles(&self) -> Vec<String> {
        self.lock().processing.processed_styles.clone()
    }

    fn assign_processing(&self, update: &ProcessingUpdate) {
        self.lock().processing = update.clone();
    }

    async fn update_columns(&self, update: &ProcessingUpdate) -> Result<(), RecordError> {
        self.write_processing(&self.db, update).await?;
        self.assign_processing(update);
        Ok(())
    }

    async fn update_with_row_lock(&self, update: &ProcessingUpdate) -> Result<(), RecordError> {
        let txn = self.db.begin().await.map_err(database)?;

        let row = attachments::Entity::find_by_id(self.id.into_inner())
            .lock_exclusive()
            .one(&txn)
            .await
            .map_err(database)?;
        if row.is_none() {
            txn.rollback().await.map_err(database)?;
            return Err(self.not_found());
        }

        self.write_processing(&txn, update).await?;
        txn.commit().await.map_err(database)?;
        self.assign_processing(update);
        Ok(())
    }
}

fn database(err: DbErr) -> RecordError {
    RecordError::Database(err.to_string())
}

fn styles_to_json(styles: &[String]) -> Json {
    Json::from(styles.to_vec())
}

/// Style names from the stored array. Non-string entries are skipped.
fn styles_from_json(value: &Json) -> Vec<String> {
    value
        .as_array()
        .map(|styles| {
            styles
                .iter()
                .filter_map(|style| style.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn file_from_model(model: &attachments::Model) -> Option<FileMetadata> {
    let file_name = model.file_name.clone()?;
    Some(FileMetadata {
        file_name,
        content_type: model.content_type.clone(),
        file_size: model.file_size.unwrap_or_default(),
        updated_at: model
            .file_updated_at
            .unwrap_or(model.updated_at)
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn model() -> attachments::Model {
        let now = Utc::now().into();
        attachments::Model {
            id: uuid::Uuid::now_v7(),
            file_name: Some("photo.png".to_string()),
            content_type: Some("image/png".to_string()),
            file_size: Some(42),
            file_updated_at: None,
            processing: true,
            processed_styles: json!(["thumb"]),
            created_at: now,
            updated_at: now,
        }
    }

    #[rstest]
    #[case::list(json!(["thumb", "large"]), vec!["thumb", "large"])]
    #[case::empty(json!([]), vec![])]
    #[case::mixed(json!(["thumb", 3, null]), vec!["thumb"])]
    #[case::not_a_list(json!({"thumb": true}), vec![])]
    fn test_styles_from_json(#[case] value: Json, #[case] expected: Vec<&str>) {
        assert_eq!(styles_from_json(&value), expected);
    }

    #[test]
    fn test_styles_to_json_is_array() {
        let value = styles_to_json(&["thumb".to_string(), "large".to_string()]);
        assert_eq!(value, json!(["thumb", "large"]));
    }

    #[test]
    fn test_loaded_row_is_persisted() {
        let model = model();
        let row = AttachmentRow::from_model(DatabaseConnection::Disconnected, &model);

        assert!(!row.is_new_record());
        assert!(row.is_persisted());
        assert_eq!(row.id().map(RecordId::into_inner), Some(model.id));
        assert_eq!(row.processed_styles(), vec!["thumb"]);
        let file = row.file().expect("file columns set");
        assert_eq!(file.file_name, "photo.png");
        assert_eq!(file.file_size, 42);
        assert_eq!(file.updated_at, model.updated_at.with_timezone(&Utc));
    }

    #[test]
    fn test_row_without_file_name_has_no_file() {
        let model = attachments::Model {
            file_name: None,
            ..model()
        };
        assert!(file_from_model(&model).is_none());
    }

    #[test]
    fn test_new_row_edits_stay_in_memory() {
        let row = AttachmentRow::new(DatabaseConnection::Disconnected);
        assert!(row.is_new_record());
        assert!(row.file().is_none());

        row.assign_processing(&ProcessingUpdate {
            processing: true,
            processed_styles: vec!["thumb".into()],
        });
        assert_eq!(row.processed_styles(), vec!["thumb"]);
    }
}
