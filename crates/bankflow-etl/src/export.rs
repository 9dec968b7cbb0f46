//! CSV export of the transform tier.

use crate::entity::Entity;
use crate::error::{EtlError, EtlResult};
use crate::store::TransformStore;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedFile {
    pub entity: Entity,
    pub path: PathBuf,
    pub rows: u64,
}

/// Write `transformed_<entity>.csv` for every entity into `dir`. NULL values
/// are written as `NA`.
pub async fn export_transformed(
    transform: &dyn TransformStore,
    dir: &Path,
) -> EtlResult<Vec<ExportedFile>> {
    tokio::fs::create_dir_all(dir).await?;
    let mut exported = Vec::with_capacity(Entity::ALL.len());

    for entity in Entity::ALL {
        let records = transform.fetch_all(entity).await?;
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(entity.typed_columns().iter().map(|c| c.name))?;
        for record in &records {
            writer.write_record(record.values.iter().map(|v| v.to_cell()))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| EtlError::Io(e.into_error()))?;

        let path = dir.join(format!("{}.csv", entity.transform_table()));
        tokio::fs::write(&path, bytes).await?;
        info!(entity = %entity, rows = records.len(), path = %path.display(), "Exported transform tier");

        exported.push(ExportedFile {
            entity,
            path,
            rows: records.len() as u64,
        });
    }

    Ok(exported)
}
