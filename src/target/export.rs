//! One-shot full-resolution exports.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::compositor::Compositor;
use crate::config::EngineConfig;
use crate::error::DiplomaError;
use crate::model::FieldMap;
use crate::recipient::{Recipient, Tournament, export_filename};
use crate::substitute::SubstitutionContext;
use crate::surface::paint;
use crate::surface::text::FontBook;

use super::{PrimitiveIndex, RenderTarget, TargetKind};

/// A rendered diploma, ready to be written or handed to a browser.
#[derive(Debug, Clone)]
pub struct ExportArtifact {
    pub recipient_id: String,
    pub filename: String,
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl ExportArtifact {
    /// Write the PNG into `dir` under its filename.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, DiplomaError> {
        let path = dir.join(&self.filename);
        std::fs::write(&path, &self.png)?;
        Ok(path)
    }
}

/// Result of one recipient's export within a batch.
#[derive(Debug)]
pub struct ExportOutcome {
    pub recipient_id: String,
    pub rank: u32,
    pub result: Result<ExportArtifact, DiplomaError>,
}

/// Everything an export needs, owned, so it can run as its own task.
pub(crate) struct ExportJob {
    pub config: Arc<EngineConfig>,
    pub compositor: Compositor,
    pub fonts: Arc<FontBook>,
    pub fields: FieldMap,
    pub tournament: Tournament,
    pub recipient: Recipient,
}

impl ExportJob {
    /// Render on a private target and index, then encode on the blocking pool.
    #[tracing::instrument(name = "export", skip_all, fields(recipient = %self.recipient.id, rank = self.recipient.rank))]
    pub async fn run(self) -> Result<ExportArtifact, DiplomaError> {
        let ExportJob {
            config,
            compositor,
            fonts,
            fields,
            tournament,
            recipient,
        } = self;

        let context = SubstitutionContext::for_recipient(&tournament, &recipient, &config.dates);
        let mut target = RenderTarget::new(
            TargetKind::Export,
            config.surface_width,
            config.surface_height,
            config.export_zoom,
            Some(context),
        );
        let mut index = PrimitiveIndex::new();
        let report = compositor.apply(&mut target, &mut index, &fields).await;

        if !report.is_clean() {
            let failed = report
                .errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            if config.strict_exports {
                return Err(DiplomaError::Export(format!(
                    "Diploma for {} has failed fields: {}",
                    recipient.id, failed
                )));
            }
            tracing::warn!(failed = %failed, "Exporting with failed fields");
        }

        let filename = export_filename(&tournament, &recipient, &config.dates);
        let zoom = target.zoom();
        let surface = target.into_surface();
        let (png, width, height) = tokio::task::spawn_blocking(move || {
            let image = paint::render(&surface, zoom, &fonts);
            let png = paint::encode_png(&image)?;
            Ok::<_, DiplomaError>((png, image.width(), image.height()))
        })
        .await
        .map_err(|e| DiplomaError::Export(format!("Render task failed: {}", e)))??;

        tracing::info!(filename = %filename, width, height, bytes = png.len(), "Exported diploma");
        Ok(ExportArtifact {
            recipient_id: recipient.id,
            filename,
            png,
            width,
            height,
        })
    }
}
