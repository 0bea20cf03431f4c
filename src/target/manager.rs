//! Long-lived render targets of one editing session.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::compositor::{ApplyReport, Compositor, FieldChange};
use crate::config::EngineConfig;
use crate::error::DiplomaError;
use crate::loader::{RasterLoader, RasterPayload};
use crate::model::{FieldKey, FieldMap, FieldRecord, Placement};
use crate::recipient::{Recipient, Tournament};
use crate::substitute::SubstitutionContext;
use crate::surface::paint;
use crate::surface::text::FontBook;

use super::export::{ExportArtifact, ExportJob, ExportOutcome};
use super::{CommitHook, PrimitiveIndex, RenderTarget, TargetKind};

#[derive(Debug)]
struct Thumbnail {
    recipient: Recipient,
    target: RenderTarget,
}

/// Owns the edit target, one thumbnail target per recipient, and the
/// primitive index they share. Exports run on private targets.
#[derive(Debug)]
pub struct RenderTargetManager {
    config: Arc<EngineConfig>,
    compositor: Compositor,
    fonts: Arc<FontBook>,
    index: PrimitiveIndex,
    edit: RenderTarget,
    thumbnails: Vec<Thumbnail>,
    /// Permits for exports in flight; each holds a full-size canvas.
    exports: Arc<Semaphore>,
}

impl RenderTargetManager {
    pub fn new(config: EngineConfig) -> Self {
        let loader = RasterLoader::new(config.pdf_scale).with_max_pixels(config.max_raster_pixels);
        Self::with_loader(config, loader)
    }

    /// Build on an existing loader, sharing its decode cache.
    pub fn with_loader(config: EngineConfig, loader: RasterLoader) -> Self {
        let fonts = FontBook::shared(&config.font_dirs);
        let edit = RenderTarget::new(
            TargetKind::Edit,
            config.surface_width,
            config.surface_height,
            1.0,
            None,
        );
        let exports = Arc::new(Semaphore::new(config.export_concurrency.max(1)));
        Self {
            exports,
            config: Arc::new(config),
            compositor: Compositor::new(loader),
            fonts,
            index: PrimitiveIndex::new(),
            edit,
            thumbnails: Vec::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn compositor(&self) -> &Compositor {
        &self.compositor
    }

    pub fn edit(&self) -> &RenderTarget {
        &self.edit
    }

    pub fn index(&self) -> &PrimitiveIndex {
        &self.index
    }

    pub fn set_commit_hook(&mut self, hook: CommitHook) {
        self.edit.set_commit_hook(hook);
    }

    /// Render the edit target unless it already shows these fields.
    pub async fn render_edit(&mut self, fields: &FieldMap) -> ApplyReport {
        if self.edit.is_current(fields) {
            return ApplyReport::default();
        }
        let report = self.compositor.apply(&mut self.edit, &mut self.index, fields).await;
        self.edit.mark_rendered(fields);
        report
    }

    // ========================================================================
    // Thumbnails
    // ========================================================================

    /// Make the thumbnail set match `recipients`, in their order.
    ///
    /// Known recipients keep their target and are rebound to the new
    /// context; new ones get a fresh target; the rest are torn down.
    pub fn sync_recipients(&mut self, tournament: &Tournament, recipients: &[Recipient]) {
        let mut previous = std::mem::take(&mut self.thumbnails);
        let mut created = 0;
        for recipient in recipients {
            let context = SubstitutionContext::for_recipient(tournament, recipient, &self.config.dates);
            let thumbnail = match previous.iter().position(|t| t.recipient.id == recipient.id) {
                Some(i) => {
                    let mut thumbnail = previous.remove(i);
                    thumbnail.target.rebind(Some(context));
                    thumbnail.recipient = recipient.clone();
                    thumbnail
                }
                None => {
                    created += 1;
                    Thumbnail {
                        recipient: recipient.clone(),
                        target: RenderTarget::new(
                            TargetKind::Thumbnail,
                            self.config.surface_width,
                            self.config.surface_height,
                            self.config.preview_zoom,
                            Some(context),
                        ),
                    }
                }
            };
            self.thumbnails.push(thumbnail);
        }

        let removed = previous.len();
        for gone in previous {
            self.index.clear_surface(gone.target.surface().id());
        }
        tracing::debug!(
            recipients = recipients.len(),
            created,
            removed,
            "Synchronized thumbnail targets"
        );
    }

    /// Recipients with a thumbnail target, in order.
    pub fn recipients(&self) -> impl Iterator<Item = &Recipient> {
        self.thumbnails.iter().map(|t| &t.recipient)
    }

    pub fn thumbnail(&self, recipient_id: &str) -> Option<&RenderTarget> {
        self.thumbnails
            .iter()
            .find(|t| t.recipient.id == recipient_id)
            .map(|t| &t.target)
    }

    /// Bring every stale thumbnail up to date with `fields`.
    ///
    /// All thumbnails are staged before any settles, so their decodes run
    /// concurrently.
    pub async fn render_thumbnails(&mut self, fields: &FieldMap) -> Vec<(String, ApplyReport)> {
        let mut staged = Vec::new();
        for (i, thumbnail) in self.thumbnails.iter_mut().enumerate() {
            if !thumbnail.target.is_current(fields) {
                self.compositor.stage(&mut thumbnail.target, &mut self.index, fields);
                staged.push(i);
            }
        }

        let mut reports = Vec::with_capacity(staged.len());
        for i in staged {
            let thumbnail = &mut self.thumbnails[i];
            let report = self.compositor.settle(&mut thumbnail.target, &mut self.index).await;
            thumbnail.target.mark_rendered(fields);
            for error in &report.errors {
                tracing::warn!(recipient = %thumbnail.recipient.id, error = %error, "Thumbnail field failed");
            }
            reports.push((thumbnail.recipient.id.clone(), report));
        }
        reports
    }

    /// PNG of one recipient's thumbnail as it currently stands.
    pub fn thumbnail_png(&self, recipient_id: &str) -> Result<Vec<u8>, DiplomaError> {
        let target = self.thumbnail(recipient_id).ok_or_else(|| {
            DiplomaError::Configuration(format!("No thumbnail for recipient {}", recipient_id))
        })?;
        let image = paint::render(target.surface(), target.zoom(), &self.fonts);
        paint::encode_png(&image)
    }

    // ========================================================================
    // Interaction
    // ========================================================================

    /// Move a field's primitive on the edit surface, as a finished drag would.
    pub fn move_primitive(&mut self, key: &FieldKey, placement: Placement) -> Result<(), DiplomaError> {
        let handle = self
            .index
            .get(self.edit.surface().id(), key)
            .and_then(|b| b.handle)
            .ok_or_else(|| DiplomaError::Configuration(format!("{} is not on the edit surface", key)))?;
        if self.edit.surface_mut().set_placement(handle, placement) {
            Ok(())
        } else {
            Err(DiplomaError::Configuration(format!("{} cannot be moved", key)))
        }
    }

    /// Commit the edit surface's transform of `key` into `record`.
    pub fn commit(&mut self, key: &FieldKey, record: &FieldRecord) -> Result<FieldChange, DiplomaError> {
        self.compositor.commit(&mut self.edit, &mut self.index, key, record)
    }

    /// Release `key`'s primitive on the edit target and every thumbnail.
    pub fn detach_everywhere(&mut self, key: &FieldKey) -> usize {
        let mut released = usize::from(self.compositor.detach(&mut self.edit, &mut self.index, key));
        for thumbnail in &mut self.thumbnails {
            released += usize::from(self.compositor.detach(&mut thumbnail.target, &mut self.index, key));
        }
        tracing::debug!(key = %key, released, "Detached field");
        released
    }

    /// The edit surface as it is now, at the save multiplier, as a PNG data URI.
    pub fn save_thumbnail(&self) -> Result<RasterPayload, DiplomaError> {
        let image = paint::render(
            self.edit.surface(),
            self.config.save_thumbnail_multiplier,
            &self.fonts,
        );
        paint::png_data_uri(&image)
    }

    // ========================================================================
    // Export
    // ========================================================================

    fn export_job(&self, fields: &FieldMap, tournament: &Tournament, recipient: &Recipient) -> ExportJob {
        ExportJob {
            config: self.config.clone(),
            compositor: self.compositor.clone(),
            fonts: self.fonts.clone(),
            fields: fields.clone(),
            tournament: tournament.clone(),
            recipient: recipient.clone(),
        }
    }

    /// Render one recipient's diploma at export zoom.
    pub async fn export(
        &self,
        fields: &FieldMap,
        tournament: &Tournament,
        recipient: &Recipient,
    ) -> Result<ExportArtifact, DiplomaError> {
        run_limited(self.exports.clone(), self.export_job(fields, tournament, recipient)).await
    }

    /// Export every recipient as an independent task.
    ///
    /// At most `export_concurrency` exports render at once. Outcomes come
    /// back in `recipients` order. A failed or panicked task only fails its
    /// own outcome.
    pub async fn export_all(
        &self,
        fields: &FieldMap,
        tournament: &Tournament,
        recipients: &[Recipient],
    ) -> Vec<ExportOutcome> {
        let tasks: Vec<_> = recipients
            .iter()
            .map(|recipient| {
                let job = self.export_job(fields, tournament, recipient);
                let permits = self.exports.clone();
                (recipient.id.clone(), recipient.rank, tokio::spawn(run_limited(permits, job)))
            })
            .collect();

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (recipient_id, rank, task) in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(DiplomaError::Export(format!(
                    "Export task for {} failed: {}",
                    recipient_id, e
                ))),
            };
            if let Err(e) = &result {
                tracing::warn!(recipient = %recipient_id, error = %e, "Export failed");
            }
            outcomes.push(ExportOutcome {
                recipient_id,
                rank,
                result,
            });
        }
        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        tracing::info!(total = outcomes.len(), failed, "Batch export finished");
        outcomes
    }

    /// Drop cached decodes that no target renders anymore.
    pub async fn prune_decodes(&self) -> usize {
        let live: HashSet<RasterPayload> = self
            .index
            .records()
            .filter_map(|record| record.image().cloned())
            .collect();
        let dropped = self.compositor.loader().retain(&live).await;
        if dropped > 0 {
            tracing::debug!(dropped, kept = live.len(), "Pruned decode cache");
        }
        dropped
    }
}

/// Wait for an export permit, then render.
async fn run_limited(permits: Arc<Semaphore>, job: ExportJob) -> Result<ExportArtifact, DiplomaError> {
    let _permit = permits
        .acquire_owned()
        .await
        .map_err(|e| DiplomaError::Export(format!("Export queue closed: {}", e)))?;
    job.run().await
}
