//! # Edit Session
//!
//! One template being edited: the model, the render targets showing it,
//! and the store it is saved to.
//!
//! The template is an immutable value; every edit builds a new one and
//! swaps it in, so readers holding the old `Arc` are never disturbed.

use serde_json::Value;
use std::sync::Arc;

use crate::compositor::{ApplyReport, FieldChange};
use crate::error::{DiplomaError, FieldError};
use crate::model::registry::{self, KeyAllocator};
use crate::model::{FieldKey, FieldKind, FieldRecord, Placement, Template};
use crate::recipient::{Recipient, Tournament};
use crate::store::{SaveRequest, TemplateStore, load_or_default};
use crate::target::{ExportOutcome, RenderTargetManager};

/// Progress of the last save.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SaveState {
    #[default]
    Idle,
    Saving,
    Saved,
    Failed(String),
}

/// Reports of one [`EditSession::render`].
#[derive(Debug, Default)]
pub struct RenderSummary {
    pub edit: ApplyReport,
    pub thumbnails: Vec<(String, ApplyReport)>,
}

pub struct EditSession {
    id: String,
    template: Arc<Template>,
    allocator: KeyAllocator,
    manager: RenderTargetManager,
    store: Arc<dyn TemplateStore>,
    save_state: SaveState,
    load_errors: Vec<FieldError>,
}

impl std::fmt::Debug for EditSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditSession")
            .field("id", &self.id)
            .field("name", &self.template.name)
            .field("fields", &self.template.fields.len())
            .field("save_state", &self.save_state)
            .finish()
    }
}

impl EditSession {
    /// Load template `id` from `store`, or start from the default template.
    pub async fn open(
        store: Arc<dyn TemplateStore>,
        id: impl Into<String>,
        manager: RenderTargetManager,
    ) -> Self {
        let id = id.into();
        let (template, load_errors) = load_or_default(store.as_ref(), &id).await;
        for error in &load_errors {
            tracing::warn!(template = %id, error = %error, "Skipped field");
        }
        tracing::info!(template = %id, name = %template.name, fields = template.fields.len(), "Opened template");
        Self {
            allocator: KeyAllocator::seeded(&template.fields),
            template: Arc::new(template),
            id,
            manager,
            store,
            save_state: SaveState::Idle,
            load_errors,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn template(&self) -> &Arc<Template> {
        &self.template
    }

    /// Fields skipped when the template was loaded.
    pub fn load_errors(&self) -> &[FieldError] {
        &self.load_errors
    }

    pub fn manager(&self) -> &RenderTargetManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut RenderTargetManager {
        &mut self.manager
    }

    pub fn save_state(&self) -> &SaveState {
        &self.save_state
    }

    fn record(&self, key: &FieldKey) -> Result<&FieldRecord, DiplomaError> {
        self.template
            .fields
            .get(key.as_str())
            .ok_or_else(|| DiplomaError::Configuration(format!("No field {}", key)))
    }

    /// Add a field of `kind` with its defaults, on top of the others.
    pub fn add_field(&mut self, kind: FieldKind) -> Result<FieldKey, DiplomaError> {
        let record = registry::new_record(kind)?;
        let key = self.allocator.allocate(kind, &self.template.fields);
        self.template = Arc::new(self.template.with_field(key.clone(), record));
        tracing::debug!(key = %key, "Added field");
        Ok(key)
    }

    /// Detach the field from every target, then drop it from the template.
    pub fn remove_field(&mut self, key: &FieldKey) -> Option<FieldRecord> {
        self.manager.detach_everywhere(key);
        let removed = self.template.fields.get(key.as_str()).cloned();
        if removed.is_some() {
            self.template = Arc::new(self.template.without_field(key.as_str()));
        }
        removed
    }

    /// Replace an existing field's record wholesale.
    pub fn replace_field(&mut self, key: &FieldKey, record: FieldRecord) -> Result<(), DiplomaError> {
        self.record(key)?;
        self.template = Arc::new(self.template.with_field(key.clone(), record));
        Ok(())
    }

    /// Overlay a JSON patch onto a field and re-materialize it.
    ///
    /// The field keeps its type; a `null` in the patch resets that
    /// attribute to its default.
    pub fn merge_field(&mut self, key: &FieldKey, patch: &Value) -> Result<FieldRecord, DiplomaError> {
        let current = self.record(key)?;
        let patch = patch.as_object().ok_or_else(|| {
            DiplomaError::Configuration(format!("Patch for {} must be an object", key))
        })?;

        let mut raw = current.to_json();
        // A legacy spelling in the patch must win over the stored canonical one
        for (legacy, canonical) in [("fontSize", "font_size"), ("fabric_props", "placement")] {
            if patch.contains_key(legacy) {
                raw.remove(canonical);
            }
        }
        for (name, value) in patch {
            if name != "type" {
                raw.insert(name.clone(), value.clone());
            }
        }

        let record = registry::materialize(&Value::Object(raw))?;
        self.template = Arc::new(self.template.with_field(key.clone(), record.clone()));
        Ok(record)
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        let mut next = (*self.template).clone();
        next.name = name.into();
        self.template = Arc::new(next);
    }

    /// Bring the edit target and every thumbnail up to date.
    pub async fn render(&mut self) -> RenderSummary {
        let template = self.template.clone();
        let edit = self.manager.render_edit(&template.fields).await;
        let thumbnails = self.manager.render_thumbnails(&template.fields).await;
        self.manager.prune_decodes().await;
        RenderSummary { edit, thumbnails }
    }

    /// Finish an interactive move of `key` and fold it into the template.
    pub fn interact(&mut self, key: &FieldKey, placement: Placement) -> Result<FieldChange, DiplomaError> {
        let record = self.record(key)?.clone();
        self.manager.move_primitive(key, placement)?;
        let change = self.manager.commit(key, &record)?;
        self.template = Arc::new(
            self.template
                .with_field(change.key.clone(), change.record.clone()),
        );
        Ok(change)
    }

    /// Save the template with a thumbnail of the edit surface as it is now.
    pub async fn save(&mut self) -> Result<(), DiplomaError> {
        self.save_state = SaveState::Saving;
        let result = self.try_save().await;
        self.save_state = match &result {
            Ok(()) => SaveState::Saved,
            Err(e) => {
                tracing::warn!(template = %self.id, error = %e, "Save failed");
                SaveState::Failed(e.to_string())
            }
        };
        result
    }

    async fn try_save(&self) -> Result<(), DiplomaError> {
        let request = SaveRequest {
            name: self.template.name.clone(),
            thumbnail: self.manager.save_thumbnail()?,
            fields: self.template.fields.to_json(),
        };
        self.store.save(&self.id, &request).await?;
        tracing::info!(template = %self.id, "Saved template");
        Ok(())
    }

    /// Export the current template for every recipient.
    pub async fn export_all(&self, tournament: &Tournament, recipients: &[Recipient]) -> Vec<ExportOutcome> {
        self.manager
            .export_all(&self.template.fields, tournament, recipients)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::store::TemplateResponse;
    use crate::surface::Content;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        saved: Mutex<Vec<SaveRequest>>,
        fail_saves: bool,
    }

    #[async_trait]
    impl TemplateStore for MemoryStore {
        async fn load(&self, _id: &str) -> Result<TemplateResponse, DiplomaError> {
            Ok(TemplateResponse {
                success: true,
                name: Some("Club".to_string()),
                fields: Some(json!({
                    "TextField-0": {"type": "TextField", "text": "Champion", "order": 0},
                    "TextField-4": {"type": "TextField", "text": "Runner-up", "order": 1},
                })),
                message: None,
            })
        }

        async fn save(&self, _id: &str, request: &SaveRequest) -> Result<(), DiplomaError> {
            if self.fail_saves {
                return Err(DiplomaError::Transport("offline".to_string()));
            }
            self.saved.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    async fn session(store: Arc<MemoryStore>) -> EditSession {
        EditSession::open(store, "t1", RenderTargetManager::new(EngineConfig::default())).await
    }

    #[tokio::test]
    async fn test_add_never_reuses_ordinals() {
        let mut session = session(Arc::new(MemoryStore::default())).await;
        let key = session.add_field(FieldKind::TextField).unwrap();
        assert_eq!(key.as_str(), "TextField-5");

        session.remove_field(&key);
        let again = session.add_field(FieldKind::TextField).unwrap();
        assert_eq!(again.as_str(), "TextField-6");
    }

    #[tokio::test]
    async fn test_merge_field_patches_and_rematerializes() {
        let mut session = session(Arc::new(MemoryStore::default())).await;
        let key = FieldKey::from("TextField-0");
        let record = session
            .merge_field(&key, &json!({"fontSize": "40", "color": "#ff0000", "type": "ImageField"}))
            .unwrap();
        let FieldRecord::TextField(text) = record else {
            panic!("type must not change");
        };
        assert_eq!(text.font_size, 40.0);
        assert_eq!(text.text, "Champion");
        assert_eq!(text.color.to_string(), "#ff0000");

        assert!(session.merge_field(&"TextField-9".into(), &json!({})).is_err());
    }

    #[tokio::test]
    async fn test_interact_updates_template() {
        let mut session = session(Arc::new(MemoryStore::default())).await;
        session.render().await;
        let key = FieldKey::from("TextField-4");

        let placement = Placement {
            left: 200.0,
            top: 40.0,
            ..Placement::text_default(842, 595)
        };
        let change = session.interact(&key, placement).unwrap();
        assert_eq!(change.key, key);
        let stored = session.template().fields.get("TextField-4").unwrap();
        assert_eq!(stored.placement().unwrap()["left"], json!(200.0));

        // The next render leaves the moved primitive alone
        let summary = session.render().await;
        assert!(summary.edit.is_noop());
    }

    #[tokio::test]
    async fn test_interact_after_unrendered_edit_shows_the_edit() {
        let mut session = session(Arc::new(MemoryStore::default())).await;
        session.render().await;
        let key = FieldKey::from("TextField-0");
        session.merge_field(&key, &json!({"text": "New"})).unwrap();

        let placement = Placement {
            left: 120.0,
            ..Placement::text_default(842, 595)
        };
        session.interact(&key, placement).unwrap();
        let summary = session.render().await;
        assert_eq!(summary.edit.updated, vec![key.clone()]);

        let edit = session.manager().edit();
        let handle = session
            .manager()
            .index()
            .get(edit.surface().id(), &key)
            .and_then(|b| b.handle)
            .unwrap();
        let primitive = edit.surface().get(handle).unwrap();
        assert!(matches!(&primitive.content, Content::Text { text, .. } if text == "New"));
        assert_eq!(primitive.placement.left, 120.0);
    }

    #[tokio::test]
    async fn test_render_prunes_replaced_images() {
        let mut session = session(Arc::new(MemoryStore::default())).await;
        let key = session.add_field(FieldKind::ImageField).unwrap();
        for shade in 0..10u8 {
            let payload = crate::loader::tests::png_payload(16, 16, [shade, shade, 0, 255]);
            session.merge_field(&key, &json!({"image": payload.as_str()})).unwrap();
            session.render().await;
        }
        assert_eq!(session.manager().compositor().loader().cached().await, 1);
    }

    #[tokio::test]
    async fn test_save_tracks_state() {
        let store = Arc::new(MemoryStore::default());
        let mut session = session(store.clone()).await;
        session.rename("Renamed");
        session.render().await;
        session.save().await.unwrap();
        assert_eq!(session.save_state(), &SaveState::Saved);

        let saved = store.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].name, "Renamed");
        assert!(saved[0].thumbnail.as_str().starts_with("data:image/png;base64,"));
        assert_eq!(saved[0].fields["TextField-4"]["order"], json!(1));
    }

    #[tokio::test]
    async fn test_failed_save() {
        let store = Arc::new(MemoryStore {
            fail_saves: true,
            ..Default::default()
        });
        let mut session = session(store).await;
        assert!(session.save().await.is_err());
        assert!(matches!(session.save_state(), SaveState::Failed(msg) if msg.contains("offline")));
    }
}
