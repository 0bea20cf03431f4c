//! # Template Store
//!
//! Where templates are loaded from and saved to. The editor talks to the
//! web backend over HTTP; the CLI keeps templates as JSON files.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::error::{DiplomaError, FieldError};
use crate::loader::RasterPayload;
use crate::model::{Template, registry};

/// `GET` response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `POST` request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveRequest {
    pub name: String,
    /// PNG data URI of the edit surface at the save multiplier.
    pub thumbnail: RasterPayload,
    pub fields: Value,
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<TemplateResponse, DiplomaError>;

    async fn save(&self, id: &str, request: &SaveRequest) -> Result<(), DiplomaError>;
}

/// Load a template, falling back to the built-in default.
///
/// A `success: false` response and a transport failure are treated alike.
/// Fields that fail to materialize are skipped and returned.
pub async fn load_or_default(store: &dyn TemplateStore, id: &str) -> (Template, Vec<FieldError>) {
    match store.load(id).await {
        Ok(response) if response.success => {
            let name = response.name.or_else(|| Some("Diploma".to_string()));
            match response.fields {
                Some(fields) => Template::from_parts(name, &fields),
                None => (Template::new(name.unwrap_or_default()), Vec::new()),
            }
        }
        Ok(response) => {
            tracing::warn!(
                id,
                message = response.message.as_deref().unwrap_or(""),
                "Template not available, using default"
            );
            (registry::default_template(), Vec::new())
        }
        Err(e) => {
            tracing::warn!(id, error = %e, "Template load failed, using default");
            (registry::default_template(), Vec::new())
        }
    }
}

// ============================================================================
// HTTP
// ============================================================================

/// The web backend's template endpoints.
#[derive(Debug, Clone)]
pub struct HttpTemplateStore {
    client: reqwest::Client,
    base_url: String,
    xsrf: Option<String>,
}

impl HttpTemplateStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self, DiplomaError> {
        let client = reqwest::Client::builder()
            .user_agent("diploma/0.1")
            .build()
            .map_err(|e| DiplomaError::Transport(format!("HTTP client error: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            xsrf: None,
        })
    }

    /// Token echoed back as `_xsrf` on saves.
    pub fn with_xsrf(mut self, token: impl Into<String>) -> Self {
        self.xsrf = Some(token.into());
        self
    }

    fn url(&self, id: &str) -> String {
        format!("{}/api/v1/diploma/template/{}", self.base_url, id)
    }
}

#[async_trait]
impl TemplateStore for HttpTemplateStore {
    async fn load(&self, id: &str) -> Result<TemplateResponse, DiplomaError> {
        let response = self
            .client
            .get(self.url(id))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<TemplateResponse>().await?)
    }

    async fn save(&self, id: &str, request: &SaveRequest) -> Result<(), DiplomaError> {
        let mut call = self.client.post(self.url(id)).json(request);
        if let Some(token) = &self.xsrf {
            call = call.query(&[("_xsrf", token)]);
        }
        let response = call.send().await?.error_for_status()?;

        // Older backends answer with an empty body
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(());
        }
        let reply: TemplateResponse = serde_json::from_str(&body)
            .map_err(|e| DiplomaError::Transport(format!("Unexpected save response: {}", e)))?;
        if reply.success {
            Ok(())
        } else {
            Err(DiplomaError::Transport(
                reply.message.unwrap_or_else(|| "save rejected".to_string()),
            ))
        }
    }
}

// ============================================================================
// FILES
// ============================================================================

/// Templates as `<dir>/<id>.json`, in the same shape the backend serves.
#[derive(Debug, Clone)]
pub struct FileTemplateStore {
    dir: PathBuf,
}

impl FileTemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, id: &str) -> Result<PathBuf, DiplomaError> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(DiplomaError::Configuration(format!("Invalid template id '{}'", id)));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }
}

/// A template file as written by hand or by [`FileTemplateStore::save`].
#[derive(Deserialize)]
struct StoredTemplate {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    fields: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

#[async_trait]
impl TemplateStore for FileTemplateStore {
    async fn load(&self, id: &str) -> Result<TemplateResponse, DiplomaError> {
        let path = self.path(id)?;
        let text = tokio::fs::read_to_string(&path).await?;
        let stored: StoredTemplate = serde_json::from_str(&text)?;
        Ok(TemplateResponse {
            // Hand-written files rarely bother with the flag
            success: stored.success.unwrap_or(true),
            name: stored.name,
            fields: stored.fields,
            message: stored.message,
        })
    }

    async fn save(&self, id: &str, request: &SaveRequest) -> Result<(), DiplomaError> {
        let path = self.path(id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::json!({
            "success": true,
            "name": request.name,
            "thumbnail": request.thumbnail,
            "fields": request.fields,
        });
        tokio::fs::write(&path, serde_json::to_vec_pretty(&body)?).await?;
        tracing::debug!(path = %path.display(), "Saved template");
        Ok(())
    }
}
