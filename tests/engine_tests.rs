//! # Engine Tests
//!
//! End-to-end behavior of the composition engine: templates in, surfaces
//! and PNGs out.
//!
//! All renders use a small surface so the export tests stay fast.

use async_trait::async_trait;
use lopdf::{Document, Object, Stream, dictionary};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

use diploma::compositor::Compositor;
use diploma::loader::{LoadPurpose, RasterLoader, RasterPayload};
use diploma::model::{Placement, registry};
use diploma::recipient::{Recipient, Tournament};
use diploma::store::{SaveRequest, TemplateResponse, TemplateStore};
use diploma::substitute::{SubstitutionContext, resolve};
use diploma::surface::Content;
use diploma::target::{PrimitiveIndex, RenderTarget, TargetKind};
use diploma::{DiplomaError, EditSession, EngineConfig, FieldKey, FieldKind, FieldMap, RenderTargetManager};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn small_config() -> EngineConfig {
    EngineConfig {
        surface_width: 200,
        surface_height: 100,
        preview_zoom: 0.5,
        export_zoom: 2.0,
        ..Default::default()
    }
}

fn png(w: u32, h: u32, color: [u8; 4]) -> RasterPayload {
    let img = image::RgbaImage::from_pixel(w, h, image::Rgba(color));
    let mut bytes = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    RasterPayload::from_bytes("image/png", &bytes)
}

/// A one-page PDF with nothing on it.
fn blank_pdf(media_box: [f32; 4]) -> RasterPayload {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let content_id = doc.add_object(Stream::new(lopdf::Dictionary::new(), b"q Q".to_vec()));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => media_box.iter().map(|v| Object::Real(*v)).collect::<Vec<_>>(),
        "Contents" => content_id,
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![Object::Reference(page_id)],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    RasterPayload::from_bytes("application/pdf", &bytes)
}

fn fields(raw: Value) -> FieldMap {
    let (fields, errors) = registry::parse_fields(&raw);
    assert!(errors.is_empty(), "{:?}", errors);
    fields
}

/// Serves one fixed template and records saves.
struct FixedStore {
    fields: Value,
    saved: Mutex<Vec<SaveRequest>>,
}

impl FixedStore {
    fn new(fields: Value) -> Arc<Self> {
        Arc::new(Self {
            fields,
            saved: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TemplateStore for FixedStore {
    async fn load(&self, _id: &str) -> Result<TemplateResponse, DiplomaError> {
        Ok(TemplateResponse {
            success: true,
            name: Some("Fixture".to_string()),
            fields: Some(self.fields.clone()),
            message: None,
        })
    }

    async fn save(&self, _id: &str, request: &SaveRequest) -> Result<(), DiplomaError> {
        self.saved.lock().unwrap().push(request.clone());
        Ok(())
    }
}

fn tournament(players: Value) -> Tournament {
    serde_json::from_value(json!({
        "id": "t-1",
        "fullName": "Spring Open",
        "startsAt": "2024-03-15T10:00:00Z",
        "standing": {"players": players},
    }))
    .unwrap()
}

// ============================================================================
// COMPOSITION
// ============================================================================

#[tokio::test]
async fn test_apply_twice_creates_nothing_new() {
    let compositor = Compositor::default();
    let mut target = RenderTarget::new(TargetKind::Edit, 200, 100, 1.0, None);
    let mut index = PrimitiveIndex::new();
    let model = fields(json!({
        "BackgroundImage-0": {"type": "BackgroundImage", "image": png(20, 10, [200, 200, 255, 255]).as_str()},
        "ImageField-0": {"type": "ImageField", "image": png(8, 8, [0, 0, 0, 255]).as_str()},
        "ImageField-1": {"type": "ImageField", "image": null},
        "TextField-0": {"type": "TextField", "text": "Winner"},
    }));

    let first = compositor.apply(&mut target, &mut index, &model).await;
    assert!(first.is_clean());
    // The image-less field renders nothing
    assert_eq!(target.surface().len(), 3);

    let second = compositor.apply(&mut target, &mut index, &model).await;
    assert!(second.is_noop());
    assert_eq!(target.surface().len(), 3);
}

#[tokio::test]
async fn test_committed_placement_round_trips() {
    let store = FixedStore::new(json!({
        "TextField-0": {"type": "TextField", "text": "Moved", "placement": {"shadow": "2px"}},
    }));
    let mut session = EditSession::open(store, "t", RenderTargetManager::new(small_config())).await;
    session.render().await;

    let key = FieldKey::from("TextField-0");
    let moved = Placement {
        left: 123.25,
        top: 40.5,
        scale_x: 1.5,
        scale_y: 1.5,
        angle: 15.0,
        ..Placement::text_default(200, 100)
    };
    let change = session.interact(&key, moved).unwrap();
    let persisted = session.template().fields.to_json();

    // A fresh editor loading the saved fields shows the same transform
    let reloaded = FixedStore::new(persisted.clone());
    let mut fresh = EditSession::open(reloaded, "t", RenderTargetManager::new(small_config())).await;
    fresh.render().await;
    let (_, primitive) = fresh.manager().edit().surface().stacked().next().unwrap();
    let shown = primitive.placement;
    assert_eq!(shown, moved);

    // Committing again without moving yields identical JSON
    let again = fresh.interact(&key, shown).unwrap();
    assert_eq!(again.record, change.record);
    assert_eq!(fresh.template().fields.to_json(), persisted);
    assert_eq!(persisted["TextField-0"]["placement"]["shadow"], json!("2px"));
}

#[tokio::test]
async fn test_committed_image_placement_round_trips() {
    let store = FixedStore::new(json!({
        "ImageField-0": {"type": "ImageField", "image": png(10, 5, [0, 128, 0, 255]).as_str()},
    }));
    let mut session = EditSession::open(store, "t", RenderTargetManager::new(small_config())).await;
    session.render().await;

    let key = FieldKey::from("ImageField-0");
    let (_, primitive) = session.manager().edit().surface().stacked().next().unwrap();
    // Created at 70% of the surface width
    assert_eq!(primitive.placement.scale_x, 0.7 * 200.0 / 10.0);
    let moved = Placement {
        left: 60.0,
        top: 25.0,
        angle: -10.0,
        ..primitive.placement
    };
    session.interact(&key, moved).unwrap();
    let persisted = session.template().fields.to_json();
    let scale = persisted["ImageField-0"]["placement"]["scaleX"].as_f64().unwrap();
    assert!((scale - 14.0).abs() < 1e-9, "{}", scale);

    let mut fresh = EditSession::open(FixedStore::new(persisted.clone()), "t", RenderTargetManager::new(small_config())).await;
    fresh.render().await;
    let (_, primitive) = fresh.manager().edit().surface().stacked().next().unwrap();
    assert_eq!(primitive.placement, moved);

    let shown = primitive.placement;
    fresh.interact(&key, shown).unwrap();
    assert_eq!(fresh.template().fields.to_json(), persisted);
}

#[tokio::test]
async fn test_move_after_unrendered_edit_keeps_both() {
    let store = FixedStore::new(json!({
        "TextField-0": {"type": "TextField", "text": "Old"},
    }));
    let mut session = EditSession::open(store.clone(), "t", RenderTargetManager::new(small_config())).await;
    session.render().await;

    let key = FieldKey::from("TextField-0");
    session.merge_field(&key, &json!({"text": "New"})).unwrap();
    let moved = Placement {
        left: 42.0,
        ..Placement::text_default(200, 100)
    };
    session.interact(&key, moved).unwrap();
    session.render().await;

    let (_, primitive) = session.manager().edit().surface().stacked().next().unwrap();
    assert!(matches!(&primitive.content, Content::Text { text, .. } if text == "New"));
    assert_eq!(primitive.placement.left, 42.0);

    session.save().await.unwrap();
    let saved = store.saved.lock().unwrap();
    assert_eq!(saved[0].fields["TextField-0"]["text"], json!("New"));
    assert_eq!(saved[0].fields["TextField-0"]["placement"]["left"], json!(42.0));
}

#[tokio::test]
async fn test_second_background_takes_over_when_first_is_removed() {
    let store = FixedStore::new(json!({
        "BackgroundImage-0": {"type": "BackgroundImage", "image": png(4, 2, [255, 0, 0, 255]).as_str(), "order": 0},
        "BackgroundImage-1": {"type": "BackgroundImage", "image": png(6, 3, [0, 0, 255, 255]).as_str(), "order": 1},
    }));
    let mut session = EditSession::open(store, "t", RenderTargetManager::new(small_config())).await;
    session.render().await;

    let shown = |session: &EditSession| {
        session
            .manager()
            .edit()
            .surface()
            .background()
            .map(|(_, p)| (p.key.clone(), p.image_size()))
    };
    assert_eq!(shown(&session), Some((FieldKey::from("BackgroundImage-1"), Some((6, 3)))));

    session.remove_field(&FieldKey::from("BackgroundImage-1"));
    session.render().await;
    assert_eq!(shown(&session), Some((FieldKey::from("BackgroundImage-0"), Some((4, 2)))));

    // The painted page is the surviving background, not white paper
    let thumbnail = session.manager().save_thumbnail().unwrap();
    let image = image::load_from_memory(&thumbnail.decode().unwrap().bytes)
        .unwrap()
        .to_rgba8();
    assert_eq!(image.get_pixel(2, 2).0, [255, 0, 0, 255]);
}

#[tokio::test]
async fn test_thumbnails_follow_committed_moves() {
    let store = FixedStore::new(json!({
        "TextField-0": {"type": "TextField", "text": "${player.name}"},
    }));
    let mut session = EditSession::open(store, "t", RenderTargetManager::new(small_config())).await;
    let t = tournament(json!([{"name": "ada", "rank": 1}]));
    session.manager_mut().sync_recipients(&t, &t.recipients());
    session.render().await;

    let key = FieldKey::from("TextField-0");
    let moved = Placement {
        left: 30.0,
        ..Placement::text_default(200, 100)
    };
    session.interact(&key, moved).unwrap();
    session.render().await;

    let thumbnail = session.manager().thumbnail("ada").unwrap();
    let (_, primitive) = thumbnail.surface().stacked().next().unwrap();
    assert_eq!(primitive.placement.left, 30.0);
    assert!(matches!(&primitive.content, Content::Text { text, .. } if text == "ada"));
    assert!(!primitive.editable);
}

#[tokio::test]
async fn test_removed_key_is_not_resurrected() {
    let store = FixedStore::new(json!({
        "TextField-0": {"type": "TextField", "text": "Old", "font_size": 40, "placement": {"left": 5}},
    }));
    let mut session = EditSession::open(store, "t", RenderTargetManager::new(small_config())).await;
    session.render().await;

    session.remove_field(&"TextField-0".into());
    let key = session.add_field(FieldKind::TextField).unwrap();
    assert_eq!(key.as_str(), "TextField-1");
    session.render().await;

    let surface = session.manager().edit().surface();
    assert_eq!(surface.len(), 1);
    let (_, primitive) = surface.stacked().next().unwrap();
    assert_eq!(primitive.key, key);
    assert_eq!(primitive.placement, Placement::text_default(200, 100));
    match &primitive.content {
        Content::Text { text, font_size, .. } => {
            assert_eq!(text, "Example Text");
            assert_eq!(*font_size, 24.0);
        }
        other => panic!("expected text, got {:?}", other),
    }
}

#[tokio::test]
async fn test_superseded_decode_is_discarded() {
    let compositor = Compositor::default();
    let mut target = RenderTarget::new(TargetKind::Edit, 200, 100, 1.0, None);
    let mut index = PrimitiveIndex::new();
    for size in [3, 4, 5, 6] {
        let model = fields(json!({
            "ImageField-0": {"type": "ImageField", "image": png(size, size, [9, 9, 9, 255]).as_str()},
        }));
        compositor.stage(&mut target, &mut index, &model);
    }
    let report = compositor.settle(&mut target, &mut index).await;

    assert!(report.is_clean());
    assert_eq!(target.surface().len(), 1);
    let (_, primitive) = target.surface().stacked().next().unwrap();
    assert_eq!(primitive.image_size(), Some((6, 6)));
}

// ============================================================================
// LOADING & SUBSTITUTION
// ============================================================================

#[tokio::test]
async fn test_pdf_background_size() {
    let loader = RasterLoader::new(2.0);
    let raster = loader
        .load(blank_pdf([0.0, 0.0, 300.6, 200.2]), LoadPurpose::Background)
        .await
        .unwrap();
    assert_eq!(raster.dimensions(), (601, 400));

    // PDFs are only accepted as backgrounds
    let as_image = loader
        .load(blank_pdf([0.0, 0.0, 10.0, 10.0]), LoadPurpose::Image)
        .await;
    assert!(matches!(as_image, Err(DiplomaError::Decode(_))));
}

#[test]
fn test_date_token_renders_calendar_date() {
    let t = tournament(json!([]));
    let r = Recipient::default();
    let ctx = SubstitutionContext::for_recipient(&t, &r, &EngineConfig::default().dates);
    assert_eq!(resolve("${tournament.date}", Some(&ctx)), "3/15/2024");
}

#[test]
fn test_substitution_context_rules() {
    let text = "Congratulations ${player.profile.firstName}";
    assert_eq!(resolve(text, None), text);

    let ctx = SubstitutionContext::new(json!({}), json!({"Profile": {"FIRSTNAME": "Ada"}}));
    assert_eq!(resolve(text, Some(&ctx)), "Congratulations Ada");
    assert_eq!(resolve("${player.missing}!", Some(&ctx)), "!");
}

// ============================================================================
// EXPORT
// ============================================================================

#[tokio::test]
async fn test_batch_export_isolates_failures() {
    let good = png(6, 6, [10, 120, 10, 255]);
    let players: Vec<Value> = (1..=5)
        .map(|rank| {
            let photo = if rank == 3 {
                "data:image/png;base64,Y29ycnVwdA==".to_string()
            } else {
                good.as_str().to_string()
            };
            json!({"name": format!("p{}", rank), "rank": rank, "photo": photo})
        })
        .collect();
    let t = tournament(Value::Array(players));

    let store = FixedStore::new(json!({
        "BackgroundImage-0": {"type": "BackgroundImage", "image": png(40, 20, [250, 250, 250, 255]).as_str()},
        "ImageField-0": {"type": "ImageField", "image": "${player.photo}"},
        "TextField-0": {"type": "TextField", "text": "${player.name}, ${tournament.fullName}"},
    }));
    let session = EditSession::open(store, "t", RenderTargetManager::new(small_config())).await;

    let outcomes = session.export_all(&t, &t.recipients()).await;
    let ids: Vec<_> = outcomes.iter().map(|o| o.recipient_id.as_str()).collect();
    assert_eq!(ids, vec!["p1", "p2", "p3", "p4", "p5"]);

    let failed: Vec<_> = outcomes.iter().filter(|o| o.result.is_err()).map(|o| o.rank).collect();
    assert_eq!(failed, vec![3]);

    for outcome in outcomes.iter().filter(|o| o.rank != 3) {
        let artifact = outcome.result.as_ref().unwrap();
        assert_eq!((artifact.width, artifact.height), (400, 200));
        assert_eq!(artifact.filename, format!("2024-03-15-Spring Open-{}.png", outcome.rank));
        let decoded = image::load_from_memory(&artifact.png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (400, 200));
    }
}

#[tokio::test]
async fn test_lenient_export_keeps_going() {
    let config = EngineConfig {
        strict_exports: false,
        ..small_config()
    };
    let t = tournament(json!([{"name": "solo", "rank": 1, "photo": "data:,nope"}]));
    let fields = fields(json!({
        "ImageField-0": {"type": "ImageField", "image": "${player.photo}"},
    }));
    let manager = RenderTargetManager::new(config);

    let artifact = manager.export(&fields, &t, &t.recipients()[0]).await.unwrap();
    assert_eq!(artifact.filename, "2024-03-15-Spring Open-1.png");
}
