use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use fluxgen_core::{
    GenerationRequest, Generator, ModelLike, SafetyClassifier, SamplingOptions, NSFW_MESSAGE,
};
use fluxgen_server::{
    api::{self, ErrorResponse, SEED_HEADER},
    page::TITLE,
    remote::{ApiClient, RemoteOutcome},
    ui::{self, Backend, UiState},
};
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use tokio::net::TcpListener;

struct SolidModel;

impl ModelLike for SolidModel {
    fn run(&mut self, options: &SamplingOptions) -> anyhow::Result<DynamicImage> {
        Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            options.width as u32,
            options.height as u32,
            Rgb([(options.seed % 256) as u8, 120, 30]),
        )))
    }
}

struct BrokenModel;

impl ModelLike for BrokenModel {
    fn run(&mut self, _: &SamplingOptions) -> anyhow::Result<DynamicImage> {
        anyhow::bail!("CUDA_ERROR_OUT_OF_MEMORY")
    }
}

struct FixedScore(f32);

impl SafetyClassifier for FixedScore {
    fn nsfw_score(&self, _: &DynamicImage) -> anyhow::Result<f32> {
        Ok(self.0)
    }
}

fn temp_dir() -> PathBuf {
    std::env::temp_dir().join(format!("fluxgen-http-{}", uuid::Uuid::new_v4()))
}

fn generator(model: Box<dyn ModelLike>, score: f32) -> Arc<Generator> {
    Arc::new(Generator::new(
        "flux-schnell",
        model,
        Box::new(FixedScore(score)),
        temp_dir(),
    ))
}

async fn spawn(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn saved_files(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}

fn request(seed: i64) -> GenerationRequest {
    GenerationRequest {
        width: 64,
        height: 48,
        num_steps: 4,
        guidance: 3.5,
        seed,
        prompt: "a lighthouse at dusk".to_string(),
        add_sampling_metadata: true,
    }
}

fn form(seed: &str) -> Vec<(&'static str, String)> {
    vec![
        ("model", "flux-schnell".to_string()),
        ("prompt", "a lighthouse at dusk".to_string()),
        ("width", "64".to_string()),
        ("height", "48".to_string()),
        ("num_steps", "4".to_string()),
        ("guidance", "3.5".to_string()),
        ("seed", seed.to_string()),
        ("add_sampling_metadata", "on".to_string()),
    ]
}

fn download_link(html: &str) -> &str {
    let start = html.find(r#"<a href=""#).expect("no download link") + r#"<a href=""#.len();
    let end = start + html[start..].find('"').unwrap();
    &html[start..end]
}

#[tokio::test]
async fn model_endpoint_reports_loaded_model() {
    let url = spawn(api::router(generator(Box::new(SolidModel), 0.0))).await;
    let body: serde_json::Value = reqwest::get(format!("{url}/model"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, serde_json::json!({ "model": "flux-schnell" }));
}

#[tokio::test]
async fn generate_returns_jpeg_with_seed_header() {
    let generator = generator(Box::new(SolidModel), 0.1);
    let url = spawn(api::router(generator.clone())).await;

    let response = reqwest::Client::new()
        .post(format!("{url}/generate"))
        .json(&request(42))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "image/jpeg");
    assert_eq!(response.headers()[SEED_HEADER], "42");

    let bytes = response.bytes().await.unwrap();
    let image = image::load_from_memory(&bytes).unwrap();
    assert_eq!(image.dimensions(), (64, 48));
    assert_eq!(saved_files(generator.output_dir()).len(), 1);
}

#[tokio::test]
async fn random_seed_is_reported() {
    let url = spawn(api::router(generator(Box::new(SolidModel), 0.0))).await;
    let response = reqwest::Client::new()
        .post(format!("{url}/generate"))
        .json(&serde_json::json!({ "prompt": "a cat", "width": 32, "height": 32 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let seed = response.headers()[SEED_HEADER].to_str().unwrap();
    let seed: u64 = seed.parse().unwrap();
    assert!(seed <= i64::MAX as u64);
}

#[tokio::test]
async fn unsafe_image_is_withheld() {
    let generator = generator(Box::new(SolidModel), 0.9);
    let url = spawn(api::router(generator.clone())).await;

    let response = reqwest::Client::new()
        .post(format!("{url}/generate"))
        .json(&request(7))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.error.message, NSFW_MESSAGE);
    assert_eq!(body.error.seed, Some(7));
    assert!(saved_files(generator.output_dir()).is_empty());
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let url = spawn(api::router(generator(Box::new(SolidModel), 0.0))).await;
    let client = reqwest::Client::new();

    let mut bad_size = request(1);
    bad_size.width = 100;
    let response = client
        .post(format!("{url}/generate"))
        .json(&bad_size)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: ErrorResponse = response.json().await.unwrap();
    assert!(body.error.message.contains("width"), "{}", body.error.message);

    let response = client
        .post(format!("{url}/generate"))
        .json(&serde_json::json!({ "width": 512 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: ErrorResponse = response.json().await.unwrap();
    assert!(body.error.message.contains("prompt"), "{}", body.error.message);
}

#[tokio::test]
async fn generation_failure_is_a_server_error() {
    let url = spawn(api::router(generator(Box::new(BrokenModel), 0.0))).await;
    let response = reqwest::Client::new()
        .post(format!("{url}/generate"))
        .json(&request(3))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: ErrorResponse = response.json().await.unwrap();
    assert!(body.error.message.contains("CUDA_ERROR_OUT_OF_MEMORY"));
}

#[tokio::test]
async fn api_client_talks_to_server() {
    let safe = ApiClient::new(spawn(api::router(generator(Box::new(SolidModel), 0.0))).await);
    assert_eq!(safe.model().await.unwrap(), "flux-schnell");
    match safe.generate(&request(42)).await.unwrap() {
        RemoteOutcome::Image { bytes, seed } => {
            assert_eq!(seed, "42");
            assert!(image::load_from_memory(&bytes).is_ok());
        }
        other => panic!("expected an image, got {other:?}"),
    }

    let unsafe_ = ApiClient::new(spawn(api::router(generator(Box::new(SolidModel), 1.0))).await);
    assert_eq!(
        unsafe_.generate(&request(9)).await.unwrap(),
        RemoteOutcome::Rejected {
            message: NSFW_MESSAGE.to_string(),
            seed: "9".to_string(),
        }
    );

    let broken = ApiClient::new(spawn(api::router(generator(Box::new(BrokenModel), 0.0))).await);
    assert!(broken.generate(&request(9)).await.is_err());
}

fn local_ui(score: f32) -> (UiState, Arc<Generator>) {
    let generator = generator(Box::new(SolidModel), score);
    let generators = HashMap::from([("flux-schnell".to_string(), generator.clone())]);
    let state = UiState::new(
        Backend::Local(generators),
        vec!["flux-schnell".to_string()],
        "a misty forest",
    );
    (state, generator)
}

#[tokio::test]
async fn ui_renders_defaults() {
    let (state, _) = local_ui(0.0);
    let url = spawn(ui::router(state)).await;
    let html = reqwest::get(&url).await.unwrap().text().await.unwrap();
    assert!(html.contains(TITLE));
    assert!(html.contains("a misty forest"));
    assert!(html.contains(r#"name="num_steps" min="1" max="50" step="1" value="4""#));
    assert!(html.contains(r#"<input type="text" name="seed" value="-1">"#));
}

#[tokio::test]
async fn ui_generates_and_serves_download() {
    let (state, generator) = local_ui(0.0);
    let url = spawn(ui::router(state)).await;
    let client = reqwest::Client::new();

    let response = client.post(url.as_str()).form(&form("42")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let html = response.text().await.unwrap();
    assert!(html.contains("data:image/jpeg;base64,"));
    assert!(html.contains(r#"readonly value="42""#));
    assert!(!html.contains("Warning"));

    let link = download_link(&html).to_string();
    let response = client.get(format!("{url}{link}")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "image/jpeg");
    let bytes = response.bytes().await.unwrap();
    let on_disk = std::fs::read(&saved_files(generator.output_dir())[0]).unwrap();
    assert_eq!(bytes.as_ref(), on_disk.as_slice());

    for name in ["../Cargo.toml", "not-a-uuid.jpg", "00000000-0000-4000-8000-000000000000.jpg"] {
        let response = client.get(format!("{url}/file/{name}")).send().await.unwrap();
        assert_eq!(response.status(), 404, "{name}");
    }
}

#[tokio::test]
async fn ui_reports_problems_as_warnings() {
    let (state, generator) = local_ui(0.95);
    let url = spawn(ui::router(state)).await;
    let client = reqwest::Client::new();

    let response = client.post(url.as_str()).form(&form("5")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let html = response.text().await.unwrap();
    assert!(html.contains(NSFW_MESSAGE));
    assert!(html.contains(r#"readonly value="5""#));
    assert!(!html.contains("Download full-resolution"));
    assert!(saved_files(generator.output_dir()).is_empty());

    let response = client.post(url.as_str()).form(&form("lucky")).send().await.unwrap();
    assert_eq!(response.status(), 400);
    let html = response.text().await.unwrap();
    assert!(html.contains("Seed must be an integer"));
    // the submitted values are kept in the form
    assert!(html.contains(r#"name="seed" value="lucky""#));
}

#[tokio::test]
async fn remote_ui_resaves_images_locally() {
    let api_generator = generator(Box::new(SolidModel), 0.0);
    let api_url = spawn(api::router(api_generator.clone())).await;
    let ui_dir = temp_dir();
    let backend = Backend::Remote {
        clients: HashMap::from([("flux-schnell".to_string(), ApiClient::new(api_url))]),
        output_dir: ui_dir.clone(),
    };
    let state = UiState::new(backend, vec!["flux-schnell".to_string()], "a misty forest");
    let url = spawn(ui::router(state)).await;
    let client = reqwest::Client::new();

    let response = client.post(url.as_str()).form(&form("11")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let html = response.text().await.unwrap();
    assert!(html.contains("data:image/jpeg;base64,"));
    assert!(html.contains(r#"readonly value="11""#));
    assert_eq!(saved_files(&ui_dir).len(), 1);
    assert_eq!(saved_files(api_generator.output_dir()).len(), 1);

    let link = download_link(&html).to_string();
    let response = client.get(format!("{url}{link}")).send().await.unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn remote_ui_surfaces_rejections_and_outages() {
    let api_url = spawn(api::router(generator(Box::new(SolidModel), 0.99))).await;
    let ui_dir = temp_dir();
    let backend = Backend::Remote {
        clients: HashMap::from([("flux-schnell".to_string(), ApiClient::new(api_url))]),
        output_dir: ui_dir.clone(),
    };
    let url = spawn(ui::router(UiState::new(
        backend,
        vec!["flux-schnell".to_string()],
        "a misty forest",
    )))
    .await;
    let client = reqwest::Client::new();

    let html = client
        .post(url.as_str())
        .form(&form("13"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(html.contains(NSFW_MESSAGE));
    assert!(html.contains(r#"readonly value="13""#));
    assert!(saved_files(&ui_dir).is_empty());

    // nothing listens on port 9 locally
    let backend = Backend::Remote {
        clients: HashMap::from([(
            "flux-schnell".to_string(),
            ApiClient::new("http://127.0.0.1:9"),
        )]),
        output_dir: temp_dir(),
    };
    let url = spawn(ui::router(UiState::new(
        backend,
        vec!["flux-schnell".to_string()],
        "a misty forest",
    )))
    .await;
    let response = client.post(url.as_str()).form(&form("13")).send().await.unwrap();
    assert_eq!(response.status(), 500);
    assert!(response.text().await.unwrap().contains("Error:"));
}

#[tokio::test]
async fn model_name_survives_generations() {
    let url = spawn(api::router(generator(Box::new(SolidModel), 0.0))).await;
    let rejecting = spawn(api::router(generator(Box::new(SolidModel), 0.99))).await;
    let broken = spawn(api::router(generator(Box::new(BrokenModel), 0.0))).await;
    let client = reqwest::Client::new();

    let post = |base: &str| client.post(format!("{base}/generate")).json(&request(21)).send();
    assert_eq!(post(url.as_str()).await.unwrap().status(), 200);
    let rejected: ErrorResponse = post(rejecting.as_str()).await.unwrap().json().await.unwrap();
    assert_eq!(rejected.error.message, NSFW_MESSAGE);
    assert_eq!(post(broken.as_str()).await.unwrap().status(), 500);

    for base in [&url, &rejecting, &broken] {
        let body: serde_json::Value = client
            .get(format!("{base}/model"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, serde_json::json!({ "model": "flux-schnell" }));
    }
}

#[tokio::test]
async fn ui_links_respect_root_path() {
    let (state, _) = local_ui(0.0);
    let url = spawn(ui::router(state.with_root_path("/apps/flux/"))).await;
    let client = reqwest::Client::new();

    let html = client.get(&url).send().await.unwrap().text().await.unwrap();
    assert!(html.contains(r#"<form method="post" action="/apps/flux/""#));

    let html = client
        .post(url.as_str())
        .form(&form("42"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let link = download_link(&html);
    assert!(link.starts_with("/apps/flux/file/"), "{link}");

    // the proxy strips the prefix before forwarding
    let name = link.trim_start_matches("/apps/flux/file/");
    let response = client.get(format!("{url}/file/{name}")).send().await.unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn ui_rejects_unconfigured_model() {
    let (state, generator) = local_ui(0.0);
    let url = spawn(ui::router(state)).await;
    let mut fields = form("1");
    fields[0].1 = "flux-pro".to_string();

    let response = reqwest::Client::new()
        .post(url.as_str())
        .form(&fields)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert!(response.text().await.unwrap().contains("unknown model"));
    assert!(saved_files(generator.output_dir()).is_empty());
}
