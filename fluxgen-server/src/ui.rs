//! Interactive web UI. Generation happens either in-process or on per-model API servers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::{
    extract::{Path as UrlPath, State},
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Form, Router,
};
use fluxgen_core::{
    output::{self, ImageMetadata},
    GenerationRequest, GenerationResult, Generator, ModelVariant,
};
use serde::Deserialize;

use crate::page::{self, FormValues, ResultView, SavedFile};
use crate::remote::{ApiClient, RemoteOutcome};

/// Where the UI sends generation requests.
pub enum Backend {
    /// One in-process generator per model.
    Local(HashMap<String, Arc<Generator>>),
    /// One API server per model; results are re-saved under `output_dir`.
    Remote {
        clients: HashMap<String, ApiClient>,
        output_dir: PathBuf,
    },
}

impl Backend {
    fn output_dirs(&self) -> Vec<&Path> {
        match self {
            Backend::Local(generators) => generators.values().map(|g| g.output_dir()).collect(),
            Backend::Remote { output_dir, .. } => vec![output_dir.as_path()],
        }
    }

    async fn generate(&self, model: &str, request: GenerationRequest) -> Result<ResultView> {
        match self {
            Backend::Local(generators) => {
                let generator = generators
                    .get(model)
                    .ok_or_else(|| unknown_model(model))?
                    .clone();
                let result =
                    tokio::task::spawn_blocking(move || generator.generate(&request)).await??;
                Ok(match result {
                    GenerationResult::Image(image) => ResultView {
                        seed: image.seed.to_string(),
                        image: Some(saved_file(&image.path, image.jpeg)?),
                        warning: None,
                    },
                    GenerationResult::Rejected { seed, message } => ResultView {
                        seed: seed.to_string(),
                        image: None,
                        warning: Some(message),
                    },
                })
            }
            Backend::Remote {
                clients,
                output_dir,
            } => {
                let client = clients
                    .get(model)
                    .ok_or_else(|| unknown_model(model))?;
                match client.generate(&request).await? {
                    RemoteOutcome::Image { bytes, seed } => {
                        let metadata = ImageMetadata::txt2img(
                            model,
                            request
                                .add_sampling_metadata
                                .then_some(request.prompt.as_str()),
                        );
                        let output_dir = output_dir.clone();
                        let (path, jpeg) = tokio::task::spawn_blocking(move || {
                            let image = image::load_from_memory(&bytes)
                                .context("endpoint returned an unreadable image")?;
                            anyhow::Ok(output::save_image(&output_dir, &image, &metadata)?)
                        })
                        .await??;
                        Ok(ResultView {
                            seed,
                            image: Some(saved_file(&path, jpeg)?),
                            warning: None,
                        })
                    }
                    RemoteOutcome::Rejected { message, seed } => Ok(ResultView {
                        seed,
                        image: None,
                        warning: Some(message),
                    }),
                }
            }
        }
    }
}

fn unknown_model(model: &str) -> anyhow::Error {
    fluxgen_core::Error::InvalidRequest(format!("unknown model `{model}`")).into()
}

fn saved_file(path: &Path, jpeg: Vec<u8>) -> Result<SavedFile> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("unexpected output path {}", path.display()))?
        .to_string();
    Ok(SavedFile { file_name, jpeg })
}

pub struct UiState {
    backend: Backend,
    models: Vec<String>,
    example_prompt: String,
    root_path: String,
}

impl UiState {
    pub fn new(backend: Backend, models: Vec<String>, example_prompt: impl Into<String>) -> Self {
        Self {
            backend,
            models,
            example_prompt: example_prompt.into(),
            root_path: String::new(),
        }
    }

    /// Serves links under `root_path`, for running behind a reverse proxy on a sub-path.
    pub fn with_root_path(mut self, root_path: &str) -> Self {
        self.root_path = page::normalize_root_path(root_path);
        self
    }

    fn default_form(&self) -> FormValues {
        let model = self.models.first().cloned().unwrap_or_default();
        let variant = ModelVariant::from_name(&model);
        let defaults = GenerationRequest::new(self.example_prompt.clone());
        FormValues {
            num_steps: variant.map_or(50, |v| v.default_steps()),
            guidance_enabled: variant.map_or(true, |v| v.uses_guidance()),
            model,
            prompt: defaults.prompt,
            width: defaults.width,
            height: defaults.height,
            guidance: defaults.guidance,
            seed: defaults.seed.to_string(),
            add_sampling_metadata: defaults.add_sampling_metadata,
        }
    }
}

/// Submitted form fields. Unchecked checkboxes are simply absent.
#[derive(Deserialize, Debug)]
pub struct GenerateForm {
    #[serde(default)]
    model: Option<String>,
    prompt: String,
    width: usize,
    height: usize,
    num_steps: usize,
    #[serde(default)]
    guidance: Option<f64>,
    seed: String,
    #[serde(default)]
    add_sampling_metadata: Option<String>,
}

async fn index(State(state): State<Arc<UiState>>) -> Html<String> {
    Html(page::render(&state.root_path, &state.models, &state.default_form(), None))
}

async fn submit(State(state): State<Arc<UiState>>, Form(form): Form<GenerateForm>) -> Response {
    let defaults = state.default_form();
    let model = form.model.unwrap_or(defaults.model);
    let values = FormValues {
        guidance_enabled: ModelVariant::from_name(&model).map_or(true, |v| v.uses_guidance()),
        model,
        prompt: form.prompt,
        width: form.width,
        height: form.height,
        num_steps: form.num_steps,
        guidance: form.guidance.unwrap_or(defaults.guidance),
        seed: form.seed,
        add_sampling_metadata: form.add_sampling_metadata.is_some(),
    };

    let (status, result) = match build_request(&values) {
        Err(message) => (StatusCode::BAD_REQUEST, ResultView::warning(message)),
        Ok(request) => match state.backend.generate(&values.model, request).await {
            Ok(result) => (StatusCode::OK, result),
            Err(err) => {
                let status = match err.downcast_ref::<fluxgen_core::Error>() {
                    Some(err) if err.is_client_error() => StatusCode::BAD_REQUEST,
                    _ => {
                        tracing::error!("Error generating image: {err:#}");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, ResultView::warning(format!("Error: {err:#}")))
            }
        },
    };
    (status, Html(page::render(&state.root_path, &state.models, &values, Some(&result)))).into_response()
}

fn build_request(values: &FormValues) -> std::result::Result<GenerationRequest, String> {
    let seed = values
        .seed
        .trim()
        .parse::<i64>()
        .map_err(|_| format!("Seed must be an integer, got `{}`", values.seed))?;
    Ok(GenerationRequest {
        width: values.width,
        height: values.height,
        num_steps: values.num_steps,
        guidance: values.guidance,
        seed,
        prompt: values.prompt.clone(),
        add_sampling_metadata: values.add_sampling_metadata,
    })
}

impl ResultView {
    fn warning(message: String) -> Self {
        Self {
            seed: String::new(),
            image: None,
            warning: Some(message),
        }
    }
}

/// Serves a previously saved image. Only `<uuid>.jpg` names are accepted.
async fn download(State(state): State<Arc<UiState>>, UrlPath(name): UrlPath<String>) -> Response {
    let valid = name
        .strip_suffix(".jpg")
        .is_some_and(|stem| uuid::Uuid::parse_str(stem).is_ok());
    if !valid {
        return StatusCode::NOT_FOUND.into_response();
    }
    for dir in state.backend.output_dirs() {
        if let Ok(bytes) = tokio::fs::read(dir.join(&name)).await {
            let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{name}\""))
                .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
            return (
                [
                    (header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg")),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                bytes,
            )
                .into_response();
        }
    }
    StatusCode::NOT_FOUND.into_response()
}

pub fn router(state: UiState) -> Router {
    Router::new()
        .route("/", get(index).post(submit))
        .route("/file/{name}", get(download))
        .with_state(Arc::new(state))
}
