use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::Router;
use clap::{Args as ClapArgs, Parser, Subcommand};
use fluxgen_core::{
    load_generator,
    output::{self, ImageMetadata, DEFAULT_OUTPUT_DIR},
    DeviceMap, GenerationRequest, LoadOptions, RANDOM_SEED,
};
use fluxgen_server::{
    api,
    config::{self, DEFAULT_EXAMPLE_PROMPT, DEFAULT_MODEL},
    remote::{ApiClient, RemoteOutcome},
    ui::{self, Backend, UiState},
};
use hf_hub::api::tokio::Api;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Flux text-to-image server and web UI")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long, global = true)]
    cpu: bool,

    /// Directory generated images are written to
    #[arg(long, global = true, env = "FLUXGEN_OUTPUT_DIR", default_value = DEFAULT_OUTPUT_DIR)]
    output_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve `GET /model` and `POST /generate` for one model
    Api(ApiArgs),
    /// Serve the web UI with models loaded in-process
    Ui(UiArgs),
    /// Serve the web UI backed by per-model API servers
    RemoteUi(RemoteUiArgs),
    /// Send one request to an API server and save the result
    Client(ClientArgs),
}

#[derive(ClapArgs, Debug)]
struct ApiArgs {
    /// Model variant to serve
    #[arg(long, env = "FLUX_MODEL_NAME", default_value = DEFAULT_MODEL)]
    model: String,

    /// Host address to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Move model components to the device only while they run
    #[arg(long)]
    offload: bool,
}

#[derive(ClapArgs, Debug)]
struct UiFlags {
    /// Comma separated list of models offered in the dropdown
    #[arg(long, default_value = DEFAULT_MODEL)]
    models: String,

    /// Prompt pre-filled in the form
    #[arg(long, default_value = DEFAULT_EXAMPLE_PROMPT)]
    example_prompt: String,

    /// Path prefix the UI is served under behind a reverse proxy
    #[arg(long, env = "FLUXGEN_WEB_ROOT_PATH", default_value = "")]
    web_root_path: String,

    /// Host address to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 7860)]
    port: u16,
}

#[derive(ClapArgs, Debug)]
struct UiArgs {
    #[command(flatten)]
    ui: UiFlags,

    /// Move model components to the device only while they run
    #[arg(long)]
    offload: bool,
}

#[derive(ClapArgs, Debug)]
struct RemoteUiArgs {
    #[command(flatten)]
    ui: UiFlags,

    /// API server for a model, as NAME=URL; may be repeated
    #[arg(long = "endpoint", value_parser = config::parse_endpoint)]
    endpoints: Vec<(String, String)>,
}

#[derive(ClapArgs, Debug)]
struct ClientArgs {
    /// Base URL of the API server
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    url: String,

    #[arg(long, default_value = DEFAULT_EXAMPLE_PROMPT)]
    prompt: String,

    #[arg(long, default_value_t = 1360)]
    width: usize,

    #[arg(long, default_value_t = 768)]
    height: usize,

    #[arg(long, default_value_t = 4)]
    num_steps: usize,

    #[arg(long, default_value_t = 3.5)]
    guidance: f64,

    #[arg(long, default_value_t = RANDOM_SEED, allow_negative_numbers = true)]
    seed: i64,

    /// Leave the prompt out of the saved image's EXIF data
    #[arg(long)]
    no_sampling_metadata: bool,
}

async fn serve(app: Router, host: &str, port: u16) -> Result<()> {
    let bind_address = format!("{host}:{port}");
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

async fn run_api(args: ApiArgs, options: LoadOptions, output_dir: PathBuf) -> Result<()> {
    let generator = load_generator(&args.model, Api::new()?, options, output_dir).await?;
    let app = api::router(Arc::new(generator));
    serve(app, &args.host, args.port).await
}

async fn run_ui(args: UiArgs, options: LoadOptions, output_dir: PathBuf) -> Result<()> {
    let models = config::parse_models(&args.ui.models)?;
    let api = Api::new()?;
    let mut generators = HashMap::new();
    for model in &models {
        let generator = load_generator(model, api.clone(), options, output_dir.clone()).await?;
        generators.insert(model.clone(), Arc::new(generator));
    }
    let state = UiState::new(Backend::Local(generators), models, args.ui.example_prompt)
        .with_root_path(&args.ui.web_root_path);
    serve(ui::router(state), &args.ui.host, args.ui.port).await
}

async fn run_remote_ui(args: RemoteUiArgs, output_dir: PathBuf) -> Result<()> {
    let models = config::parse_models(&args.ui.models)?;
    let helm = config::helm_release_from_env();
    let endpoints = config::resolve_endpoints(
        &models,
        &args.endpoints,
        helm.as_ref().map(|(r, n)| (r.as_str(), n.as_str())),
    )?;
    let http = reqwest::Client::new();
    let clients = endpoints
        .into_iter()
        .map(|(model, url)| {
            tracing::info!("Using {url} for {model}");
            (model, ApiClient::with_client(http.clone(), url))
        })
        .collect();
    let backend = Backend::Remote {
        clients,
        output_dir,
    };
    let state =
        UiState::new(backend, models, args.ui.example_prompt).with_root_path(&args.ui.web_root_path);
    serve(ui::router(state), &args.ui.host, args.ui.port).await
}

async fn run_client(args: ClientArgs, output_dir: &Path) -> Result<()> {
    let client = ApiClient::new(&args.url);
    let model = client.model().await?;
    let request = GenerationRequest {
        width: args.width,
        height: args.height,
        num_steps: args.num_steps,
        guidance: args.guidance,
        seed: args.seed,
        prompt: args.prompt,
        add_sampling_metadata: !args.no_sampling_metadata,
    };
    request.validate()?;
    tracing::info!("Requesting image from {model} at {}", client.base_url());

    match client.generate(&request).await? {
        RemoteOutcome::Image { bytes, seed } => {
            let image = image::load_from_memory(&bytes)?;
            let metadata = ImageMetadata::txt2img(
                &model,
                request
                    .add_sampling_metadata
                    .then_some(request.prompt.as_str()),
            );
            let (path, _) = output::save_image(output_dir, &image, &metadata)?;
            println!("Seed: {seed}");
            println!("Result saved to: {}", path.display());
            Ok(())
        }
        RemoteOutcome::Rejected { message, seed } => bail!("{message} (seed {seed})"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let options = LoadOptions {
        device_map: DeviceMap::from_cpu_flag(args.cpu),
        ..Default::default()
    };

    match args.command {
        Command::Api(api_args) => {
            let options = LoadOptions {
                offload: api_args.offload,
                ..options
            };
            run_api(api_args, options, args.output_dir).await
        }
        Command::Ui(ui_args) => {
            let options = LoadOptions {
                offload: ui_args.offload,
                ..options
            };
            run_ui(ui_args, options, args.output_dir).await
        }
        Command::RemoteUi(remote_args) => run_remote_ui(remote_args, args.output_dir).await,
        Command::Client(client_args) => run_client(client_args, &args.output_dir).await,
    }
}
