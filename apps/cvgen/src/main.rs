use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use cvrelay_client::{
    ClientConfig, FlowOptions, GenerationFlow, GenerationRequest, ImageInput, Preset, RelayClient,
    WaitOptions,
};
use cvrelay_common::parse_duration;
use cvrelay_protocol::CameraStrength;

#[derive(Parser)]
#[command(name = "cvgen", version, about = "Generate images and video through a cvrelay instance")]
struct Cli {
    /// Relay base URL.
    #[arg(long, env = "RELAY_ENDPOINT")]
    endpoint: String,

    #[arg(long, env = "RELAY_ACCESS_KEY")]
    access_key: String,

    #[arg(long, env = "RELAY_SECRET_KEY")]
    secret_key: String,

    #[arg(long, env = "RELAY_REGION", default_value = "cn-north-1")]
    region: String,

    /// Directory results are written to.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Replace existing result files.
    #[arg(long)]
    overwrite: bool,

    /// Override the polling interval, e.g. `2s`.
    #[arg(long)]
    poll_interval: Option<String>,

    /// Override the wait timeout, e.g. `5m`.
    #[arg(long)]
    wait_timeout: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Text-to-image generation.
    Image {
        #[arg(long, default_value = "t2i-v40")]
        preset: String,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        seed: Option<i64>,
    },
    /// Text- or image-to-video generation.
    Video {
        #[arg(long, default_value = "t2v-720")]
        preset: String,
        #[arg(long)]
        prompt: Option<String>,
        /// Image input: local path, http(s) URL, or data URL. Repeatable.
        #[arg(long = "image")]
        images: Vec<String>,
        #[arg(long)]
        frames: Option<u32>,
        #[arg(long)]
        aspect_ratio: Option<String>,
        #[arg(long)]
        template: Option<String>,
        /// weak | medium | strong (recamera preset only).
        #[arg(long)]
        camera_strength: Option<String>,
        #[arg(long)]
        seed: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = ClientConfig::new(&cli.endpoint, &cli.access_key, &cli.secret_key);
    config.region = cli.region.clone();
    let client = RelayClient::new(config).context("build relay client")?;

    let request = build_request(&cli.command)?;
    let wait = wait_options(&cli, request.preset)?;
    let flow = GenerationFlow::new(
        client,
        FlowOptions {
            out_dir: cli.out_dir.clone(),
            overwrite: cli.overwrite,
            wait,
            ..FlowOptions::default()
        },
    )
    .context("build generation flow")?;

    let outcome = flow.run(&request).await;
    if let Some(task_id) = &outcome.task_id {
        println!("task id: {task_id}");
    }
    if let Some(status) = outcome.status {
        println!("status:  {status}");
    }
    for file in &outcome.files {
        println!("wrote:   {}", file.display());
    }
    match outcome.error {
        Some(err) => Err(anyhow::anyhow!(err).context("generation failed")),
        None => Ok(()),
    }
}

fn build_request(command: &Command) -> anyhow::Result<GenerationRequest> {
    match command {
        Command::Image {
            preset,
            prompt,
            seed,
        } => {
            let preset: Preset = preset
                .parse()
                .map_err(|err: String| anyhow::anyhow!(err))?;
            let mut request = GenerationRequest::new(preset).with_prompt(prompt.as_str());
            request.seed = *seed;
            Ok(request)
        }
        Command::Video {
            preset,
            prompt,
            images,
            frames,
            aspect_ratio,
            template,
            camera_strength,
            seed,
        } => {
            let preset: Preset = preset
                .parse()
                .map_err(|err: String| anyhow::anyhow!(err))?;
            let mut request = GenerationRequest::new(preset);
            request.prompt = prompt.clone();
            request.frames = *frames;
            request.aspect_ratio = aspect_ratio.clone();
            request.template_id = template.clone();
            request.camera_strength = camera_strength
                .as_deref()
                .map(parse_camera_strength)
                .transpose()?;
            request.seed = *seed;
            for raw in images {
                request = request.with_image(parse_image_input(raw));
            }
            Ok(request)
        }
    }
}

fn parse_image_input(raw: &str) -> ImageInput {
    if raw.starts_with("data:") {
        ImageInput::DataUrl(raw.to_string())
    } else if raw.starts_with("http://") || raw.starts_with("https://") {
        ImageInput::Url(raw.to_string())
    } else {
        ImageInput::File(PathBuf::from(raw))
    }
}

fn parse_camera_strength(raw: &str) -> anyhow::Result<CameraStrength> {
    match raw {
        "weak" => Ok(CameraStrength::Weak),
        "medium" => Ok(CameraStrength::Medium),
        "strong" => Ok(CameraStrength::Strong),
        other => anyhow::bail!("invalid --camera-strength {other}; want weak|medium|strong"),
    }
}

fn wait_options(cli: &Cli, preset: Preset) -> anyhow::Result<Option<WaitOptions>> {
    if cli.poll_interval.is_none() && cli.wait_timeout.is_none() {
        return Ok(None);
    }
    let mut options = WaitOptions::for_output(preset.capabilities().output);
    if let Some(raw) = &cli.poll_interval {
        let interval =
            parse_duration(raw).map_err(|err| anyhow::anyhow!("invalid --poll-interval: {err}"))?;
        options = options.with_poll_interval(interval);
    }
    if let Some(raw) = &cli.wait_timeout {
        let timeout =
            parse_duration(raw).map_err(|err| anyhow::anyhow!("invalid --wait-timeout: {err}"))?;
        options = options.with_timeout(timeout);
    }
    Ok(Some(options))
}
