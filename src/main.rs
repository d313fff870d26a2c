use clap::{Parser, Subcommand};
use image_proxy::batch;
use image_proxy::config;
use image_proxy::engine::Engine;
use image_proxy::imaging::RustBackend;
use image_proxy::optimize::ProcessRunner;
use image_proxy::request::ClientRequest;
use image_proxy::response;
use std::path::PathBuf;
use std::time::SystemTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "image-proxy")]
#[command(about = "On-the-fly image transformation from query directives")]
#[command(long_about = "\
On-the-fly image transformation from query directives

Directives run in the order they appear in the query:

  w=200                 width (pixels, or percent with w=50%)
  h=100                 height
  crop=1&w=100&h=100    centred crop to exactly 100x100 (always runs first)
  crop=10,10,50%,50%    offset crop x,y,w,h (px suffix for pixels, else percent)
  resize=300,200        exact size, centred crop
  fit=300,200           fit inside a box
  lb=300,300,ffffff     letterbox with a border colour
  ulb=true              remove a letterbox
  filter=grayscale      negate, grayscale, sepia, edgedetect, emboss,
                        blurgaussian, blurselective, meanremoval
  brightness=20  contrast=-10  colorize=30,0,0  smooth=5

Signals: upscale=1, quality=80, strip=all|info|color|none, zoom=2, webp=1

Run 'image-proxy gen-config' to generate a documented config.toml.")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "config.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Transform one image and print the response headers
    Transform {
        /// Source image
        source: PathBuf,
        /// Where to write the result
        #[arg(long, short)]
        output: PathBuf,
        /// Query string, e.g. "w=200&quality=80"
        #[arg(long, short, default_value = "")]
        query: String,
        /// Accept header sent by the client
        #[arg(long)]
        accept: Option<String>,
        /// DPR client-hint header
        #[arg(long)]
        dpr: Option<String>,
        /// URL for the Link rel="canonical" header
        #[arg(long)]
        canonical_url: Option<String>,
    },
    /// Run a JSON list of jobs in parallel and write a JSON report
    Batch {
        /// JSON array of {source, query, output, accept?, dpr?}
        jobs: PathBuf,
        /// Report file; printed to stdout when absent
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Print a stock config.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Transform {
            source,
            output,
            query,
            accept,
            dpr,
            canonical_url,
        } => {
            let config = config::load_config(Some(&cli.config))?;
            let backend = RustBackend::new();
            let runner = ProcessRunner;
            let engine = Engine::new(&config, &backend, &runner);

            let mut request = ClientRequest::from_query(&query);
            request.accept = accept;
            request.dpr = dpr;
            request.canonical_url = canonical_url;

            let data = std::fs::read(&source)?;
            let result = engine.transform(&data, &request)?;
            std::fs::write(&output, &result.bytes)?;

            let modified = std::fs::metadata(&source)?.modified()?;
            for (name, value) in response::headers(
                &config,
                &result,
                request.canonical_url.as_deref(),
                modified,
                SystemTime::now(),
            ) {
                println!("{name}: {value}");
            }
        }
        Command::Batch { jobs, report } => {
            let config = config::load_config(Some(&cli.config))?;
            let jobs = batch::load_jobs(&jobs)?;
            let reports = batch::run_batch(&config, &RustBackend::new(), &ProcessRunner, &jobs)?;
            let json = serde_json::to_string_pretty(&reports)?;
            match report {
                Some(path) => std::fs::write(path, json)?,
                None => println!("{json}"),
            }
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}
