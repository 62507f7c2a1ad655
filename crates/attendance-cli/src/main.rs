use anyhow::{bail, Context, Result};
use attendance_core::{
    AttendanceService, BlinkLivenessDetector, EmbeddingExtractor, FaceEmbedder, FailureKind,
    FlowError, Gallery, IdentityId, ModelContext, ModelPaths, Recognition,
};
use attendance_store::SqliteGallery;
use chrono::SecondsFormat;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod output;

use config::Config;
use output::Envelope;

type Service = AttendanceService<FaceEmbedder, BlinkLivenessDetector, SqliteGallery>;

#[derive(Parser)]
#[command(name = "attendance", version, about = "Face-recognition attendance with blink liveness")]
struct Cli {
    /// Print the response envelope as JSON
    #[arg(long, global = true)]
    json: bool,

    /// TOML configuration file (default: $ATTENDANCE_CONFIG)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database tables
    Init,
    /// Enroll a new employee from a face image
    Register {
        /// Employee name
        #[arg(short, long)]
        name: String,
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
    },
    /// Mark attendance from a face image
    Mark {
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
    },
    /// Attendance timestamps for every employee with this name
    History { name: String },
    /// Attendance records of one employee id
    Events { id: IdentityId },
    /// List enrolled employees
    Employees,
    /// Show version, model files and record counts
    Status,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let envelope = run(&cli).unwrap_or_else(|e| {
        tracing::error!(error = %format!("{e:#}"), "command failed");
        Envelope::error(format!("{e:#}"))
    });

    match envelope.render(cli.json) {
        Ok(text) => {
            if envelope.success {
                println!("{text}");
            } else {
                eprintln!("{text}");
            }
            envelope.exit_code()
        }
        Err(e) => {
            eprintln!("error: failed to render response: {e}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: &Cli) -> Result<Envelope> {
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "configuration loaded");

    match &cli.command {
        Commands::Init => init(&config),
        Commands::Register { name, image } => register(&config, name, image),
        Commands::Mark { image } => mark(&config, image),
        Commands::History { name } => history(&config, name),
        Commands::Events { id } => events(&config, *id),
        Commands::Employees => employees(&config),
        Commands::Status => status(&config),
    }
}

fn open_store(config: &Config) -> Result<SqliteGallery> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = SqliteGallery::open(&config.db_path, config.embedding_dim, config.pool_size)
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    store.init().context("initializing database")?;
    Ok(store)
}

fn build_service(config: &Config) -> Result<Service> {
    let store = open_store(config)?;
    let models = ModelContext::load(&ModelPaths::in_dir(&config.model_dir))
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;

    let extractor = FaceEmbedder::new(Arc::clone(&models));
    if extractor.dimension() != config.embedding_dim {
        bail!(
            "recognizer produces {}-dimensional embeddings but embedding_dim is {}",
            extractor.dimension(),
            config.embedding_dim
        );
    }
    let liveness = BlinkLivenessDetector::new(models, config.blink());

    Ok(AttendanceService::new(extractor, liveness, store)
        .with_threshold(config.similarity_threshold)
        .with_policy(config.match_policy))
}

/// Read the request image; a missing or unreadable file is the caller's error.
fn read_image(path: &Path) -> std::result::Result<Vec<u8>, Envelope> {
    std::fs::read(path).map_err(|e| {
        tracing::info!(path = %path.display(), error = %e, "image file unreadable");
        Envelope::unreadable_image(path, &e)
    })
}

fn init(config: &Config) -> Result<Envelope> {
    open_store(config)?;
    Ok(Envelope::success(format!("database ready at {}", config.db_path.display()))
        .with("db_path", &config.db_path)?)
}

fn register(config: &Config, name: &str, image: &Path) -> Result<Envelope> {
    if name.trim().is_empty() {
        return Ok(Envelope::from_flow(&FlowError::InvalidName));
    }
    let bytes = match read_image(image) {
        Ok(bytes) => bytes,
        Err(envelope) => return Ok(envelope),
    };
    let service = build_service(config)?;

    match service.enroll_bytes(name, &bytes) {
        Ok(id) => Ok(Envelope::registered(name, id)?),
        Err(e) => Ok(Envelope::from_flow(&e)),
    }
}

fn mark(config: &Config, image: &Path) -> Result<Envelope> {
    let bytes = match read_image(image) {
        Ok(bytes) => bytes,
        Err(envelope) => return Ok(envelope),
    };
    let service = build_service(config)?;

    match service.recognize_bytes(&bytes) {
        Ok(Recognition::Matched {
            identity_id,
            name,
            similarity,
            event,
        }) => {
            let stamp = event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
            Ok(Envelope::marked(identity_id, &name, similarity, &stamp)?)
        }
        Ok(Recognition::NoMatch { best_similarity }) => {
            Ok(Envelope::failure(FailureKind::NoMatch, "no matching employee")
                .with("best_similarity", best_similarity)?
                .detail(format!(
                    "best similarity {best_similarity:.3}, threshold {:.3}",
                    service.threshold()
                )))
        }
        Err(e) => Ok(Envelope::from_flow(&e)),
    }
}

fn history(config: &Config, name: &str) -> Result<Envelope> {
    let store = open_store(config)?;
    let stamps = match store.get_events_by_name(name) {
        Ok(stamps) => stamps,
        Err(e) => return Ok(Envelope::from_flow(&e.into())),
    };

    let rendered: Vec<String> = stamps
        .iter()
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .collect();
    Ok(Envelope::history(name, &rendered)?)
}

fn events(config: &Config, id: IdentityId) -> Result<Envelope> {
    let store = open_store(config)?;
    let records = match store.get_events_by_id(id) {
        Ok(records) => records,
        Err(e) => return Ok(Envelope::from_flow(&e.into())),
    };

    let mut envelope = Envelope::success(format!("{} attendance records for employee {id}", records.len()))
        .with("employee_id", id)?
        .with("count", records.len())?
        .with("records", &records)?;
    for r in &records {
        envelope = envelope.detail(format!(
            "#{}  {}  {}",
            r.event_id,
            r.name,
            r.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
        ));
    }
    Ok(envelope)
}

fn employees(config: &Config) -> Result<Envelope> {
    let store = open_store(config)?;
    let roster = store.list_employees().context("listing employees")?;
    Ok(Envelope::roster(&roster)?)
}

fn status(config: &Config) -> Result<Envelope> {
    let paths = ModelPaths::in_dir(&config.model_dir);
    let missing: Vec<String> = paths
        .missing()
        .iter()
        .map(|p| p.display().to_string())
        .collect();

    let store = open_store(config)?;
    let counts = store.counts().context("counting records")?;

    let envelope = if missing.is_empty() {
        Envelope::success("ready")
    } else {
        Envelope::error(format!("missing model files: {}", missing.join(", ")))
    };

    Ok(envelope
        .with("version", env!("CARGO_PKG_VERSION"))?
        .with("model_dir", &config.model_dir)?
        .with("missing_models", &missing)?
        .with("db_path", &config.db_path)?
        .with("schema_version", attendance_store::SCHEMA_VERSION)?
        .with("employees", counts.identities)?
        .with("attendance_events", counts.events)?
        .with("similarity_threshold", config.similarity_threshold)?
        .with("match_policy", config.match_policy)?
        .with("ear_threshold", config.ear_threshold)?
        .with("ear_distance", config.ear_distance)?
        .detail(format!("version      {}", env!("CARGO_PKG_VERSION")))
        .detail(format!("models       {}", config.model_dir.display()))
        .detail(format!("database     {}", config.db_path.display()))
        .detail(format!(
            "records      {} employees, {} attendance events",
            counts.identities, counts.events
        ))
        .detail(format!(
            "matching     {} above {}",
            config.match_policy, config.similarity_threshold
        ))
        .detail(format!(
            "liveness     {} EAR below {}",
            config.ear_distance, config.ear_threshold
        )))
}
