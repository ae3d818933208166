use adminbase::api::{ApiClient, ApiClientOptions, FilePart, HttpTransport, UploadRequest};
use adminbase::backend::{Backend, BackendCallOptions};
use adminbase::config::{self, ClientArgs};
use adminbase::descriptor::MethodDescriptor;
use adminbase::session::SessionStore;
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// adminbase - command line client for schema-driven admin backends
#[derive(Parser, Debug)]
#[command(name = "adminbase")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Call admin backend methods from the command line", long_about = None)]
struct Cli {
    #[command(flatten)]
    client: ClientArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Authenticate against core.login.getToken and persist the session
    Login {
        email: String,
        #[arg(env = "ADMINBASE_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Clear the persisted session
    Logout,
    /// Show the decoded claims of the current session
    Whoami,
    /// Call a remote method and print the JSON result
    Call {
        package: String,
        class: String,
        method: String,
        /// Optional record id appended to the path
        #[arg(long)]
        record_id: Option<String>,
        /// JSON arguments for the method
        #[arg(long, default_value = "{}")]
        args: String,
        /// Serve from the TTL cache when fresh
        #[arg(long)]
        cache: bool,
        /// Do not wait for authentication
        #[arg(long)]
        no_auth: bool,
    },
    /// Upload files as attachments of one record
    Upload {
        #[arg(long)]
        db: String,
        #[arg(long)]
        table: String,
        #[arg(long)]
        row: String,
        files: Vec<PathBuf>,
    },
    /// Download an attachment by record id
    Download {
        record_id: String,
        /// Output path (defaults to the server-provided filename)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists (safe to ignore if not found)
    dotenvy::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let cfg = config::load(&cli.client).context("Failed to load configuration")?;
    cfg.log_summary();

    let session_file = cfg
        .session_file
        .clone()
        .unwrap_or_else(SessionStore::default_path);
    let store = SessionStore::with_persistence(session_file);
    store.set_toast(|message| eprintln!("note: {message}"));

    let transport = Arc::new(HttpTransport::new(cfg.base_url.clone()));
    let api = ApiClient::new(
        Arc::clone(&store),
        transport,
        ApiClientOptions {
            auth_wait: Duration::from_millis(cfg.auth_wait_ms),
            auth_retry_max: cfg.auth_retry_max,
            lock_timeout: Duration::from_millis(cfg.lock_timeout_ms),
        },
    );
    let backend = Backend::new(api, Arc::clone(&store), Duration::from_millis(cfg.cache_ttl_ms));

    let result = run(&cli.command, &backend, cfg.request_timeout_ms).await;
    if result.is_err() {
        if let Some(message) = store.error_message() {
            eprintln!("error: {message}");
        }
    }
    result
}

async fn run(command: &Command, backend: &Arc<Backend>, timeout_ms: u64) -> Result<()> {
    let store = Arc::clone(backend.store());
    match command {
        Command::Login { email, password } => {
            if backend.login(email, password).await? {
                println!("Logged in as {}", store.user_id());
            } else {
                return Err(anyhow!("Login rejected"));
            }
        }
        Command::Logout => {
            backend.logout();
            println!("Logged out");
        }
        Command::Whoami => {
            if store.is_authenticated() {
                println!("{}", serde_json::to_string_pretty(&store.claims())?);
            } else {
                println!("Not authenticated");
            }
        }
        Command::Call {
            package,
            class,
            method,
            record_id,
            args,
            cache,
            no_auth,
        } => {
            let auth = !no_auth;
            if auth && !store.is_authenticated() {
                // Waiting two minutes for a login that cannot arrive makes no
                // sense in a one-shot CLI; fail fast with a hint instead.
                return Err(anyhow!("Not authenticated; run `adminbase login` first"));
            }
            let args: Value =
                serde_json::from_str(args).context("--args must be a JSON value")?;
            let mut descriptor =
                MethodDescriptor::new(package, class, method).with_args(args);
            descriptor.record_id = record_id.clone();

            let response = backend
                .call(
                    &descriptor,
                    &BackendCallOptions {
                        auth,
                        cache: *cache,
                        timeout: Duration::from_millis(timeout_ms),
                        ..Default::default()
                    },
                )
                .await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "data": response.data,
                    "messages": response.messages,
                }))?
            );
        }
        Command::Upload {
            db,
            table,
            row,
            files,
        } => {
            if files.is_empty() {
                return Err(anyhow!("No files given"));
            }
            let mut parts = Vec::with_capacity(files.len());
            for path in files {
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("upload")
                    .to_string();
                parts.push(FilePart {
                    mime: mime_for(&name).to_string(),
                    name,
                    bytes,
                });
            }
            let response = backend
                .upload(
                    UploadRequest {
                        db: db.clone(),
                        table: table.clone(),
                        row: row.clone(),
                        files: parts,
                    },
                    &BackendCallOptions::default(),
                )
                .await?;
            println!("Uploaded: {}", response.data);
        }
        Command::Download { record_id, out } => {
            let download = backend.download(record_id, None).await?;
            let dest = out
                .clone()
                .unwrap_or_else(|| PathBuf::from(&download.filename));
            download
                .write_to(&dest)
                .with_context(|| format!("Failed to write {}", dest.display()))?;
            println!("Saved {} ({} bytes)", dest.display(), download.bytes.len());
        }
    }
    Ok(())
}

/// Minimal extension-based MIME guess for upload parts.
fn mime_for(name: &str) -> &'static str {
    match name.rsplit('.').next().map(|e| e.to_ascii_lowercase()) {
        Some(ext) => match ext.as_str() {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "pdf" => "application/pdf",
            "txt" => "text/plain",
            "csv" => "text/csv",
            "json" => "application/json",
            _ => "application/octet-stream",
        },
        None => "application/octet-stream",
    }
}
