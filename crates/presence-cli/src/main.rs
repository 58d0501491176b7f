use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use presence_core::{
    AttendanceRecord, AttendanceSummary, FaceOutcome, IdentitySummary, RecognitionResult,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.presence.Attendance1",
    default_service = "org.presence.Attendance1",
    default_path = "/org/presence/Attendance1"
)]
trait Attendance {
    async fn create_identity(&self, id: &str, display_name: &str) -> zbus::Result<String>;
    async fn rename_identity(&self, id: &str, display_name: &str) -> zbus::Result<String>;
    async fn enroll(&self, id: &str, vector_json: &str) -> zbus::Result<String>;
    async fn remove(&self, id: &str) -> zbus::Result<u32>;
    async fn process_frame(&self, vectors_json: &str, occurred_at: &str) -> zbus::Result<String>;
    async fn attendance(&self, start: &str, end: &str) -> zbus::Result<String>;
    async fn history(&self, id: &str) -> zbus::Result<String>;
    async fn summary(&self, period: &str) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn reload(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "presence", about = "Presence face attendance CLI")]
struct Cli {
    /// Talk to presenced on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,
    /// Print raw JSON replies
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new identity
    Add {
        /// Identity id (letters, digits, '-' and '_')
        id: String,
        /// Display name
        name: String,
    },
    /// Change the display name of an identity
    Rename {
        id: String,
        /// New display name
        name: String,
    },
    /// Enroll feature vectors for an identity
    Enroll {
        id: String,
        /// JSON file with one vector or an array of vectors
        #[arg(long)]
        vector_file: PathBuf,
    },
    /// Remove every enrolled vector of an identity (history is kept)
    Remove { id: String },
    /// Recognize one frame of precomputed face vectors
    Recognize {
        /// JSON file with an array of vectors, one per detected face
        #[arg(long)]
        vectors_file: PathBuf,
        /// Capture time (RFC 3339 or "YYYY-MM-DD HH:MM:SS"); default now
        #[arg(long)]
        at: Option<String>,
    },
    /// Attendance records between two dates (inclusive)
    Report {
        /// First day, YYYY-MM-DD (default today)
        #[arg(long)]
        from: Option<String>,
        /// Last day, YYYY-MM-DD (default: same as --from)
        #[arg(long)]
        to: Option<String>,
    },
    /// Full attendance history of one identity
    History { id: String },
    /// Present/absent summary for one day
    Summary {
        /// Day, YYYY-MM-DD (default today)
        #[arg(long)]
        date: Option<String>,
    },
    /// List registered identities
    List,
    /// Rebuild the daemon's registry from storage
    Reload,
    /// Show daemon status
    Status,
}

/// Vector file contents: a single vector or a list of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum VectorFile {
    Many(Vec<Vec<f32>>),
    One(Vec<f32>),
}

impl VectorFile {
    fn into_vectors(self) -> Vec<Vec<f32>> {
        match self {
            VectorFile::Many(vectors) => vectors,
            VectorFile::One(v) if v.is_empty() => Vec::new(),
            VectorFile::One(v) => vec![v],
        }
    }
}

fn read_vectors(path: &Path) -> Result<Vec<Vec<f32>>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_vectors(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn parse_vectors(raw: &str) -> Result<Vec<Vec<f32>>> {
    let file: VectorFile =
        serde_json::from_str(raw).context("expected a JSON array of numbers or of number arrays")?;
    Ok(file.into_vectors())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("presenced is not reachable")?;
    tracing::debug!(system = cli.system, "connected to presenced");

    match cli.command {
        Commands::Add { id, name } => {
            let id = proxy.create_identity(&id, &name).await?;
            println!("Created identity {id}");
        }
        Commands::Rename { id, name } => {
            let reply = proxy.rename_identity(&id, &name).await?;
            if cli.json {
                println!("{reply}");
            } else {
                let summary: IdentitySummary = serde_json::from_str(&reply)?;
                println!("Renamed {} to {}", summary.id.as_str(), summary.display_name);
            }
        }
        Commands::Enroll { id, vector_file } => {
            let vectors = read_vectors(&vector_file)?;
            if vectors.is_empty() {
                bail!("{} contains no vectors", vector_file.display());
            }
            for vector in vectors {
                let reply = proxy.enroll(&id, &serde_json::to_string(&vector)?).await?;
                if cli.json {
                    println!("{reply}");
                    continue;
                }
                let enrolled: serde_json::Value = serde_json::from_str(&reply)?;
                println!(
                    "Enrolled {id} vector version {} ({} values)",
                    enrolled["version"],
                    vector.len()
                );
            }
        }
        Commands::Remove { id } => {
            let removed = proxy.remove(&id).await?;
            println!("Removed {removed} vector(s) from {id}; attendance history kept");
        }
        Commands::Recognize { vectors_file, at } => {
            let vectors = read_vectors(&vectors_file)?;
            let reply = proxy
                .process_frame(&serde_json::to_string(&vectors)?, at.as_deref().unwrap_or(""))
                .await?;
            if cli.json {
                println!("{reply}");
            } else {
                let results: Vec<RecognitionResult> = serde_json::from_str(&reply)?;
                print_recognition(&results);
            }
        }
        Commands::Report { from, to } => {
            let from = from.unwrap_or_else(today);
            let to = to.unwrap_or_else(|| from.clone());
            let reply = proxy.attendance(&from, &to).await?;
            if cli.json {
                println!("{reply}");
            } else {
                let records: Vec<AttendanceRecord> = serde_json::from_str(&reply)?;
                print_records(&records);
            }
        }
        Commands::History { id } => {
            let reply = proxy.history(&id).await?;
            if cli.json {
                println!("{reply}");
            } else {
                let records: Vec<AttendanceRecord> = serde_json::from_str(&reply)?;
                print_records(&records);
            }
        }
        Commands::Summary { date } => {
            let reply = proxy.summary(date.as_deref().unwrap_or("")).await?;
            if cli.json {
                println!("{reply}");
            } else {
                let summary: AttendanceSummary = serde_json::from_str(&reply)?;
                println!("Date:      {}", summary.period);
                println!("Enrolled:  {}", summary.enrolled);
                println!("Present:   {}", summary.present);
                println!("Absent:    {}", summary.absent);
                println!("Rate:      {:.1}%", summary.attendance_rate);
            }
        }
        Commands::List => {
            let reply = proxy.list_identities().await?;
            if cli.json {
                println!("{reply}");
            } else {
                let identities: Vec<IdentitySummary> = serde_json::from_str(&reply)?;
                print_identities(&identities);
            }
        }
        Commands::Reload => {
            let reply = proxy.reload().await?;
            println!("{reply}");
        }
        Commands::Status => {
            let reply = proxy.status().await?;
            let status: serde_json::Value = serde_json::from_str(&reply)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

fn print_recognition(results: &[RecognitionResult]) {
    if results.is_empty() {
        println!("No faces in frame");
        return;
    }
    for result in results {
        let who = match (&result.identity_id, &result.display_name) {
            (Some(id), Some(name)) => format!("{id} ({name})"),
            (Some(id), None) => id.to_string(),
            _ => "unknown".to_string(),
        };
        let mut line = format!(
            "face {}: {who}, confidence {:.2}, {}",
            result.face_index,
            result.confidence,
            result.status_message()
        );
        if let FaceOutcome::Failed { message, .. } = &result.outcome {
            line.push_str(&format!(" ({message})"));
        }
        if !result.tied_with.is_empty() {
            let tied: Vec<&str> = result.tied_with.iter().map(|id| id.as_str()).collect();
            line.push_str(&format!(" [ambiguous, tied with {}]", tied.join(", ")));
        }
        println!("{line}");
    }
}

fn print_records(records: &[AttendanceRecord]) {
    if records.is_empty() {
        println!("No attendance records");
        return;
    }
    println!("{:<12} {:<10} {:<20} {:>6}  STATUS", "DATE", "TIME", "IDENTITY", "CONF");
    for r in records {
        println!(
            "{:<12} {:<10} {:<20} {:>6.2}  {}",
            r.period.to_string(),
            r.occurred_at.format("%H:%M:%S").to_string(),
            r.identity_id.as_str(),
            r.confidence,
            r.status.as_str()
        );
    }
}

fn print_identities(identities: &[IdentitySummary]) {
    if identities.is_empty() {
        println!("No identities registered");
        return;
    }
    println!("{:<20} {:<30} {:>7}  LAST ENROLLED", "ID", "NAME", "VECTORS");
    for identity in identities {
        let last = identity
            .last_enrolled_at
            .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<30} {:>7}  {last}",
            identity.id.as_str(),
            identity.display_name,
            identity.vector_count
        );
    }
}
