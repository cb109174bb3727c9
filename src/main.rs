use std::path::PathBuf;

use clap::{Parser, Subcommand};
use gridlock::{Error, Result, cmd};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the gridlock application
#[derive(Parser)]
#[command(name = "gridlock")]
#[command(about = "Lease-guarded blob storage")]
#[command(version)]
struct Cli {
   #[arg(long, global = true, env = "GRIDLOCK_NAMESPACE", help = "Namespace (default from config)")]
   namespace: Option<String>,

   #[command(subcommand)]
   command: Cmd,
}

/// Available subcommands for gridlock
#[derive(Subcommand)]
enum Cmd {
   #[command(about = "Store a file under an exclusive lease and print its id")]
   Put {
      #[arg(help = "File to upload")]
      path: PathBuf,

      #[arg(long, help = "Resource id (24 hex chars; generated if absent)")]
      id: Option<String>,

      #[arg(long, help = "Stored filename (default: basename of path)")]
      filename: Option<String>,

      #[arg(long, help = "Content type recorded with the file")]
      content_type: Option<String>,
   },

   #[command(about = "Read a resource under a shared lease")]
   Get {
      #[arg(help = "Resource id")]
      id: String,

      #[arg(short = 'o', long, help = "Output file (default: stdout)")]
      out: Option<PathBuf>,

      #[arg(long, help = "First byte to read (inclusive)")]
      start: Option<u64>,

      #[arg(long, help = "Last byte to read (inclusive)")]
      end: Option<u64>,
   },

   #[command(about = "Delete a resource under an exclusive lease")]
   Rm {
      #[arg(help = "Resource id")]
      id: String,
   },

   #[command(about = "Check whether a resource exists")]
   Exists {
      #[arg(help = "Resource id")]
      id: String,
   },

   #[command(about = "Show the stored-file record as JSON")]
   Stat {
      #[arg(help = "Resource id")]
      id: String,
   },
}

#[tokio::main]
async fn main() {
   tracing_subscriber::fmt()
      .with_env_filter(
         EnvFilter::try_from_env("GRIDLOCK_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
      )
      .with_writer(std::io::stderr)
      .init();

   let cli = Cli::parse();
   if let Err(err) = run(cli).await {
      if !matches!(err, Error::Reported { .. }) {
         eprintln!("{err}");
      }
      std::process::exit(err.exit_code());
   }
}

async fn run(cli: Cli) -> Result<()> {
   let namespace = cli.namespace;
   match cli.command {
      Cmd::Put { path, id, filename, content_type } => {
         cmd::put::execute(path, id, filename, content_type, namespace).await
      },
      Cmd::Get { id, out, start, end } => cmd::get::execute(id, out, start, end, namespace).await,
      Cmd::Rm { id } => cmd::rm::execute(id, namespace).await,
      Cmd::Exists { id } => cmd::stat::exists(id, namespace).await,
      Cmd::Stat { id } => cmd::stat::stat(id, namespace).await,
   }
}
