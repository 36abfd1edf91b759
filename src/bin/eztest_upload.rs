//! `eztest-upload`: command-line front end for the attachment client.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use eztest_uploads::{
    client::{
        ClientConfig, FileDescriptor, UploadClient, UploadSource, registry::UploadRegistry,
    },
    models::attachment::EntityType,
};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about = "Upload, link and delete EZTest attachments")]
struct Cli {
    /// Base URL of the attachment service
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    server: String,

    /// Caller id sent as X-User-Id
    #[arg(long)]
    user: String,

    /// Parts uploaded in parallel
    #[arg(long, default_value_t = 3)]
    concurrency: usize,

    /// Attempts per part, including the first
    #[arg(long, default_value_t = 3)]
    attempts: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file through presigned part URLs
    Upload(UploadArgs),
    /// Two-phase delete of an attachment
    Delete { id: Uuid },
    /// Link an attachment to its entity
    Link {
        id: Uuid,
        #[arg(long)]
        entity_type: EntityType,
        #[arg(long)]
        entity_id: String,
    },
}

#[derive(Args, Debug)]
struct UploadArgs {
    path: PathBuf,

    #[arg(long)]
    project: String,

    /// Form field the file belongs to
    #[arg(long, default_value = "attachments")]
    field: String,

    #[arg(long, default_value = "unassigned")]
    entity_type: EntityType,

    #[arg(long)]
    entity_id: Option<String>,

    /// MIME type of the file
    #[arg(long, default_value = "application/octet-stream")]
    mime: String,

    /// Name recorded for the file; defaults to the path's file name
    #[arg(long)]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = ClientConfig {
        max_attempts: cli.attempts,
        concurrency: cli.concurrency,
        ..ClientConfig::default()
    };
    let client = UploadClient::new(&cli.server, &cli.user, config);

    match cli.command {
        Command::Upload(args) => upload(&client, args).await,
        Command::Delete { id } => {
            client.delete_attachment(id).await?;
            println!("deleted {}", id);
            Ok(())
        }
        Command::Link {
            id,
            entity_type,
            entity_id,
        } => {
            let attachment = client.link_attachment(id, entity_type, &entity_id).await?;
            println!("{}", serde_json::to_string_pretty(&attachment)?);
            Ok(())
        }
    }
}

async fn upload(client: &UploadClient, args: UploadArgs) -> Result<()> {
    let file_name = match args.name {
        Some(name) => name,
        None => args
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .with_context(|| format!("{} has no usable file name", args.path.display()))?,
    };
    let descriptor = FileDescriptor {
        file_name,
        file_type: args.mime,
        field_name: args.field,
        entity_type: args.entity_type,
        entity_id: args.entity_id,
        project_id: args.project,
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, aborting upload");
            on_signal.cancel();
        }
    });

    let registry = UploadRegistry::new();
    let local_id = registry.register();
    let source = UploadSource::File(args.path);
    let attachment = client
        .upload(&source, &descriptor, &registry, local_id, &cancel)
        .await?;
    println!("{}", serde_json::to_string_pretty(&attachment)?);
    Ok(())
}
