//! Main entry point for the pages-vfs CLI application.
//!
//! Serves one request against a site directory or a site archive and writes
//! the response body to stdout, or lists the files of an archive.

use anyhow::{Result, bail};
use clap::Parser;
use reqwest::header;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

use pages_vfs::{
    Cli, FileServer, InstrumentedVfs, LocalVfs, LookupPath, ServeRequest, Vfs, ZipArchive, ZipVfs,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if cli.is_archive() {
        process_archive(&cli).await
    } else {
        if cli.list {
            bail!("-l lists archive entries, {} is not an archive URL", cli.source);
        }
        serve(Arc::new(InstrumentedVfs::new(LocalVfs::new())), &cli).await
    }
}

async fn process_archive(cli: &Cli) -> Result<()> {
    let mut config = cli.zip.clone();
    if let Some(path) = cli.source.strip_prefix("file://")
        && config.allowed_paths.is_empty()
        && let Some(parent) = Path::new(path).parent()
    {
        config.allowed_paths.push(parent.to_path_buf());
    }

    let vfs = Arc::new(ZipVfs::new(config)?);
    let archive = vfs.archive(&cli.source, &cli.cache_key()).await?;

    let result = if cli.list {
        list_entries(&archive, cli.verbose);
        Ok(())
    } else {
        serve(Arc::new(InstrumentedVfs::new(vfs.clone())), cli).await
    };

    // Display network transfer statistics for HTTP sources
    if let Some(resource) = archive.resource() {
        eprintln!(
            "\nTotal bytes transferred: {} in {} requests",
            format_size(resource.transferred_bytes()),
            resource.requests()
        );
    }

    result
}

fn list_entries(archive: &ZipArchive, verbose: bool) {
    let entries = archive.entries();

    if verbose {
        println!("{:>10}  {:>7}  {:>10}  {:>5}  Name", "Length", "Mode", "Date", "Time");
        println!("{}", "-".repeat(70));
    }

    let mut total = 0u64;
    let mut file_count = 0usize;

    for (name, info) in &entries {
        if !verbose {
            println!("{name}");
            continue;
        }

        let (date, time) = info
            .modified
            .map(|t| (t.format("%Y-%m-%d").to_string(), t.format("%H:%M").to_string()))
            .unwrap_or_default();

        println!(
            "{:>10}  {:>7o}  {:>10}  {:>5}  {}",
            info.size,
            info.mode(),
            date,
            time,
            name
        );

        if !info.is_dir() {
            total += info.size;
            file_count += 1;
        }
    }

    if verbose {
        println!("{}", "-".repeat(70));
        println!("{:>10}  {:>28}  {} files", total, "", file_count);
    }
}

async fn serve<V: Vfs + 'static>(vfs: Arc<V>, cli: &Cli) -> Result<()> {
    let server = FileServer::new(vfs);
    let lookup = LookupPath {
        prefix: "/".to_string(),
        path: cli.source.clone(),
        sha256: cli.cache_key(),
        ..LookupPath::default()
    };

    let (url_path, query) = cli.url_path();
    let sub_path = url_path.trim_start_matches('/').to_string();
    let method = if cli.head {
        reqwest::Method::HEAD
    } else {
        reqwest::Method::GET
    };

    let mut request = ServeRequest::new(method, url_path, sub_path);
    request.query = query;
    if let Some(encodings) = &cli.accept_encoding {
        request = request.with_header(header::ACCEPT_ENCODING, encodings);
    }
    if let Some(range) = &cli.range {
        request = request.with_header(header::RANGE, range);
    }

    let response = server.serve(&lookup, &request).await;

    if cli.verbose {
        eprintln!("{}", response.status);
        for (name, value) in &response.headers {
            eprintln!("{name}: {}", value.to_str().unwrap_or("<binary>"));
        }
        eprintln!();
    }

    let status = response.status;
    let mut stdout = tokio::io::stdout();
    response.body.copy_to(&mut stdout).await?;
    stdout.flush().await?;

    if status.is_client_error() || status.is_server_error() {
        bail!("request failed with status {status}");
    }

    Ok(())
}

/// Format a byte size into a human-readable string.
///
/// ```ignore
/// assert_eq!(format_size(500), "500 bytes");
/// assert_eq!(format_size(1536), "1.50 KB");
/// ```
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
