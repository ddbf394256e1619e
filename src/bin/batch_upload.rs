/// Batch upload tool
/// Uploads every file under the given paths to a bucket, keyed by relative path

use anyhow::{bail, Context};
use resumable_uploader::config::get_logs_dir;
use resumable_uploader::logging::init_logging;
use resumable_uploader::{BatchJob, Config, Credential, UploadManager};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use walkdir::WalkDir;

const USAGE: &str = "usage: batch_upload <config.toml> <bucket> <path>...";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 {
        bail!(USAGE);
    }
    let config_path = PathBuf::from(&args[0]);
    let bucket = &args[1];
    let roots: Vec<PathBuf> = args[2..].iter().map(PathBuf::from).collect();

    init_logging(&get_logs_dir()).context("Failed to initialize logging")?;

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let access_key = std::env::var("UPLOADER_ACCESS_KEY").context("UPLOADER_ACCESS_KEY is not set")?;
    let secret_key = std::env::var("UPLOADER_SECRET_KEY").context("UPLOADER_SECRET_KEY is not set")?;
    let credential = Credential::new(access_key, secret_key);

    let manager = UploadManager::new(config)?;
    let batch = manager.batch_for_bucket(bucket, &credential)?;

    let files = collect_files(&roots)?;
    if files.is_empty() {
        println!("Nothing to upload");
        return Ok(());
    }
    batch.set_expected_jobs_count(files.len());

    let results = Arc::new(Mutex::new(Vec::with_capacity(files.len())));
    for (path, key) in files {
        let results = Arc::clone(&results);
        let label = path.display().to_string();
        let job = BatchJob::builder()
            .key(key)
            .on_completed(move |result| {
                let line = match result {
                    Ok(response) => format!(
                        "OK    {} -> {} ({})",
                        label,
                        response.key().unwrap_or("-"),
                        response.hash().unwrap_or("-")
                    ),
                    Err(e) => format!("FAIL  {}: {}", label, e),
                };
                if let Ok(mut results) = results.lock() {
                    results.push(line);
                }
            })
            .upload_file(&path);
        batch.submit(job)?;
    }

    let report = batch.start().await;
    if let Ok(results) = results.lock() {
        for line in results.iter() {
            println!("{}", line);
        }
    }
    println!(
        "\n{} uploaded, {} failed",
        report.succeeded, report.failed
    );

    if report.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Every regular file under `roots`, paired with its object key
fn collect_files(roots: &[PathBuf]) -> anyhow::Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    for root in roots {
        if root.is_file() {
            let key = root
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| root.display().to_string());
            files.push((root.clone(), key));
            continue;
        }
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            if entry.file_type().is_file() {
                let key = object_key(root, entry.path());
                files.push((entry.into_path(), key));
            }
        }
    }
    Ok(files)
}

fn object_key(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
