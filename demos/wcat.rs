//! `wcat`: fetch URLs to stdout through the download engine.
//!
//! Usage: wcat [-x http://proxy:port] URL [URL...]
//!
//! The process exit code reflects the worst outcome over all URLs, mapped
//! the way shell consumers expect: 0 for success, EACCES (13) when the
//! upstream answered with a 4xx, EIO (5) for server errors and transport
//! trouble.

use cachefetch::{
    DownloadEngine, DownloadItem, EngineConfig, ItemFactory, ItemStatus, Job, PrintItemFactory,
    StatusClass,
};
use std::process::ExitCode;
use std::sync::Arc;

const EXIT_EIO: u8 = 5;
const EXIT_EACCES: u8 = 13;

fn exit_code_for(item: &DownloadItem) -> u8 {
    if item.status() == ItemStatus::Complete {
        return 0;
    }
    match item.head().map(|head| StatusClass::of(head.status)) {
        Some(StatusClass::AccessDenied) => EXIT_EACCES,
        // No header at all means the transport itself failed
        _ => EXIT_EIO,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = EngineConfig::default();
    let mut urls = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-x" | "--proxy" => match args.next() {
                Some(proxy) => config.http.proxy_url = Some(proxy),
                None => {
                    eprintln!("{arg} needs a proxy URL argument");
                    return ExitCode::from(EXIT_EIO);
                }
            },
            _ => urls.push(arg),
        }
    }
    if urls.is_empty() {
        eprintln!("usage: wcat [-x http://proxy:port] URL [URL...]");
        return ExitCode::from(EXIT_EIO);
    }

    let engine = match DownloadEngine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("wcat: {e}");
            return ExitCode::from(EXIT_EIO);
        }
    };

    let factory = PrintItemFactory;
    let mut items = Vec::new();
    for url in &urls {
        let item = factory.create();
        match Job::new(url, Arc::clone(&item)) {
            Ok(job) => {
                if let Err(e) = engine.submit(job) {
                    eprintln!("wcat: {url}: {e}");
                    return ExitCode::from(EXIT_EIO);
                }
                items.push((url, item));
            }
            Err(e) => {
                eprintln!("wcat: {url}: {e}");
                return ExitCode::from(EXIT_EIO);
            }
        }
    }

    engine.run_until_idle().await;

    let mut worst = 0u8;
    for (url, item) in &items {
        let code = exit_code_for(item);
        if code != 0 {
            if let Some(reason) = item.failure_reason() {
                eprintln!("wcat: {url}: download failed ({reason:?})");
            }
            worst = worst.max(code);
        }
    }
    ExitCode::from(worst)
}
