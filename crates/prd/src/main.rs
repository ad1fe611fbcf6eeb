use std::process::ExitCode;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::Parser;
use prd::cli::Args;
use prd::config::{default_write_path, Config};
use prd::extract::NoopExtractor;
use prd::observer::BarObserver;
use prd::resolver::{Resolver, SearchItem};
use prd_fetch::{Category, NullObserver, ProgressObserver, Session};
use prd_fs::SpringDir;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    if !args.disable_logging {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_target(false)
            .init();
    }

    let config = Config::from_env();
    let dir = SpringDir::new(
        args.filesystem_writepath
            .clone()
            .unwrap_or_else(default_write_path),
    );
    info!(dir = %dir.root().display(), "using data directory");

    // maintenance modes need no network at all
    if let Some(path) = &args.dump_sdp {
        return dump_sdp(path);
    }
    if let Some(path) = &args.validate_sdp {
        return match prd_rapid::validate_sdp(&dir, path) {
            Ok(true) => ExitCode::SUCCESS,
            Ok(false) => ExitCode::from(1),
            Err(e) => {
                error!(error = %e, "descriptor validation failed");
                ExitCode::from(1)
            }
        };
    }
    if args.rapid_validate {
        return match prd_fs::validate_pool(&dir.pool_dir(), args.delete) {
            Ok(report) if report.broken.is_empty() => {
                info!(checked = report.checked, "pool is valid");
                ExitCode::SUCCESS
            }
            Ok(report) => {
                error!(
                    checked = report.checked,
                    broken = report.broken.len(),
                    "pool contains invalid files"
                );
                ExitCode::from(1)
            }
            Err(e) => {
                error!(error = %e, "pool validation failed");
                ExitCode::from(1)
            }
        };
    }

    let mut items = Vec::new();
    for name in &args.download_map {
        items.push(SearchItem::new(Category::Map, name));
    }
    for name in &args.download_game {
        items.push(SearchItem::new(Category::Game, name));
    }
    for name in &args.download_engine {
        items.push(SearchItem::new(Category::Engine, name));
    }
    for name in &args.items {
        items.push(SearchItem::new(Category::None, name));
    }
    if items.is_empty() && args.http_download.is_empty() {
        error!("nothing to download; see --help");
        return ExitCode::from(1);
    }

    let observer: Arc<dyn ProgressObserver> = if args.disable_logging {
        Arc::new(NullObserver)
    } else {
        Arc::new(BarObserver::new())
    };
    let session = match Session::new(config.tls.clone(), observer) {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "could not set up http client");
            return ExitCode::from(1);
        }
    };

    let mut resolver = Resolver::new(&session, config, dir, !args.disable_fetch_depends);
    for url in &args.http_download {
        resolver.add_url(url);
    }
    if !items.is_empty() {
        match resolver.search(&mut items).await {
            Ok(count) => {
                info!(results = count, "search finished");
                for id in 0..count {
                    resolver.add(id);
                }
            }
            Err(e) => {
                error!(error = %e, "search failed");
                return ExitCode::from(1);
            }
        }
        for item in items.iter().filter(|i| !i.found) {
            warn!(name = %item.name, "no download found");
        }
    }

    ExitCode::from(resolver.start(&NoopExtractor).await)
}

fn dump_sdp(path: &std::path::Path) -> ExitCode {
    match prd_rapid::parse_sdp(path) {
        Ok(files) => {
            println!("md5 (filename in pool)           crc32        size filename");
            for f in &files {
                println!(
                    "{} {:02X}{:02X}{:02X}{:02X} {:8} {}",
                    f.md5, f.crc32[0], f.crc32[1], f.crc32[2], f.crc32[3], f.size, f.name
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "cannot dump descriptor");
            ExitCode::from(1)
        }
    }
}
