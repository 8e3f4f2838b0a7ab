mod calc;
mod db;
mod ipc;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    // stdout carries the IPC protocol; logs go to stderr only.
    let filter = EnvFilter::try_from_env("GRADESD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    init_logging();

    let mut state = ipc::AppState {
        workspace: None,
        db: None,
    };
    if let Ok(path) = std::env::var("GRADESD_WORKSPACE") {
        if let Err(e) = ipc::select_workspace(&mut state, PathBuf::from(&path)) {
            tracing::warn!(workspace = %path, "could not open startup workspace: {e:?}");
        }
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "gradesd ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                tracing::warn!("dropping unparseable request: {}", e);
                let _ = writeln!(
                    stdout,
                    "{}",
                    serde_json::json!({
                        "ok": false,
                        "error": { "code": "bad_json", "message": e.to_string() }
                    })
                );
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
