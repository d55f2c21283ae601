//! Append-only file logging with size-based cleanup before each run.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `$HOME/.citeproxy.log` on Unix, `%APPDATA%\citeproxy\citeproxy.log` on Windows.
pub fn log_path() -> Option<PathBuf> {
    #[cfg(windows)]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .map(|p| p.join("citeproxy").join("citeproxy.log"))
    }
    #[cfg(not(windows))]
    {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .map(|p| p.join(".citeproxy.log"))
    }
}

/// Delete `path` if it is larger than `max_bytes`. Returns whether it was removed.
pub fn rotate_if_oversized(path: &Path, max_bytes: u64) -> std::io::Result<bool> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() > max_bytes => {
            std::fs::remove_file(path)?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Never-rotating appender writing exactly to `path`.
fn file_appender(path: &Path) -> Option<RollingFileAppender> {
    let dir = path.parent()?;
    let stem = path.file_stem()?.to_str()?;
    let mut builder = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(stem);
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        builder = builder.filename_suffix(ext);
    }
    std::fs::create_dir_all(dir).ok()?;
    builder.build(dir).ok()
}

/// Initialize tracing. The returned guard must live as long as the process logs.
pub fn init(level: &str, debug: bool, max_bytes: u64) -> Option<WorkerGuard> {
    let level = if debug { "debug" } else { level };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("citeproxy={level},citeproxy_core={level},warn"))
    });

    let appender = log_path().and_then(|path| {
        let rotated = rotate_if_oversized(&path, max_bytes);
        file_appender(&path).map(|a| (a, path, rotated))
    });

    let Some((appender, path, rotated)) = appender else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        tracing::warn!("file logging unavailable, using stderr");
        return None;
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false));
    if debug {
        registry
            .with(fmt::layer().with_writer(std::io::stdout))
            .init();
    } else {
        registry.init();
    }

    match rotated {
        Ok(true) => tracing::info!(path = %path.display(), "log exceeded {max_bytes} bytes, started fresh"),
        Ok(false) => {}
        Err(e) => tracing::error!(path = %path.display(), error = %e, "failed to remove oversized log"),
    }
    Some(guard)
}
