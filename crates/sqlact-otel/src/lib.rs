use once_cell::sync::OnceCell;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static JOB_LOG_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Console tracing filtered by `RUST_LOG` (default `info`), plus an optional
/// rolling file that captures the activity job's own events.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(fmt::layer().with_filter(filter));
    if std::env::var("SQLACT_JOB_LOG_ROLL").ok().as_deref() == Some("1") {
        let dir = std::env::var("SQLACT_JOB_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
        let rotation = rotation_from_env(std::env::var("SQLACT_JOB_LOG_ROTATION").ok().as_deref());
        if std::fs::create_dir_all(&dir).is_err() {
            tracing::warn!(directory = %dir, "failed to create job log directory");
        }
        let writer = tracing_appender::rolling::RollingFileAppender::new(rotation, &dir, "activity-job");
        let (nb, guard) = tracing_appender::non_blocking(writer);
        let _ = JOB_LOG_GUARD.set(guard);
        let job_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(nb)
            .with_filter(job_targets());
        let _ = registry.with(job_layer).try_init();
    } else {
        let _ = registry.try_init();
    }
}

fn job_targets() -> Targets {
    Targets::new()
        .with_target("sqlact::job", tracing::Level::DEBUG)
        .with_target("sqlact::scheduler", tracing::Level::DEBUG)
        .with_target("sqlact::store", tracing::Level::INFO)
}

fn rotation_from_env(raw: Option<&str>) -> Rotation {
    match raw.map(str::to_lowercase).as_deref() {
        Some("hourly") => Rotation::HOURLY,
        Some("minutely") => Rotation::MINUTELY,
        Some("never") => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}
