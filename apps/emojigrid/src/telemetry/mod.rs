use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

static PERF_ENABLED: Lazy<bool> = Lazy::new(|| env_truthy("EMOJIGRID_PERF").unwrap_or(false));

static STATS: Lazy<Mutex<BTreeMap<&'static str, PerfStat>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

/// Fault counters are always on; perf timings only with `EMOJIGRID_PERF=1`.
static COUNTERS: Lazy<Mutex<BTreeMap<(Category, &'static str), u64>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    /// Inbound frame that failed to decode and was dropped.
    DroppedFrame,
    /// Decoded message that contradicts what the client knows about the grid.
    IntegrityFault,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::DroppedFrame => "dropped_frame",
            Category::IntegrityFault => "integrity_fault",
        }
    }
}

#[derive(Default)]
struct PerfStat {
    total_ns: u128,
    max_ns: u128,
    count: u64,
}

pub fn enabled() -> bool {
    *PERF_ENABLED
}

pub fn record_dropped_frame(kind: &'static str) {
    bump(Category::DroppedFrame, kind, 1);
}

pub fn record_integrity_fault(kind: &'static str, count: usize) {
    bump(Category::IntegrityFault, kind, count as u64);
}

fn bump(category: Category, kind: &'static str, by: u64) {
    let mut counters = COUNTERS.lock();
    let entry = counters.entry((category, kind)).or_default();
    *entry = entry.saturating_add(by);
}

pub fn counter(category: Category, kind: &'static str) -> u64 {
    COUNTERS.lock().get(&(category, kind)).copied().unwrap_or(0)
}

/// Total across every kind in `category`.
pub fn total(category: Category) -> u64 {
    COUNTERS
        .lock()
        .iter()
        .filter(|((c, _), _)| *c == category)
        .map(|(_, count)| *count)
        .sum()
}

/// `category.kind=count` pairs, sorted, for a one-line summary.
pub fn summary() -> String {
    COUNTERS
        .lock()
        .iter()
        .map(|((category, kind), count)| format!("{}.{kind}={count}", category.as_str()))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn record_duration(label: &'static str, duration: Duration) {
    if !enabled() {
        return;
    }
    let mut stats = STATS.lock();
    let entry = stats.entry(label).or_default();
    entry.count += 1;
    let nanos = duration.as_nanos();
    entry.total_ns += nanos;
    entry.max_ns = entry.max_ns.max(nanos);
    if entry.count % 50 == 0 {
        let avg_us = (entry.total_ns / entry.count as u128) as f64 / 1_000.0;
        let max_us = entry.max_ns as f64 / 1_000.0;
        tracing::info!(
            target: "perf",
            label,
            count = entry.count,
            avg_us = format_args!("{avg_us:.2}"),
            max_us = format_args!("{max_us:.2}"),
            "timing"
        );
    }
}

pub struct PerfGuard {
    label: &'static str,
    start: Instant,
}

impl PerfGuard {
    pub fn new(label: &'static str) -> Option<Self> {
        if !enabled() {
            return None;
        }
        Some(Self {
            label,
            start: Instant::now(),
        })
    }
}

impl Drop for PerfGuard {
    fn drop(&mut self) {
        record_duration(self.label, self.start.elapsed());
    }
}

pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    pub const FILTER_ENV: &str = "EMOJIGRID_LOG_FILTER";

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }

        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Install the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let filter = build_env_filter(config.level.to_filter());
        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_level(true)
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level >= LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;
        let _ = GUARD.set(guard);
        Ok(())
    }

    fn build_env_filter(level: LevelFilter) -> EnvFilter {
        match std::env::var(FILTER_ENV) {
            Ok(filter) => EnvFilter::new(filter),
            Err(_) => EnvFilter::new(default_filter_for(level)),
        }
    }

    /// Our own targets follow `level`; dependencies stay at `info` at most so
    /// websocket internals do not drown the grid traffic.
    pub(crate) fn default_filter_for(level: LevelFilter) -> String {
        const OWN_TARGETS: &[&str] = &[
            "emojigrid",
            "emojigrid_client",
            "grid",
            "session",
            "transport",
            "client",
            "perf",
        ];
        match level {
            LevelFilter::TRACE | LevelFilter::DEBUG => {
                let level = level.to_string().to_lowercase();
                let mut filter = String::from("info");
                for target in OWN_TARGETS {
                    filter.push_str(&format!(",{target}={level}"));
                }
                filter
            }
            other => other.to_string().to_lowercase(),
        }
    }
}
