// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    env,
    io::IsTerminal,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use bon::Builder;
use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Deserializer, Serialize, de};
use smart_default::SmartDefault;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::Subscriber;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter, fmt::MakeWriter, layer::SubscriberExt,
    registry::LookupSpan,
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LoggingError {
    #[snafu(display("failed to bridge `log` records into tracing"))]
    LogBridge { source: tracing_log::log::SetLoggerError },

    #[snafu(display("failed to create rolling log file in {dir}"))]
    Appender {
        dir:    String,
        source: tracing_appender::rolling::InitError,
    },

    #[snafu(display("invalid log level filter {level:?}"))]
    InvalidLevel {
        level:  String,
        source: filter::ParseError,
    },

    #[snafu(display("failed to install the global subscriber"))]
    SetGlobal {
        source: tracing::subscriber::SetGlobalDefaultError,
    },

    #[snafu(display("logging has not been initialized"))]
    NotInitialized,

    #[snafu(display("failed to reload log level"))]
    Reload {
        source: tracing_subscriber::reload::Error,
    },
}

pub type Result<T, E = LoggingError> = std::result::Result<T, E>;

/// Treats an empty string as `T::default()`, so `log_format = ""` in a
/// config file means "unset".
pub fn empty_string_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
        Ok(T::default())
    } else {
        T::deserialize(de::value::StrDeserializer::new(&s)).map_err(|e: de::value::Error| {
            de::Error::custom(format!("invalid value, expect empty string, err: {e}"))
        })
    }
}

pub const DEFAULT_LOGGING_DIR: &str = "logs";

const DEFAULT_LOG_TARGETS: &str = "info";

/// Handle for changing the level filter after initialization.
static RELOAD_HANDLE: OnceCell<tracing_subscriber::reload::Handle<filter::Targets, Registry>> =
    OnceCell::new();

static INITIALIZED: AtomicBool = AtomicBool::new(false);

static GLOBAL_UT_LOG_GUARD: Lazy<Mutex<Option<Vec<WorkerGuard>>>> = Lazy::new(|| Mutex::new(None));

/// Configuration options for the logging system.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, Builder)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory for hourly-rotated log files. Empty disables file logging.
    #[default = ""]
    #[builder(default)]
    pub dir: String,

    /// Level filter such as `"info"` or `"debug,reqwest=warn"`. Falls back to
    /// `RUST_LOG`, then `info`.
    pub level: Option<String>,

    #[serde(default, deserialize_with = "empty_string_as_default")]
    #[builder(default)]
    pub log_format: LogFormat,

    /// Rotated files kept per log stream.
    #[default = 720]
    #[builder(default = 720)]
    pub max_log_files: usize,

    /// Mirror every record to stderr as well. Stdout is left to progress
    /// output.
    #[default = true]
    #[builder(default = true)]
    pub append_stderr: bool,
}

#[derive(
    Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, Default, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

fn fmt_layer<S, W>(writer: W, format: LogFormat, ansi: bool) -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => tracing_subscriber::fmt::Layer::new()
            .json()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::Layer::new()
            .with_writer(writer)
            .with_ansi(ansi)
            .boxed(),
    }
}

fn rolling_appender(dir: &str, prefix: String, max_files: usize) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(prefix)
        .max_log_files(max_files)
        .build(dir)
        .context(AppenderSnafu { dir })
}

/// Install the global subscriber.
///
/// Only the first call has an effect; later calls return an empty guard list.
/// The returned guards flush the non-blocking writers when dropped and must be
/// held for as long as the process logs.
///
/// Layers:
/// - stderr, when `append_stderr` is set
/// - `<dir>/<app_name>.*` with every record, when `dir` is set
/// - `<dir>/<app_name>-err.*` with `ERROR` records only, when `dir` is set
pub fn init_global_logging(app_name: &str, opts: &LoggingOptions) -> Result<Vec<WorkerGuard>> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(vec![]);
    }

    let mut guards = vec![];
    LogTracer::init().context(LogBridgeSnafu)?;

    let level = opts
        .level
        .clone()
        .or_else(|| env::var(EnvFilter::DEFAULT_ENV).ok())
        .unwrap_or_else(|| DEFAULT_LOG_TARGETS.to_string());
    let targets = level
        .parse::<filter::Targets>()
        .context(InvalidLevelSnafu { level: &level })?;
    let (dyn_filter, reload_handle) = tracing_subscriber::reload::Layer::new(targets);
    let _ = RELOAD_HANDLE.set(reload_handle);

    let stderr_layer = if opts.append_stderr {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
        guards.push(guard);
        Some(fmt_layer(
            writer,
            opts.log_format,
            std::io::stderr().is_terminal(),
        ))
    } else {
        None
    };

    let (file_layer, err_file_layer) = if opts.dir.is_empty() {
        (None, None)
    } else {
        let appender = rolling_appender(&opts.dir, app_name.to_string(), opts.max_log_files)?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        let file_layer = fmt_layer(writer, opts.log_format, false);

        let appender =
            rolling_appender(&opts.dir, format!("{app_name}-err"), opts.max_log_files)?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        let err_layer = fmt_layer(writer, opts.log_format, false)
            .with_filter(filter::LevelFilter::ERROR)
            .boxed();

        (Some(file_layer), Some(err_layer))
    };

    let subscriber = Registry::default()
        .with(dyn_filter)
        .with(stderr_layer)
        .with(file_layer)
        .with(err_file_layer);
    tracing::subscriber::set_global_default(subscriber).context(SetGlobalSnafu)?;

    tracing::debug!(app = app_name, level = %level, dir = %opts.dir, "logging initialized");
    Ok(guards)
}

/// Replace the active level filter, e.g. when `--verbose` is toggled.
pub fn reload_level(level: &str) -> Result<()> {
    let targets = level
        .parse::<filter::Targets>()
        .context(InvalidLevelSnafu { level })?;
    RELOAD_HANDLE
        .get()
        .context(NotInitializedSnafu)?
        .reload(targets)
        .context(ReloadSnafu)
}

/// Logging for unit and integration tests.
///
/// Writes to `UNITTEST_LOG_DIR` (default `/tmp/__unittest_logs`) with the
/// filter from `UNITTEST_LOG_LEVEL`. Safe to call from every test.
pub fn init_default_ut_logging() {
    let mut guard = GLOBAL_UT_LOG_GUARD
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if guard.is_some() {
        return;
    }

    let dir = env::var("UNITTEST_LOG_DIR").unwrap_or_else(|_| "/tmp/__unittest_logs".to_string());
    let level = env::var("UNITTEST_LOG_LEVEL")
        .unwrap_or_else(|_| "debug,hyper=warn,reqwest=warn,h2=info,axum=info".to_string());
    let opts = LoggingOptions::builder()
        .dir(dir.clone())
        .level(level)
        .append_stderr(false)
        .build();

    match init_global_logging("unittest", &opts) {
        Ok(guards) => {
            *guard = Some(guards);
            tracing::info!("logs dir = {}", dir);
        }
        Err(e) => {
            *guard = Some(vec![]);
            eprintln!("unit test logging disabled: {e}");
        }
    }
}
