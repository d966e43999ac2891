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

use std::{path::PathBuf, sync::Arc};

use clap::{Args, Parser, Subcommand};
use panflow_base::readable_size::ReadableSize;
use panflow_common_telemetry::{LoggingOptions, init_global_logging, set_panic_hook};
use panflow_transfer::{
    DEFAULT_MAX_PARALLEL, DEFAULT_MAX_RETRY, DownloadContext, DownloadFlags, DownloadTaskUnit,
    DownloaderConfig, ExecutorConfig, RangeGenMode, TaskExecutor,
};
use snafu::{ResultExt, Whatever};
use tracing::{info, warn};

mod direct;
mod progress;

use direct::DirectHttpService;
use progress::ProgressFactory;

#[derive(Debug, Parser)]
#[clap(
name = "panflow",
about = "Resumable parallel downloads",
author = env!("CARGO_PKG_AUTHORS"),
version)]
struct Cli {
    /// Log level filter, e.g. `debug` or `info,panflow_transfer=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Directory for rotated log files
    #[arg(long, global = true)]
    log_dir: Option<String>,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Download(DownloadArgs),
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Download one or more files over HTTP with parallel ranged requests.
An interrupted download resumes from `<file>.panflow-downloading`.
Examples:

panflow download https://example.com/big.iso -p 8 --max-rate 2MiB

")]
struct DownloadArgs {
    /// URLs to download
    #[arg(required = true)]
    urls: Vec<String>,

    /// Directory the files are saved into
    #[arg(short, long, default_value = ".")]
    out_dir: PathBuf,

    /// Range workers per file
    #[arg(short, long, default_value_t = DEFAULT_MAX_PARALLEL)]
    parallel: usize,

    /// Files downloaded at once
    #[arg(short, long, default_value_t = 1)]
    load: usize,

    /// Range size
    #[arg(long, default_value = "55MiB")]
    block_size: ReadableSize,

    /// Split each file evenly across workers instead of by block size
    #[arg(long)]
    even_split: bool,

    /// Aggregate throughput cap, e.g. `512KiB`
    #[arg(long)]
    max_rate: Option<ReadableSize>,

    /// Mirror URL serving the same content; repeatable
    #[arg(long = "mirror")]
    mirrors: Vec<String>,

    /// Retries per file
    #[arg(long, default_value_t = DEFAULT_MAX_RETRY)]
    retry: usize,

    /// Replace files that already exist
    #[arg(long)]
    overwrite: bool,

    /// Mark downloaded files executable
    #[arg(short = 'x', long)]
    executable: bool,

    /// Print every worker on each progress tick
    #[arg(short, long)]
    verbose: bool,
}

impl DownloadArgs {
    async fn run(self) -> Result<(), Whatever> {
        let load = self.load.max(1);
        let service = DirectHttpService::new(concat!("panflow/", env!("CARGO_PKG_VERSION")))
            .whatever_context("failed to build HTTP client")?;
        let executor = TaskExecutor::new(ExecutorConfig {
            parallel: load,
            ..ExecutorConfig::default()
        });
        let config = DownloaderConfig {
            max_parallel: self.parallel.max(1),
            block_size: self.block_size,
            mode: if self.even_split {
                RangeGenMode::Default
            } else {
                RangeGenMode::BlockSize
            },
            max_rate: self.max_rate,
            mirrors: self.mirrors,
            ..DownloaderConfig::default()
        };
        let ctx = Arc::new(
            DownloadContext::builder()
                .service(Arc::new(service))
                .executor(executor.clone())
                .config(config)
                .flags(DownloadFlags {
                    executable: self.executable,
                    // plain HTTP carries no checksum
                    no_check:   true,
                    overwrite:  self.overwrite,
                })
                .save_root(self.out_dir)
                .load(load)
                .observers(Arc::new(ProgressFactory {
                    show_workers: self.verbose,
                }))
                .build(),
        );

        for url in self.urls {
            let unit = DownloadTaskUnit::new(Arc::clone(&ctx), url.clone())
                .with_save_path(ctx.save_root.join(direct::file_name(&url)));
            let info = executor.append(unit, self.retry);
            info!(task = info.id(), url = %url, "queued");
        }

        let cancel = ctx.cancel.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, saving progress for the next run");
                cancel.cancel();
            }
        });
        let summary = executor.execute().await;
        interrupt.abort();
        if ctx.cancel.is_cancelled() {
            snafu::whatever!(
                "interrupted after {} of {} downloads, rerun to resume",
                summary.succeeded,
                summary.succeeded + summary.failed
            );
        }

        println!(
            "\ndownloaded {} file(s), {} in {:.1?}",
            ctx.statistic.total_files(),
            ReadableSize(ctx.statistic.total_bytes()),
            ctx.statistic.elapsed(),
        );
        let failed = executor.failed();
        if failed.is_empty() {
            return Ok(());
        }
        println!("{} failed:", failed.len());
        for task in &failed {
            let error = task
                .result
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            println!("  [{}] {}: {} {}", task.info.id(), task.label, task.result.message, error);
        }
        snafu::whatever!("{} of {} downloads failed", failed.len(), summary.succeeded + summary.failed)
    }
}

#[tokio::main]
async fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();
    let options = LoggingOptions {
        dir: cli.log_dir.unwrap_or_default(),
        level: cli.log_level,
        ..LoggingOptions::default()
    };
    let _guards =
        init_global_logging("panflow", &options).whatever_context("failed to initialize logging")?;
    set_panic_hook();

    match cli.commands {
        Commands::Download(args) => args.run().await,
    }
}
