use std::{fs, path::Path};

use miette::{miette, Context, IntoDiagnostic, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};


/// Set up tracing with a console layer and a daily-rolling file layer.
/// The returned guard must stay alive until the program exits, or tail
/// log lines are lost.
pub fn initialize_tracing(
    console_output_level_filter: EnvFilter,
    log_file_output_level_filter: EnvFilter,
    log_file_output_directory: &Path,
) -> Result<WorkerGuard> {
    fs::create_dir_all(log_file_output_directory)
        .into_diagnostic()
        .wrap_err_with(|| miette!("Failed to create log file output directory."))?;

    let file_appender = tracing_appender::rolling::daily(log_file_output_directory, "tidewatch.log");
    let (non_blocking_file_appender, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_output_level_filter),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking_file_appender)
                .with_filter(log_file_output_level_filter),
        )
        .try_init()
        .into_diagnostic()
        .wrap_err_with(|| miette!("Failed to initialize the tracing subscriber."))?;

    Ok(guard)
}
