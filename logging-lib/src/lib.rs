use clap::{Parser, ValueEnum};
use is_terminal::IsTerminal;
use tracing::{Dispatch, dispatcher};
use tracing_log::AsLog;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default, Parser)]
pub struct LoggingOpts {
    #[clap(long, env = "A2A_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    #[clap(long, env = "A2A_LOG_COLOR", default_value = "auto")]
    pub log_color: LogColor,

    /// Additional per-target directives in the RUST_LOG format. Levels set
    /// via RUST_LOG itself take priority over these.
    #[clap(long)]
    pub log_directives: Option<String>,
}

pub fn init(opts: &LoggingOpts) -> Result<(), anyhow::Error> {
    let color = match opts.log_color {
        LogColor::Auto => std::io::stderr().is_terminal(),
        LogColor::Always => true,
        LogColor::Never => false,
    };

    let mut filter_builder = EnvFilter::builder();
    if let Some(directives) = &opts.log_directives {
        filter_builder = filter_builder.with_default_directive(directives.parse()?);
    }
    let filter = filter_builder.from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let dispatch: Dispatch = match opts.log_format {
        LogFormat::Text => builder.with_ansi(color).finish().into(),
        LogFormat::Json => builder.json().finish().into(),
    };
    dispatcher::set_global_default(dispatch)?;

    tracing_log::LogTracer::builder()
        // Must run after the global default is set so the max level hint
        // is already known.
        .with_max_level(tracing_core::LevelFilter::current().as_log())
        .init()?;
    Ok(())
}

/// Best-effort init for tests and tools that may race to install the
/// global subscriber.
pub fn try_init_default() {
    let _ = init(&LoggingOpts::default());
}

#[derive(Debug, Clone, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, ValueEnum)]
pub enum LogColor {
    #[default]
    Auto,
    Always,
    Never,
}
