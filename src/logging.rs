use std::io;
use tracing::Level;
use tracing_appender::rolling;
use tracing_subscriber::filter::FilterFn;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const DEFAULT_STDOUT_FILTER: &str =
    "info,llm_request=info,web_request=warn,db_query=warn,reconcile=info,sqlx=off";
const DEFAULT_FILE_FILTER: &str = "llm_request=debug,reconcile=debug,info,sqlx=info";

pub fn configure_logging() {
    // reqwest's connection pool is chatty at WARN when a server closes keep-alive sockets
    let custom_filter = FilterFn::new(|metadata| {
        !(metadata.level() == &Level::WARN && metadata.target().starts_with("hyper_util"))
    });

    // RUST_LOG overrides the stdout filter only; the file log keeps full detail
    let stdout_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_STDOUT_FILTER));

    let stdout_log = fmt::layer()
        .with_writer(io::stdout)
        .with_filter(stdout_filter)
        .with_filter(custom_filter);

    let log_dir = std::env::var("ANNALIST_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let file_appender = rolling::daily(log_dir, "annalist.log");
    let file_log = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_filter(EnvFilter::new(DEFAULT_FILE_FILTER));

    tracing_subscriber::Registry::default()
        .with(stdout_log)
        .with(file_log)
        .init();
}
