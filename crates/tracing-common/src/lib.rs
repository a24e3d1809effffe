use color_eyre::eyre::Context;
use tracing_subscriber::{
    EnvFilter, Layer as _, Registry, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};
use tracing_tree::HierarchicalLayer;

pub const JSON_LOGS: &str = "JSON_LOGS";

fn default_filter(crate_name: &str) -> String {
    format!("info,{crate_name}=trace,sqlx=warn")
}

/// Sets up tracing with either a JSON or a hierarchical layer.
///
/// Logs go to stderr so command output on stdout stays machine readable.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Log filter (defaults to `info,{crate_name}=trace,sqlx=warn`)
/// - `JSON_LOGS`: If set, outputs JSON logs instead of hierarchical
pub fn setup_tracing(crate_name: &str) -> color_eyre::Result<()> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter(crate_name));

    let env_filter = EnvFilter::builder().parse(&rust_log).wrap_err_with(|| {
        color_eyre::eyre::eyre!("Couldn't create env filter from {}", rust_log)
    })?;

    let stderr_layer = if std::env::var(JSON_LOGS).is_ok() {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        HierarchicalLayer::default()
            .with_writer(std::io::stderr)
            .with_indent_lines(true)
            .with_indent_amount(2)
            .with_verbose_exit(true)
            .with_verbose_entry(true)
            .with_targets(true)
            .boxed()
    };

    Registry::default()
        .with(stderr_layer)
        .with(env_filter)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_parses() {
        let filter = default_filter("pgshift");
        assert_eq!(filter, "info,pgshift=trace,sqlx=warn");
        assert!(EnvFilter::builder().parse(&filter).is_ok());
    }
}
