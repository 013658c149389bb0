use clap::Parser;
use kiln_cli::{Args, SYSTEM_LIBRARY_DIR, prepend_library_path};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let current = std::env::var("LD_LIBRARY_PATH").ok();
    let library_path = prepend_library_path(SYSTEM_LIBRARY_DIR, current.as_deref());
    // SAFETY: no other threads exist yet.
    unsafe {
        std::env::set_var("LD_LIBRARY_PATH", library_path);
    }

    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();

    kiln_cli::run(&args)?;
    Ok(())
}
