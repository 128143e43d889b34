use clap::Parser;
use icebox::rewrite::{Directive, ImageRewriter};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Rewrite a dumped image directory for a new container identity.
#[derive(Parser)]
#[command(name = "icebox-rewrite")]
struct Args {
    /// Source image directory.
    src: PathBuf,
    /// Destination image directory (may equal SRC for in-place rewrite).
    dest: PathBuf,
    /// Directives: ip=IPV4, mac=HEX, cgroup=OLD:NEW.
    #[arg(required = true)]
    directives: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("icebox=info")),
        )
        .init();

    let args = Args::parse();
    let directives = args
        .directives
        .iter()
        .map(|s| Directive::parse(s))
        .collect::<Result<Vec<_>, _>>()?;

    let config = icebox::config::Config::from_env();
    ImageRewriter::new(&args.src, &args.dest)
        .with_ip_binary(config.ip_binary)
        .apply_all(&directives)
        .await?;

    tracing::info!(
        src = %args.src.display(),
        dest = %args.dest.display(),
        count = directives.len(),
        "image rewrite complete"
    );
    Ok(())
}
