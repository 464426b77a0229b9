use clap::Parser;
use delfin::{Role, runtime};
use tracing::trace;

/// Exporter role: ships alert events to the configured sinks
#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file (defaults to $DELFIN_CONFIG, then /etc/delfin/delfin.json)
    #[arg(short, long)]
    file: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    runtime::init_tracing(Role::Exporter);
    let args = Args::parse();
    trace!("started with args: {args:?}");

    runtime::run(Role::Exporter, args.file.as_deref()).await
}
