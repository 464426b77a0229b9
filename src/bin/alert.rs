use clap::Parser;
use delfin::{Role, runtime};
use tracing::trace;

/// Alert role: alert processing dispatch
#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file (defaults to $DELFIN_CONFIG, then /etc/delfin/delfin.json)
    #[arg(short, long)]
    file: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    runtime::init_tracing(Role::Alert);
    let args = Args::parse();
    trace!("started with args: {args:?}");

    runtime::run(Role::Alert, args.file.as_deref()).await
}
