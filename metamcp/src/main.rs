use std::{
    io::IsTerminal,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
};

use args::{Args, LogFormat};
use clap::Parser;
use logforth::{
    append::{FastraceEvent, Stdout},
    diagnostic::FastraceDiagnostic,
    layout::{JsonLayout, TextLayout},
};
use server::ServeConfig;
use storage::MemoryStorage;

mod args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.config()?;

    init_logging(&args);

    let listen_address = args
        .listen_address
        .or(config.server.listen_address)
        .unwrap_or(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8000)));

    server::serve(ServeConfig {
        listen_address,
        config,
        storage: Arc::new(MemoryStorage::new()),
    })
    .await
}

/// Two logforth dispatches: one feeds log records into fastrace spans, one
/// writes to stdout in the requested format. Auto means colored text when
/// stdout is a terminal.
fn init_logging(args: &Args) {
    logforth::builder()
        .dispatch(|d| d.filter(args.log_filter()).append(FastraceEvent::default()))
        .dispatch(|d| {
            let d = d
                .diagnostic(FastraceDiagnostic::default())
                .filter(args.log_filter());

            let stdout = Stdout::default();

            match args.log_format {
                LogFormat::Json => d.append(stdout.with_layout(JsonLayout::default())),
                LogFormat::Plain => d.append(stdout.with_layout(TextLayout::default().no_color())),
                LogFormat::Auto if std::io::stdout().is_terminal() => {
                    d.append(stdout.with_layout(TextLayout::default()))
                }
                LogFormat::Auto => d.append(stdout.with_layout(TextLayout::default().no_color())),
            }
        })
        .apply();
}
