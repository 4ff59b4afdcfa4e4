use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use speaker_group_control::{
    config::Args,
    externals::{
        console::task::{spawn_stdin_reader, task_console},
        event_logging::task::task_status_event_logging,
        ssc::{connector::SscConnector, probe::MdnsProbe},
    },
    internals::core::supervisor::Supervisor,
};
use tokio::{signal, sync::mpsc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&args.log_level))?;

    // NOTE: the guard flushes the file writer and must live until exit.
    let (file_layer, _log_guard) = match args.log_file_location() {
        Some((directory, name)) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(directory, name));
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_target(false),
        )
        .with(file_layer)
        .try_init()?;

    let config = args.to_config()?;
    info!("Using {:?}.", config);

    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    let (supervisor, handle) = Supervisor::new(
        config.clone(),
        Arc::new(MdnsProbe::new(config.probe_window)),
        Arc::new(SscConnector::new(config.io_timeout)),
        args.interface(),
        token.child_token(),
    );
    let dispatcher = handle.dispatcher(&config);

    // NOTE: subscribe before the supervisor starts so no event is missed.
    let rx_status_logging = handle.subscribe();
    let rx_status_console = handle.subscribe();

    let token_clone = token.clone();
    tracker.spawn(async { task_status_event_logging(token_clone, rx_status_logging).await });

    let token_clone = token.clone();
    tracker.spawn(async move {
        supervisor.run().await;
        token_clone.cancel();
    });

    let (tx_lines, rx_lines) = mpsc::channel(8);
    spawn_stdin_reader(tx_lines)?;

    let token_clone = token.clone();
    tracker.spawn(async move {
        task_console(token_clone, handle, dispatcher, rx_status_console, rx_lines).await
    });

    let token_clone = token.clone();

    tokio::select! {
        _ = token_clone.cancelled() => {}
        res = signal::ctrl_c() => {
            match res {
                Ok(_) => {
                    token.cancel();
                },
                Err(e)=>{
                    tracing::error!("Failed to listen for ctrl_c. Error: {}", e);
                    token.cancel();
                }
            };
        },
    }

    tracker.close();
    tracker.wait().await;

    Ok(())
}
