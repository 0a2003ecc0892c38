use clap::Parser;
use kiln_core::ProcessEvent;
use kiln_runner::ProcessSupervisor;
use kiln_runner::config::RunnerConfig;
use tracing_subscriber::EnvFilter;

/// Kiln Runner - dev-server supervisor
#[derive(Parser)]
#[command(name = "kiln-runner")]
#[command(version)]
#[command(about = "Kiln Runner - dev-server supervisor for Kiln projects")]
struct Args {
    /// Base URL of the Kiln web API
    #[arg(long, env = "API_BASE_URL", default_value = "http://localhost:3000")]
    api_base_url: String,

    /// Identity of this runner instance
    #[arg(long, env = "RUNNER_ID")]
    runner_id: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = RunnerConfig::from_env();
    config.api_base_url = args.api_base_url;
    if let Some(runner_id) = args.runner_id {
        config.runner_id = runner_id;
    }

    let supervisor = ProcessSupervisor::new(&config);
    tracing::info!(
        runner = %config.runner_id,
        api = %config.api_base_url,
        "Kiln runner ready"
    );

    // Relay process events as structured logs for the platform's collector.
    if let Some(mut events) = supervisor.take_event_receiver() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ProcessEvent::Log {
                        project_id,
                        stream,
                        line,
                    } => {
                        tracing::info!(project = %project_id, stream = %stream, "{line}");
                    }
                    ProcessEvent::Exit {
                        project_id,
                        code,
                        signal,
                        state,
                        failure_reason,
                        ..
                    } => {
                        tracing::info!(
                            project = %project_id,
                            code,
                            signal,
                            state = %state,
                            reason = failure_reason.map(|r| r.to_string()).as_deref(),
                            "Process exited"
                        );
                    }
                    ProcessEvent::Error {
                        project_id,
                        message,
                    } => {
                        tracing::error!(project = %project_id, "{message}");
                    }
                }
            }
        });
    }

    wait_for_shutdown_signal().await;
    tracing::info!("Shutdown signal received, stopping all dev servers");
    supervisor.stop_all(None).await;
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
