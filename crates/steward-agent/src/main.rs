use std::sync::Arc;

use steward_agent::{Settings, StartOutcome, Supervisor, TracingSink, format_error_chain};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const TAIL_LINES: usize = 50;

const HELP: &str = "commands: start <name> | stop | run <command> | say <text> | list | status | tail | help | quit";

fn init_logging(settings: &Settings) -> tracing_appender::non_blocking::WorkerGuard {
    let appender = tracing_appender::rolling::daily(settings.logs_dir().join("agent"), "agent.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    guard
}

async fn handle_line(sup: &Supervisor, line: &str) -> anyhow::Result<bool> {
    let line = line.trim();
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match cmd {
        "" => {}
        "start" if !rest.is_empty() => match sup.start(rest).await? {
            StartOutcome::Started(status) => {
                println!("started {} (pid {:?})", rest, status.pid);
            }
            StartOutcome::Provisioned { path, .. } => {
                println!(
                    "server files downloaded to {}; run `start {rest}` again to launch",
                    path.display()
                );
            }
        },
        "stop" => {
            sup.stop().await?;
            println!("stopping");
        }
        "run" if !rest.is_empty() => {
            sup.run_command(rest).await?;
            println!("ran {rest}");
        }
        "say" => {
            if !sup.write_console(rest).await {
                println!("no server is running");
            }
        }
        "list" => {
            let names = sup.list_available().await?;
            println!("{} available", names.len());
            for name in names {
                println!("  - {name}");
            }
        }
        "status" => {
            let status = sup.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        "tail" => {
            let (lines, _) = sup.tail_console(0, TAIL_LINES).await;
            for l in lines {
                println!("{l}");
            }
        }
        "quit" | "exit" => return Ok(false),
        _ => println!("{HELP}"),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env();
    let _log_guard = init_logging(&settings);

    tracing::info!(
        data_root = %settings.data_root.display(),
        version = env!("CARGO_PKG_VERSION"),
        "steward-agent starting"
    );

    let interval = settings.reconcile_interval;
    let sup = Supervisor::new(settings, Arc::new(TracingSink))?;
    let reconciler = sup.spawn_reconciler(interval);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match handle_line(&sup, &line).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => {
                        tracing::warn!(error = %format!("{err:#}"), "command failed");
                        println!("error: {err:#}");
                    }
                }
            }
        }
    }

    if sup.status().await.name.is_some()
        && let Err(err) = sup.stop().await
    {
        tracing::warn!(error = %format_error_chain(&err), "stop on shutdown failed");
    }
    reconciler.abort();
    tracing::info!("steward-agent stopped");
    Ok(())
}
