// ABOUTME: Entry point for the sshot CLI application.
// ABOUTME: Parses arguments, resolves the target and dispatches to run/stream/upload/resolve.

mod cli;

use clap::Parser;
use cli::{Cli, Commands, ConnectionArgs};
use sshot::error::{Error, Result};
use sshot::output::{Output, OutputMode};
use sshot::ssh::{Completion, ConnectionParameters, HostKeyPolicy, Session};
use std::env;
use std::path::Path;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbose flag when set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    let mode = if cli.json {
        OutputMode::Json
    } else if cli.quiet {
        OutputMode::Quiet
    } else {
        OutputMode::Normal
    };
    let mut output = Output::new(mode);

    if let Err(e) = run(cli.command, &mut output).await {
        output.error(&e.to_string());
        std::process::exit(e.exit_code());
    }
}

async fn run(command: Commands, output: &mut Output) -> Result<()> {
    match command {
        Commands::Run {
            connection,
            command,
        } => run_remote(&resolve(&connection)?, &command.join(" "), output).await,
        Commands::Stream {
            connection,
            command,
        } => stream_remote(&resolve(&connection)?, &command.join(" "), output).await,
        Commands::Upload {
            connection,
            source,
            destination,
        } => upload(&resolve(&connection)?, &source, &destination, output).await,
        Commands::Resolve { connection } => {
            let params = resolve(&connection)?;
            output.line(&format!("user {}", params.user));
            output.line(&format!("host {}", params.host));
            output.line(&format!("port {}", params.port));
            if let Some(key) = &params.key_path {
                output.line(&format!("identityfile {}", key.display()));
            }
            Ok(())
        }
    }
}

/// Resolve the target, then apply command-line overrides on top.
fn resolve(args: &ConnectionArgs) -> Result<ConnectionParameters> {
    let mut params = ConnectionParameters::resolve(&args.target, host_key_policy(args))?;

    if let Some(port) = args.port {
        params = params.port(port);
    }
    if let Some(identity) = &args.identity {
        params = params.key_path(identity);
    }
    if let Some(var) = &args.password_env {
        let password = env::var(var).map_err(|_| Error::MissingEnvVar(var.clone()))?;
        params = params.password(password);
    }

    Ok(params)
}

fn host_key_policy(args: &ConnectionArgs) -> HostKeyPolicy {
    if args.insecure {
        HostKeyPolicy::AcceptAny
    } else if let Some(fingerprint) = &args.fingerprint {
        HostKeyPolicy::Fingerprint(fingerprint.clone())
    } else {
        HostKeyPolicy::KnownHosts {
            path: args.known_hosts.clone(),
            trust_on_first_use: args.trust_first_connection,
        }
    }
}

/// Buffer the whole output and print it after the command ends.
async fn run_remote(params: &ConnectionParameters, command: &str, output: &Output) -> Result<()> {
    output.progress(&format!("→ Connecting to {}@{}:{}...", params.user, params.host, params.port));
    let session = Session::connect(params).await?;

    let (text, completion) = session.stream(command).await?.collect_output().await?;
    for line in text.lines() {
        output.line(line);
    }
    command_result(completion)
}

async fn stream_remote(params: &ConnectionParameters, command: &str, output: &Output) -> Result<()> {
    output.progress(&format!("→ Connecting to {}@{}:{}...", params.user, params.host, params.port));
    let session = Session::connect(params).await?;

    let mut stream = session.stream(command).await?;
    while let Some(line) = stream.next_line().await {
        output.line(&line);
    }
    command_result(stream.finish().await?)
}

fn command_result(completion: Completion) -> Result<()> {
    if let Some(error) = completion.error {
        return Err(Error::CommandAborted(error));
    }
    match completion.exit_status {
        Some(0) | None => Ok(()),
        Some(status) => Err(Error::CommandExited(status)),
    }
}

async fn upload(
    params: &ConnectionParameters,
    source: &Path,
    destination: &str,
    output: &mut Output,
) -> Result<()> {
    output.progress(&format!("→ Connecting to {}@{}:{}...", params.user, params.host, params.port));
    output.start_timer();
    let session = Session::connect(params).await?;

    output.progress(&format!("→ Uploading {}...", source.display()));
    session.upload(source, destination).await?;

    output.success(&format!("✓ Uploaded {} to {}:{}", source.display(), params.host, destination));
    Ok(())
}
