use std::io::Write;
use std::process::ExitCode;

use clap::Parser;
use report_mailer::cli::{Cli, Mode};
use report_mailer::{SmtpClient, SmtpError, SmtpResult};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = cli.logging_config().init() {
        eprintln!("failed to initialise logging: {}", e);
    }

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let cause = std::error::Error::source(&e).map(|c| c.to_string());
            tracing::error!(error = %e, stage = %e.stage(), kind = ?e.kind(), cause = cause.as_deref(), "report-mailer failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> SmtpResult<()> {
    let config = cli.smtp_config()?;
    let client = SmtpClient::new(config)?;

    match cli.mode() {
        Mode::Check => {
            let info = client.verify().await?;
            if cli.json {
                print_json(&info)?;
            } else {
                println!(
                    "{}:{} ok (tls: {}, user: {})",
                    info.host,
                    info.port,
                    info.tls_enabled,
                    info.authenticated_user.as_deref().unwrap_or("-")
                );
            }
        }
        Mode::DryRun => {
            let email = cli.build_email().await?;
            let encoded = client.encode(&email)?;
            tracing::info!(message_id = %encoded.message_id, bytes = encoded.size(), "Dry run, not sending");
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(&encoded.bytes)
                .and_then(|_| stdout.flush())
                .map_err(|e| SmtpError::configuration("Cannot write to stdout").with_cause(e))?;
        }
        Mode::Send => {
            let email = cli.build_email().await?;
            let result = client.send(&email).await?;
            if cli.json {
                print_json(&result)?;
            } else {
                println!("sent {} to {} recipient(s)", result.message_id, result.accepted.len());
                for rejected in &result.rejected {
                    println!("rejected {} ({} {})", rejected.address, rejected.code, rejected.message);
                }
            }
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> SmtpResult<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| {
        SmtpError::configuration("Cannot serialize output").with_cause(e)
    })?;
    println!("{}", json);
    Ok(())
}
