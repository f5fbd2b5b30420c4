//! crosspost-transform - image transform worker
//!
//! Reads one `TransformRequest` JSON object per line on stdin and answers each
//! with one `TransformResponse` line on stdout. A single engine lives for the
//! whole process, so repeated requests for the same source decode it once.

use anyhow::{Context, Result};
use clap::Parser;
use libcrosspost::logging::{LogFormat, LoggingConfig};
use libcrosspost::transform::protocol::{decode_line, encode_line};
use libcrosspost::transform::{TransformEngine, TransformRequest, TransformResponse};
use std::io::{BufRead, Write};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "crosspost-transform")]
#[command(version)]
#[command(about = "Image transform worker speaking JSON lines on stdin/stdout")]
#[command(long_about = "\
crosspost-transform - image transform worker

DESCRIPTION:
    Started by crosspost-send when [transform] mode = \"subprocess\".
    Speaks JSON lines on stdin/stdout. Each input line is a request:

        {\"location\":\"/path/cat.png\",\"quality\":80,\"type\":\"image/jpeg\",\"width\":1280}

    Each output line is a response:

        {\"code\":\"SUCCESS\",\"data\":{\"buffer\":\"<base64>\",\"type\":\"image/jpeg\"}}
        {\"code\":\"ERROR\",\"err\":\"...\"}

    Malformed requests get an ERROR response; the worker keeps running
    until stdin is closed.

EXIT CODES:
    0 - stdin closed
    1 - stdout could not be written
")]
struct Cli {
    /// Log format on stderr
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Enable debug logging to stderr
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    LoggingConfig::new(cli.log_format, "warn".to_string(), cli.verbose).init();

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let handled = serve(stdin.lock(), stdout.lock(), &mut TransformEngine::new())?;

    info!(requests = handled, "Transform worker exiting");
    Ok(())
}

/// Answer requests until `input` ends, returning how many were handled
fn serve<R: BufRead, W: Write>(input: R, mut output: W, engine: &mut TransformEngine) -> Result<usize> {
    let mut handled = 0;

    for line in input.lines() {
        let line = line.context("Failed to read request")?;
        if line.trim().is_empty() {
            continue;
        }

        let response = match decode_line::<TransformRequest>(&line) {
            Ok(request) => {
                debug!(location = %request.location, width = request.width, "Transform request");
                TransformResponse::from(engine.transform(&request))
            }
            Err(e) => {
                warn!(error = %e, "Malformed request");
                TransformResponse::Error {
                    err: format!("Malformed request: {}", e),
                }
            }
        };

        let reply = encode_line(&response).context("Failed to encode response")?;
        output
            .write_all(reply.as_bytes())
            .and_then(|_| output.flush())
            .context("Failed to write response")?;
        handled += 1;
    }

    Ok(handled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_lines_get_error_replies() {
        let input = "not json\n\n{\"location\":\"/missing.png\",\"quality\":80,\"type\":\"image/png\",\"width\":10}\n";
        let mut output = Vec::new();

        let handled = serve(input.as_bytes(), &mut output, &mut TransformEngine::new()).unwrap();
        assert_eq!(handled, 2);

        let replies: Vec<TransformResponse> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| decode_line(l).unwrap())
            .collect();
        assert!(matches!(&replies[0], TransformResponse::Error { err } if err.starts_with("Malformed")));
        assert!(matches!(&replies[1], TransformResponse::Error { err } if err.contains("/missing.png")));
    }
}
