use std::collections::BTreeMap;
use std::convert::Infallible;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use openagents_stream::{
    Adjustment, ClientNotification, ConnectionState, EnvelopeDecoder, LiveSession, LogEntry,
    MemoryTransport, SseTransport, StreamConfig, SubscribeOptions, SubscribeParams,
    TransportMessage, WeightVector, decode_chunk_stream,
};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "oa-stream")]
#[command(about = "Drive the OpenAgents streaming layer from the command line")]
pub struct StreamHarnessCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Split a recorded chat response into visible text and envelopes
    Decode(DecodeArgs),
    /// Feed recorded live-event JSON lines through a live session
    Replay(ReplayArgs),
    /// Attach a live session to an SSE endpoint
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    pub file: PathBuf,
    /// Bytes per chunk fed to the decoder
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, value_parser = parse_chunk_size)]
    pub chunk_size: usize,
}

#[derive(Args, Debug)]
pub struct ReplayArgs {
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    pub url: String,
    /// Extra query parameter, repeatable
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub params: Vec<(String, String)>,
}

fn parse_chunk_size(raw: &str) -> Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(0) => Err("chunk size must be at least 1".to_string()),
        Ok(size) => Ok(size),
        Err(error) => Err(error.to_string()),
    }
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

pub async fn run(cli: StreamHarnessCli) -> Result<()> {
    let stdout = std::io::stdout();
    match cli.command {
        Commands::Decode(args) => {
            let input = read_input(&args.file).await?;
            let mut rendered = Vec::new();
            decode(&input, args.chunk_size, &mut rendered).await?;
            stdout.lock().write_all(&rendered)?;
            Ok(())
        }
        Commands::Replay(args) => {
            let input = read_input(&args.file).await?;
            let text = String::from_utf8(input)
                .with_context(|| format!("{} is not valid utf-8", args.file.display()))?;
            let config = StreamConfig::from_env()?;
            let summary = replay(&text, &config).await?;
            let mut out = stdout.lock();
            serde_json::to_writer_pretty(&mut out, &summary)?;
            writeln!(out)?;
            Ok(())
        }
        Commands::Watch(args) => {
            let config = StreamConfig::from_env()?;
            watch(&args, &config).await
        }
    }
}

async fn read_input(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("read {}", path.display()))
}

/// Write the visible text, then one JSON line per envelope.
pub async fn decode(input: &[u8], chunk_size: usize, out: &mut impl Write) -> Result<()> {
    let chunks = futures::stream::iter(
        input
            .chunks(chunk_size.max(1))
            .map(Ok::<&[u8], Infallible>),
    );
    let mut decoder = EnvelopeDecoder::new();
    let envelopes = decode_chunk_stream(chunks, &mut decoder).await?;

    out.write_all(decoder.visible_text().as_bytes())?;
    if !decoder.visible_text().is_empty() && !decoder.visible_text().ends_with('\n') {
        writeln!(out)?;
    }
    for envelope in &envelopes {
        serde_json::to_writer(&mut *out, envelope)?;
        writeln!(out)?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaySummary {
    pub events: Vec<LogEntry>,
    pub evicted: u64,
    pub steps: u32,
    pub weights: WeightVector,
    pub mitigation_count: u64,
    pub adjustments: Vec<Adjustment>,
    pub series: BTreeMap<String, Vec<f64>>,
}

/// Push every non-blank line through an in-memory connection and summarize the session.
pub async fn replay(lines: &str, config: &StreamConfig) -> Result<ReplaySummary> {
    let transport = Arc::new(MemoryTransport::new());
    let feed = transport.accept_next();
    let session = LiveSession::new(Arc::clone(&transport) as _, config);
    let mut notifications = session.notifications();

    session.start(&SubscribeParams::new("replay://file"), SubscribeOptions::default())?;
    for line in lines.lines().map(str::trim).filter(|line| !line.is_empty()) {
        feed.send(TransportMessage::new(None, line.to_string()));
    }
    // Closing the feed ends the connection once every line has been pumped.
    drop(feed);

    loop {
        match notifications.recv().await {
            Ok(ClientNotification::Status(status))
                if matches!(
                    status.state,
                    ConnectionState::BackoffWait | ConnectionState::Disconnected
                ) =>
            {
                break;
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return Err(anyhow!("live session closed unexpectedly")),
        }
    }
    session.stop();

    let state = session.snapshot();
    let series = state
        .series_names()
        .filter_map(|name| {
            state
                .series(name)
                .map(|buffer| (name.to_string(), buffer.values()))
        })
        .collect();
    Ok(ReplaySummary {
        events: session.log().snapshot(),
        evicted: session.log().evicted(),
        steps: state.steps(),
        weights: state.weights(),
        mitigation_count: state.mitigation_state().mitigation_count,
        adjustments: state.adjustments().to_vec(),
        series,
    })
}

async fn watch(args: &WatchArgs, config: &StreamConfig) -> Result<()> {
    let mut base = SubscribeParams::new(args.url.clone());
    for (key, value) in &args.params {
        base.set_param(key.clone(), value.clone());
    }

    let session = LiveSession::new(Arc::new(SseTransport::default()), config);
    let mut notifications = session.notifications();
    session.start(&base, SubscribeOptions::default())?;
    let mut seen_mitigations = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; stopping live session");
                break;
            }
            notification = notifications.recv() => match notification {
                Ok(ClientNotification::Status(status)) => {
                    info!(
                        state = status.state.as_str(),
                        attempt = status.attempt,
                        next_retry_ms = ?status.next_retry_ms,
                        "connection status"
                    );
                }
                Ok(ClientNotification::Appended { seq }) => {
                    session.sync();
                    let adjustments = session.adjustments();
                    for adjustment in adjustments.iter().skip(seen_mitigations) {
                        info!(
                            seq,
                            from = %adjustment.from_level,
                            to = %adjustment.to_level,
                            steps = adjustment.steps_after,
                            "mitigation applied"
                        );
                    }
                    seen_mitigations = adjustments.len();
                }
                Ok(ClientNotification::Terminal { attempts, last_error }) => {
                    warn!(attempts, error = %last_error, "live stream gave up");
                    break;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "status notifications lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use clap::error::ErrorKind;
    use openagents_stream::StreamConfig;

    use super::{Commands, StreamHarnessCli, decode, replay};

    #[test]
    fn cli_requires_subcommand() {
        let err = match StreamHarnessCli::try_parse_from(["oa-stream"]) {
            Ok(_) => panic!("expected missing subcommand parse error"),
            Err(err) => err,
        };
        assert_eq!(
            err.kind(),
            ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        );
    }

    #[test]
    fn decode_parses_chunk_size_and_rejects_zero() {
        let cli = StreamHarnessCli::try_parse_from(["oa-stream", "decode", "in.txt", "--chunk-size", "3"])
            .unwrap_or_else(|err| panic!("{err}"));
        match cli.command {
            Commands::Decode(args) => assert_eq!(args.chunk_size, 3),
            other => panic!("unexpected command {other:?}"),
        }

        let err = match StreamHarnessCli::try_parse_from([
            "oa-stream",
            "decode",
            "in.txt",
            "--chunk-size",
            "0",
        ]) {
            Ok(_) => panic!("expected zero chunk size to be rejected"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn watch_collects_repeated_params() {
        let cli = StreamHarnessCli::try_parse_from([
            "oa-stream",
            "watch",
            "http://localhost:8787/live",
            "--param",
            "runId=run-7",
            "--param",
            "filter=a=b",
        ])
        .unwrap_or_else(|err| panic!("{err}"));
        match cli.command {
            Commands::Watch(args) => {
                assert_eq!(args.url, "http://localhost:8787/live");
                assert_eq!(
                    args.params,
                    vec![
                        ("runId".to_string(), "run-7".to_string()),
                        ("filter".to_string(), "a=b".to_string()),
                    ]
                );
            }
            other => panic!("unexpected command {other:?}"),
        }

        assert!(
            StreamHarnessCli::try_parse_from(["oa-stream", "watch", "http://x", "--param", "novalue"])
                .is_err()
        );
    }

    #[tokio::test]
    async fn decode_writes_text_then_envelope_lines() {
        let input = b"Working on it.\n{\"type\":\"diff\",\"diff\":\"@@ -1 +1 @@\"}\nDone";
        let mut out = Vec::new();
        decode(input, 5, &mut out)
            .await
            .unwrap_or_else(|err| panic!("{err}"));

        let text = String::from_utf8(out).unwrap_or_else(|err| panic!("{err}"));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Working on it.");
        assert_eq!(lines[1], "Done");
        let envelope: serde_json::Value =
            serde_json::from_str(lines[2]).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(envelope["kind"], "diff");
        assert_eq!(envelope["receivedAtSeq"], 1);
        assert_eq!(lines.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_summarizes_log_mitigations_and_series() {
        let lines = r#"
{"type":"run:start","runId":"run-1"}
{"type":"stability","runId":"run-1","level":"high"}
{"type":"phi","runId":"run-1","value":0.25}
not json at all
{"type":"stability","runId":"run-1","level":"critical"}
{"type":"run:end","runId":"run-1","status":"completed"}
"#;
        let summary = replay(lines, &StreamConfig::default())
            .await
            .unwrap_or_else(|err| panic!("{err}"));

        assert_eq!(summary.events.len(), 5);
        assert_eq!(summary.mitigation_count, 2);
        assert_eq!(summary.steps, 32);
        assert_eq!(summary.series.get("phi"), Some(&vec![0.25]));
        assert_eq!(summary.adjustments.len(), 2);
        assert!(summary.weights.is_normalized(1e-9));
    }
}
