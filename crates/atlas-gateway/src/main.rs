//! Atlas Command mesh gateway: bridges the radio mesh to the HTTP API.
//!
//! Entrypoint structure grounded on `strata-agent::main`'s
//! `tracing_subscriber` setup and CLI-then-run shape, daemon state threaded
//! through handlers the way `strata-control` threads `AppState`.

mod dispatcher;
mod http_exec;

use std::sync::Arc;
use std::time::{Duration, Instant};

use atlas_common::config::{AtlasConfig, ReliabilityMethod};
use atlas_common::ids::id_prefix;
use atlas_outbox::Outbox;
use atlas_radio::{RadioAdapter, SimBus};
use atlas_transport::reliability::{ReliabilityEngine, ReliabilityStrategy};
use atlas_transport::wire::Chunk;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dispatcher::{build_ack_for, check_dedupe, route_envelope, GatewayAction, GatewayState};
use http_exec::HttpExecutor;

/// `AtlasConfig`'s wire-format-agnostic method name maps onto the
/// transport crate's own strategy enum; kept here rather than in either
/// crate to avoid a dependency edge neither otherwise needs.
fn to_strategy(method: ReliabilityMethod) -> ReliabilityStrategy {
    match method {
        ReliabilityMethod::Simple => ReliabilityStrategy::Simple,
        ReliabilityMethod::Stage => ReliabilityStrategy::Stage,
        ReliabilityMethod::Window => ReliabilityStrategy::Window,
        ReliabilityMethod::WindowFec => ReliabilityStrategy::WindowFec,
    }
}

#[derive(Parser, Debug)]
#[command(name = "atlas-gateway", about = "Atlas Command mesh transport gateway")]
struct Cli {
    /// Path to the TOML config file. Falls back to the standard
    /// resolution chain documented on `AtlasConfig::load` when omitted.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Run against an in-memory simulated radio bus instead of hardware.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Base URL of the Atlas Command HTTP API.
    #[arg(long, default_value = "http://127.0.0.1:8090/api")]
    api_base_url: String,

    /// This node's id on the mesh.
    #[arg(long, default_value = "gateway")]
    node_id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = AtlasConfig::load(cli.config.as_deref())?;

    let api_token = std::env::var("ATLAS_API_TOKEN").ok();
    let http = HttpExecutor::new(cli.api_base_url, api_token);

    let reliability = ReliabilityEngine::new(to_strategy(config.transport.reliability_method))?;
    let mut state = GatewayState::new(reliability, Duration::from_secs(config.dedupe.dedupe_ttl_seconds));

    let mut outbox = Outbox::open(&config.outbox.spool_path, config.outbox.retries)?;

    // Simulation radio is the only backend wired up end-to-end here; the
    // hardware serial adapter is a drop-in swap behind the same trait
    // object (§4.8).
    let bus = SimBus::new(0.0);
    let radio: Arc<dyn RadioAdapter> = Arc::new(bus.register(cli.node_id.clone()));

    info!(node_id = %cli.node_id, simulate = cli.simulate, "atlas-gateway starting");

    let segment_size = config.transport.segment_size;
    let mut flush_tick = tokio::time::interval(Duration::from_secs(5));
    let mut timeout_tick = tokio::time::interval(Duration::from_secs(10));

    loop {
        tokio::select! {
            _ = flush_tick.tick() => {
                flush_outbox(&mut outbox, &mut state, radio.as_ref(), segment_size).await;
            }
            _ = timeout_tick.tick() => {
                check_pending_timeouts(&mut state, radio.as_ref());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested, draining in-flight work");
                break;
            }
            frame = recv_frame(radio.clone()) => {
                match frame {
                    Ok((sender, bytes)) => handle_frame(&mut state, &mut outbox, &http, radio.as_ref(), &sender, bytes, segment_size).await,
                    Err(e) => {
                        warn!(error = %e, "radio receive failed");
                    }
                }
            }
        }
    }

    Ok(())
}

/// Drive each Pending Send's progress-resetting timer (§4.4): past
/// expiry, ask the peer for its missing-chunk bitmap.
fn check_pending_timeouts(state: &mut GatewayState, radio: &dyn RadioAdapter) {
    for (destination, chunk) in state.reliability.check_timeouts(Instant::now()) {
        match chunk.encode() {
            Ok(frame) => {
                if let Err(e) = radio.send(&destination, frame) {
                    warn!(error = %e, "radio send failed");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode bitmap_req chunk"),
        }
    }
}

async fn recv_frame(radio: Arc<dyn RadioAdapter>) -> Result<(String, bytes::Bytes), anyhow::Error> {
    tokio::task::spawn_blocking(move || radio.recv().map_err(anyhow::Error::from))
        .await
        .map_err(anyhow::Error::from)?
}

async fn handle_frame(
    state: &mut GatewayState,
    outbox: &mut Outbox,
    http: &HttpExecutor,
    radio: &dyn RadioAdapter,
    sender: &str,
    bytes: bytes::Bytes,
    segment_size: u16,
) {
    let chunk = match Chunk::decode(bytes) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "dropping invalid frame");
            return;
        }
    };

    if chunk.flags.is_control() {
        // Control chunks bypass the Codec entirely (§4.7).
        handle_control(state, sender, &chunk, radio, segment_size);
        return;
    }

    let now = Instant::now();
    let envelope = match state.on_data_chunk(sender, &chunk, now) {
        Ok(Some(envelope)) => envelope,
        Ok(None) => {
            if let Some(nack) = state.maybe_reactive_nack(sender, &chunk, now) {
                if let Ok(frame) = nack.encode() {
                    let _ = radio.send(sender, frame);
                }
            }
            return;
        }
        Err(e) => {
            warn!(error = %e, "dropping chunk during reassembly");
            return;
        }
    };

    if let Some(ack) = build_ack_for(&envelope) {
        send_envelope(state, radio, &ack, sender, segment_size);
    }

    match route_envelope(envelope) {
        GatewayAction::AckReceived { correlation_id } => {
            let _ = outbox.on_ack(&correlation_id);
            state.on_ack(&correlation_id);
        }
        GatewayAction::ExecuteRequest(request) => {
            let fingerprint = request.semantic_fingerprint();
            match check_dedupe(&state.dedupe, &request) {
                atlas_dedupe::DedupeOutcome::Cached(response) => {
                    send_envelope(state, radio, &response, sender, segment_size);
                }
                atlas_dedupe::DedupeOutcome::Leased => {
                    let response = http.execute(&request).await;
                    state
                        .dedupe
                        .complete(&request.id, Some(&fingerprint), response.clone());
                    // Persist the response before its first send (§2 "every
                    // envelope submitted is persisted before first send"),
                    // same durability guarantee as the client's requests.
                    if let Err(e) = outbox.submit(response.clone(), sender.to_string()) {
                        warn!(error = %e, "failed to spool response");
                    }
                    send_envelope(state, radio, &response, sender, segment_size);
                }
                atlas_dedupe::DedupeOutcome::InFlight => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    if let atlas_dedupe::DedupeOutcome::Cached(response) =
                        check_dedupe(&state.dedupe, &request)
                    {
                        send_envelope(state, radio, &response, sender, segment_size);
                    }
                }
            }
        }
        GatewayAction::Unexpected(envelope) => dispatcher::log_unexpected(&envelope),
    }
}

fn handle_control(state: &mut GatewayState, sender: &str, chunk: &Chunk, radio: &dyn RadioAdapter, segment_size: u16) {
    use dispatcher::ControlAction;

    // Control chunk id_prefix ties it back to the originating message;
    // we don't have the full envelope id string here, only its 8-byte
    // prefix, so this demo wiring keys pending-sends by prefix match.
    match dispatcher::parse_control_chunk(chunk, chunk.total) {
        ControlAction::AllReceived { envelope_id } => {
            state.reliability.process_all_received(&envelope_id);
        }
        ControlAction::BitmapRequested { envelope_id } => {
            let now = Instant::now();
            if let Some(answer) = state.answer_bitmap_request(sender, chunk.id_prefix, &envelope_id, now) {
                if let Ok(frame) = answer.encode() {
                    let _ = radio.send(sender, frame);
                }
            }
        }
        ControlAction::Nack { missing, .. } => {
            let Some(envelope_id) = state.reliability.envelope_id_for_prefix(chunk.id_prefix).map(str::to_string) else {
                return;
            };
            state.reliability.note_progress(&envelope_id, Instant::now());
            let resend = state.reliability.process_nack(&envelope_id, &missing, 3);
            for c in resend {
                if let Ok(frame) = c.encode() {
                    let _ = radio.send(sender, frame);
                }
            }
        }
        ControlAction::Unrecognized => {
            let _ = segment_size;
        }
    }
}

fn send_envelope(
    state: &mut GatewayState,
    radio: &dyn RadioAdapter,
    envelope: &atlas_common::Envelope,
    destination: &str,
    segment_size: u16,
) {
    let prefix = id_prefix(&envelope.id);
    match state.prepare_send(envelope, prefix, destination, segment_size, Instant::now()) {
        Ok(chunks) => {
            for chunk in chunks {
                match chunk.encode() {
                    Ok(frame) => {
                        if let Err(e) = radio.send(destination, frame) {
                            warn!(error = %e, "radio send failed");
                        }
                    }
                    Err(e) => error!(error = %e, "failed to encode chunk"),
                }
            }
        }
        Err(e) => warn!(error = %e, "failed to prepare envelope for send"),
    }
}

async fn flush_outbox(outbox: &mut Outbox, state: &mut GatewayState, radio: &dyn RadioAdapter, segment_size: u16) {
    let now = chrono::Utc::now();
    for record in outbox.due_records(now) {
        send_envelope(state, radio, &record.envelope, &record.destination, segment_size);
        if let Ok(Some(failed)) = outbox.mark_attempted(&record.envelope.id, now) {
            warn!(envelope_id = %failed.envelope_id, attempts = failed.attempts, "delivery failed, retries exhausted");
        }
    }
}
