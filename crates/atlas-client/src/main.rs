//! Atlas Command mesh client: sends one request and waits for its answer.
//!
//! Entrypoint shape grounded on `strata-agent::main`'s
//! `tracing_subscriber` setup and CLI-then-run structure; the
//! radio-recv/outbox-flush/response-wait multiplexing loop mirrors
//! `strata-agent::control::run`'s `tokio::select!` shape, reused here
//! (see `atlas-gateway::main`) with a third arm for the response wait.

mod cli;
mod dispatcher;

use std::sync::Arc;
use std::time::{Duration, Instant};

use atlas_common::config::{AtlasConfig, ReliabilityMethod};
use atlas_common::envelope::Envelope;
use atlas_common::ids::id_prefix;
use atlas_outbox::Outbox;
use atlas_radio::{RadioAdapter, SerialRadioAdapter, SimBus};
use atlas_transport::reliability::{ReliabilityEngine, ReliabilityStrategy};
use atlas_transport::wire::Chunk;
use clap::Parser;
use cli::{Cli, Command};
use dispatcher::{build_ack_for, route_envelope, ClientAction, ClientState};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn to_strategy(method: ReliabilityMethod) -> ReliabilityStrategy {
    match method {
        ReliabilityMethod::Simple => ReliabilityStrategy::Simple,
        ReliabilityMethod::Stage => ReliabilityStrategy::Stage,
        ReliabilityMethod::Window => ReliabilityStrategy::Window,
        ReliabilityMethod::WindowFec => ReliabilityStrategy::WindowFec,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = AtlasConfig::load(cli.config.as_deref())?;

    let radio: Arc<dyn RadioAdapter> = if cli.simulate {
        // A standalone process can't share memory with another process's
        // `SimBus`; this path only pairs usefully with an embedding test
        // harness that registers both roles against one bus. Real
        // deployments always go through the serial adapter below.
        let bus = SimBus::new(0.0);
        Arc::new(bus.register(cli.node_id.clone()))
    } else {
        let port_name = cli
            .radio_port
            .clone()
            .or_else(|| config.radio.radio_port.clone())
            .ok_or_else(|| anyhow::anyhow!("no --radio-port given and none set in config"))?;
        Arc::new(SerialRadioAdapter::open(cli.node_id.clone(), &port_name, 115_200)?)
    };

    let reliability = ReliabilityEngine::new(to_strategy(config.transport.reliability_method))?;
    let mut state = ClientState::new(reliability);
    let mut outbox = Outbox::open(&config.outbox.spool_path, config.outbox.retries)?;

    let segment_size = config.transport.segment_size;
    let response_timeout = Duration::from_secs(config.transport.post_response_timeout_secs);

    let Command::Send { command, data } = cli.command;
    let payload: serde_json::Value = serde_json::from_str(&data)
        .map_err(|e| anyhow::anyhow!("request data must be valid JSON: {e}"))?;
    let request = Envelope::request(command, payload);

    info!(request_id = %request.id, gateway = %cli.gateway_node_id, "sending request");
    outbox.submit(request.clone(), cli.gateway_node_id.clone())?;
    let rx = state.await_response(&request.id);
    send_envelope(&mut state, radio.as_ref(), &request, &cli.gateway_node_id, segment_size);

    let mut flush_tick = tokio::time::interval(Duration::from_secs(5));
    let mut timeout_tick = tokio::time::interval(Duration::from_secs(10));
    tokio::pin!(rx);
    let deadline = tokio::time::sleep(response_timeout);
    tokio::pin!(deadline);

    let outcome = loop {
        tokio::select! {
            resp = &mut rx => {
                break resp.ok();
            }
            _ = &mut deadline => {
                state.cancel_wait(&request.id);
                warn!(request_id = %request.id, "timed out waiting for a response");
                break None;
            }
            _ = flush_tick.tick() => {
                let now = chrono::Utc::now();
                for record in outbox.due_records(now) {
                    send_envelope(&mut state, radio.as_ref(), &record.envelope, &record.destination, segment_size);
                    let _ = outbox.mark_attempted(&record.envelope.id, now);
                }
            }
            _ = timeout_tick.tick() => {
                check_pending_timeouts(&mut state, radio.as_ref());
            }
            frame = recv_frame(radio.clone()) => {
                match frame {
                    Ok((sender, bytes)) => handle_frame(&mut state, &mut outbox, radio.as_ref(), &sender, bytes, segment_size),
                    Err(e) => warn!(error = %e, "radio receive failed"),
                }
            }
        }
    };

    match outcome {
        Some(envelope) => {
            println!("{}", serde_json::to_string_pretty(&envelope.data)?);
            Ok(())
        }
        None => anyhow::bail!("request {} timed out with no response", request.id),
    }
}

async fn recv_frame(radio: Arc<dyn RadioAdapter>) -> Result<(String, bytes::Bytes), anyhow::Error> {
    tokio::task::spawn_blocking(move || radio.recv().map_err(anyhow::Error::from))
        .await
        .map_err(anyhow::Error::from)?
}

/// Drive the Pending Send's progress-resetting timer (§4.4): past expiry,
/// ask the gateway for its missing-chunk bitmap.
fn check_pending_timeouts(state: &mut ClientState, radio: &dyn RadioAdapter) {
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

fn handle_frame(
    state: &mut ClientState,
    outbox: &mut Outbox,
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
        handle_control(state, sender, &chunk, radio);
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
        ClientAction::AckReceived { correlation_id } => {
            let _ = outbox.on_ack(&correlation_id);
            state.on_ack(&correlation_id);
        }
        ClientAction::Delivered(envelope) => state.deliver(envelope),
        ClientAction::Unexpected(envelope) => {
            warn!(id = %envelope.id, ty = ?envelope.ty, "client received an envelope type it doesn't expect");
        }
    }
}

fn handle_control(state: &mut ClientState, sender: &str, chunk: &Chunk, radio: &dyn RadioAdapter) {
    use dispatcher::ControlAction;

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
        ControlAction::Unrecognized => {}
    }
}

fn send_envelope(
    state: &mut ClientState,
    radio: &dyn RadioAdapter,
    envelope: &Envelope,
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
                    Err(e) => warn!(error = %e, "failed to encode chunk"),
                }
            }
        }
        Err(e) => warn!(error = %e, "failed to prepare envelope for send"),
    }
}
