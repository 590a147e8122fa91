//! One actor per connected terminal.
//!
//! The actor answers `reg` and `sendlog` in-line, forwards terminal replies to
//! the inbound relay channel, and after every frame or idle tick hands at most
//! one queued outbound command to the terminal. Queue and sink futures run
//! through `ctx.wait`, so frames of one connection are handled strictly in
//! arrival order.

use actix::prelude::*;
use actix_http::ws::Item;
use actix_web_actors::ws::{self, CloseCode, CloseReason, Message};
use bytes::BytesMut;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::settings::SessionConfig;
use crate::error::AppError;
use crate::models::terminal::{self, CMD_REBOOT};
use crate::models::{Envelope, EnvelopeKind, TerminalRequest};
use crate::services::log_sink::{LogSink, RecordKind, SinkRecord};
use crate::services::relay_queue::{Direction, RelayQueue};
use crate::services::session_registry::{ClaimOutcome, CloseConnection, SessionRegistry};
use crate::services::trace_logger::TraceLogger;

/// Largest inbound message, whole or reassembled from fragments; fits a full `sendlog` batch
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Everything a session needs from the process, shared by all connections
#[derive(Clone)]
pub struct SessionServices {
    pub queue: RelayQueue,
    pub log_sink: Arc<dyn LogSink>,
    pub trace: Arc<TraceLogger>,
    pub registry: SessionRegistry,
    pub config: SessionConfig,
    /// When false, replies are not forwarded and outbound commands are not drained
    pub relay_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    IdleTimeout,
}

/// Counts consecutive ticks that saw no inbound frame.
///
/// With tick period T and limit N a silent connection is closed on the N-th
/// quiet tick, i.e. between N*T and (N+1)*T after its last frame.
#[derive(Debug, Clone)]
pub struct IdleTracker {
    max_cycles: u32,
    cycles: u32,
    active_since_tick: bool,
}

impl IdleTracker {
    pub fn new(max_cycles: u32) -> Self {
        Self {
            max_cycles,
            cycles: 0,
            active_since_tick: false,
        }
    }

    pub fn record_activity(&mut self) {
        self.cycles = 0;
        self.active_since_tick = true;
    }

    pub fn tick(&mut self) -> TickOutcome {
        if self.active_since_tick {
            self.active_since_tick = false;
            return TickOutcome::Continue;
        }

        self.cycles = self.cycles.saturating_add(1);
        if self.max_cycles > 0 && self.cycles >= self.max_cycles {
            TickOutcome::IdleTimeout
        } else {
            TickOutcome::Continue
        }
    }

    pub fn cycles(&self) -> u32 {
        self.cycles
    }
}

pub struct TerminalSession {
    pub connection_id: Uuid,
    /// Learned from the first inbound message carrying `sn`
    pub device_sn: Option<String>,
    idle: IdleTracker,
    /// Open fragmented message, if any
    fragments: Option<BytesMut>,
    services: SessionServices,
}

impl TerminalSession {
    fn start_idle_ticks(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.services.config.new_message_timeout, |act, ctx| {
            if act.idle.tick() == TickOutcome::IdleTimeout {
                info!(
                    connection_id = %act.connection_id,
                    device_sn = ?act.device_sn,
                    idle_cycles = act.idle.cycles(),
                    "Terminal idle limit reached, closing session"
                );
                act.services.trace.server(&format!(
                    "Idle timeout for {}.",
                    act.device_sn.as_deref().unwrap_or("unknown device")
                ));
                ctx.close(Some(CloseReason {
                    code: CloseCode::Normal,
                    description: Some("idle timeout".into()),
                }));
                ctx.stop();
                return;
            }

            act.drain_outbound(ctx);
        });
    }

    /// Closes the connection after a fault local to this session.
    fn terminate(&mut self, code: CloseCode, error: AppError, ctx: &mut ws::WebsocketContext<Self>) {
        warn!(
            connection_id = %self.connection_id,
            device_sn = ?self.device_sn,
            error = %error,
            "Terminating terminal session"
        );
        self.services.trace.server(&format!("Error: {}.", error));
        ctx.close(Some(CloseReason {
            code,
            description: Some(error.to_string()),
        }));
        ctx.stop();
    }

    /// Returns false when the session must not go on with this identity.
    fn learn_identity(&mut self, envelope: &Envelope, ctx: &mut ws::WebsocketContext<Self>) -> bool {
        if self.device_sn.is_some() {
            return true;
        }
        let Some(sn) = envelope.device_sn() else {
            return true;
        };

        let outcome = self.services.registry.claim(
            sn,
            self.connection_id,
            ctx.address().recipient(),
            self.services.config.duplicate_policy,
        );
        if let ClaimOutcome::Rejected { holder } = outcome {
            info!(
                connection_id = %self.connection_id,
                device_sn = %sn,
                holder = %holder,
                "Closing duplicate terminal connection"
            );
            ctx.close(Some(CloseReason {
                code: CloseCode::Policy,
                description: Some("device already connected".into()),
            }));
            ctx.stop();
            return false;
        }

        debug!(connection_id = %self.connection_id, device_sn = %sn, "Device identity learned");
        self.device_sn = Some(sn.to_string());
        true
    }

    /// Binary frames and reassembled messages carry the same JSON text.
    fn handle_bytes(&mut self, bytes: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        match std::str::from_utf8(bytes) {
            Ok(text) => self.handle_text(text, ctx),
            Err(_) => self.terminate(
                CloseCode::Invalid,
                AppError::MalformedMessage("message is not UTF-8".to_string()),
                ctx,
            ),
        }
    }

    fn handle_fragment(&mut self, item: Item, ctx: &mut ws::WebsocketContext<Self>) {
        match item {
            Item::FirstText(data) | Item::FirstBinary(data) => {
                if self.fragments.is_some() {
                    self.fragments = None;
                    self.terminate(
                        CloseCode::Protocol,
                        AppError::MalformedMessage("new message started inside a fragmented one".to_string()),
                        ctx,
                    );
                    return;
                }
                self.fragments = Some(BytesMut::with_capacity(data.len()));
                self.append_fragment(&data, ctx);
            }
            Item::Continue(data) => {
                self.append_fragment(&data, ctx);
            }
            Item::Last(data) => {
                if !self.append_fragment(&data, ctx) {
                    return;
                }
                if let Some(message) = self.fragments.take() {
                    self.handle_bytes(&message, ctx);
                }
            }
        }
    }

    /// Returns false once the session has been terminated.
    fn append_fragment(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) -> bool {
        let Some(buffer) = self.fragments.as_mut() else {
            self.terminate(
                CloseCode::Protocol,
                AppError::MalformedMessage("continuation frame without a first fragment".to_string()),
                ctx,
            );
            return false;
        };

        if buffer.len() + data.len() > MAX_MESSAGE_SIZE {
            self.fragments = None;
            self.terminate(
                CloseCode::Size,
                AppError::MalformedMessage(format!(
                    "fragmented message exceeds {} bytes",
                    MAX_MESSAGE_SIZE
                )),
                ctx,
            );
            return false;
        }

        buffer.extend_from_slice(data);
        true
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.terminate(CloseCode::Invalid, e, ctx);
                return;
            }
        };

        debug!(
            connection_id = %self.connection_id,
            device_sn = ?self.device_sn,
            kind = %envelope.kind(),
            "Received terminal message"
        );

        if !self.learn_identity(&envelope, ctx) {
            return;
        }
        if let Some(sn) = &self.device_sn {
            self.services.registry.touch(sn, self.connection_id);
        }
        self.services.trace.dump_message(&envelope);

        if matches!(envelope.kind(), EnvelopeKind::Command(_)) {
            if !self.answer_request(&envelope, ctx) {
                return;
            }
        } else {
            self.forward_reply(envelope, ctx);
        }

        self.drain_outbound(ctx);
    }

    /// Sends the in-line reply, then hands the records to the log sink.
    fn answer_request(&mut self, envelope: &Envelope, ctx: &mut ws::WebsocketContext<Self>) -> bool {
        let request = match TerminalRequest::from_envelope(envelope) {
            Ok(request) => request,
            Err(e) => {
                self.terminate(CloseCode::Invalid, e, ctx);
                return false;
            }
        };

        match request {
            TerminalRequest::Register(reg) => {
                let devinfo = &reg.devinfo;
                self.services.trace.client(&format!(
                    "Register request received by {}. Device info: modelname={}, netinuse={}, fpalgo={}, firmware={}, time={}, mac={}.",
                    reg.sn,
                    devinfo.modelname.as_deref().unwrap_or("-"),
                    devinfo.netinuse.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string()),
                    devinfo.fpalgo.as_deref().unwrap_or("-"),
                    devinfo.firmware.as_deref().unwrap_or("-"),
                    devinfo.time.as_deref().unwrap_or("-"),
                    devinfo.mac.as_deref().unwrap_or("-"),
                ));

                let cloudtime = terminal::cloud_time_now();
                ctx.text(terminal::register_success(&cloudtime).to_json_string());
                self.services.trace.server(&format!("Register success on {}.", cloudtime));

                self.persist(&reg.sn, RecordKind::Reg, vec![SinkRecord::Registration(reg.devinfo.clone())]);
            }
            TerminalRequest::SendLog(upload) => match upload.announced_records() {
                Some(records) => {
                    for record in records {
                        self.services.trace.client(&format!(
                            "Record from {}: enrollid={}, aliasid={}, name={}, time={}, mode={}, inout={}, event={}.",
                            upload.sn,
                            record.enrollid,
                            record.aliasid.as_deref().unwrap_or("-"),
                            record.name,
                            record.time,
                            record.mode,
                            record.inout,
                            record.event,
                        ));
                    }

                    let reply = terminal::sendlog_success(upload.count, upload.logindex, &terminal::cloud_time_now());
                    ctx.text(reply.to_json_string());

                    let batch = records.iter().cloned().map(SinkRecord::Access).collect();
                    self.persist(&upload.sn, RecordKind::Sendlog, batch);
                }
                None => {
                    warn!(
                        connection_id = %self.connection_id,
                        device_sn = %upload.sn,
                        count = upload.count,
                        carried = upload.record.len(),
                        "sendlog announced more records than it carried"
                    );
                    ctx.text(terminal::sendlog_failure().to_json_string());
                }
            },
            TerminalRequest::Unsupported(cmd) => {
                self.terminate(
                    CloseCode::Unsupported,
                    AppError::MalformedMessage(format!("Undefined message received: cmd {}", cmd)),
                    ctx,
                );
                return false;
            }
        }

        true
    }

    /// Runs after the reply frame is queued; failures never reach the terminal.
    fn persist(&self, device_sn: &str, kind: RecordKind, records: Vec<SinkRecord>) {
        let sink = self.services.log_sink.clone();
        let device_sn = device_sn.to_string();
        let connection_id = self.connection_id;

        actix::spawn(async move {
            if let Err(e) = sink.append_records(&device_sn, kind, records).await {
                warn!(
                    connection_id = %connection_id,
                    device_sn = %device_sn,
                    kind = %kind,
                    error = %e,
                    "Log sink rejected terminal records"
                );
            }
        });
    }

    fn forward_reply(&mut self, envelope: Envelope, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(sn) = self.device_sn.clone() else {
            debug!(
                connection_id = %self.connection_id,
                kind = %envelope.kind(),
                "Reply from unidentified terminal dropped"
            );
            return;
        };
        if !self.services.relay_enabled {
            return;
        }

        let queue = self.services.queue.clone();
        let ret = envelope.kind().name().to_string();
        ctx.wait(
            async move { queue.enqueue(&sn, Direction::Inbound, &envelope).await.map(|_| sn) }
                .into_actor(self)
                .map(move |result, act, _ctx| match result {
                    Ok(sn) => {
                        act.services
                            .trace
                            .server(&format!("Incoming message ({}) received from {}.", ret, sn));
                    }
                    Err(e) => {
                        warn!(
                            connection_id = %act.connection_id,
                            device_sn = ?act.device_sn,
                            error = %e,
                            "Relay queue unavailable, terminal reply not forwarded"
                        );
                    }
                }),
        );
    }

    /// Sends at most one queued outbound command; a reboot ends the session.
    fn drain_outbound(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if !self.services.relay_enabled {
            return;
        }
        let Some(sn) = self.device_sn.clone() else {
            return;
        };

        let queue = self.services.queue.clone();
        ctx.wait(
            async move { queue.dequeue(&sn, Direction::Outbound).await }
                .into_actor(self)
                .map(|result, act, ctx| {
                    let sn = act.device_sn.clone().unwrap_or_default();
                    match result {
                        Ok(Some(outgoing)) => {
                            ctx.text(outgoing.to_json_string());
                            act.services.trace.server(&format!("Outgoing message sent to {}.", sn));
                            info!(
                                connection_id = %act.connection_id,
                                device_sn = %sn,
                                kind = %outgoing.kind(),
                                "Relayed outbound command to terminal"
                            );

                            if outgoing.is_command(CMD_REBOOT) {
                                act.services.trace.server(&format!("Rebooting {}, closing session.", sn));
                                ctx.close(Some(CloseReason {
                                    code: CloseCode::Normal,
                                    description: Some("reboot".into()),
                                }));
                                ctx.stop();
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(
                                connection_id = %act.connection_id,
                                device_sn = %sn,
                                error = %e,
                                "Relay queue unavailable, outbound drain skipped"
                            );
                        }
                    }
                }),
        );
    }
}

impl Actor for TerminalSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "Terminal connection opened");
        self.start_idle_ticks(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(
            connection_id = %self.connection_id,
            device_sn = ?self.device_sn,
            "Terminal connection closed"
        );
        if let Some(sn) = &self.device_sn {
            self.services.registry.release(sn, self.connection_id);
        }
    }
}

impl Handler<CloseConnection> for TerminalSession {
    type Result = ();

    fn handle(&mut self, msg: CloseConnection, ctx: &mut Self::Context) {
        info!(
            connection_id = %self.connection_id,
            device_sn = ?self.device_sn,
            reason = %msg.reason,
            "Closing terminal connection on request"
        );
        ctx.close(Some(CloseReason {
            code: CloseCode::Policy,
            description: Some(msg.reason),
        }));
        ctx.stop();
    }
}

impl StreamHandler<Result<Message, ws::ProtocolError>> for TerminalSession {
    fn handle(&mut self, msg: Result<Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(Message::Ping(payload)) => {
                self.idle.record_activity();
                ctx.pong(&payload);
            }
            Ok(Message::Pong(_)) => {
                self.idle.record_activity();
            }
            Ok(Message::Text(text)) => {
                self.idle.record_activity();
                self.handle_text(&text, ctx);
            }
            Ok(Message::Binary(bin)) => {
                self.idle.record_activity();
                self.handle_bytes(&bin, ctx);
            }
            Ok(Message::Continuation(item)) => {
                self.idle.record_activity();
                self.handle_fragment(item, ctx);
            }
            Ok(Message::Close(reason)) => {
                info!(
                    connection_id = %self.connection_id,
                    device_sn = ?self.device_sn,
                    reason = ?reason,
                    "Terminal sent close frame"
                );
                ctx.close(reason);
                ctx.stop();
            }
            Ok(Message::Nop) => {}
            Err(e) => {
                error!(
                    connection_id = %self.connection_id,
                    device_sn = ?self.device_sn,
                    error = %e,
                    "Terminal WebSocket protocol error"
                );
                self.services
                    .trace
                    .server(&format!("Error: {}.", AppError::ChannelClosed(e.to_string())));
                ctx.stop();
            }
        }
    }
}

/// Create a session actor for a freshly accepted connection
pub fn create_terminal_session(services: &SessionServices) -> TerminalSession {
    TerminalSession {
        connection_id: Uuid::new_v4(),
        device_sn: None,
        idle: IdleTracker::new(services.config.max_idle_cycles),
        fragments: None,
        services: services.clone(),
    }
}
