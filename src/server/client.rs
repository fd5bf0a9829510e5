//! Client app connection handler.
//!
//! Same loop shape as the Base handler, over newline-delimited JSON.
//! Keep-alive probes run from login until the socket closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::watch;
use tokio::time;
use tracing::{Instrument, Span, debug, field, info, info_span, trace, warn};

use super::directory::{Command, CommandSender, Outgoing, command_channel};
use super::router::split_client_entry;
use super::session::{Context, Flow, Inbound, Session};
use super::{backoff_sleep, ticker, write_within};
use crate::auth::{ClientAuthenticator, ClientLogin};
use crate::core::{ClientId, CodecError, DEFAULT_COMMAND_BUFFER, GatewayError};
use crate::sync::{ClientCommand, client_keepalive_probe, unix_now};
use crate::transport::{ClientMessage, split_line};

/// Serve one Client socket until it closes.
pub async fn serve_client(
    stream: TcpStream,
    remote: SocketAddr,
    ctx: Arc<Context>,
    shutdown: watch::Receiver<bool>,
) {
    let span = info_span!("client", %remote, peer = field::Empty);
    async move {
        debug!("connected");
        match run(stream, remote, ctx, shutdown).await {
            Ok(()) => info!("disconnected"),
            Err(err) => info!(%err, "disconnected"),
        }
    }
    .instrument(span)
    .await
}

async fn run(
    stream: TcpStream,
    remote: SocketAddr,
    ctx: Arc<Context>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), GatewayError> {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%err, "could not disable nagle");
    }
    let (mut reader, writer) = stream.into_split();
    let (tx, mut commands) = command_channel(DEFAULT_COMMAND_BUFFER);

    let auth_deadline = time::sleep(ctx.config.auth_timeout());
    tokio::pin!(auth_deadline);
    let mut sender_tick = ticker(ctx.config.sender_interval());
    let mut keepalive_tick = ticker(ctx.config.keepalive());

    let mut conn = ClientConnection::new(ctx, remote, writer, tx);
    let mut buffer = BytesMut::with_capacity(4096);

    let result = loop {
        let authenticated = conn.session.is_some();
        let keepalive = conn.session.as_ref().is_some_and(Session::keepalive);
        let backoff = conn.session.as_ref().and_then(Session::backoff_deadline);

        let step = tokio::select! {
            read = reader.read_buf(&mut buffer) => match read {
                Ok(0) => break Ok(()),
                Ok(_) => conn.on_readable(&mut buffer).await,
                Err(err) => break Err(GatewayError::Io(err)),
            },
            _ = sender_tick.tick(), if authenticated => conn.deliver().await,
            _ = backoff_sleep(backoff), if backoff.is_some() => conn.on_backoff_expired().await,
            _ = &mut auth_deadline, if !authenticated => {
                warn!("authentication timed out");
                break Ok(());
            }
            _ = keepalive_tick.tick(), if keepalive => conn.send(&client_keepalive_probe()).await,
            Some(command) = commands.recv() => conn.on_command(command).await,
            _ = shutdown.changed() => break Ok(()),
        };

        match step {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close) => break Ok(()),
            Err(err) => break Err(err),
        }
    };

    conn.close();
    result
}

struct ClientConnection {
    ctx: Arc<Context>,
    connection: u64,
    writer: OwnedWriteHalf,
    write_timeout: Duration,
    auth: ClientAuthenticator,
    session: Option<Session>,
    timezone_offset_minutes: i16,
    commands: CommandSender,
}

impl ClientConnection {
    fn new(
        ctx: Arc<Context>,
        remote: SocketAddr,
        writer: OwnedWriteHalf,
        commands: CommandSender,
    ) -> Self {
        let connection = ctx.router.directory().next_connection_id();
        let auth = ClientAuthenticator::new(remote.ip(), ctx.config.auth_policy());
        let write_timeout = ctx.config.write_timeout();
        Self {
            ctx,
            connection,
            writer,
            write_timeout,
            auth,
            session: None,
            timezone_offset_minutes: 0,
            commands,
        }
    }

    fn identity(&self) -> Option<ClientId> {
        self.session.as_ref().and_then(|s| s.peer().as_client())
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<Flow, GatewayError> {
        let line = message.to_line()?;
        self.write(&line).await?;
        Ok(Flow::Continue)
    }

    async fn write(&mut self, line: &str) -> Result<(), GatewayError> {
        write_within(&mut self.writer, line.as_bytes(), self.write_timeout).await
    }

    async fn on_readable(&mut self, buffer: &mut BytesMut) -> Result<Flow, GatewayError> {
        loop {
            let line = match split_line(buffer, self.ctx.config.max_line_bytes) {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(Flow::Continue),
                Err(CodecError::TooLarge(len)) => return Err(GatewayError::Oversized(len)),
                Err(err) => return Err(err.into()),
            };
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let message = match ClientMessage::parse(&line) {
                Ok(message) => message,
                Err(err) => {
                    warn!(%err, "malformed line");
                    continue;
                }
            };
            trace!(header = %message.flags(), sequence = message.tx_sender, "line");

            let flow = if self.session.is_some() {
                self.on_message(message).await?
            } else {
                self.on_login(message).await?
            };
            if flow == Flow::Close {
                return Ok(Flow::Close);
            }
        }
    }

    async fn on_login(&mut self, message: ClientMessage) -> Result<Flow, GatewayError> {
        match self.auth.handle(&message, self.ctx.store.as_ref()) {
            Ok(login) => self.establish(login).await,
            Err(err) => {
                warn!(%err, "login rejected");
                match ClientAuthenticator::rejection(&err) {
                    Some(reply) => self.send(&reply).await,
                    None => Ok(Flow::Continue),
                }
            }
        }
    }

    async fn establish(&mut self, login: ClientLogin) -> Result<Flow, GatewayError> {
        let ClientLogin {
            grant,
            session: start,
            baseline,
            reply,
        } = login;
        let Some(client) = grant.peer.as_client() else {
            warn!(peer = %grant.peer, "store granted a non-client identity");
            return Ok(Flow::Close);
        };
        Span::current().record("peer", field::display(&grant.peer));
        self.send(&reply).await?;

        let displaced = self.ctx.router.directory().register(
            grant.peer,
            self.connection,
            self.commands.clone(),
        );
        info!(
            baseline,
            force_resync = start.force_resync,
            displaced,
            "authenticated"
        );

        let mut session = Session::new(
            grant.peer,
            self.connection,
            self.ctx.config.delivery(),
            baseline,
            self.ctx.store.clone(),
        );
        session.set_keepalive(true);
        session.save_receive_sequence();
        self.session = Some(session);
        self.timezone_offset_minutes = grant.timezone_offset_minutes;

        match self.ctx.router.base_statuses(client) {
            Ok(statuses) => {
                for status in &statuses {
                    self.send(status).await?;
                }
            }
            Err(err) => warn!(%err, "could not load base presence"),
        }
        self.deliver().await
    }

    async fn on_message(&mut self, message: ClientMessage) -> Result<Flow, GatewayError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(Flow::Continue);
        };
        let header = message.flags();

        let flow = match session.inbound(header, message.tx_sender) {
            Inbound::Ack(flow) => flow,
            Inbound::Notification => {
                self.process(&message).await?;
                Flow::Continue
            }
            Inbound::Sequenced { ack, deliver, flow } => {
                self.send(&ClientMessage::ack(ack, message.tx_sender))
                    .await?;
                if deliver {
                    self.process(&message).await?;
                }
                flow
            }
        };

        if header.is_save_peer_sequence() {
            if let Some(session) = &self.session {
                session.save_receive_sequence();
            }
        }
        Ok(flow)
    }

    async fn process(&mut self, message: &ClientMessage) -> Result<(), GatewayError> {
        if message.flags().is_system() {
            return self.on_system(&message.data).await;
        }
        let Some(client) = self.identity() else {
            return Ok(());
        };
        let Some(payload) = message.hex_payload() else {
            warn!(sequence = message.tx_sender, "dropping non-hex payload");
            return Ok(());
        };
        if let Err(err) =
            self.ctx
                .router
                .relay_from_client(client, message.flags(), &message.baseid, &payload)
        {
            warn!(%err, "relay failed");
        }
        Ok(())
    }

    async fn on_system(&mut self, data: &Value) -> Result<(), GatewayError> {
        match ClientCommand::parse(data) {
            ClientCommand::PullUnacked => {
                if let Some(session) = self.session.as_mut() {
                    session.resend_unacked();
                }
            }
            ClientCommand::Timestamp => {
                let reply = ClientMessage::timestamp(unix_now(), self.timezone_offset_minutes);
                self.send(&reply).await?;
            }
            ClientCommand::Unknown(kind) => warn!(kind = %kind, "unknown system message"),
        }
        Ok(())
    }

    /// Write queued entries until the run ends.
    async fn deliver(&mut self) -> Result<Flow, GatewayError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(Flow::Continue);
        };
        let now = Instant::now();
        if !session.wants_send_at(now) {
            return Ok(Flow::Continue);
        }

        session.begin_tick();
        while let Some(entry) = session.next_outbound(now) {
            let Some((origin, payload)) = split_client_entry(&entry.payload) else {
                warn!(sequence = entry.sequence, "discarding malformed queue entry");
                session.discard(entry.sequence);
                continue;
            };
            let line = ClientMessage::from_base(entry.sequence, origin, payload).to_line()?;
            write_within(&mut self.writer, line.as_bytes(), self.write_timeout).await?;
            session.mark_sent(entry.sequence);
        }
        Ok(Flow::Continue)
    }

    async fn on_backoff_expired(&mut self) -> Result<Flow, GatewayError> {
        if let Some(session) = self.session.as_mut() {
            session.on_backoff_expired();
        }
        self.deliver().await
    }

    async fn on_command(&mut self, command: Command) -> Result<Flow, GatewayError> {
        match command {
            Command::Wake => {
                if let Some(session) = self.session.as_mut() {
                    session.wake();
                }
                self.deliver().await
            }
            Command::Deliver(Outgoing::Line(line)) => self.send(&line).await,
            Command::Deliver(Outgoing::Frame(_)) => {
                debug!("ignoring base frame routed to a client");
                Ok(Flow::Continue)
            }
            Command::Evict => Err(GatewayError::Displaced),
        }
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            self.ctx
                .router
                .directory()
                .remove(&session.peer(), self.connection);
        }
    }
}
