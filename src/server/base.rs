//! Base device connection handler.
//!
//! One task per socket. Every inbound frame is encrypted: under the zero
//! key until the identity is accepted, under the device key afterwards.
//! Socket reads, the delivery tick, the backoff timer, keep-alive probes and
//! directory commands are multiplexed in a single `select!` loop, so session
//! state has exactly one writer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::watch;
use tokio::time;
use tracing::{Instrument, Span, debug, field, info, info_span, trace, warn};

use super::config::IvMode;
use super::directory::{Command, CommandSender, Outgoing, command_channel};
use super::session::{Context, Flow, Inbound, Session};
use super::{backoff_sleep, ticker, write_within};
use crate::auth::{BaseAuthenticator, BaseStep};
use crate::core::{
    AuthError, AuthGrant, BLOCK_SIZE, BaseId, CodecError, DEFAULT_COMMAND_BUFFER, GatewayError,
    SessionStart,
};
use crate::crypto::{BlockCipher, DeviceKey};
use crate::sync::{SystemCommand, keepalive_probe, timestamp_reply, unix_now, variable_reply};
use crate::transport::{
    Header, IvSource, Message, build_encrypted, chain_block, split_frame, unpack_encrypted,
};

/// Serve one Base socket until it closes.
pub async fn serve_base(
    stream: TcpStream,
    remote: SocketAddr,
    ctx: Arc<Context>,
    shutdown: watch::Receiver<bool>,
) {
    let span = info_span!("base", %remote, peer = field::Empty);
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

    let mut conn = BaseConnection::new(ctx, remote, writer, tx);
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
            _ = keepalive_tick.tick(), if keepalive => conn.probe().await,
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

/// Write side of the socket and the session key.
struct BaseLink {
    writer: OwnedWriteHalf,
    cipher: BlockCipher,
    zero: BlockCipher,
    iv_mode: IvMode,
    chain: Option<[u8; BLOCK_SIZE]>,
    write_timeout: Duration,
}

impl BaseLink {
    fn new(writer: OwnedWriteHalf, iv_mode: IvMode, write_timeout: Duration) -> Self {
        let zero = BlockCipher::new(&DeviceKey::zero());
        Self {
            writer,
            cipher: zero.clone(),
            zero,
            iv_mode,
            chain: None,
            write_timeout,
        }
    }

    fn rekey(&mut self, key: &DeviceKey) {
        self.cipher = BlockCipher::new(key);
    }

    fn decode(&self, frame: &[u8]) -> Result<Message, CodecError> {
        unpack_encrypted(frame, &self.cipher)
    }

    fn decode_zero(&self, frame: &[u8]) -> Result<Message, CodecError> {
        unpack_encrypted(frame, &self.zero)
    }

    /// Track the last frame seen on the session for chained IVs.
    fn observe(&mut self, frame: &[u8]) {
        if self.iv_mode == IvMode::Chained {
            self.chain = chain_block(frame);
        }
    }

    fn iv(&self) -> IvSource {
        match (self.iv_mode, self.chain) {
            (IvMode::Chained, Some(block)) => IvSource::Explicit(block),
            _ => IvSource::Random,
        }
    }

    /// Send under the session key.
    async fn send(&mut self, message: &Message) -> Result<(), GatewayError> {
        let frame = build_encrypted(
            &self.cipher,
            message.header,
            message.sequence,
            &message.data,
            self.iv(),
        )?;
        self.write(frame).await
    }

    /// Send under the zero key (handshake rejections).
    async fn send_zero(&mut self, message: &Message) -> Result<(), GatewayError> {
        let frame = build_encrypted(
            &self.zero,
            message.header,
            message.sequence,
            &message.data,
            self.iv(),
        )?;
        self.write(frame).await
    }

    async fn write(&mut self, frame: Bytes) -> Result<(), GatewayError> {
        self.observe(&frame);
        write_within(&mut self.writer, &frame, self.write_timeout).await
    }
}

struct BaseConnection {
    ctx: Arc<Context>,
    connection: u64,
    link: BaseLink,
    auth: BaseAuthenticator,
    session: Option<Session>,
    timezone_offset_minutes: i16,
    commands: CommandSender,
}

impl BaseConnection {
    fn new(
        ctx: Arc<Context>,
        remote: SocketAddr,
        writer: OwnedWriteHalf,
        commands: CommandSender,
    ) -> Self {
        let connection = ctx.router.directory().next_connection_id();
        let auth = BaseAuthenticator::new(remote.ip(), ctx.config.auth_policy());
        let link = BaseLink::new(writer, ctx.config.iv_mode, ctx.config.write_timeout());
        Self {
            ctx,
            connection,
            link,
            auth,
            session: None,
            timezone_offset_minutes: 0,
            commands,
        }
    }

    fn identity(&self) -> Option<BaseId> {
        self.session.as_ref().and_then(|s| s.peer().as_base())
    }

    async fn on_readable(&mut self, buffer: &mut BytesMut) -> Result<Flow, GatewayError> {
        while let Some(frame) = split_frame(buffer) {
            if self.on_frame(&frame).await? == Flow::Close {
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_frame(&mut self, frame: &[u8]) -> Result<Flow, GatewayError> {
        let message = match self.link.decode(frame) {
            Ok(message) => message,
            Err(err) => return self.on_undecodable(frame, err).await,
        };
        self.link.observe(frame);
        trace!(
            header = %message.header,
            sequence = message.sequence,
            len = message.data.len(),
            "frame"
        );

        if self.session.is_some() {
            self.on_message(message).await
        } else {
            self.on_handshake(message).await
        }
    }

    async fn on_undecodable(
        &mut self,
        frame: &[u8],
        err: CodecError,
    ) -> Result<Flow, GatewayError> {
        // A fresh identity frame on an authenticated session.
        if self.session.is_some() {
            if let Ok(message) = self.link.decode_zero(frame) {
                if BaseAuthenticator::is_identity_shaped(&message) {
                    warn!("identity frame on authenticated session");
                    if let Some(reply) = BaseAuthenticator::rejection(&AuthError::AlreadyAuthenticated)
                    {
                        self.link.send_zero(&reply).await?;
                    }
                    return Ok(Flow::Continue);
                }
            }
        }

        if err.is_silent_drop() {
            debug!(%err, "dropped frame");
        } else {
            warn!(%err, "undecodable frame");
        }
        Ok(Flow::Continue)
    }

    async fn on_handshake(&mut self, message: Message) -> Result<Flow, GatewayError> {
        match self.auth.handle(&message, self.ctx.store.as_ref()) {
            Ok(BaseStep::Challenge { key, reply }) => {
                if let Some(identity) = self.auth.identity() {
                    debug!(%identity, "challenge issued");
                }
                self.link.rekey(&key);
                self.link.send(&reply).await?;
                Ok(Flow::Continue)
            }
            Ok(BaseStep::Authenticated {
                grant,
                session,
                baseline,
                reply,
            }) => {
                self.link.send(&reply).await?;
                self.establish(grant, session, baseline).await
            }
            Err(err) => {
                warn!(%err, identity = ?self.auth.identity(), "handshake rejected");
                if let Some(reply) = BaseAuthenticator::rejection(&err) {
                    self.link.send_zero(&reply).await?;
                }
                Ok(Flow::Continue)
            }
        }
    }

    async fn establish(
        &mut self,
        grant: AuthGrant,
        start: SessionStart,
        baseline: u32,
    ) -> Result<Flow, GatewayError> {
        let Some(identity) = grant.peer.as_base() else {
            warn!(peer = %grant.peer, "store granted a non-base identity");
            return Ok(Flow::Close);
        };
        Span::current().record("peer", field::display(&grant.peer));

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

        let session = Session::new(
            grant.peer,
            self.connection,
            self.ctx.config.delivery(),
            baseline,
            self.ctx.store.clone(),
        );
        session.save_receive_sequence();
        self.session = Some(session);
        self.timezone_offset_minutes = grant.timezone_offset_minutes;

        self.ctx.router.announce_base(identity, true);
        self.deliver().await
    }

    async fn on_message(&mut self, message: Message) -> Result<Flow, GatewayError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(Flow::Continue);
        };

        let flow = match session.inbound(message.header, message.sequence) {
            Inbound::Ack(flow) => flow,
            Inbound::Notification => {
                self.process(&message).await?;
                Flow::Continue
            }
            Inbound::Sequenced { ack, deliver, flow } => {
                self.link.send(&Message::ack(ack, message.sequence)).await?;
                if deliver {
                    self.process(&message).await?;
                }
                flow
            }
        };

        if message.header.is_save_peer_sequence() {
            if let Some(session) = &self.session {
                session.save_receive_sequence();
            }
        }
        Ok(flow)
    }

    async fn process(&mut self, message: &Message) -> Result<(), GatewayError> {
        if message.header.is_system() {
            return self.on_system(message).await;
        }
        let Some(identity) = self.identity() else {
            return Ok(());
        };
        if let Err(err) =
            self.ctx
                .router
                .relay_from_base(identity, message.header, &message.data)
        {
            warn!(%err, "relay failed");
        }
        Ok(())
    }

    async fn on_system(&mut self, message: &Message) -> Result<(), GatewayError> {
        let (Some(identity), Some(session)) = (self.identity(), self.session.as_mut()) else {
            return Ok(());
        };

        match SystemCommand::parse(&message.data) {
            None => debug!("empty system message"),
            Some(SystemCommand::ResendUnacked) => session.resend_unacked(),
            Some(SystemCommand::KeepAlive(enabled)) => {
                debug!(enabled, "keep-alive toggled");
                session.set_keepalive(enabled);
            }
            Some(SystemCommand::Timestamp) => {
                let reply = timestamp_reply(unix_now(), self.timezone_offset_minutes);
                self.link.send(&reply).await?;
            }
            Some(SystemCommand::SetVariable(value)) => {
                if let Err(err) = self.ctx.store.save_variable(&identity, &value) {
                    warn!(%err, "could not store variable");
                }
            }
            Some(SystemCommand::GetVariable) => match self.ctx.store.load_variable(&identity) {
                Ok(value) => self.link.send(&variable_reply(&value)).await?,
                Err(err) => warn!(%err, "could not load variable"),
            },
            Some(SystemCommand::Unknown(code)) => warn!(code, "unknown system message"),
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
            let sequence = entry.sequence;
            let frame = Message::new(Header::NONE, sequence, entry.payload);
            match self.link.send(&frame).await {
                Ok(()) => session.mark_sent(sequence),
                Err(GatewayError::Codec(err)) => {
                    warn!(sequence, %err, "discarding entry that cannot be framed");
                    session.discard(sequence);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_backoff_expired(&mut self) -> Result<Flow, GatewayError> {
        if let Some(session) = self.session.as_mut() {
            session.on_backoff_expired();
        }
        self.deliver().await
    }

    async fn probe(&mut self) -> Result<Flow, GatewayError> {
        self.link.send(&keepalive_probe()).await?;
        Ok(Flow::Continue)
    }

    async fn on_command(&mut self, command: Command) -> Result<Flow, GatewayError> {
        match command {
            Command::Wake => {
                if let Some(session) = self.session.as_mut() {
                    session.wake();
                }
                self.deliver().await
            }
            Command::Deliver(Outgoing::Frame(frame)) => {
                self.link.send(&frame).await?;
                Ok(Flow::Continue)
            }
            Command::Deliver(Outgoing::Line(_)) => {
                debug!("ignoring client line routed to a base");
                Ok(Flow::Continue)
            }
            Command::Evict => Err(GatewayError::Displaced),
        }
    }

    fn close(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let peer = session.peer();
        if self.ctx.router.directory().remove(&peer, self.connection) {
            if let Some(identity) = peer.as_base() {
                self.ctx.router.announce_base(identity, false);
            }
        }
    }
}
