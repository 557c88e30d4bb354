//! The mail submission server: a per-connection SMTP-subset dialogue with
//! credential-prompt authentication.

use crate::auth::AuthTracker;
use crate::error::Error;
use crate::message_id::IdGenerator;
use crate::queue::{QueuedMessage, SubmissionQueue};
use crate::rate_limiter::RateLimiter;
use crate::store::Store;
use crate::utils::{decode_credential, epoch_now, strip_angle_brackets};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

/// Everything a connection handler needs, shared across connections.
///
/// All mutable cross-connection state lives in the store; this context is
/// read-only apart from the id generator's internal counter.
pub struct SmtpContext {
    pub store: Store,
    pub auth: AuthTracker,
    pub rate_limiter: RateLimiter,
    pub queue: SubmissionQueue,
    pub ids: IdGenerator,
}

/// Protocol position of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum SessionState {
    #[default]
    Init,
    Helo,
    Mail,
    Rcpt,
    Data,
}

/// Per-connection dialogue state.
#[derive(Debug, Default)]
struct Session {
    state: SessionState,
    authenticated: bool,
    username: String,
    mail_from: String,
    rcpt_to: String,
    data: String,
}

impl Session {
    /// Checks the authentication gate and the expected protocol position,
    /// returning the reply to send when the command is not allowed. The
    /// authentication gate wins over the sequence check.
    fn gate(&self, expected: SessionState) -> Option<&'static str> {
        if !self.authenticated {
            return Some("530 Authentication required\r\n");
        }
        if self.state != expected {
            return Some("503 Bad sequence of commands\r\n");
        }
        None
    }

    /// Drops the current transaction and returns to the post-greeting
    /// state. The login survives; one AUTH serves the whole connection.
    fn reset(&mut self) {
        self.mail_from.clear();
        self.rcpt_to.clear();
        self.data.clear();
        self.state = SessionState::Helo;
    }
}

/// Runs the submission server on the specified address.
pub async fn run_smtp_server(addr: &str, ctx: Arc<SmtpContext>) -> Result<(), Error> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("submission server listening on {addr}");

    loop {
        let (socket, peer) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            handle_connection(socket, peer.ip(), ctx).await;
        });
    }
}

/// Handles an individual submission connection.
async fn handle_connection(socket: TcpStream, peer: IpAddr, ctx: Arc<SmtpContext>) {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);

    if let Err(e) = serve_session(&mut reader, &mut writer, peer, &ctx).await {
        log::warn!("session from {peer} failed: {e}");
        // best effort; the connection may already be gone
        let _ = writer.write_all(b"451 server error\r\n").await;
    }
}

async fn serve_session(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    peer: IpAddr,
    ctx: &SmtpContext,
) -> Result<(), Error> {
    writer.write_all(b"220 relaymail ready\r\n").await?;

    let mut session = Session::default();
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(());
        }

        // Commands end with CRLF, but a bare LF is accepted.
        let cmd = line.trim_end();
        log::debug!("received: {cmd}");
        let upper = cmd.to_ascii_uppercase();

        if upper.starts_with("AUTH LOGIN") {
            auth_login(reader, writer, peer, &mut session, ctx).await?;
        } else if upper.starts_with("HELO") {
            if let Some(reply) = session.gate(SessionState::Init) {
                writer.write_all(reply.as_bytes()).await?;
                continue;
            }
            session.state = SessionState::Helo;
            writer.write_all(b"250 Hello\r\n").await?;
        } else if upper.starts_with("MAIL FROM:") {
            if let Some(reply) = session.gate(SessionState::Helo) {
                writer.write_all(reply.as_bytes()).await?;
                continue;
            }
            if session.username.is_empty() {
                writer.write_all(b"535 Authentication failed\r\n").await?;
                continue;
            }
            let addr = strip_angle_brackets(&cmd["MAIL FROM:".len()..]);
            match ctx.store.lookup_user(&session.username).await {
                Ok(Some(user)) if user.email == addr => {
                    session.mail_from = addr.to_string();
                    session.state = SessionState::Mail;
                    writer.write_all(b"250 OK\r\n").await?;
                }
                Ok(_) => {
                    // unknown user, or an address other than the bound one
                    writer.write_all(b"535 Authentication failed\r\n").await?;
                }
                Err(e) => {
                    log::warn!("registry lookup failed for {}: {e}", session.username);
                    writer.write_all(b"451 Local error\r\n").await?;
                }
            }
        } else if upper.starts_with("RCPT TO:") {
            if let Some(reply) = session.gate(SessionState::Mail) {
                writer.write_all(reply.as_bytes()).await?;
                continue;
            }
            session.rcpt_to = strip_angle_brackets(&cmd["RCPT TO:".len()..]).to_string();
            session.state = SessionState::Rcpt;
            writer.write_all(b"250 OK\r\n").await?;
        } else if upper == "DATA" {
            if let Some(reply) = session.gate(SessionState::Rcpt) {
                writer.write_all(reply.as_bytes()).await?;
                continue;
            }
            session.state = SessionState::Data;
            writer
                .write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n")
                .await?;
            read_body(reader, &mut session).await?;
            let reply = commit(&mut session, ctx).await;
            writer.write_all(reply).await?;
        } else if upper == "RSET" {
            session.reset();
            writer.write_all(b"250 OK\r\n").await?;
        } else if upper == "QUIT" {
            writer.write_all(b"221 Bye\r\n").await?;
            return Ok(());
        } else {
            writer
                .write_all(b"500 Syntax error, command unrecognized\r\n")
                .await?;
        }
    }
}

/// The two-step credential prompt: rate-limit and lock gates after the
/// username, verifier check after the password. Gate refusals leave the
/// session where it was.
async fn auth_login(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    peer: IpAddr,
    session: &mut Session,
    ctx: &SmtpContext,
) -> Result<(), Error> {
    // base64 of "Username:"
    writer.write_all(b"334 VXNlcm5hbWU6\r\n").await?;

    let Some(username) = read_credential(reader).await? else {
        writer.write_all(b"535 Authentication failed\r\n").await?;
        return Ok(());
    };

    match ctx.rate_limiter.validate(&username, peer).await {
        Ok(true) => {}
        Ok(false) => {
            writer.write_all(b"454 Too many login attempts\r\n").await?;
            return Ok(());
        }
        Err(e) => {
            log::warn!("rate limiter unavailable: {e}");
            writer.write_all(b"451 Local error\r\n").await?;
            return Ok(());
        }
    }

    match ctx.auth.is_locked(&username).await {
        Ok(false) => {}
        Ok(true) => {
            writer
                .write_all(b"535 Account temporarily locked\r\n")
                .await?;
            return Ok(());
        }
        Err(e) => {
            log::warn!("lock check unavailable: {e}");
            writer.write_all(b"451 Local error\r\n").await?;
            return Ok(());
        }
    }

    // base64 of "Password:"
    writer.write_all(b"334 UGFzc3dvcmQ6\r\n").await?;

    let Some(password) = read_credential(reader).await? else {
        writer.write_all(b"535 Authentication failed\r\n").await?;
        return Ok(());
    };

    let user = match ctx.store.lookup_user(&username).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            note_failure(ctx, &username).await;
            writer.write_all(b"535 Authentication failed\r\n").await?;
            return Ok(());
        }
        Err(e) => {
            log::warn!("registry lookup failed for {username}: {e}");
            writer.write_all(b"451 Local error\r\n").await?;
            return Ok(());
        }
    };

    // A malformed stored hash counts as a mismatch.
    if argon2::verify_encoded(&user.password_hash, password.as_bytes()).unwrap_or(false) {
        session.authenticated = true;
        session.state = SessionState::Init;
        session.username = username.clone();
        if let Err(e) = ctx.auth.clear(&username).await {
            log::warn!("failed to clear failure counter for {username}: {e}");
        }
        log::info!("{username} authenticated from {peer}");
        writer.write_all(b"235 Authentication successful\r\n").await?;
    } else {
        note_failure(ctx, &username).await;
        writer.write_all(b"535 Authentication failed\r\n").await?;
    }

    Ok(())
}

/// Reads and decodes one base64 credential line.
async fn read_credential(reader: &mut BufReader<OwnedReadHalf>) -> Result<Option<String>, Error> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(decode_credential(&line))
}

async fn note_failure(ctx: &SmtpContext, username: &str) {
    if let Err(e) = ctx.auth.note_failure(username).await {
        log::warn!("failed to record auth failure for {username}: {e}");
    }
}

/// Reads the message body until the bare-dot terminator line.
async fn read_body(
    reader: &mut BufReader<OwnedReadHalf>,
    session: &mut Session,
) -> Result<(), Error> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        let body_line = line.trim_end();
        if body_line == "." {
            return Ok(());
        }
        session.data.push_str(body_line);
        session.data.push('\n');
    }
}

/// Hands the finished transaction to the submission queue.
///
/// Either way the transaction is discarded afterwards; acceptance means
/// queued, not delivered.
async fn commit(session: &mut Session, ctx: &SmtpContext) -> &'static [u8] {
    let id = match ctx.ids.next() {
        Ok(id) => id,
        Err(e) => {
            log::error!("message id allocation failed: {e}");
            session.reset();
            return b"451 Local error in processing\r\n".as_slice();
        }
    };

    let msg = QueuedMessage {
        id,
        username: session.username.clone(),
        from: session.mail_from.clone(),
        to: session.rcpt_to.clone(),
        data: session.data.clone(),
        time: epoch_now(),
        retry: 0,
        error: None,
    };

    let reply = match ctx.queue.push(&msg).await {
        Ok(()) => {
            log::info!("message {} accepted from {}", msg.id, msg.username);
            b"250 Message accepted\r\n".as_slice()
        }
        Err(e) => {
            log::error!("failed to enqueue message {}: {e}", msg.id);
            b"451 Queue error\r\n".as_slice()
        }
    };
    session.reset();
    reply
}
