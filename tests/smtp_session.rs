//! Black-box protocol tests against a running submission server.
//!
//! The suite talks to `localhost:8000` over plain TCP and provisions users
//! directly in the Redis instance at `localhost:6379`, so it needs both
//! running (`relaymail relaymail.conf submit`). Everything here is ignored
//! by default; run with:
//!
//!     cargo test -- --ignored

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::Rng;
use redis::aio::MultiplexedConnection;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const SMTP_ADDR: &str = "127.0.0.1:8000";
const REDIS_URL: &str = "redis://127.0.0.1:6379";

const TEST_USERNAME: &str = "testuser";
const TEST_PASSWORD: &str = "TestPassword123";
const TEST_EMAIL: &str = "testuser@example.com";
const TEST_EMAIL2: &str = "testuser2@example.com";

fn b64(s: &str) -> String {
    BASE64.encode(s.as_bytes())
}

async fn redis_conn() -> MultiplexedConnection {
    redis::Client::open(REDIS_URL)
        .expect("valid redis url")
        .get_multiplexed_async_connection()
        .await
        .expect("redis must be running for the black-box suite")
}

/// Wipes every key a test can create for the given username, including the
/// loopback rate buckets, so state never bleeds between runs.
async fn clean_all(conn: &mut MultiplexedConnection, username: &str) {
    let _: () = redis::cmd("DEL")
        .arg(format!("user:{username}"))
        .arg(format!("auth:fail:user:{username}"))
        .arg(format!("lock:user:{username}"))
        .arg(format!("auth:user:{username}"))
        .arg("auth:ip:127.0.0.1")
        .arg("auth:ip:::1")
        .query_async(conn)
        .await
        .expect("DEL failed");
}

/// Provisions a user the way the HTTP endpoint would.
async fn provision_user(
    conn: &mut MultiplexedConnection,
    username: &str,
    password: &str,
    email: &str,
) {
    let salt: [u8; 16] = OsRng.gen();
    let hash = argon2::hash_encoded(password.as_bytes(), &salt, &argon2::Config::default())
        .expect("argon2 hash failed");
    let _: () = redis::cmd("HSET")
        .arg(format!("user:{username}"))
        .arg("password")
        .arg(hash)
        .arg("email")
        .arg(email)
        .query_async(conn)
        .await
        .expect("HSET failed");
}

struct SmtpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl SmtpClient {
    /// Dials the server and consumes the 220 greeting.
    async fn connect() -> Self {
        let stream = TcpStream::connect(SMTP_ADDR)
            .await
            .expect("the submission server must be running for the black-box suite");
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
        };
        let greeting = client.read_line().await;
        assert!(greeting.starts_with("220"), "greeting was {greeting:?}");
        client
    }

    async fn send_line(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("write failed");
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .expect("read failed");
        assert!(n > 0, "server closed the connection unexpectedly");
        line.trim_end().to_string()
    }

    async fn expect(&mut self, line: &str, code: &str) {
        self.send_line(line).await;
        let reply = self.read_line().await;
        assert!(
            reply.starts_with(code),
            "expected {code} for {line:?}, got {reply:?}"
        );
    }

    /// Runs the AUTH LOGIN exchange and returns the final reply: 235 or
    /// 535, or 454/535 straight after the username if a gate refused it.
    async fn login(&mut self, username: &str, password: &str) -> String {
        self.send_line("AUTH LOGIN").await;
        let prompt = self.read_line().await;
        assert!(prompt.starts_with("334"), "username prompt was {prompt:?}");
        self.send_line(&b64(username)).await;
        let reply = self.read_line().await;
        if !reply.starts_with("334") {
            return reply;
        }
        self.send_line(&b64(password)).await;
        self.read_line().await
    }
}

/// Dials, authenticates and greets; the returned connection is ready for
/// MAIL FROM.
async fn full_login(username: &str, password: &str) -> SmtpClient {
    let mut client = SmtpClient::connect().await;
    let reply = client.login(username, password).await;
    assert!(reply.starts_with("235"), "login failed: {reply:?}");
    client.expect("HELO localhost", "250").await;
    client
}

async fn fresh_test_user() -> MultiplexedConnection {
    let mut conn = redis_conn().await;
    clean_all(&mut conn, TEST_USERNAME).await;
    provision_user(&mut conn, TEST_USERNAME, TEST_PASSWORD, TEST_EMAIL).await;
    conn
}

#[tokio::test]
#[ignore = "requires a running submission server and redis"]
async fn greeting_and_quit() {
    let mut client = SmtpClient::connect().await;
    client.expect("QUIT", "221").await;
}

#[tokio::test]
#[ignore = "requires a running submission server and redis"]
async fn auth_success() {
    let mut conn = fresh_test_user().await;
    let mut client = SmtpClient::connect().await;
    let reply = client.login(TEST_USERNAME, TEST_PASSWORD).await;
    assert!(reply.starts_with("235"), "got {reply:?}");
    clean_all(&mut conn, TEST_USERNAME).await;
}

#[tokio::test]
#[ignore = "requires a running submission server and redis"]
async fn auth_wrong_password() {
    let mut conn = fresh_test_user().await;
    let mut client = SmtpClient::connect().await;
    let reply = client.login(TEST_USERNAME, "wrongpassword").await;
    assert!(reply.starts_with("535"), "got {reply:?}");
    clean_all(&mut conn, TEST_USERNAME).await;
}

#[tokio::test]
#[ignore = "requires a running submission server and redis"]
async fn auth_nonexistent_user() {
    let mut conn = redis_conn().await;
    clean_all(&mut conn, "ghost_user_xyz").await;
    let mut client = SmtpClient::connect().await;
    let reply = client.login("ghost_user_xyz", "anypassword").await;
    assert!(reply.starts_with("535"), "got {reply:?}");
    clean_all(&mut conn, "ghost_user_xyz").await;
}

#[tokio::test]
#[ignore = "requires a running submission server and redis"]
async fn commands_require_auth() {
    for cmd in [
        "HELO localhost",
        "MAIL FROM:<a@b.com>",
        "RCPT TO:<c@d.com>",
        "DATA",
    ] {
        let mut client = SmtpClient::connect().await;
        client.expect(cmd, "530").await;
    }
}

#[tokio::test]
#[ignore = "requires a running submission server and redis"]
async fn account_locks_after_failures() {
    let mut conn = fresh_test_user().await;

    // Five wrong-password attempts arm the lock.
    for _ in 0..5 {
        let mut client = SmtpClient::connect().await;
        client.login(TEST_USERNAME, "badpass").await;
    }

    // Clear the rate buckets so the lock check is actually reached.
    let _: () = redis::cmd("DEL")
        .arg(format!("auth:user:{TEST_USERNAME}"))
        .arg("auth:ip:127.0.0.1")
        .arg("auth:ip:::1")
        .query_async(&mut conn)
        .await
        .expect("DEL failed");

    let mut client = SmtpClient::connect().await;
    let reply = client.login(TEST_USERNAME, TEST_PASSWORD).await;
    assert!(reply.starts_with("535"), "expected locked, got {reply:?}");
    clean_all(&mut conn, TEST_USERNAME).await;
}

#[tokio::test]
#[ignore = "requires a running submission server and redis"]
async fn successful_login_clears_fail_count() {
    let mut conn = fresh_test_user().await;

    // Three failures, below the lock threshold.
    for _ in 0..3 {
        let mut client = SmtpClient::connect().await;
        client.login(TEST_USERNAME, "badpass").await;
    }

    let mut client = SmtpClient::connect().await;
    let reply = client.login(TEST_USERNAME, TEST_PASSWORD).await;
    assert!(reply.starts_with("235"), "got {reply:?}");

    let exists: bool = redis::cmd("EXISTS")
        .arg(format!("auth:fail:user:{TEST_USERNAME}"))
        .query_async(&mut conn)
        .await
        .expect("EXISTS failed");
    assert!(!exists, "fail counter should be cleared after a good login");
    clean_all(&mut conn, TEST_USERNAME).await;
}

#[tokio::test]
#[ignore = "requires a running submission server and redis"]
async fn rate_limit_blocks_after_user_limit() {
    let mut conn = fresh_test_user().await;

    // Exhaust the per-user bucket (limit 5).
    for _ in 0..5 {
        let mut client = SmtpClient::connect().await;
        client.login(TEST_USERNAME, TEST_PASSWORD).await;
    }

    // The sixth attempt is refused straight after the username.
    let mut client = SmtpClient::connect().await;
    let reply = client.login(TEST_USERNAME, TEST_PASSWORD).await;
    assert!(reply.starts_with("454"), "got {reply:?}");
    clean_all(&mut conn, TEST_USERNAME).await;
}

#[tokio::test]
#[ignore = "requires a running submission server and redis"]
async fn helo_is_required_before_mail_from() {
    let mut conn = fresh_test_user().await;
    let mut client = SmtpClient::connect().await;
    let reply = client.login(TEST_USERNAME, TEST_PASSWORD).await;
    assert!(reply.starts_with("235"), "got {reply:?}");

    client
        .expect(&format!("MAIL FROM:<{TEST_EMAIL}>"), "503")
        .await;
    clean_all(&mut conn, TEST_USERNAME).await;
}

#[tokio::test]
#[ignore = "requires a running submission server and redis"]
async fn rcpt_without_mail_from_is_rejected() {
    let mut conn = fresh_test_user().await;
    let mut client = full_login(TEST_USERNAME, TEST_PASSWORD).await;
    client
        .expect(&format!("RCPT TO:<{TEST_EMAIL2}>"), "503")
        .await;
    clean_all(&mut conn, TEST_USERNAME).await;
}

#[tokio::test]
#[ignore = "requires a running submission server and redis"]
async fn data_without_rcpt_is_rejected() {
    let mut conn = fresh_test_user().await;
    let mut client = full_login(TEST_USERNAME, TEST_PASSWORD).await;
    client
        .expect(&format!("MAIL FROM:<{TEST_EMAIL}>"), "250")
        .await;
    client.expect("DATA", "503").await;
    clean_all(&mut conn, TEST_USERNAME).await;
}

#[tokio::test]
#[ignore = "requires a running submission server and redis"]
async fn mail_from_must_match_the_bound_email() {
    let mut conn = fresh_test_user().await;
    let mut client = full_login(TEST_USERNAME, TEST_PASSWORD).await;
    client.expect("MAIL FROM:<impostor@evil.com>", "535").await;
    clean_all(&mut conn, TEST_USERNAME).await;
}

#[tokio::test]
#[ignore = "requires a running submission server and redis"]
async fn full_send_flow() {
    let mut conn = fresh_test_user().await;
    let mut client = full_login(TEST_USERNAME, TEST_PASSWORD).await;

    client
        .expect(&format!("MAIL FROM:<{TEST_EMAIL}>"), "250")
        .await;
    client
        .expect(&format!("RCPT TO:<{TEST_EMAIL2}>"), "250")
        .await;
    client.expect("DATA", "354").await;
    client.send_line("Subject: Test").await;
    client.send_line("Hello World!").await;
    client.expect(".", "250").await;
    clean_all(&mut conn, TEST_USERNAME).await;
}

#[tokio::test]
#[ignore = "requires a running submission server and redis"]
async fn rset_resets_the_transaction() {
    let mut conn = fresh_test_user().await;
    let mut client = full_login(TEST_USERNAME, TEST_PASSWORD).await;

    client
        .expect(&format!("MAIL FROM:<{TEST_EMAIL}>"), "250")
        .await;
    client.expect("RSET", "250").await;
    // no active MAIL FROM any more
    client
        .expect(&format!("RCPT TO:<{TEST_EMAIL2}>"), "503")
        .await;

    // and a full transaction still works afterwards
    client
        .expect(&format!("MAIL FROM:<{TEST_EMAIL}>"), "250")
        .await;
    client
        .expect(&format!("RCPT TO:<{TEST_EMAIL2}>"), "250")
        .await;
    client.expect("DATA", "354").await;
    client.send_line("Subject: After reset").await;
    client.expect(".", "250").await;
    clean_all(&mut conn, TEST_USERNAME).await;
}

#[tokio::test]
#[ignore = "requires a running submission server and redis"]
async fn multiple_messages_on_one_connection() {
    let mut conn = fresh_test_user().await;
    let mut client = full_login(TEST_USERNAME, TEST_PASSWORD).await;

    for i in 1..=3 {
        client
            .expect(&format!("MAIL FROM:<{TEST_EMAIL}>"), "250")
            .await;
        client
            .expect(&format!("RCPT TO:<{TEST_EMAIL2}>"), "250")
            .await;
        client.expect("DATA", "354").await;
        client.send_line(&format!("Message number {i}")).await;
        client.expect(".", "250").await;
    }
    clean_all(&mut conn, TEST_USERNAME).await;
}

#[tokio::test]
#[ignore = "requires a running submission server and redis"]
async fn unknown_commands_reply_500() {
    let mut client = SmtpClient::connect().await;
    client.expect("GARBAGE COMMAND", "500").await;
}
