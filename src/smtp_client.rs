use crate::error::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;

/// Relays one message to the SMTP server at `host:port` with a plain HELO
/// dialogue, checking each reply against the expected code.
pub async fn send(host: &str, port: u16, from: &str, to: &str, body: &str) -> Result<(), Error> {
    let stream = TcpStream::connect((host, port)).await?;

    // Disable Nagle's algorithm.
    stream.set_nodelay(true)?;

    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let mut response = String::new();

    macro_rules! cmd {
        ($command:expr, $context:expr, $expected_code:expr) => {
            cmd!(write $command);
            cmd!(read $context, $expected_code);
        };
        (write $command:expr) => {
            writer.write_all($command).await?;
            writer.flush().await?;
        };
        (read $context:expr, $expected_code:expr) => {
            reader.read_line(&mut response).await?;
            if !response.starts_with($expected_code) {
                return Err(Error::MailSend {
                    context: $context.to_string(),
                    raw_smtp_answer: response.clone(),
                });
            }
            response.clear();
        };
    }

    // Read initial greeting
    cmd!(read "initial greeting", "220");

    // Greet (Using HELO as we don't want to deal with extended SMTP anyway.)
    cmd!(b"HELO localhost\r\n", "HELO", "250");

    cmd!(
        format!("MAIL FROM:<{from}>\r\n").as_bytes(),
        "MAIL FROM",
        "250"
    );

    cmd!(format!("RCPT TO:<{to}>\r\n").as_bytes(), "RCPT TO", "250");

    cmd!(b"DATA\r\n", "DATA", "354");
    cmd!(write body.as_bytes());
    cmd!(write b"\r\n.\r\n");
    cmd!(read "end of DATA", "250");

    // The reply to QUIT is not interesting.
    cmd!(write b"QUIT\r\n");

    Ok(())
}
