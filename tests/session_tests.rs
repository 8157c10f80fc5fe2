//! End-to-end submission sessions against scripted servers.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use report_mailer::mocks::{
    auth_continue_response, auth_success_response, data_ready_response, ehlo_after_tls,
    ehlo_before_tls, ehlo_response, starttls_ready_response, test_email,
    test_email_with_attachments, MockTransport,
};
use report_mailer::protocol::SmtpResponse;
use report_mailer::{
    Attachment, Email, SmtpClient, SmtpConfig, SmtpErrorKind, SmtpTransport, TlsMode,
};

const USERNAME: &str = "bench@example.com";
const PASSWORD: &str = "not-a-real-app-password";

fn client() -> SmtpClient {
    let config = SmtpConfig::builder()
        .host("smtp.example.com")
        .credentials(USERNAME, PASSWORD)
        .build()
        .unwrap();
    SmtpClient::new(config).unwrap()
}

/// Queues EHLO, STARTTLS and the post-TLS EHLO with the given AUTH line.
fn queue_handshake(transport: &mut MockTransport, auth: &str) {
    transport
        .queue_response(ehlo_before_tls())
        .queue_response(starttls_ready_response())
        .queue_response(ehlo_response(&["SIZE 35882577", "8BITMIME", auth]));
}

fn queue_transaction(transport: &mut MockTransport) {
    transport
        .queue_ok()
        .queue_ok()
        .queue_response(data_ready_response())
        .queue_response(SmtpResponse::new(250, "2.0.0 OK queued"))
        .queue_response(SmtpResponse::new(221, "2.0.0 closing connection"));
}

#[tokio::test]
async fn starttls_then_plain_auth_delivers_message() {
    let client = client();
    let email = test_email_with_attachments().unwrap();

    let mut transport = MockTransport::new();
    transport
        .queue_response(ehlo_before_tls())
        .queue_response(starttls_ready_response())
        .queue_response(ehlo_after_tls())
        .queue_response(auth_success_response());
    queue_transaction(&mut transport);

    let result = client.send_via(&mut transport, &email).await.unwrap();

    assert_eq!(transport.tls_upgrades(), 1);
    assert!(transport.is_tls());
    assert_eq!(result.accepted.len(), 1);
    assert!(result.rejected.is_empty());
    assert_eq!(result.response, "2.0.0 OK queued");

    let commands = transport.commands_sent();
    assert_eq!(commands[0], "EHLO localhost");
    assert_eq!(commands[1], "STARTTLS");
    assert_eq!(commands[2], "EHLO localhost");
    assert_eq!(commands[3], "AUTH PLAIN <redacted>");
    assert!(commands[4].starts_with("MAIL FROM:<sender@example.com> SIZE="));
    assert!(commands[4].ends_with(" BODY=8BITMIME"));
    assert_eq!(commands[5], "RCPT TO:<recipient@example.com>");
    assert_eq!(commands[6], "DATA");
    assert_eq!(commands[7], "QUIT");
    assert_eq!(commands.len(), 8);

    let expected = BASE64.encode(format!("\0{}\0{}", USERNAME, PASSWORD));
    assert_eq!(transport.wire_commands()[3], format!("AUTH PLAIN {}", expected));

    let data = transport.data_received();
    assert!(data.ends_with(b"\r\n.\r\n"));
    let text = String::from_utf8_lossy(data);
    assert!(text.contains("Subject: GPU Benchmark Report\r\n"));
    assert!(text.contains(&format!("Message-ID: <{}>", result.message_id)));
}

#[tokio::test]
async fn password_never_appears_in_log_safe_commands() {
    let client = client();
    let mut transport = MockTransport::new();
    queue_handshake(&mut transport, "AUTH LOGIN");
    transport
        .queue_response(auth_continue_response("VXNlcm5hbWU6"))
        .queue_response(auth_continue_response("UGFzc3dvcmQ6"))
        .queue_response(auth_success_response());
    queue_transaction(&mut transport);

    client.send_via(&mut transport, &test_email().unwrap()).await.unwrap();

    let encoded_password = BASE64.encode(PASSWORD);
    for command in transport.commands_sent() {
        assert!(!command.contains(PASSWORD), "{}", command);
        assert!(!command.contains(&encoded_password), "{}", command);
    }

    let wire = transport.wire_commands();
    assert_eq!(wire[3], "AUTH LOGIN");
    assert_eq!(wire[4], BASE64.encode(USERNAME));
    assert_eq!(wire[5], encoded_password);
}

#[tokio::test]
async fn cram_md5_is_preferred_when_offered() {
    let config = SmtpConfig::builder()
        .host("postoffice.reston.mci.net")
        .credentials("tim", "tanstaaftanstaaf")
        .build()
        .unwrap();
    let client = SmtpClient::new(config).unwrap();

    let mut transport = MockTransport::new();
    queue_handshake(&mut transport, "AUTH PLAIN LOGIN CRAM-MD5");
    transport
        .queue_response(auth_continue_response(
            "PDE4OTYuNjk3MTcwOTUyQHBvc3RvZmZpY2UucmVzdG9uLm1jaS5uZXQ+",
        ))
        .queue_response(auth_success_response());
    queue_transaction(&mut transport);

    client.send_via(&mut transport, &test_email().unwrap()).await.unwrap();

    let wire = transport.wire_commands();
    assert_eq!(wire[3], "AUTH CRAM-MD5");
    assert_eq!(wire[4], "dGltIGI5MTNhNjAyYzdlZGE3YTQ5NWI0ZTZlNzMzNGQzODkw");
}

#[tokio::test]
async fn rejected_credentials_stop_before_mail() {
    let client = client();
    let mut transport = MockTransport::new();
    queue_handshake(&mut transport, "AUTH PLAIN");
    transport.queue_error(535, "5.7.8 Username and Password not accepted");

    let err = client
        .send_via(&mut transport, &test_email().unwrap())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), SmtpErrorKind::CredentialsInvalid);
    assert_eq!(err.smtp_code(), Some(535));
    assert!(!err.to_string().contains(PASSWORD));
    assert!(!transport.commands_sent().iter().any(|c| c.starts_with("MAIL")));
    assert_eq!(transport.commands_sent().last().map(String::as_str), Some("QUIT"));
}

#[tokio::test]
async fn partially_rejected_recipients_are_reported() {
    let client = client();
    let email = Email::builder()
        .from("bench@example.com").unwrap()
        .to("ops@example.com").unwrap()
        .cc("nobody@example.com").unwrap()
        .bcc("OPS@example.com").unwrap()
        .subject("GPU Benchmark Report")
        .text("Benchmark Report attached")
        .build()
        .unwrap();

    let mut transport = MockTransport::new();
    queue_handshake(&mut transport, "AUTH PLAIN");
    transport
        .queue_response(auth_success_response())
        .queue_ok()
        .queue_ok()
        .queue_error(550, "5.1.1 No such user")
        .queue_response(data_ready_response())
        .queue_response(SmtpResponse::new(250, "2.0.0 OK"));

    let result = client.send_via(&mut transport, &email).await.unwrap();

    assert_eq!(result.accepted.len(), 1);
    assert_eq!(result.accepted[0].email(), "ops@example.com");
    assert_eq!(result.rejected.len(), 1);
    assert_eq!(result.rejected[0].address.email(), "nobody@example.com");
    assert_eq!(result.rejected[0].code, 550);

    let rcpts: Vec<String> = transport
        .commands_sent()
        .into_iter()
        .filter(|c| c.starts_with("RCPT"))
        .collect();
    assert_eq!(rcpts, vec!["RCPT TO:<ops@example.com>", "RCPT TO:<nobody@example.com>"]);

    let text = String::from_utf8_lossy(transport.data_received()).into_owned();
    assert!(text.contains("Cc: nobody@example.com"));
    assert!(!text.contains("Bcc"));
}

#[tokio::test]
async fn all_recipients_rejected_resets_transaction() {
    let client = client();
    let mut transport = MockTransport::new();
    queue_handshake(&mut transport, "AUTH PLAIN");
    transport
        .queue_response(auth_success_response())
        .queue_ok()
        .queue_error(550, "5.1.1 No such user")
        .queue_ok();

    let err = client
        .send_via(&mut transport, &test_email().unwrap())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), SmtpErrorKind::InvalidRecipientAddress);
    assert_eq!(err.smtp_code(), Some(550));
    let commands = transport.commands_sent();
    assert_eq!(&commands[commands.len() - 2..], &["RSET".to_string(), "QUIT".to_string()]);
    assert!(transport.data_received().is_empty());
}

#[tokio::test]
async fn message_over_server_limit_is_not_sent() {
    let client = client();
    let email = Email::builder()
        .from("bench@example.com").unwrap()
        .to("ops@example.com").unwrap()
        .subject("GPU Benchmark Report")
        .text("Benchmark Report attached")
        .attachment(Attachment::binary("big.bin", vec![0u8; 4096]))
        .build()
        .unwrap();

    let mut transport = MockTransport::new();
    transport
        .queue_response(ehlo_before_tls())
        .queue_response(starttls_ready_response())
        .queue_response(ehlo_response(&["SIZE 1024", "AUTH PLAIN"]))
        .queue_response(auth_success_response());

    let err = client.send_via(&mut transport, &email).await.unwrap_err();
    assert_eq!(err.kind(), SmtpErrorKind::MessageTooLarge);
    assert!(!transport.commands_sent().iter().any(|c| c.starts_with("MAIL")));
}

#[tokio::test]
async fn data_rejection_surfaces_server_reply() {
    let client = client();
    let mut transport = MockTransport::new();
    queue_handshake(&mut transport, "AUTH PLAIN");
    transport
        .queue_response(auth_success_response())
        .queue_ok()
        .queue_ok()
        .queue_response(data_ready_response())
        .queue_error(552, "5.3.4 Message size exceeds fixed limit");

    let err = client
        .send_via(&mut transport, &test_email().unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), SmtpErrorKind::MessageTooLarge);
    assert_eq!(err.smtp_code(), Some(552));
}

#[tokio::test]
async fn verify_reports_connection_details() {
    let client = client();
    let mut transport = MockTransport::new();
    transport
        .queue_response(ehlo_before_tls())
        .queue_response(starttls_ready_response())
        .queue_response(ehlo_after_tls())
        .queue_response(auth_success_response());

    let info = client.verify_via(&mut transport).await.unwrap();

    assert!(info.tls_enabled);
    assert_eq!(info.authenticated_user.as_deref(), Some(USERNAME));
    assert!(info.capabilities.iter().any(|c| c.starts_with("AUTH")));
    assert!(!transport.commands_sent().iter().any(|c| c.starts_with("MAIL")));
}

/// Minimal plaintext SMTP server that accepts one message.
async fn accept_one_message(listener: TcpListener) -> (Vec<String>, Vec<u8>) {
    let (socket, _) = listener.accept().await.unwrap();
    let (read, mut write) = socket.into_split();
    let mut reader = BufReader::new(read);
    let mut commands = Vec::new();
    let mut data = Vec::new();

    write.write_all(b"220 localhost ESMTP ready\r\n").await.unwrap();

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await.unwrap() == 0 {
            break;
        }
        let command = line.trim_end().to_string();
        commands.push(command.clone());

        let verb = command.split(' ').next().unwrap_or_default().to_ascii_uppercase();
        match verb.as_str() {
            "EHLO" => {
                write
                    .write_all(b"250-localhost greets you\r\n250-SIZE 1000000\r\n250 8BITMIME\r\n")
                    .await
                    .unwrap();
            }
            "DATA" => {
                write.write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n").await.unwrap();
                loop {
                    let mut chunk = Vec::new();
                    if reader.read_until(b'\n', &mut chunk).await.unwrap() == 0 {
                        break;
                    }
                    if chunk == b".\r\n" {
                        break;
                    }
                    data.extend_from_slice(&chunk);
                }
                write.write_all(b"250 2.0.0 Ok: queued as 4F2A1\r\n").await.unwrap();
            }
            "QUIT" => {
                write.write_all(b"221 2.0.0 Bye\r\n").await.unwrap();
                break;
            }
            _ => write.write_all(b"250 2.1.0 Ok\r\n").await.unwrap(),
        }
    }

    (commands, data)
}

#[tokio::test]
async fn sends_over_loopback_without_tls() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(accept_one_message(listener));

    let config = SmtpConfig::builder()
        .host("127.0.0.1")
        .port(port)
        .tls_mode(TlsMode::None)
        .build()
        .unwrap();
    let client = SmtpClient::new(config).unwrap();

    let email = Email::builder()
        .from("bench@example.com").unwrap()
        .to("ops@example.com").unwrap()
        .subject("GPU Benchmark Report")
        .text("Benchmark Report attached\n.hidden line")
        .attachment(Attachment::binary("benchmark_report.txt", b"gpu0 1234 fps\n".to_vec()))
        .message_id("report-1@example.com")
        .build()
        .unwrap();

    let result = client.send(&email).await.unwrap();
    let (commands, data) = server.await.unwrap();

    assert_eq!(result.message_id, "report-1@example.com");
    assert_eq!(result.response, "Ok: queued as 4F2A1");
    assert_eq!(commands[0], "EHLO localhost");
    assert!(commands[1].starts_with("MAIL FROM:<bench@example.com> SIZE="));
    assert_eq!(commands[2], "RCPT TO:<ops@example.com>");
    assert_eq!(commands[3], "DATA");
    assert_eq!(commands[4], "QUIT");

    let text = String::from_utf8(data).unwrap();
    assert!(text.contains("Message-ID: <report-1@example.com>\r\n"));
    assert!(text.contains("Content-Disposition: attachment; filename=\"benchmark_report.txt\""));
    assert!(text.contains(&BASE64.encode(b"gpu0 1234 fps\n")));
    assert!(!text.lines().any(|l| l.starts_with(".hidden")));
}
