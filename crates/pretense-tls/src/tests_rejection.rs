use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConnection};

use crate::{classify_rejection, FallbackAuthority, FallbackAuthorityConfig, RejectionReason};

const HOST: &str = "api.example.com";

fn authority(common_name: &str) -> FallbackAuthority {
    FallbackAuthority::new(FallbackAuthorityConfig {
        ca_common_name: common_name.to_string(),
        ..FallbackAuthorityConfig::default()
    })
    .expect("authority")
}

fn server_for(authority: &FallbackAuthority) -> Connection {
    let context = authority.issue_for_host(HOST).expect("leaf");
    let config = context.server_config().expect("server config");
    Connection::Server(ServerConnection::new(config).expect("server connection"))
}

fn client_trusting(authority: &FallbackAuthority) -> Connection {
    let mut roots = RootCertStore::empty();
    roots
        .add(authority.ca_certificate_der().clone())
        .expect("add root");
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let server_name = ServerName::try_from(HOST).expect("server name");
    Connection::Client(
        ClientConnection::new(Arc::new(config), server_name).expect("client connection"),
    )
}

/// Moves pending TLS records from `from` into `to`. Returns whether anything
/// was sent.
fn deliver(from: &mut Connection, to: &mut Connection) -> Result<bool, rustls::Error> {
    let mut records = Vec::new();
    while from.wants_write() {
        from.write_tls(&mut records).expect("write_tls");
    }
    if records.is_empty() {
        return Ok(false);
    }
    let mut reader = records.as_slice();
    while !reader.is_empty() {
        to.read_tls(&mut reader).expect("read_tls");
        to.process_new_packets()?;
    }
    Ok(true)
}

/// Runs the handshake in memory and returns the errors seen by the server and
/// the client.
fn handshake(
    client: &mut Connection,
    server: &mut Connection,
) -> (Option<rustls::Error>, Option<rustls::Error>) {
    let mut server_error = None;
    let mut client_error = None;
    for _ in 0..16 {
        let sent_to_server = match deliver(client, server) {
            Ok(sent) => sent,
            Err(error) => {
                server_error = Some(error);
                break;
            }
        };
        let sent_to_client = match deliver(server, client) {
            Ok(sent) => sent,
            Err(error) => {
                client_error = Some(error);
                true
            }
        };
        if !sent_to_server && !sent_to_client {
            break;
        }
    }
    (server_error, client_error)
}

#[test]
fn client_refusing_unknown_issuer_is_classified_as_unknown_ca() {
    let presented_by = authority("pretense Untrusted Test CA");
    let trusted = authority("pretense Trusted Test CA");
    let mut server = server_for(&presented_by);
    let mut client = client_trusting(&trusted);

    let (server_error, client_error) = handshake(&mut client, &mut server);
    let client_error = client_error.expect("client must refuse the chain");
    let server_error = server_error.expect("server must see the client's alert");

    assert!(
        matches!(
            client_error,
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer)
        ),
        "{client_error}"
    );
    assert_eq!(
        classify_rejection(&server_error.to_string()),
        RejectionReason::UnknownCa,
        "{server_error}"
    );
}

#[test]
fn trusting_client_completes_handshake_without_errors() {
    let trusted = authority("pretense Trusted Test CA");
    let mut server = server_for(&trusted);
    let mut client = client_trusting(&trusted);

    let (server_error, client_error) = handshake(&mut client, &mut server);
    assert!(server_error.is_none(), "{server_error:?}");
    assert!(client_error.is_none(), "{client_error:?}");
    assert!(!client.is_handshaking());
    assert!(!server.is_handshaking());
}

#[test]
fn plaintext_request_is_classified_as_not_tls() {
    let trusted = authority("pretense Trusted Test CA");
    let mut server = server_for(&trusted);

    let mut request: &[u8] = b"GET / HTTP/1.1\r\nHost: api.example.com\r\n\r\n";
    server.read_tls(&mut request).expect("read_tls");
    let error = server
        .process_new_packets()
        .expect_err("plaintext must not parse as TLS");

    assert_eq!(
        classify_rejection(&error.to_string()),
        RejectionReason::NotTls,
        "{error}"
    );
}
