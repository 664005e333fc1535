//! Integration tests for the complete relay handshake.
//! 对完整中继握手的集成测试。

use std::sync::OnceLock;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use relay_handshake::crypto::keys::{LocalKeyPair, RemotePublicKey};
use relay_handshake::error::{FailureReason, HandshakeError, Result};
use relay_handshake::protocol::codec::{self, Envelope};
use relay_handshake::protocol::message::{
    AUTH_FAILED, AUTH_SUCCESS, CLIENT_PUBLIC_KEY, NICK, PASSWORD, PUBLIC_KEY_READY, SERVER_FULL,
};
use relay_handshake::transport::{ChannelConnector, ChannelTransport, TcpTransport, Transport};
use relay_handshake::{ChatClient, ClientConfig, HandshakeState, Identity, InboundMessage};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const SECRET: &str = "s3cret";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn relay_keys() -> &'static LocalKeyPair {
    static KEYS: OnceLock<LocalKeyPair> = OnceLock::new();
    KEYS.get_or_init(|| LocalKeyPair::generate(1024).unwrap())
}

fn test_config() -> ClientConfig {
    ClientConfig {
        key_bits: 1024,
        ..Default::default()
    }
}

type ChannelClient = (
    ChatClient<ChannelConnector>,
    ChannelConnector,
    tokio::sync::mpsc::UnboundedReceiver<ChannelTransport>,
);

fn channel_client() -> ChannelClient {
    channel_client_with(test_config())
}

fn channel_client_with(config: ClientConfig) -> ChannelClient {
    init_tracing();
    let (connector, accepted) = ChannelConnector::new();
    let client = ChatClient::builder()
        .connector(connector.clone())
        .config(config)
        .build()
        .unwrap();
    (client, connector, accepted)
}

fn spawn_connect<C: relay_handshake::transport::Connector>(
    client: &ChatClient<C>,
    nickname: &str,
) -> JoinHandle<Result<relay_handshake::Session>> {
    let client = client.clone();
    let identity = Identity::new(nickname, SECRET);
    tokio::spawn(async move { client.connect(identity).await })
}

/// What the scripted relay learned during the exchange.
struct Admitted {
    client_key: RemotePublicKey,
    nickname: String,
}

/// Plays the relay's side of the exchange up to the credential check.
async fn relay_exchange<T: Transport>(relay: &mut T) -> Result<(RemotePublicKey, String, String)> {
    let keys = relay_keys();

    relay.send(PUBLIC_KEY_READY).await?;
    relay.send(CLIENT_PUBLIC_KEY).await?;
    relay.send(&keys.export_public_pem()?).await?;
    println!("R -> C: PUBLIC_KEY_READY, CLIENT_PUBLIC_KEY, relay PEM");

    let wrapped = relay.receive().await?.expect("client public key");
    let pem = String::from_utf8(STANDARD.decode(wrapped).expect("base64 PEM")).expect("utf-8 PEM");
    let client_key = RemotePublicKey::from_pem(&pem)?;
    println!("C -> R: client PEM ({} bit key)", client_key.ciphertext_len() * 8);

    relay.send(NICK).await?;
    let nickname = codec::decode(&relay.receive().await?.expect("nickname"), keys)?;
    println!("C -> R: encrypted nickname '{}'", nickname);

    relay.send(PASSWORD).await?;
    let secret = codec::decode(&relay.receive().await?.expect("secret"), keys)?;
    println!("C -> R: encrypted secret");

    Ok((client_key, nickname, secret))
}

/// Runs the relay side and admits the client when the secret matches.
async fn relay_admit<T: Transport>(relay: &mut T) -> Result<Admitted> {
    let (client_key, nickname, secret) = relay_exchange(relay).await?;
    assert_eq!(secret, SECRET);
    relay.send(AUTH_SUCCESS).await?;
    println!("R -> C: AUTH_SUCCESS");
    Ok(Admitted {
        client_key,
        nickname,
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn test_full_handshake_and_chat_exchange() -> Result<()> {
    println!("--- Setting up client and in-process relay ---");
    let (client, _connector, mut accepted) = channel_client();
    let mut states = client.subscribe();

    println!("--- Starting handshake ---");
    let pending = spawn_connect(&client, "ana");
    let mut relay = accepted.recv().await.expect("relay end");
    let admitted = relay_admit(&mut relay).await?;
    let mut session = pending.await.expect("attempt task")?;

    assert_eq!(admitted.nickname, "ana");
    assert_eq!(client.state(), HandshakeState::Authenticated);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), HandshakeState::Authenticated);
    println!("--- Handshake successful, session authenticated ---");

    println!("--- Relay broadcast to client ---");
    let broadcast = codec::seal("📢 ana se unió al chat!", &admitted.client_key)?;
    relay.send(&broadcast).await?;
    assert_eq!(
        session.recv().await,
        Some(InboundMessage::Text("📢 ana se unió al chat!".to_string()))
    );

    println!("--- Client message to relay ---");
    session.send("hola a todos").await?;
    let wire = relay.receive().await?.expect("chat message");
    let envelope = Envelope::parse(&wire)?;
    let plaintext = codec::decode(&wire, relay_keys())?;
    assert_eq!(plaintext, "hola a todos");
    assert!(envelope.verify(&plaintext));
    println!("R: verified '{}' against both digests", plaintext);

    println!("--- Undecryptable inbound message ---");
    relay.send("bm90IGEgY2lwaGVydGV4dA==").await?;
    relay.send(&codec::seal("sigue funcionando", &admitted.client_key)?).await?;
    assert_eq!(session.recv().await, Some(InboundMessage::Undecryptable));
    assert_eq!(
        session.recv().await.and_then(|m| m.text().map(str::to_owned)),
        Some("sigue funcionando".to_string())
    );
    assert_eq!(client.state(), HandshakeState::Authenticated);

    println!("--- Oversized message is refused locally ---");
    let too_long = "x".repeat(session.max_message_len() + 1);
    assert!(matches!(
        session.send(&too_long).await,
        Err(HandshakeError::Encryption(_))
    ));
    session.send("todavía conectado").await?;
    let wire = relay.receive().await?.expect("chat message");
    assert_eq!(codec::decode(&wire, relay_keys())?, "todavía conectado");

    println!("--- Client closes the session ---");
    session.close().await?;
    assert_eq!(relay.receive().await?, None);
    assert_eq!(client.state(), HandshakeState::Closed);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wrong_credentials_fail_and_close() -> Result<()> {
    let (client, _connector, mut accepted) = channel_client();

    let pending = spawn_connect(&client, "ana");
    let mut relay = accepted.recv().await.expect("relay end");
    let (_, _, secret) = relay_exchange(&mut relay).await?;
    assert_eq!(secret, SECRET);
    relay.send(AUTH_FAILED).await?;
    println!("R -> C: AUTH_FAILED");

    let result = pending.await.expect("attempt task");
    assert!(matches!(result, Err(HandshakeError::WrongCredentials)));
    assert_eq!(
        client.state(),
        HandshakeState::Failed(FailureReason::WrongCredentials)
    );
    assert_eq!(relay.receive().await?, None, "client should close the transport");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_full_fails_the_attempt() -> Result<()> {
    let (client, _connector, mut accepted) = channel_client();

    let pending = spawn_connect(&client, "ana");
    let mut relay = accepted.recv().await.expect("relay end");
    relay.send(PUBLIC_KEY_READY).await?;
    relay.send(SERVER_FULL).await?;

    let result = pending.await.expect("attempt task");
    assert!(matches!(result, Err(HandshakeError::ServerFull)));
    assert_eq!(client.state(), HandshakeState::Failed(FailureReason::ServerFull));
    assert_eq!(relay.receive().await?, None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_attempt_is_refused_while_first_is_in_flight() -> Result<()> {
    let (client, connector, mut accepted) = channel_client();

    let first = spawn_connect(&client, "ana");
    let relay = accepted.recv().await.expect("relay end");
    assert!(client.state().is_in_flight());

    let second = client.connect(Identity::new("ana", SECRET)).await;
    assert!(matches!(second, Err(HandshakeError::AttemptInFlight(_))));
    assert_eq!(connector.connections_opened(), 1);
    assert!(accepted.try_recv().is_err(), "no second transport");

    drop(relay);
    let first = first.await.expect("attempt task");
    assert!(matches!(first, Err(HandshakeError::ClosedBeforeAuthentication)));
    assert_eq!(client.state(), HandshakeState::Closed);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_silent_relay_times_out() -> Result<()> {
    let (client, _connector, mut accepted) = channel_client();

    let pending = spawn_connect(&client, "ana");
    let mut relay = accepted.recv().await.expect("relay end");

    let result = pending.await.expect("attempt task");
    assert!(matches!(result, Err(HandshakeError::ConnectionTimeout)));
    assert_eq!(
        client.state(),
        HandshakeState::Failed(FailureReason::ConnectionTimeout)
    );
    assert_eq!(relay.receive().await?, None, "transport is forced closed");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_relay_key_is_a_key_import_error() -> Result<()> {
    let (client, _connector, mut accepted) = channel_client();

    let pending = spawn_connect(&client, "ana");
    let mut relay = accepted.recv().await.expect("relay end");
    relay.send(PUBLIC_KEY_READY).await?;
    relay
        .send("-----BEGIN PUBLIC KEY-----\nnot*base64\n-----END PUBLIC KEY-----")
        .await?;

    let result = pending.await.expect("attempt task");
    assert!(matches!(result, Err(HandshakeError::KeyImport(_))));
    assert_eq!(
        client.state(),
        HandshakeState::Failed(FailureReason::KeyImportError)
    );

    // The client is usable again after the failure.
    let retry = spawn_connect(&client, "ana");
    let mut relay = accepted.recv().await.expect("second relay end");
    relay_admit(&mut relay).await?;
    retry.await.expect("attempt task")?;
    assert_eq!(client.state(), HandshakeState::Authenticated);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_relay_key_before_ready_fails_fast() -> Result<()> {
    let (client, _connector, mut accepted) = channel_client();

    let pending = spawn_connect(&client, "ana");
    let mut relay = accepted.recv().await.expect("relay end");
    relay.send(&relay_keys().export_public_pem()?).await?;

    let result = pending.await.expect("attempt task");
    assert!(matches!(result, Err(HandshakeError::KeyGenerationTimeout)));
    assert_eq!(
        client.state(),
        HandshakeState::Failed(FailureReason::KeyGenerationTimeout)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_key_generation_outlasting_its_bound_fails() -> Result<()> {
    let (client, _connector, mut accepted) = channel_client_with(ClientConfig {
        key_bits: 2048,
        key_ready_timeout_ms: 1,
        ..Default::default()
    });

    let pending = spawn_connect(&client, "ana");
    let mut relay = accepted.recv().await.expect("relay end");
    relay.send(PUBLIC_KEY_READY).await?;
    relay.send(&relay_keys().export_public_pem()?).await?;
    println!("R -> C: PUBLIC_KEY_READY, relay PEM while the client is still generating");

    let result = pending.await.expect("attempt task");
    assert!(matches!(result, Err(HandshakeError::KeyGenerationTimeout)));
    assert_eq!(
        client.state(),
        HandshakeState::Failed(FailureReason::KeyGenerationTimeout)
    );
    assert_eq!(relay.receive().await?, None, "client should close the transport");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_key_request_before_ready_is_ignored() -> Result<()> {
    let (client, _connector, mut accepted) = channel_client();

    let pending = spawn_connect(&client, "ana");
    let mut relay = accepted.recv().await.expect("relay end");
    relay.send(CLIENT_PUBLIC_KEY).await?;
    println!("R -> C: CLIENT_PUBLIC_KEY ahead of PUBLIC_KEY_READY");
    relay_admit(&mut relay).await?;

    pending.await.expect("attempt task")?;
    assert_eq!(client.state(), HandshakeState::Authenticated);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_key_request_after_key_exchange_is_ignored() -> Result<()> {
    let (client, _connector, mut accepted) = channel_client();
    let keys = relay_keys();

    let pending = spawn_connect(&client, "ana");
    let mut relay = accepted.recv().await.expect("relay end");
    relay.send(PUBLIC_KEY_READY).await?;
    relay.send(&keys.export_public_pem()?).await?;
    let wrapped = relay.receive().await?.expect("client public key");
    assert!(STANDARD.decode(wrapped).is_ok());

    relay.send(CLIENT_PUBLIC_KEY).await?;
    println!("R -> C: CLIENT_PUBLIC_KEY after the key exchange");

    relay.send(NICK).await?;
    let nickname = codec::decode(&relay.receive().await?.expect("nickname"), keys)?;
    assert_eq!(nickname, "ana");
    relay.send(PASSWORD).await?;
    let secret = codec::decode(&relay.receive().await?.expect("secret"), keys)?;
    assert_eq!(secret, SECRET);
    relay.send(AUTH_SUCCESS).await?;

    pending.await.expect("attempt task")?;
    assert_eq!(client.state(), HandshakeState::Authenticated);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_out_of_order_token_is_a_protocol_violation() -> Result<()> {
    let (client, _connector, mut accepted) = channel_client();

    let pending = spawn_connect(&client, "ana");
    let mut relay = accepted.recv().await.expect("relay end");
    relay.send(NICK).await?;

    let result = pending.await.expect("attempt task");
    match result {
        Err(HandshakeError::UnexpectedMessage { state, message }) => {
            assert_eq!(state, HandshakeState::AwaitingServerReady);
            assert_eq!(message, NICK);
        }
        other => panic!("expected a protocol violation, got {other:?}"),
    }
    assert_eq!(
        client.state(),
        HandshakeState::Failed(FailureReason::ProtocolViolation)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_new_attempt_supersedes_authenticated_session() -> Result<()> {
    let (client, connector, mut accepted) = channel_client();

    let first = spawn_connect(&client, "ana");
    let mut first_relay = accepted.recv().await.expect("relay end");
    relay_admit(&mut first_relay).await?;
    let mut first_session = first.await.expect("attempt task")?;

    println!("--- Reconnecting while authenticated ---");
    let second = spawn_connect(&client, "ana");
    assert_eq!(first_relay.receive().await?, None, "old session is closed");
    assert_eq!(first_session.recv().await, None);

    let mut second_relay = accepted.recv().await.expect("second relay end");
    relay_admit(&mut second_relay).await?;
    second.await.expect("attempt task")?;

    assert_eq!(connector.connections_opened(), 2);
    assert_eq!(client.state(), HandshakeState::Authenticated);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abandoned_connect_still_runs_its_attempt() -> Result<()> {
    let (client, connector, mut accepted) = channel_client();

    let first = spawn_connect(&client, "ana");
    let mut first_relay = accepted.recv().await.expect("relay end");
    relay_admit(&mut first_relay).await?;
    let _first_session = first.await.expect("attempt task")?;

    println!("--- Reconnecting, then giving up on the result at once ---");
    let abandoned =
        tokio::time::timeout(Duration::ZERO, client.connect(Identity::new("ana", SECRET))).await;
    assert!(abandoned.is_err());

    let second_relay = accepted.recv().await.expect("attempt opened a transport");
    assert_eq!(first_relay.receive().await?, None, "old session is closed");
    assert_eq!(connector.connections_opened(), 2);

    drop(second_relay);
    let mut states = client.subscribe();
    let settled = *states
        .wait_for(|state| !state.is_in_flight())
        .await
        .expect("client alive");
    assert_eq!(settled, HandshakeState::Closed);

    println!("--- The client accepts a new attempt ---");
    let third = spawn_connect(&client, "ana");
    let mut third_relay = accepted.recv().await.expect("third relay end");
    relay_admit(&mut third_relay).await?;
    third.await.expect("attempt task")?;
    assert_eq!(client.state(), HandshakeState::Authenticated);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unread_inbound_messages_do_not_block_close() -> Result<()> {
    let (client, _connector, mut accepted) = channel_client_with(ClientConfig {
        session_queue_depth: 4,
        ..test_config()
    });

    let pending = spawn_connect(&client, "ana");
    let mut relay = accepted.recv().await.expect("relay end");
    let admitted = relay_admit(&mut relay).await?;
    let session = pending.await.expect("attempt task")?;

    println!("--- Relay floods a session nobody reads ---");
    for n in 0..10 {
        relay
            .send(&codec::seal(&format!("mensaje {n}"), &admitted.client_key)?)
            .await?;
    }

    tokio::time::timeout(Duration::from_secs(5), session.close())
        .await
        .expect("close must not wait on the inbound queue")?;
    assert_eq!(relay.receive().await?, None);
    assert_eq!(client.state(), HandshakeState::Closed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_full_after_auth_closes_the_session() -> Result<()> {
    let (client, _connector, mut accepted) = channel_client();

    let pending = spawn_connect(&client, "ana");
    let mut relay = accepted.recv().await.expect("relay end");
    relay_admit(&mut relay).await?;
    let mut session = pending.await.expect("attempt task")?;

    relay.send(SERVER_FULL).await?;
    println!("R -> C: SERVIDOR_LLENO after AUTH_SUCCESS");

    assert_eq!(session.recv().await, None, "no placeholder reaches the caller");
    assert_eq!(client.state(), HandshakeState::Closed);
    assert_eq!(relay.receive().await?, None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_relay_close_ends_the_session() -> Result<()> {
    let (client, _connector, mut accepted) = channel_client();

    let pending = spawn_connect(&client, "ana");
    let mut relay = accepted.recv().await.expect("relay end");
    relay_admit(&mut relay).await?;
    let mut session = pending.await.expect("attempt task")?;

    relay.close().await?;
    assert_eq!(session.recv().await, None);
    assert_eq!(client.state(), HandshakeState::Closed);
    assert!(matches!(
        session.send("¿hay alguien?").await,
        Err(HandshakeError::SessionClosed)
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handshake_over_tcp() -> Result<()> {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let config = ClientConfig {
        host: "127.0.0.1".to_string(),
        port,
        ..test_config()
    };
    let client = ChatClient::tcp(config)?;

    let pending = spawn_connect(&client, "ana");
    let (stream, _) = listener.accept().await?;
    let mut relay = TcpTransport::new(stream);
    let admitted = relay_admit(&mut relay).await?;
    let mut session = pending.await.expect("attempt task")?;

    relay
        .send(&codec::seal("bienvenida", &admitted.client_key)?)
        .await?;
    assert_eq!(
        session.recv().await,
        Some(InboundMessage::Text("bienvenida".to_string()))
    );

    session.send("gracias").await?;
    let wire = relay.receive().await?.expect("chat message");
    let envelope = Envelope::parse(&wire)?;
    assert!(envelope.verify("gracias"));

    session.close().await?;
    assert_eq!(relay.receive().await?, None);
    Ok(())
}
