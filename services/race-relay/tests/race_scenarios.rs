
use std::time::Duration;

use harness::{bounded, dead_addr, eventually, session_config, RelayHandle, Script, ScriptedBackend};
use race_relay::BroadcastFailurePolicy;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const RACE_WINDOW: Duration = Duration::from_millis(400);

#[tokio::test]
async fn ping_pong_picks_the_only_responder() {
    let silent = ScriptedBackend::spawn(Script::Silent).await.unwrap();
    let responder = ScriptedBackend::spawn(Script::echo(b"PONG", Duration::from_millis(200)))
        .await
        .unwrap();

    let relay = RelayHandle::spawn(
        vec![silent.addr, responder.addr],
        session_config(RACE_WINDOW),
    )
    .await
    .unwrap();

    let mut client = relay.connect().await.unwrap();
    client.write_all(b"PING").await.unwrap();

    let mut buf = [0u8; 4];
    bounded(client.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"PONG");

    // The losing candidate saw the first payload and nothing else.
    assert_eq!(silent.first_payloads(), vec![b"PING".to_vec()]);
    assert!(eventually(Duration::from_secs(2), || silent.closed_by_relay() == 1).await);
    assert_eq!(silent.bytes_after_first(), 0);

    assert_eq!(relay.log.count("info", "succeeded, keeping"), 1);
    assert_eq!(
        relay.log.matching("succeeded, keeping")[0],
        format!("Connection to {} succeeded, keeping", responder.addr)
    );
}

#[tokio::test]
async fn silent_candidates_close_client_without_bytes() {
    let backends = [
        ScriptedBackend::spawn(Script::Silent).await.unwrap(),
        ScriptedBackend::spawn(Script::Silent).await.unwrap(),
        ScriptedBackend::spawn(Script::Silent).await.unwrap(),
    ];

    let relay = RelayHandle::spawn(
        backends.iter().map(|b| b.addr).collect(),
        session_config(Duration::from_millis(200)),
    )
    .await
    .unwrap();

    let mut client = relay.connect().await.unwrap();
    client.write_all(b"0123456789").await.unwrap();

    let mut received = Vec::new();
    bounded(client.read_to_end(&mut received)).await.unwrap();
    assert!(received.is_empty());

    for backend in &backends {
        assert_eq!(backend.connection_count(), 1);
        assert_eq!(backend.first_payloads(), vec![b"0123456789".to_vec()]);
    }

    assert!(eventually(Duration::from_secs(2), || relay.sessions_aborted() == 1).await);
    assert_eq!(relay.log.count("warn", "no viable candidate among 3"), 1);
    assert_eq!(relay.log.count("info", "Closed (0 bytes sent, 0 bytes received)"), 1);
}

#[tokio::test]
async fn backend_close_closes_client_and_reports_counters() {
    let backend = ScriptedBackend::spawn(Script::close(b"PONG", Duration::from_millis(20)))
        .await
        .unwrap();

    let relay = RelayHandle::spawn(vec![backend.addr], session_config(RACE_WINDOW))
        .await
        .unwrap();

    let mut client = relay.connect().await.unwrap();
    client.write_all(b"PING").await.unwrap();

    let mut received = Vec::new();
    bounded(client.read_to_end(&mut received)).await.unwrap();
    assert_eq!(received, b"PONG");

    assert!(eventually(Duration::from_secs(2), || relay.sessions_relayed() == 1).await);
    assert_eq!(relay.log.count("info", "Closed ("), 1);
    assert_eq!(relay.log.count("info", "Closed (4 bytes sent, 4 bytes received)"), 1);
    assert_eq!(relay.log.count("warn", ""), 0);
}

#[tokio::test]
async fn bytes_survive_the_race_relay_boundary() {
    let winner = ScriptedBackend::spawn(Script::echo(b"HELLO", Duration::from_millis(10)))
        .await
        .unwrap();

    let relay = RelayHandle::spawn(vec![winner.addr], session_config(RACE_WINDOW))
        .await
        .unwrap();

    let mut client = relay.connect().await.unwrap();
    client.write_all(b"first").await.unwrap();

    let mut greeting = [0u8; 5];
    bounded(client.read_exact(&mut greeting)).await.unwrap();
    assert_eq!(&greeting, b"HELLO");

    let mut expected = Vec::new();
    for i in 0..50u32 {
        let chunk = format!("chunk-{i:04};");
        client.write_all(chunk.as_bytes()).await.unwrap();
        expected.extend_from_slice(chunk.as_bytes());
    }

    let mut echoed = vec![0u8; expected.len()];
    bounded(client.read_exact(&mut echoed)).await.unwrap();
    assert_eq!(echoed, expected);

    drop(client);
    assert!(eventually(Duration::from_secs(2), || relay.sessions_relayed() == 1).await);

    let sent = 5 + expected.len();
    let received = 5 + expected.len();
    assert_eq!(
        relay.log.count(
            "info",
            &format!("Closed ({sent} bytes sent, {received} bytes received)")
        ),
        1
    );
    assert_eq!(winner.first_payloads(), vec![b"first".to_vec()]);
    assert_eq!(winner.bytes_after_first(), expected.len() as u64);
}

#[tokio::test]
async fn first_candidate_in_order_wins_when_several_answer() {
    let slow_first = ScriptedBackend::spawn(Script::echo(b"ONE", Duration::from_millis(150)))
        .await
        .unwrap();
    let fast_second = ScriptedBackend::spawn(Script::echo(b"TWO", Duration::ZERO))
        .await
        .unwrap();

    let relay = RelayHandle::spawn(
        vec![slow_first.addr, fast_second.addr],
        session_config(RACE_WINDOW),
    )
    .await
    .unwrap();

    let mut client = relay.connect().await.unwrap();
    client.write_all(b"who").await.unwrap();

    let mut buf = [0u8; 3];
    bounded(client.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"ONE");

    // Traffic after the race goes to the winner only.
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    bounded(client.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"ping");

    assert!(eventually(Duration::from_secs(2), || fast_second.closed_by_relay() == 1).await);
    assert_eq!(fast_second.bytes_after_first(), 0);
    assert_eq!(relay.log.count("warn", "Multiple candidates answered"), 1);
}

#[tokio::test]
async fn unreachable_candidates_are_skipped() {
    let dead = dead_addr().await;
    let live = ScriptedBackend::spawn(Script::echo(b"UP", Duration::ZERO))
        .await
        .unwrap();

    let relay = RelayHandle::spawn(vec![dead, live.addr], session_config(RACE_WINDOW))
        .await
        .unwrap();

    let mut client = relay.connect().await.unwrap();
    client.write_all(b"hi").await.unwrap();

    let mut buf = [0u8; 2];
    bounded(client.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"UP");
    assert_eq!(
        relay.log.count("warn", &format!("Remote connection to {dead} failed")),
        1
    );
}

#[tokio::test]
async fn all_candidates_unreachable_aborts() {
    let relay = RelayHandle::spawn(
        vec![dead_addr().await, dead_addr().await],
        session_config(RACE_WINDOW),
    )
    .await
    .unwrap();

    let mut client = relay.connect().await.unwrap();
    client.write_all(b"hi").await.unwrap();

    let mut received = Vec::new();
    bounded(client.read_to_end(&mut received)).await.unwrap();
    assert!(received.is_empty());
    assert!(eventually(Duration::from_secs(2), || relay.sessions_aborted() == 1).await);
}

#[tokio::test]
async fn client_hanging_up_early_dials_nothing() {
    let backend = ScriptedBackend::spawn(Script::echo(b"X", Duration::ZERO))
        .await
        .unwrap();

    let relay = RelayHandle::spawn(vec![backend.addr], session_config(RACE_WINDOW))
        .await
        .unwrap();

    let client = relay.connect().await.unwrap();
    drop(client);

    assert!(eventually(Duration::from_secs(2), || relay.sessions_aborted() == 1).await);
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn drop_policy_still_relays() {
    let backend = ScriptedBackend::spawn(Script::echo(b"OK", Duration::ZERO))
        .await
        .unwrap();

    let mut config = session_config(RACE_WINDOW);
    config.broadcast_failure = BroadcastFailurePolicy::DropCandidate;
    config.disable_nagle = true;
    config.hex_logging = true;

    let relay = RelayHandle::spawn(vec![backend.addr], config).await.unwrap();

    let mut client = relay.connect().await.unwrap();
    client.write_all(b"go").await.unwrap();

    let mut buf = [0u8; 2];
    bounded(client.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"OK");

    client.write_all(b"AB").await.unwrap();
    bounded(client.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"AB");

    // Trace lines carry the hex-encoded payload.
    assert!(eventually(Duration::from_secs(2), || relay.log.count("trace", "4142") >= 1).await);
}
