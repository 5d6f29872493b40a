// Copyright (C) 2024  dbgp-proxy contributors
//
// This file is part of dbgp-proxy.
//
// dbgp-proxy is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Integration tests against real loopback TCP sockets, covering the
//! invariants and scenarios from the rendezvous proxy's test plan.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dbgp_proxy::metrics::Metrics;
use dbgp_proxy::registration;
use dbgp_proxy::registry::Registry;
use dbgp_proxy::session;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

struct TestProxy {
    ide_addr: SocketAddr,
    engine_addr: SocketAddr,
    /// Fires once per engine session after `handle_session` returns, so
    /// tests can confirm a session actually terminates instead of only
    /// observing one side's socket close.
    session_done_rx: mpsc::UnboundedReceiver<()>,
}

async fn spawn_proxy() -> TestProxy {
    let registry = Registry::new();
    let metrics = Arc::new(Metrics::new());

    let ide_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ide_addr = ide_listener.local_addr().unwrap();
    let engine_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let engine_addr = engine_listener.local_addr().unwrap();
    let engine_host = engine_addr.ip().to_string();

    {
        let registry = registry.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match ide_listener.accept().await {
                    Ok(v) => v,
                    Err(_) => break,
                };
                let registry = registry.clone();
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    registration::handle_connection(stream, peer, registry, metrics, engine_addr)
                        .await;
                });
            }
        });
    }

    let (session_done_tx, session_done_rx) = mpsc::unbounded_channel();

    {
        let registry = registry.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _peer) = match engine_listener.accept().await {
                    Ok(v) => v,
                    Err(_) => break,
                };
                let registry = registry.clone();
                let metrics = metrics.clone();
                let engine_host = engine_host.clone();
                let session_done_tx = session_done_tx.clone();
                tokio::spawn(async move {
                    session::handle_session(
                        stream,
                        registry,
                        metrics,
                        engine_host,
                        Duration::from_secs(5),
                    )
                    .await;
                    let _ = session_done_tx.send(());
                });
            }
        });
    }

    TestProxy {
        ide_addr,
        engine_addr,
        session_done_rx,
    }
}

async fn write_framed(stream: &mut TcpStream, body: &str) {
    let framed = format!("{}\0{}\0", body.len(), body);
    stream.write_all(framed.as_bytes()).await.unwrap();
}

async fn read_framed(stream: &mut TcpStream) -> String {
    let mut len_str = String::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.unwrap();
        if byte[0] == 0 {
            break;
        }
        len_str.push(byte[0] as char);
    }
    let len: usize = len_str.parse().unwrap();
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    stream.read_exact(&mut byte).await.unwrap();
    assert_eq!(byte[0], 0, "frame must end with a trailing NUL");
    String::from_utf8(body).unwrap()
}

async fn send_registration_command(ide_addr: SocketAddr, command: &str) -> String {
    let mut stream = TcpStream::connect(ide_addr).await.unwrap();
    stream.write_all(command.as_bytes()).await.unwrap();
    read_framed(&mut stream).await
}

#[tokio::test]
async fn s1_successful_registration() {
    let proxy = spawn_proxy().await;
    let reply = send_registration_command(proxy.ide_addr, "proxyinit -p 9000 -k MYKEY").await;
    assert!(reply.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n"));
    assert!(reply.contains("proxyinit success=\"1\""));
    assert!(reply.contains("idekey=\"MYKEY\""));
    assert!(reply.contains(&format!("port=\"{}\"", proxy.engine_addr.port())));
}

#[tokio::test]
async fn s2_duplicate_key_is_rejected() {
    let proxy = spawn_proxy().await;
    let _ = send_registration_command(proxy.ide_addr, "proxyinit -p 9000 -k DUPKEY").await;
    let reply = send_registration_command(proxy.ide_addr, "proxyinit -p 9100 -k DUPKEY").await;
    assert!(reply.contains("proxyinit success=\"0\""));
    assert!(reply.contains("<error id=\"3\">"));
    assert!(reply.contains("IDE Key already exists."));
}

#[tokio::test]
async fn key_uniqueness_allows_reregistration_after_proxystop() {
    let proxy = spawn_proxy().await;
    let _ = send_registration_command(proxy.ide_addr, "proxyinit -p 9000 -k REUSED").await;
    let stop_reply = send_registration_command(proxy.ide_addr, "proxystop -k REUSED").await;
    assert!(stop_reply.contains("success=\"1\""));
    let reply = send_registration_command(proxy.ide_addr, "proxyinit -p 9100 -k REUSED").await;
    assert!(reply.contains("success=\"1\""));
}

#[tokio::test]
async fn s3_missing_key_is_invalid_options() {
    let proxy = spawn_proxy().await;
    let reply = send_registration_command(proxy.ide_addr, "proxyinit -p 9000").await;
    assert!(reply.contains("proxyinit success=\"0\""));
    assert!(reply.contains("<error id=\"3\">"));
}

#[tokio::test]
async fn s4_unknown_command_is_unimplemented() {
    let proxy = spawn_proxy().await;
    let reply = send_registration_command(proxy.ide_addr, "foobar arg1 arg2").await;
    assert!(reply.contains("proxyerror success=\"0\""));
    assert!(reply.contains("<error id=\"4\">"));
    assert!(reply.contains("Unknown command [foobar]"));
}

#[tokio::test]
async fn echo_property_proxystop_on_unknown_key() {
    let proxy = spawn_proxy().await;
    let reply = send_registration_command(proxy.ide_addr, "proxystop -k NEVERREGISTERED").await;
    assert!(reply.contains("proxystop success=\"1\""));
    assert!(reply.contains("idekey=\"NEVERREGISTERED\""));
}

#[tokio::test]
async fn s5_session_happy_path_rewrites_init_and_forwards_bytes() {
    let proxy = spawn_proxy().await;

    let fake_ide_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fake_ide_port = fake_ide_listener.local_addr().unwrap().port();

    let reply = send_registration_command(
        proxy.ide_addr,
        &format!("proxyinit -p {fake_ide_port} -k MYKEY"),
    )
    .await;
    assert!(reply.contains("success=\"1\""));

    let accept_fut = fake_ide_listener.accept();
    let mut engine_stream = TcpStream::connect(proxy.engine_addr).await.unwrap();
    write_framed(
        &mut engine_stream,
        r#"<init idekey="MYKEY" fileuri="file:///x.php"/>"#,
    )
    .await;

    let (mut ide_stream, _) = accept_fut.await.unwrap();
    let received_init = read_framed(&mut ide_stream).await;

    assert!(received_init.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n"));
    assert!(received_init.contains(r#"idekey="MYKEY""#));
    assert!(received_init.contains(r#"fileuri="file:///x.php""#));
    assert!(received_init.contains(r#"proxied="127.0.0.1""#));
    assert!(received_init.contains("hostname=\""));

    engine_stream.write_all(b"STEP_OVER\n").await.unwrap();
    let mut buf = [0u8; 16];
    let n = ide_stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"STEP_OVER\n");

    let payload: Vec<u8> = (0..=255u16).cycle().take(4096).map(|b| b as u8).collect();
    ide_stream.write_all(&payload).await.unwrap();
    let mut received = vec![0u8; payload.len()];
    engine_stream.read_exact(&mut received).await.unwrap();
    assert_eq!(received, payload);
}

#[tokio::test]
async fn s6_unregistered_key_closes_engine_connection() {
    let proxy = spawn_proxy().await;
    let mut engine_stream = TcpStream::connect(proxy.engine_addr).await.unwrap();
    write_framed(&mut engine_stream, r#"<init idekey="NOPE"/>"#).await;

    let mut buf = [0u8; 16];
    let n = engine_stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "engine connection should be closed for an unknown idekey");
}

#[tokio::test]
async fn s7_dial_failure_self_heals_registry() {
    let proxy = spawn_proxy().await;

    let dead_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = dead_listener.local_addr().unwrap().port();
    drop(dead_listener);

    let reply = send_registration_command(
        proxy.ide_addr,
        &format!("proxyinit -p {dead_port} -k MYKEY"),
    )
    .await;
    assert!(reply.contains("success=\"1\""));

    let mut engine_stream = TcpStream::connect(proxy.engine_addr).await.unwrap();
    write_framed(&mut engine_stream, r#"<init idekey="MYKEY"/>"#).await;
    let mut buf = [0u8; 16];
    let n = engine_stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);

    tokio::time::sleep(Duration::from_millis(50)).await;

    let second_reply = send_registration_command(
        proxy.ide_addr,
        &format!("proxyinit -p {dead_port} -k MYKEY"),
    )
    .await;
    assert!(
        second_reply.contains("success=\"1\""),
        "registry entry should have been purged after the failed dial, got: {second_reply}"
    );
}

#[tokio::test]
async fn lifetime_coupling_closing_engine_closes_ide_side() {
    let mut proxy = spawn_proxy().await;
    let fake_ide_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fake_ide_port = fake_ide_listener.local_addr().unwrap().port();

    send_registration_command(
        proxy.ide_addr,
        &format!("proxyinit -p {fake_ide_port} -k MYKEY"),
    )
    .await;

    let accept_fut = fake_ide_listener.accept();
    let mut engine_stream = TcpStream::connect(proxy.engine_addr).await.unwrap();
    write_framed(&mut engine_stream, r#"<init idekey="MYKEY"/>"#).await;

    let (mut ide_stream, _) = accept_fut.await.unwrap();
    read_framed(&mut ide_stream).await;

    drop(engine_stream);

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), ide_stream.read(&mut buf))
        .await
        .expect("IDE side should observe closure promptly")
        .unwrap();
    assert_eq!(n, 0, "closing the engine side should close the IDE side");

    // The IDE peer never closed its own socket; without forcing a full
    // close on the losing side, `ide_to_engine` would still be blocked on
    // `ide_stream`'s read and the session task would never finish.
    tokio::time::timeout(Duration::from_secs(2), proxy.session_done_rx.recv())
        .await
        .expect("session task should terminate once one direction closes")
        .expect("session_done_tx should not have been dropped without sending");
}

#[tokio::test]
async fn lifetime_coupling_idle_ide_peer_does_not_leak_the_session_task() {
    let mut proxy = spawn_proxy().await;
    let fake_ide_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fake_ide_port = fake_ide_listener.local_addr().unwrap().port();

    send_registration_command(
        proxy.ide_addr,
        &format!("proxyinit -p {fake_ide_port} -k MYKEY"),
    )
    .await;

    let accept_fut = fake_ide_listener.accept();
    let mut engine_stream = TcpStream::connect(proxy.engine_addr).await.unwrap();
    write_framed(&mut engine_stream, r#"<init idekey="MYKEY"/>"#).await;

    let (ide_stream, _) = accept_fut.await.unwrap();
    // Leave `ide_stream` open and unread from: a peer that neither reads
    // nor writes after the engine hangs up.
    drop(engine_stream);

    tokio::time::timeout(Duration::from_secs(2), proxy.session_done_rx.recv())
        .await
        .expect("session task must not hang on a half-closed, unresponsive IDE peer")
        .expect("session_done_tx should not have been dropped without sending");

    drop(ide_stream);
}
