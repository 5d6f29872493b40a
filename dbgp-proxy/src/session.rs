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

//! The engine ↔ IDE session: read and rewrite the init packet, dial the
//! registered IDE, then splice the two sockets together verbatim.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use ii_async_utils::FutureExt;
use ii_logging::macros::*;

use crate::framing::{read_one_frame, DbgpCodec};
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::xmlinit;
use tokio_util::codec::Encoder;

/// Drive one engine connection from `AWAITING_INIT` through to the end of
/// `FORWARDING`. Never propagates an error to the caller: every failure
/// path here just logs and returns, closing the engine socket on drop.
pub async fn handle_session(
    mut engine: TcpStream,
    registry: Registry,
    metrics: Arc<Metrics>,
    engine_listen_host: String,
    init_packet_timeout: Duration,
) {
    let peer = match engine.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            debug!("could not read engine peer address: {}", e);
            return;
        }
    };

    let (body, leftover) = match read_one_frame(&mut engine, DbgpCodec::MAX_FRAME_LEN)
        .timeout(init_packet_timeout)
        .await
    {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            debug!("failed to read init packet from {}: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!("timed out waiting for init packet from {}", peer);
            return;
        }
    };

    let idekey = match xmlinit::extract_idekey(&body) {
        Ok(key) => key,
        Err(e) => {
            debug!("malformed init packet from {}: {}", peer, e);
            return;
        }
    };

    let entry = match registry.lookup(&idekey) {
        Some(entry) => entry,
        None => {
            debug!("engine {} sent unknown idekey {:?}", peer, idekey);
            return;
        }
    };

    let proxied_addr = peer.ip().to_string();
    let mutated = match xmlinit::mutate_init_packet(&body, &proxied_addr, &engine_listen_host) {
        Ok(m) => m,
        Err(e) => {
            debug!("failed to rewrite init packet from {}: {}", peer, e);
            return;
        }
    };

    let ide_addr = std::net::SocketAddr::new(entry.ide.host, entry.ide.port);
    let mut ide = match TcpStream::connect(ide_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                "failed to dial IDE {} for idekey {:?}: {}, purging registration",
                ide_addr, idekey, e
            );
            registry.remove(&idekey);
            metrics.inc_sessions_failed_dial();
            return;
        }
    };

    if let Err(e) = write_frame(&mut ide, &mutated).await {
        warn!("failed to forward init packet to IDE {}: {}", ide_addr, e);
        return;
    }

    metrics.inc_sessions_established();
    forward(engine, ide, leftover).await;
    metrics.inc_sessions_closed();
}

async fn write_frame(stream: &mut TcpStream, body: &str) -> std::io::Result<()> {
    let mut codec = DbgpCodec::new();
    let mut out = BytesMut::new();
    Encoder::<&str>::encode(&mut codec, body, &mut out)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    stream.write_all(&out).await
}

/// Splice the two sockets byte-for-byte, with no further framing or
/// parsing. `leftover` is whatever the engine already sent past the end of
/// the init frame (read as part of accumulating that frame) and must be
/// forwarded to the IDE before the raw copy begins.
///
/// Whichever direction finishes first (EOF, error, or a half-close that its
/// peer never reciprocates) ends the session outright rather than leaving
/// the other direction blocked on a read that may never return: both
/// sockets are dropped as soon as one copy task completes, which forces the
/// still-blocked `read()` on the other to unblock with an error or EOF.
async fn forward(mut engine: TcpStream, mut ide: TcpStream, leftover: BytesMut) {
    if !leftover.is_empty() {
        if let Err(e) = ide.write_all(&leftover).await {
            debug!("failed to forward buffered engine bytes to IDE: {}", e);
            return;
        }
    }

    let (mut engine_rx, mut engine_tx) = engine.split();
    let (mut ide_rx, mut ide_tx) = ide.split();

    tokio::select! {
        _ = copy_and_shutdown(&mut engine_rx, &mut ide_tx) => {}
        _ = copy_and_shutdown(&mut ide_rx, &mut engine_tx) => {}
    }

    // Dropping both streams here closes whichever direction `select!` left
    // running, instead of waiting on a peer that may never close its end.
}

async fn copy_and_shutdown<R, W>(reader: &mut R, writer: &mut W)
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    if let Err(e) = tokio::io::copy(reader, writer).await {
        debug!("forwarding copy ended: {}", e);
    }
    let _ = writer.shutdown().await;
}
