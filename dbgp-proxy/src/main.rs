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

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use structopt::StructOpt;
use tokio::net::TcpListener;

use dbgp_proxy::config::{Args, Config};
use dbgp_proxy::metrics::Metrics;
use dbgp_proxy::registration;
use dbgp_proxy::registry::Registry;
use dbgp_proxy::session;

use ii_logging::macros::*;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_RUNTIME_ERROR: i32 = 2;
const EXIT_DEPENDENCY_FAILURE: i32 = 3;

fn main() {
    let args = Args::from_args();
    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let mut logging_config =
        ii_logging::LoggingConfig::for_app(ii_logging::LoggingConfig::ASYNC_LOGGER_DRAIN_CHANNEL_SIZE);
    logging_config.level = config.log_level;
    let _flush_guard = ii_logging::setup(logging_config);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    };

    let exit_code = runtime.block_on(run(config));
    std::process::exit(exit_code);
}

async fn run(config: Config) -> i32 {
    ii_async_utils::setup_panic_handling();

    info!("starting dbgp-proxy"; "ide" => %config.ide_addr, "dbg" => %config.engine_addr);

    let registry = Registry::new();
    let metrics = Arc::new(Metrics::new());
    let halt = ii_async_utils::HaltHandle::arc();

    let ide_listener = match bind_listener(config.ide_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("{:#}", e);
            return EXIT_DEPENDENCY_FAILURE;
        }
    };
    let engine_listener = match bind_listener(config.engine_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("{:#}", e);
            return EXIT_DEPENDENCY_FAILURE;
        }
    };

    spawn_ide_listener(&halt, ide_listener, registry.clone(), metrics.clone(), config.engine_addr);
    spawn_engine_listener(
        &halt,
        engine_listener,
        registry,
        metrics,
        config.engine_addr.ip().to_string(),
        config.init_packet_timeout,
    );

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, halting");

    if let Err(e) = halt.halt(Duration::from_secs(5)).await {
        warn!("shutdown did not complete cleanly: {}", e);
    }

    EXIT_OK
}

async fn bind_listener(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind listener on {addr}"))
}

fn spawn_ide_listener(
    halt: &Arc<ii_async_utils::HaltHandle>,
    listener: TcpListener,
    registry: Registry,
    metrics: Arc<Metrics>,
    engine_addr: SocketAddr,
) {
    let mut tripwire = halt.subscribe();
    halt.spawn("ide-listener", async move {
        loop {
            tokio::select! {
                _ = &mut tripwire => {
                    info!("IDE listener stopping");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let registry = registry.clone();
                            let metrics = metrics.clone();
                            tokio::spawn(async move {
                                registration::handle_connection(stream, peer, registry, metrics, engine_addr).await;
                            });
                        }
                        Err(e) => warn!("accept error on IDE listener: {}", e),
                    }
                }
            }
        }
    });
}

fn spawn_engine_listener(
    halt: &Arc<ii_async_utils::HaltHandle>,
    listener: TcpListener,
    registry: Registry,
    metrics: Arc<Metrics>,
    engine_listen_host: String,
    init_packet_timeout: Duration,
) {
    let mut tripwire = halt.subscribe();
    halt.spawn("engine-listener", async move {
        loop {
            tokio::select! {
                _ = &mut tripwire => {
                    info!("engine listener stopping");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _peer)) => {
                            let registry = registry.clone();
                            let metrics = metrics.clone();
                            let engine_listen_host = engine_listen_host.clone();
                            tokio::spawn(async move {
                                session::handle_session(
                                    stream,
                                    registry,
                                    metrics,
                                    engine_listen_host,
                                    init_packet_timeout,
                                )
                                .await;
                            });
                        }
                        Err(e) => warn!("accept error on engine listener: {}", e),
                    }
                }
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            warn!("failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
