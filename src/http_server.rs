// This file is part of jgwd, the journal gateway daemon
// Copyright (C) 2023 Pengutronix e.K.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::env;
use std::net::TcpListener;
use std::os::unix::io::FromRawFd;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use log::info;
use nix::unistd::getpid;
use tide::{Request, Server};
use tide_rustls::TlsListener;

use crate::error::GatewayError;

const FALLBACK_PORT: &str = "[::]:19531";

// First fd the service manager passes down, by protocol.
const SD_LISTEN_FDS_START: i32 = 3;

pub struct TlsConfig {
    pub key: PathBuf,
    pub cert: PathBuf,
}

pub struct HttpServer {
    listener: TcpListener,
    tls: Option<TlsConfig>,
    pub server: Server<()>,
}

impl HttpServer {
    pub fn new(tls: Option<TlsConfig>) -> Result<Self> {
        let listener = match activation_socket()? {
            Some(listener) => {
                info!("Adopted listen socket from the service manager");
                listener
            }
            None => {
                // This, somewhat confusingly also listens on 0.0.0.0 and
                // not only on IPv6.
                TcpListener::bind(FALLBACK_PORT).with_context(|| {
                    format!("Could not bind to {FALLBACK_PORT}, is another gateway running?")
                })?
            }
        };

        let mut server = tide::new();

        // Only GET is routed at all; everything unknown gets a uniform
        // plain text 404.
        server.at("*").get(not_found);

        Ok(Self {
            listener,
            tls,
            server,
        })
    }

    pub async fn serve(self) -> Result<()> {
        match self.tls {
            Some(tls) => {
                info!("Serving HTTPS");

                self.server
                    .listen(
                        TlsListener::build()
                            .tcp(self.listener)
                            .cert(tls.cert)
                            .key(tls.key),
                    )
                    .await?;
            }
            None => {
                info!("Serving HTTP");

                self.server.listen(vec![self.listener]).await?;
            }
        }

        Ok(())
    }
}

async fn not_found(_req: Request<()>) -> tide::Result {
    Ok(GatewayError::NotFound.into_response())
}

/// Adopt the listen socket if the service manager passed exactly one
/// down, sd_listen_fds(3) style.
fn activation_socket() -> Result<Option<TcpListener>> {
    let listen_pid: i32 = match env::var("LISTEN_PID").ok().and_then(|v| v.parse().ok()) {
        Some(pid) => pid,
        None => return Ok(None),
    };

    if listen_pid != getpid().as_raw() {
        return Ok(None);
    }

    let n_fds: u32 = match env::var("LISTEN_FDS").ok().and_then(|v| v.parse().ok()) {
        Some(n) => n,
        None => return Ok(None),
    };

    match n_fds {
        0 => Ok(None),
        1 => {
            let listener = unsafe { TcpListener::from_raw_fd(SD_LISTEN_FDS_START) };
            Ok(Some(listener))
        }
        n => bail!("Received {n} sockets from the service manager, expected exactly one"),
    }
}
