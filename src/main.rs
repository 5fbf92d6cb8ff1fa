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

use std::path::PathBuf;
use std::process::exit;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::Parser;
use log::{error, info};

mod browse;
mod entries;
mod error;
mod fields;
mod http_server;
mod journal;
mod machine;
mod output;
mod request;
mod stream;

use http_server::{HttpServer, TlsConfig};

#[derive(Parser)]
#[command(version, about = "HTTP gateway to the system journal")]
struct Args {
    /// PEM encoded server key, enables TLS together with --cert
    #[arg(long, value_name = "PATH", requires = "cert")]
    key: Option<PathBuf>,

    /// PEM encoded server certificate, enables TLS together with --key
    #[arg(long, value_name = "PATH", requires = "key")]
    cert: Option<PathBuf>,
}

fn init(args: Args) -> Result<HttpServer> {
    let tls = match (args.key, args.cert) {
        (Some(key), Some(cert)) => Some(TlsConfig { key, cert }),
        _ => None,
    };

    let mut http_server = HttpServer::new(tls)?;

    // Each endpoint registers its own routes on the shared server.
    browse::serve(&mut http_server.server);
    entries::serve(&mut http_server.server);
    fields::serve(&mut http_server.server);
    machine::serve(&mut http_server.server);

    Ok(http_server)
}

#[async_std::main]
async fn main() -> Result<()> {
    // clap's default exit codes do not match ours: anything that is not
    // an explicit --help / --version should exit 1.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();

            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit(0),
                _ => exit(1),
            }
        }
    };

    pretty_env_logger::init();

    match init(args) {
        Ok(http_server) => {
            info!("Setup complete. Handling requests");

            http_server.serve().await
        }
        Err(e) => {
            error!("Failed to start jgwd: {e}");

            exit(1);
        }
    }
}
