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

use async_std::channel::bounded;
use async_std::io::BufReader;
use async_std::prelude::*;
use async_std::task::spawn_blocking;

use tide::http::Body;
use tide::{Request, Response, Server};

use crate::error::GatewayError;
use crate::journal::{Journal, OpenOptions};
use crate::machine;
use crate::output::OutputMode;
use crate::request::{self, RequestOptions};
use crate::stream::{self, BodyReader, EntryStream};

pub fn serve(server: &mut Server<()>) {
    server
        .at("/entries")
        .get(|req: Request<()>| async move { entries_response(req, false).await });

    // Shorthand for "everything since this boot".
    server
        .at("/boot")
        .get(|req: Request<()>| async move { entries_response(req, true).await });
}

async fn entries_response(req: Request<()>, current_boot: bool) -> tide::Result {
    let mut opts = match request::parse(&req) {
        Ok(opts) => opts,
        Err(e) => return Ok(e.into_response()),
    };

    if current_boot {
        match machine::boot_id() {
            Ok(boot_id) => opts.matches.push(("_BOOT_ID".to_string(), boot_id)),
            Err(e) => {
                return Ok(GatewayError::Server(format!(
                    "Failed to look up the boot id: {e}"
                ))
                .into_response())
            }
        }
    }

    let (response_tx, mut response_rx) = bounded::<Response>(1);

    // The journal handle is not Send, so it has to be opened in the
    // thread that streams from it. Errors during open and seek should
    // still turn into a proper HTTP status, which is why this channel
    // contraption sends a single response back, either the error or the
    // already-streaming success.
    spawn_blocking(move || {
        let entry_stream = match open_entry_stream(&opts) {
            Ok(entry_stream) => entry_stream,
            Err(e) => {
                let _ = response_tx.try_send(e.into_response());
                return;
            }
        };

        let (tx, rx) = bounded(8);

        let body = Body::from_reader(BufReader::new(BodyReader::new(rx)), None);

        let mut builder = Response::builder(200)
            .body(body)
            .content_type(opts.mode.mime());

        if opts.mode == OutputMode::JsonSse {
            builder = builder.header("Cache-Control", "no-cache");
        }

        if response_tx.try_send(builder.build()).is_err() {
            // The Future handling the get request was canceled, the
            // response Receiver dropped and thus the channel closed.
            return;
        }

        stream::pump(entry_stream, tx);
    });

    let resp = response_rx.next().await.unwrap_or_else(|| {
        GatewayError::Server("Journal reader stopped unexpectedly".to_string()).into_response()
    });

    Ok(resp)
}

fn open_entry_stream(opts: &RequestOptions) -> Result<EntryStream, GatewayError> {
    let mut journal = open_journal()?;

    for (key, value) in &opts.matches {
        journal
            .match_add(key, value)
            .map_err(|e| GatewayError::Server(format!("Failed to add journal match: {e}")))?;
    }

    stream::seek_for(&mut journal, opts)?;

    Ok(EntryStream::new(journal, opts))
}

pub(crate) fn open_journal() -> Result<Journal, GatewayError> {
    OpenOptions::default()
        .system(true)
        .local_only(true)
        .open()
        .map_err(|e| GatewayError::Server(format!("Failed to open journal file(s): {e}")))
}
