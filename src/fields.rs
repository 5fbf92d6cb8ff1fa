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

use crate::entries::open_journal;
use crate::error::GatewayError;
use crate::output::OutputMode;
use crate::stream::{self, BodyReader, FieldStream};

pub fn serve(server: &mut Server<()>) {
    server.at("/fields/:field").get(fields_response);
}

async fn fields_response(req: Request<()>) -> tide::Result {
    let field = match req.param("field") {
        Ok(field) => field.to_string(),
        Err(_) => return Ok(GatewayError::NotFound.into_response()),
    };

    if !field_name_valid(&field) {
        return Ok(
            GatewayError::Parse(format!("Invalid field name \"{field}\"")).into_response(),
        );
    }

    // Of the four output modes only Json applies here; everything else
    // collapses to the plain text form.
    let json = OutputMode::from_accept(req.header("Accept").map(|v| v.last().as_str()))
        == OutputMode::Json;

    let (response_tx, mut response_rx) = bounded::<Response>(1);

    // Same thread-bound journal contraption as for /entries.
    spawn_blocking(move || {
        let field_stream = match open_field_stream(&field, json) {
            Ok(field_stream) => field_stream,
            Err(e) => {
                let _ = response_tx.try_send(e.into_response());
                return;
            }
        };

        let (tx, rx) = bounded(8);

        let body = Body::from_reader(BufReader::new(BodyReader::new(rx)), None);

        let resp = Response::builder(200)
            .body(body)
            .content_type(if json { "application/json" } else { "text/plain" })
            .build();

        if response_tx.try_send(resp).is_err() {
            return;
        }

        stream::pump(field_stream, tx);
    });

    let resp = response_rx.next().await.unwrap_or_else(|| {
        GatewayError::Server("Journal reader stopped unexpectedly".to_string()).into_response()
    });

    Ok(resp)
}

fn open_field_stream(field: &str, json: bool) -> Result<FieldStream, GatewayError> {
    let mut journal = open_journal()?;

    journal
        .query_unique(field)
        .map_err(|e| GatewayError::Server(format!("Failed to query unique values: {e}")))?;

    Ok(FieldStream::new(journal, json, None))
}

fn field_name_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return false;
    }

    name.chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}
