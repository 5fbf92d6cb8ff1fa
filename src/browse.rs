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

use log::warn;
use tide::http::Body;
use tide::{Request, Response, Server};

use crate::error::GatewayError;

#[cfg(any(test, feature = "demo_mode"))]
const BROWSE_ASSET: &str = "web/browse.html";

#[cfg(not(any(test, feature = "demo_mode")))]
const BROWSE_ASSET: &str = "/usr/share/jgwd/browse.html";

const REDIRECT_BODY: &str =
    "<html><body>Please continue to the <a href=\"/browse\">journal browser</a>.</body></html>\n";

pub fn serve(server: &mut Server<()>) {
    server.at("/").get(redirect_response);
    server.at("/browse").get(browse_response);
}

async fn redirect_response(_req: Request<()>) -> tide::Result {
    let resp = Response::builder(301)
        .header("Location", "/browse")
        .body(REDIRECT_BODY)
        .content_type("text/html")
        .build();

    Ok(resp)
}

async fn browse_response(_req: Request<()>) -> tide::Result {
    // The browser asset is an opaque file maintained elsewhere. Not
    // having it is a deployment problem, not a reason to crash.
    let body = match Body::from_file(BROWSE_ASSET).await {
        Ok(body) => body,
        Err(e) => {
            warn!("Can not serve {BROWSE_ASSET}: {e}");
            return Ok(GatewayError::NotFound.into_response());
        }
    };

    let resp = Response::builder(200)
        .body(body)
        .content_type("text/html")
        .build();

    Ok(resp)
}
