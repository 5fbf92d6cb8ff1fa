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

use std::io;

use thiserror::Error;
use tide::Response;

/// Request failures and their HTTP shape.
///
/// Every error response is plain text with a trailing newline so clients
/// (and humans with curl) get something readable even mid-script.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Parse(String),
    #[error("Not found.")]
    NotFound,
    #[error("{0}")]
    Server(String),
    #[error("Out of memory.")]
    Oom,
}

impl GatewayError {
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::Parse(_) => 400,
            GatewayError::NotFound => 404,
            GatewayError::Server(_) => 500,
            GatewayError::Oom => 503,
        }
    }

    pub fn into_response(self) -> Response {
        Response::builder(self.status())
            .body(format!("{self}\n"))
            .build()
    }
}

impl From<io::Error> for GatewayError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::OutOfMemory => GatewayError::Oom,
            // Malformed cursors and the like surface as InvalidInput from
            // the journal adapter and are the client's fault.
            io::ErrorKind::InvalidInput => GatewayError::Parse(e.to_string()),
            _ => GatewayError::Server(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use async_std::task::block_on;

    use super::GatewayError;

    #[test]
    fn status_mapping() {
        assert_eq!(GatewayError::Parse("nope".into()).status(), 400);
        assert_eq!(GatewayError::NotFound.status(), 404);
        assert_eq!(GatewayError::Server("boom".into()).status(), 500);
        assert_eq!(GatewayError::Oom.status(), 503);
    }

    #[test]
    fn oom_body_is_exact() {
        let mut resp = GatewayError::Oom.into_response();
        let body = block_on(resp.take_body().into_string()).unwrap();
        assert_eq!(body, "Out of memory.\n");
    }

    #[test]
    fn io_error_kinds() {
        let oom = io::Error::new(io::ErrorKind::OutOfMemory, "alloc");
        assert!(matches!(GatewayError::from(oom), GatewayError::Oom));

        let bad = io::Error::new(io::ErrorKind::InvalidInput, "cursor");
        assert!(matches!(GatewayError::from(bad), GatewayError::Parse(_)));

        let other = io::Error::new(io::ErrorKind::PermissionDenied, "journal");
        assert!(matches!(GatewayError::from(other), GatewayError::Server(_)));
    }
}
