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

use std::borrow::Cow;

use tide::Request;

use crate::error::GatewayError;
use crate::machine;
use crate::output::OutputMode;

/// Everything a request can say about the entry window it wants:
/// the output mode, an optional start cursor, a signed skip relative to
/// the seek point, an optional entry budget, the follow / discrete flags
/// and the field matches to apply to the journal.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub mode: OutputMode,
    pub cursor: Option<String>,
    pub n_skip: i64,
    pub n_entries: Option<u64>,
    pub follow: bool,
    pub discrete: bool,
    pub matches: Vec<(String, String)>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self {
            mode: OutputMode::Short,
            cursor: None,
            n_skip: 0,
            n_entries: None,
            follow: false,
            discrete: false,
            matches: Vec::new(),
        }
    }
}

pub fn parse(req: &Request<()>) -> Result<RequestOptions, GatewayError> {
    let mut opts = RequestOptions::new();

    opts.mode = OutputMode::from_accept(req.header("Accept").map(|v| v.last().as_str()));

    if let Some(range) = req.header("Range") {
        parse_range(range.last().as_str(), &mut opts)?;
    }

    parse_query(req.url().query_pairs(), &mut opts)?;

    if opts.discrete && opts.cursor.is_none() {
        return Err(GatewayError::Parse(
            "Discrete seeks require a cursor specification".to_string(),
        ));
    }

    Ok(opts)
}

/// Parse a `Range: entries=<cursor>[:<n_skip>[:<n_entries>]]` header.
///
/// A missing header or one with a different range unit is not an error,
/// the request simply starts at the head of the journal.
pub fn parse_range(header: &str, opts: &mut RequestOptions) -> Result<(), GatewayError> {
    let range = match header.strip_prefix("entries=") {
        Some(range) => range.trim_start(),
        None => return Ok(()),
    };

    let mut parts = range.splitn(3, ':');

    let cursor = parts.next().unwrap_or("").trim_end();
    if !cursor.is_empty() {
        opts.cursor = Some(cursor.to_string());
    }

    if let Some(skip) = parts.next() {
        if !skip.is_empty() {
            opts.n_skip = skip.parse().map_err(|_| {
                GatewayError::Parse(format!("Failed to parse skip \"{skip}\""))
            })?;
        }
    }

    if let Some(count) = parts.next() {
        if !count.is_empty() {
            let count: u64 = count.parse().map_err(|_| {
                GatewayError::Parse(format!("Failed to parse entry count \"{count}\""))
            })?;

            if count == 0 {
                return Err(GatewayError::Parse(
                    "Entry count must be positive".to_string(),
                ));
            }

            opts.n_entries = Some(count);
        }
    }

    Ok(())
}

/// Walk the query pairs, applying flags and collecting journal matches.
///
/// The iteration always runs to completion; only the first error is kept
/// and reported afterwards, so a request with several broken arguments
/// gets a single, stable complaint.
pub fn parse_query<'a>(
    pairs: impl Iterator<Item = (Cow<'a, str>, Cow<'a, str>)>,
    opts: &mut RequestOptions,
) -> Result<(), GatewayError> {
    let mut deferred = None;

    for (key, value) in pairs {
        let res = match key.as_ref() {
            "follow" => parse_flag(&value).map(|follow| opts.follow = follow),
            "discrete" => parse_flag(&value).map(|discrete| opts.discrete = discrete),
            "boot" => parse_flag(&value).and_then(|boot| {
                if boot {
                    let boot_id = machine::boot_id().map_err(|e| {
                        GatewayError::Parse(format!("Failed to look up the boot id: {e}"))
                    })?;

                    opts.matches.push(("_BOOT_ID".to_string(), boot_id));
                }

                Ok(())
            }),
            _ => {
                opts.matches
                    .push((key.into_owned(), value.into_owned()));

                Ok(())
            }
        };

        if let Err(e) = res {
            deferred.get_or_insert(e);
        }
    }

    match deferred {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// A bare flag (no value) means true.
fn parse_flag(value: &str) -> Result<bool, GatewayError> {
    if value.is_empty() {
        return Ok(true);
    }

    parse_boolean(value)
        .ok_or_else(|| GatewayError::Parse(format!("Failed to parse boolean \"{value}\"")))
}

fn parse_boolean(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "y" | "yes" | "t" | "true" | "on" => Some(true),
        "0" | "n" | "no" | "f" | "false" | "off" => Some(false),
        _ => None,
    }
}
