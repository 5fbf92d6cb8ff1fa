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

use std::io::{self, Write};

use chrono::{TimeZone, Utc};
use serde_json::Value;

use crate::journal::Entry;

/// The four representations an entry can be served in, selected by exact
/// match on the Accept header. Anything unknown falls back to Short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Short,
    Json,
    JsonSse,
    Export,
}

impl OutputMode {
    pub fn from_accept(accept: Option<&str>) -> Self {
        match accept {
            Some("application/json") => OutputMode::Json,
            Some("text/event-stream") => OutputMode::JsonSse,
            Some("application/vnd.fdo.journal") => OutputMode::Export,
            _ => OutputMode::Short,
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            OutputMode::Short => "text/plain",
            OutputMode::Json => "application/json",
            OutputMode::JsonSse => "text/event-stream",
            OutputMode::Export => "application/vnd.fdo.journal",
        }
    }
}

/// Serialize one entry into the scratch buffer in the given mode.
pub fn serialize_entry(entry: &Entry, mode: OutputMode, out: &mut Vec<u8>) -> io::Result<()> {
    let payload: usize = entry
        .fields
        .iter()
        .map(|(k, v)| k.len() + v.len() + 2)
        .sum();

    reserve(out, entry.cursor.len() + payload + 128)?;

    match mode {
        OutputMode::Short => serialize_short(entry, out),
        OutputMode::Json => {
            write_json(&entry_to_json(entry), out)?;
            out.push(b'\n');
            Ok(())
        }
        OutputMode::JsonSse => {
            out.extend_from_slice(b"data: ");
            write_json(&entry_to_json(entry), out)?;
            out.extend_from_slice(b"\n\n");
            Ok(())
        }
        OutputMode::Export => serialize_export(entry, out),
    }
}

/// Serialize one `FIELD=value` item from the unique-value enumeration.
/// Everything that is not Json collapses to the plain text form.
pub fn serialize_unique(data: &[u8], json: bool, out: &mut Vec<u8>) -> io::Result<()> {
    let eq = data.iter().position(|&b| b == b'=').ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "Unique field data without '=' separator",
        )
    })?;

    reserve(out, data.len() + 16)?;

    if json {
        let key = Value::String(String::from_utf8_lossy(&data[..eq]).into_owned());
        let value = Value::String(String::from_utf8_lossy(&data[eq + 1..]).into_owned());

        writeln!(out, "{{ {key} : {value} }}")?;
    } else {
        out.extend_from_slice(&data[eq + 1..]);
        out.push(b'\n');
    }

    Ok(())
}

// The classic syslog-ish one-liner.
fn serialize_short(entry: &Entry, out: &mut Vec<u8>) -> io::Result<()> {
    let hostname = entry
        .fields
        .get("_HOSTNAME")
        .map(String::as_str)
        .unwrap_or("localhost");
    let identifier = entry
        .fields
        .get("SYSLOG_IDENTIFIER")
        .or_else(|| entry.fields.get("_COMM"))
        .map(String::as_str)
        .unwrap_or("unknown");
    let message = entry
        .fields
        .get("MESSAGE")
        .map(String::as_str)
        .unwrap_or("");

    write!(
        out,
        "{} {} {}",
        format_timestamp(entry.realtime_usec),
        hostname,
        identifier
    )?;

    if let Some(pid) = entry.fields.get("_PID") {
        write!(out, "[{pid}]")?;
    }

    writeln!(out, ": {message}")?;

    Ok(())
}

fn serialize_export(entry: &Entry, out: &mut Vec<u8>) -> io::Result<()> {
    writeln!(out, "__CURSOR={}", entry.cursor)?;
    writeln!(out, "__REALTIME_TIMESTAMP={}", entry.realtime_usec)?;

    if let Some(monotonic) = entry.monotonic_usec {
        writeln!(out, "__MONOTONIC_TIMESTAMP={monotonic}")?;
    }

    for (key, value) in &entry.fields {
        if value.contains('\n') {
            // Values a KEY=VALUE line can not carry use the binary form:
            // the field name, a newline, a little-endian u64 length and
            // the raw payload.
            out.extend_from_slice(key.as_bytes());
            out.push(b'\n');
            out.extend_from_slice(&(value.len() as u64).to_le_bytes());
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        } else {
            writeln!(out, "{key}={value}")?;
        }
    }

    out.push(b'\n');

    Ok(())
}

fn entry_to_json(entry: &Entry) -> Value {
    let mut map = serde_json::Map::new();

    map.insert(
        "__CURSOR".to_string(),
        Value::String(entry.cursor.clone()),
    );
    map.insert(
        "__REALTIME_TIMESTAMP".to_string(),
        Value::String(entry.realtime_usec.to_string()),
    );

    if let Some(monotonic) = entry.monotonic_usec {
        map.insert(
            "__MONOTONIC_TIMESTAMP".to_string(),
            Value::String(monotonic.to_string()),
        );
    }

    for (key, value) in &entry.fields {
        map.insert(key.clone(), Value::String(value.clone()));
    }

    Value::Object(map)
}

fn write_json(value: &Value, out: &mut Vec<u8>) -> io::Result<()> {
    serde_json::to_writer(&mut *out, value).map_err(io::Error::other)
}

fn format_timestamp(usec: u64) -> String {
    let secs = (usec / 1_000_000) as i64;

    match Utc.timestamp_opt(secs, 0).single() {
        Some(stamp) => stamp.format("%b %d %H:%M:%S").to_string(),
        None => usec.to_string(),
    }
}

fn reserve(out: &mut Vec<u8>, additional: usize) -> io::Result<()> {
    out.try_reserve(additional).map_err(|_| {
        io::Error::new(
            io::ErrorKind::OutOfMemory,
            "Failed to grow the scratch buffer",
        )
    })
}

#[cfg(test)]
mod tests {
    use crate::journal::{Entry, JournalRecord};

    use super::{serialize_entry, serialize_unique, OutputMode};

    // 2023-01-01 12:00:00 UTC
    const REALTIME: u64 = 1_672_574_400_000_000;

    fn test_entry() -> Entry {
        let mut fields = JournalRecord::new();
        fields.insert("_HOSTNAME".to_string(), "demo".to_string());
        fields.insert("_PID".to_string(), "423".to_string());
        fields.insert("MESSAGE".to_string(), "Says HI!".to_string());
        fields.insert("SYSLOG_IDENTIFIER".to_string(), "jgwd".to_string());

        Entry {
            cursor: "i=0000000000000001".to_string(),
            realtime_usec: REALTIME,
            monotonic_usec: Some(5_000_000),
            fields,
        }
    }

    fn serialized(mode: OutputMode) -> Vec<u8> {
        let mut out = Vec::new();
        serialize_entry(&test_entry(), mode, &mut out).unwrap();
        out
    }

    #[test]
    fn accept_header_selection() {
        assert_eq!(OutputMode::from_accept(None), OutputMode::Short);
        assert_eq!(
            OutputMode::from_accept(Some("application/json")),
            OutputMode::Json
        );
        assert_eq!(
            OutputMode::from_accept(Some("text/event-stream")),
            OutputMode::JsonSse
        );
        assert_eq!(
            OutputMode::from_accept(Some("application/vnd.fdo.journal")),
            OutputMode::Export
        );

        // Unknown MIME types are not an error, they mean Short.
        assert_eq!(
            OutputMode::from_accept(Some("application/xml")),
            OutputMode::Short
        );
    }

    #[test]
    fn short_form() {
        assert_eq!(
            serialized(OutputMode::Short),
            b"Jan 01 12:00:00 demo jgwd[423]: Says HI!\n".to_vec()
        );
    }

    #[test]
    fn short_form_fallbacks() {
        let entry = Entry {
            cursor: "i=0000000000000002".to_string(),
            realtime_usec: REALTIME,
            monotonic_usec: None,
            fields: JournalRecord::new(),
        };

        let mut out = Vec::new();
        serialize_entry(&entry, OutputMode::Short, &mut out).unwrap();

        assert_eq!(out, b"Jan 01 12:00:00 localhost unknown: \n".to_vec());
    }

    #[test]
    fn json_form() {
        let out = serialized(OutputMode::Json);
        let text = String::from_utf8(out).unwrap();

        assert!(text.ends_with('\n'));

        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["__CURSOR"], "i=0000000000000001");
        assert_eq!(value["__REALTIME_TIMESTAMP"], "1672574400000000");
        assert_eq!(value["__MONOTONIC_TIMESTAMP"], "5000000");
        assert_eq!(value["MESSAGE"], "Says HI!");
    }

    #[test]
    fn json_sse_form() {
        let out = serialized(OutputMode::JsonSse);
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("data: {"));
        assert!(text.ends_with("}\n\n"));

        let value: serde_json::Value =
            serde_json::from_str(text.strip_prefix("data: ").unwrap()).unwrap();
        assert_eq!(value["SYSLOG_IDENTIFIER"], "jgwd");
    }

    #[test]
    fn export_form() {
        let out = serialized(OutputMode::Export);
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("__CURSOR=i=0000000000000001\n__REALTIME_TIMESTAMP=1672574400000000\n__MONOTONIC_TIMESTAMP=5000000\n"));
        assert!(text.contains("\nMESSAGE=Says HI!\n"));
        assert!(text.ends_with("\n\n"));
    }

    #[test]
    fn export_form_binary_value() {
        let mut entry = test_entry();
        entry
            .fields
            .insert("MESSAGE".to_string(), "two\nlines".to_string());

        let mut out = Vec::new();
        serialize_entry(&entry, OutputMode::Export, &mut out).unwrap();

        let mut expected = b"MESSAGE\n".to_vec();
        expected.extend_from_slice(&9u64.to_le_bytes());
        expected.extend_from_slice(b"two\nlines\n");

        assert!(out
            .windows(expected.len())
            .any(|window| window == expected.as_slice()));
    }

    #[test]
    fn unique_plain_and_json() {
        let mut out = Vec::new();
        serialize_unique(b"_SYSTEMD_UNIT=a.service", false, &mut out).unwrap();
        assert_eq!(out, b"a.service\n".to_vec());

        let mut out = Vec::new();
        serialize_unique(b"_SYSTEMD_UNIT=a.service", true, &mut out).unwrap();
        assert_eq!(
            out,
            b"{ \"_SYSTEMD_UNIT\" : \"a.service\" }\n".to_vec()
        );
    }

    #[test]
    fn unique_without_separator_is_an_error() {
        let mut out = Vec::new();
        let err = serialize_unique(b"_SYSTEMD_UNIT", true, &mut out).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
