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
// with this library; if not, see <https://www.gnu.org/licenses/>.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::io::{Error, ErrorKind, Result};
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use systemd::journal::{self, JournalSeek, JournalWaitResult};

use super::{Entry, JournalRecord, WaitResult};

// Upper bound on the entries looked at when collecting unique field
// values. sd_journal_query_unique() is not wrapped by the systemd crate,
// so the values are collected by scanning instead.
const UNIQUE_SCAN_LIMIT: usize = 100_000;

const JOURNAL_DIRS: &[&str] = &["/var/log/journal", "/run/log/journal"];

#[derive(Clone, Copy)]
pub struct OpenOptions {
    system: bool,
    local_only: bool,
}

impl OpenOptions {
    pub fn default() -> Self {
        Self {
            system: false,
            local_only: false,
        }
    }

    pub fn system(mut self, system: bool) -> Self {
        self.system = system;
        self
    }

    pub fn local_only(mut self, local_only: bool) -> Self {
        self.local_only = local_only;
        self
    }

    fn open_raw(&self) -> Result<journal::Journal> {
        journal::OpenOptions::default()
            .system(self.system)
            .local_only(self.local_only)
            .open()
    }

    pub fn open(self) -> Result<Journal> {
        let inner = self.open_raw()?;

        Ok(Journal {
            inner,
            options: self,
            fresh_tail: false,
            current: None,
            unique: None,
        })
    }
}

pub struct Journal {
    inner: journal::Journal,
    options: OpenOptions,
    // A tail seek resolves just past the last entry; the first backward
    // step out of it lands on the last entry and consumes one step of
    // the caller's folded skip. See the module comment in journal.rs.
    fresh_tail: bool,
    current: Option<JournalRecord>,
    unique: Option<VecDeque<Vec<u8>>>,
}

impl Journal {
    pub fn match_add(&mut self, key: &str, value: &str) -> Result<()> {
        self.inner.match_add(key, value.as_bytes().to_vec())?;

        Ok(())
    }

    pub fn seek_head(&mut self) -> Result<()> {
        self.inner.seek_head()?;
        self.fresh_tail = false;
        self.current = None;

        Ok(())
    }

    pub fn seek_tail(&mut self) -> Result<()> {
        self.inner.seek_tail()?;
        self.fresh_tail = true;
        self.current = None;

        Ok(())
    }

    pub fn seek_cursor(&mut self, cursor: &str) -> Result<()> {
        self.inner.seek(JournalSeek::Cursor {
            cursor: cursor.to_string(),
        })?;
        self.fresh_tail = false;
        self.current = None;

        Ok(())
    }

    pub fn next(&mut self) -> Result<u64> {
        match self.inner.next_entry()? {
            Some(record) => {
                self.current = Some(record);
                self.fresh_tail = false;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    pub fn previous(&mut self) -> Result<u64> {
        match self.inner.previous_entry()? {
            Some(record) => {
                self.current = Some(record);
                self.fresh_tail = false;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    pub fn next_skip(&mut self, n: u64) -> Result<u64> {
        let mut moved = 0;

        while moved < n && self.next()? != 0 {
            moved += 1;
        }

        Ok(moved)
    }

    pub fn previous_skip(&mut self, n: u64) -> Result<u64> {
        if n == 0 {
            return Ok(0);
        }

        let steps = if self.fresh_tail { (n - 1).max(1) } else { n };

        let mut moved = 0;

        while moved < steps && self.previous()? != 0 {
            moved += 1;
        }

        Ok(moved)
    }

    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<WaitResult> {
        match self.inner.wait(timeout)? {
            JournalWaitResult::Nop => Ok(WaitResult::Timeout),
            // Append and Invalidate both mean "look again".
            _ => Ok(WaitResult::NewData),
        }
    }

    pub fn cursor(&mut self) -> Result<String> {
        self.inner.cursor()
    }

    pub fn cursor_matches(&mut self, cursor: &str) -> Result<bool> {
        // sd_journal_test_cursor() is not wrapped by the systemd crate;
        // comparing the canonical cursor of the current entry is close
        // enough for cursors this daemon handed out itself.
        Ok(self.cursor()? == cursor)
    }

    pub fn current_entry(&mut self) -> Result<Entry> {
        let fields = self
            .current
            .clone()
            .ok_or_else(|| Error::other("Journal is not positioned on an entry"))?;

        Ok(Entry {
            cursor: self.inner.cursor()?,
            realtime_usec: realtime_usec(&mut self.inner)?,
            monotonic_usec: None,
            fields,
        })
    }

    pub fn query_unique(&mut self, field: &str) -> Result<()> {
        // Scan a fresh handle so the position of this one stays put.
        let mut scan = self.options.open_raw()?;
        scan.seek_head()?;

        let mut values = BTreeSet::new();

        for _ in 0..UNIQUE_SCAN_LIMIT {
            match scan.next_entry()? {
                Some(record) => {
                    if let Some(value) = record.get(field) {
                        values.insert(value.clone());
                    }
                }
                None => break,
            }
        }

        self.unique = Some(
            values
                .into_iter()
                .map(|v| format!("{field}={v}").into_bytes())
                .collect(),
        );

        Ok(())
    }

    pub fn enumerate_unique(&mut self) -> Result<Option<Vec<u8>>> {
        let unique = self
            .unique
            .as_mut()
            .ok_or_else(|| Error::other("enumerate_unique without query_unique"))?;

        Ok(unique.pop_front())
    }

    pub fn usage(&mut self) -> Result<u64> {
        let mut total = 0;

        for dir in JOURNAL_DIRS {
            total += dir_size(Path::new(dir))?;
        }

        Ok(total)
    }

    pub fn cutoff_realtime(&mut self) -> Result<(u64, u64)> {
        let mut scan = self.options.open_raw()?;

        scan.seek_head()?;
        let from = match scan.next_entry()? {
            Some(_) => realtime_usec(&mut scan)?,
            None => return Ok((0, 0)),
        };

        scan.seek_tail()?;
        let to = match scan.previous_entry()? {
            Some(_) => realtime_usec(&mut scan)?,
            None => from,
        };

        Ok((from, to))
    }
}

fn realtime_usec(journal: &mut journal::Journal) -> Result<u64> {
    let stamp = journal.timestamp()?;

    stamp
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .map_err(|_| {
            Error::new(
                ErrorKind::InvalidData,
                "Entry timestamp predates the epoch",
            )
        })
}

fn dir_size(path: &Path) -> Result<u64> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut total = 0;

    for entry in entries {
        let entry = entry?;
        let metadata = entry.metadata()?;

        if metadata.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }

    Ok(total)
}
