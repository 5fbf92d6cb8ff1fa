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
use std::io::{Error, ErrorKind, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use super::{Entry, JournalRecord, WaitResult};

// Realtime timestamp of the first entry appended to a store.
// 2023-01-01 12:00:00 UTC, one entry per second from there.
const REALTIME_BASE: u64 = 1_672_574_400_000_000;
const MONOTONIC_BASE: u64 = 5_000_000;

// Rough per-entry file overhead, so the reported usage is not just the
// sum of the field payloads.
const ENTRY_OVERHEAD: u64 = 64;

pub const DEMO_BOOT_ID: &str = "b6c8a7cf2f6e4d5fa9f1c0b3d2e1f0a9";
const DEMO_HOSTNAME: &str = "demo";

#[derive(Debug, Clone)]
struct StoredEntry {
    seq: u64,
    realtime_usec: u64,
    monotonic_usec: u64,
    fields: JournalRecord,
}

#[derive(Debug)]
struct State {
    entries: Vec<StoredEntry>,
    next_seq: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    appended: Condvar,
}

/// An append-only in-memory journal.
///
/// Cloning yields another handle to the same store, so a test (or the
/// demo journal) can append entries while readers are waiting on them.
#[derive(Debug, Clone)]
pub struct Store {
    shared: Arc<Shared>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    entries: Vec::new(),
                    next_seq: 1,
                }),
                appended: Condvar::new(),
            }),
        }
    }

    /// Append an entry and wake up all blocked readers.
    /// Returns the cursor of the new entry.
    pub fn append(&self, fields: JournalRecord) -> String {
        let mut state = self
            .shared
            .state
            .lock()
            .expect("Tried to lock a tainted Mutex");

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(StoredEntry {
            seq,
            realtime_usec: REALTIME_BASE + (seq - 1) * 1_000_000,
            monotonic_usec: MONOTONIC_BASE + (seq - 1) * 1_000_000,
            fields,
        });

        self.shared.appended.notify_all();

        cursor_for(seq)
    }
}

/// The store every `OpenOptions::open()` call hands out.
///
/// It plays the role journald plays for the real backend and is seeded
/// with a couple of plausible boot records.
pub fn demo_store() -> &'static Store {
    static STORE: OnceLock<Store> = OnceLock::new();

    STORE.get_or_init(|| {
        let store = Store::new();

        let seed = [
            ("systemd-journald.service", "journald", "180", "Journal started"),
            ("jgwd.service", "jgwd", "423", "Journal gateway starting"),
            ("jgwd.service", "jgwd", "423", "Listening on [::]:19531"),
        ];

        for (unit, identifier, pid, message) in seed {
            store.append(demo_record(unit, identifier, pid, message));
        }

        store
    })
}

pub fn demo_record(unit: &str, identifier: &str, pid: &str, message: &str) -> JournalRecord {
    let mut fields = JournalRecord::new();
    fields.insert("_BOOT_ID".to_string(), DEMO_BOOT_ID.to_string());
    fields.insert("_HOSTNAME".to_string(), DEMO_HOSTNAME.to_string());
    fields.insert("_PID".to_string(), pid.to_string());
    fields.insert("_SYSTEMD_UNIT".to_string(), unit.to_string());
    fields.insert("MESSAGE".to_string(), message.to_string());
    fields.insert("PRIORITY".to_string(), "6".to_string());
    fields.insert("SYSLOG_IDENTIFIER".to_string(), identifier.to_string());
    fields
}

fn cursor_for(seq: u64) -> String {
    format!("i={seq:016x}")
}

fn parse_cursor(cursor: &str) -> Result<u64> {
    cursor
        .strip_prefix("i=")
        .and_then(|hex| u64::from_str_radix(hex, 16).ok())
        .ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidInput,
                format!("Failed to seek to cursor \"{cursor}\""),
            )
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Head,
    Tail,
    /// An unresolved cursor seek; the next step resolves onto this entry.
    Seek(u64),
    /// Positioned on the entry with this sequence number.
    At(u64),
}

pub struct OpenOptions;

impl OpenOptions {
    pub fn default() -> Self {
        Self
    }

    pub fn system(self, _: bool) -> Self {
        self
    }

    pub fn local_only(self, _: bool) -> Self {
        self
    }

    pub fn open(self) -> Result<Journal> {
        Ok(Journal::from_store(demo_store().clone()))
    }
}

pub struct Journal {
    store: Store,
    matches: Vec<(String, String)>,
    pos: Position,
    current: Option<StoredEntry>,
    unique: Option<VecDeque<Vec<u8>>>,
}

impl Journal {
    pub fn from_store(store: Store) -> Self {
        Self {
            store,
            matches: Vec::new(),
            pos: Position::Head,
            current: None,
            unique: None,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.store
            .shared
            .state
            .lock()
            .map_err(|_| Error::other("Tried to lock a tainted Mutex"))
    }

    pub fn match_add(&mut self, key: &str, value: &str) -> Result<()> {
        self.matches.push((key.to_string(), value.to_string()));
        Ok(())
    }

    pub fn seek_head(&mut self) -> Result<()> {
        self.pos = Position::Head;
        self.current = None;
        Ok(())
    }

    pub fn seek_tail(&mut self) -> Result<()> {
        self.pos = Position::Tail;
        self.current = None;
        Ok(())
    }

    pub fn seek_cursor(&mut self, cursor: &str) -> Result<()> {
        self.pos = Position::Seek(parse_cursor(cursor)?);
        self.current = None;
        Ok(())
    }

    fn step(&mut self, forward: bool) -> Result<u64> {
        let found = {
            let state = self.lock()?;
            let matches = &self.matches;
            let accept =
                |e: &&StoredEntry| entry_matches(matches, &e.fields);

            let found = if forward {
                match self.pos {
                    Position::Head => state.entries.iter().find(accept),
                    Position::Seek(s) => {
                        state.entries.iter().filter(|e| e.seq >= s).find(accept)
                    }
                    Position::At(s) => {
                        state.entries.iter().filter(|e| e.seq > s).find(accept)
                    }
                    Position::Tail => None,
                }
            } else {
                match self.pos {
                    Position::Tail => state.entries.iter().rev().find(accept),
                    Position::Seek(s) => {
                        state.entries.iter().rev().filter(|e| e.seq <= s).find(accept)
                    }
                    Position::At(s) => {
                        state.entries.iter().rev().filter(|e| e.seq < s).find(accept)
                    }
                    Position::Head => None,
                }
            };

            found.cloned()
        };

        match found {
            Some(entry) => {
                self.pos = Position::At(entry.seq);
                self.current = Some(entry);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    pub fn next(&mut self) -> Result<u64> {
        self.step(true)
    }

    pub fn previous(&mut self) -> Result<u64> {
        self.step(false)
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

        // A fresh tail seek sits just past the last entry. The first
        // backward step resolves the position and lands on the last entry
        // at the same time, consuming one step of the requested skip.
        let steps = if self.pos == Position::Tail {
            (n - 1).max(1)
        } else {
            n
        };

        let mut moved = 0;

        while moved < steps && self.previous()? != 0 {
            moved += 1;
        }

        Ok(moved)
    }

    /// Block until the store gains entries or the timeout elapses.
    /// `None` waits indefinitely.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<WaitResult> {
        let shared = &self.store.shared;
        let mut state = shared
            .state
            .lock()
            .map_err(|_| Error::other("Tried to lock a tainted Mutex"))?;

        let seen = state.entries.len();

        loop {
            match timeout {
                Some(timeout) => {
                    let (guard, res) = shared
                        .appended
                        .wait_timeout(state, timeout)
                        .map_err(|_| Error::other("Tried to lock a tainted Mutex"))?;
                    state = guard;

                    if state.entries.len() > seen {
                        return Ok(WaitResult::NewData);
                    }

                    if res.timed_out() {
                        return Ok(WaitResult::Timeout);
                    }
                }
                None => {
                    state = shared
                        .appended
                        .wait(state)
                        .map_err(|_| Error::other("Tried to lock a tainted Mutex"))?;

                    if state.entries.len() > seen {
                        return Ok(WaitResult::NewData);
                    }
                }
            }
        }
    }

    pub fn cursor(&mut self) -> Result<String> {
        self.current
            .as_ref()
            .map(|e| cursor_for(e.seq))
            .ok_or_else(|| Error::other("Journal is not positioned on an entry"))
    }

    pub fn cursor_matches(&mut self, cursor: &str) -> Result<bool> {
        Ok(self.cursor()? == cursor)
    }

    pub fn current_entry(&mut self) -> Result<Entry> {
        let entry = self
            .current
            .as_ref()
            .ok_or_else(|| Error::other("Journal is not positioned on an entry"))?;

        Ok(Entry {
            cursor: cursor_for(entry.seq),
            realtime_usec: entry.realtime_usec,
            monotonic_usec: Some(entry.monotonic_usec),
            fields: entry.fields.clone(),
        })
    }

    pub fn query_unique(&mut self, field: &str) -> Result<()> {
        let values: BTreeSet<String> = {
            let state = self.lock()?;

            state
                .entries
                .iter()
                .filter_map(|e| e.fields.get(field))
                .cloned()
                .collect()
        };

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
        let state = self.lock()?;

        Ok(state
            .entries
            .iter()
            .map(|e| {
                let payload: usize = e
                    .fields
                    .iter()
                    .map(|(k, v)| k.len() + v.len() + 2)
                    .sum();

                payload as u64 + ENTRY_OVERHEAD
            })
            .sum())
    }

    pub fn cutoff_realtime(&mut self) -> Result<(u64, u64)> {
        let state = self.lock()?;

        match (state.entries.first(), state.entries.last()) {
            (Some(first), Some(last)) => Ok((first.realtime_usec, last.realtime_usec)),
            _ => Ok((0, 0)),
        }
    }
}

/// systemd match semantics: matches for the same field are ORed,
/// matches for different fields are ANDed.
fn entry_matches(matches: &[(String, String)], fields: &JournalRecord) -> bool {
    matches.iter().all(|(key, _)| {
        matches
            .iter()
            .filter(|(k, _)| k == key)
            .any(|(_, value)| fields.get(key) == Some(value))
    })
}
