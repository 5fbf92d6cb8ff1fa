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
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_std::channel::{Receiver, Sender};
use async_std::task::block_on;
use futures::stream::Stream;

use crate::journal::{Journal, WaitResult};
use crate::output::{self, OutputMode};
use crate::request::RequestOptions;

pub const CHUNK_SIZE: usize = 4096;

// How long a follow request sits in the journal's wait primitive before
// the pump gets a chance to notice that the client is gone.
const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// `n` bytes were written to the destination buffer.
    Data(usize),
    /// Follow mode: nothing new arrived within the poll interval.
    Idle,
    /// The stream is complete.
    End,
}

/// A resumable producer answering byte-range reads at arbitrary offsets
/// while the journal underneath only ever advances one entry at a time.
///
/// The currently serialized entry sits in `scratch`; `delta` is the
/// absolute stream offset of its first byte, so `delta + scratch.len()`
/// is the first byte not produced yet. Reads never go backwards, the
/// HTTP layer consumes the body strictly front to back.
pub trait BodySource {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<Progress>;
}

pub struct EntryStream {
    journal: Journal,
    mode: OutputMode,
    cursor: Option<String>,
    n_skip: i64,
    n_entries: Option<u64>,
    follow: bool,
    discrete: bool,
    scratch: Vec<u8>,
    delta: u64,
}

/// Position the journal for the requested window: an explicit cursor
/// wins, otherwise forward windows start at the head and backward ones
/// at the tail.
pub fn seek_for(journal: &mut Journal, opts: &RequestOptions) -> io::Result<()> {
    if let Some(cursor) = &opts.cursor {
        journal.seek_cursor(cursor)
    } else if opts.n_skip >= 0 {
        journal.seek_head()
    } else {
        journal.seek_tail()
    }
}

impl EntryStream {
    pub fn new(journal: Journal, opts: &RequestOptions) -> Self {
        Self {
            journal,
            mode: opts.mode,
            cursor: opts.cursor.clone(),
            n_skip: opts.n_skip,
            n_entries: opts.n_entries,
            follow: opts.follow,
            discrete: opts.discrete,
            scratch: Vec::new(),
            delta: 0,
        }
    }
}

impl BodySource for EntryStream {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<Progress> {
        assert!(pos >= self.delta, "body reads must be monotonic");

        let mut rel = (pos - self.delta) as usize;

        // The scratch buffer is exhausted, advance to the next entry.
        while rel >= self.scratch.len() {
            if self.n_entries == Some(0) {
                return Ok(Progress::End);
            }

            // The skip only applies to the first advance and folds the
            // step out of the seek position into its count.
            let advanced = if self.n_skip < 0 {
                self.journal.previous_skip(self.n_skip.unsigned_abs() + 1)?
            } else if self.n_skip > 0 {
                self.journal.next_skip(self.n_skip as u64 + 1)?
            } else {
                self.journal.next()?
            };

            if advanced == 0 {
                if !self.follow {
                    return Ok(Progress::End);
                }

                if self.journal.wait(Some(FOLLOW_POLL_INTERVAL))? == WaitResult::Timeout {
                    return Ok(Progress::Idle);
                }

                continue;
            }

            if self.discrete {
                // Serve only the entry the request named. Landing anywhere
                // else (or having skipped away from it) ends the stream.
                let wanted = self.cursor.as_deref().unwrap_or("");

                if !self.journal.cursor_matches(wanted)? {
                    return Ok(Progress::End);
                }
            }

            self.delta += self.scratch.len() as u64;
            rel -= self.scratch.len();
            self.n_skip = 0;

            if let Some(n_entries) = self.n_entries.as_mut() {
                *n_entries -= 1;
            }

            let entry = self.journal.current_entry()?;
            self.scratch.clear();
            output::serialize_entry(&entry, self.mode, &mut self.scratch)?;
        }

        let n = (self.scratch.len() - rel).min(buf.len());
        buf[..n].copy_from_slice(&self.scratch[rel..rel + n]);

        Ok(Progress::Data(n))
    }
}

/// The reduced sibling of `EntryStream`: one unique field value per
/// iteration, no follow, no discrete, optional value budget.
pub struct FieldStream {
    journal: Journal,
    json: bool,
    n_fields: Option<u64>,
    scratch: Vec<u8>,
    delta: u64,
}

impl FieldStream {
    pub fn new(journal: Journal, json: bool, n_fields: Option<u64>) -> Self {
        Self {
            journal,
            json,
            n_fields,
            scratch: Vec::new(),
            delta: 0,
        }
    }
}

impl BodySource for FieldStream {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<Progress> {
        assert!(pos >= self.delta, "body reads must be monotonic");

        let mut rel = (pos - self.delta) as usize;

        while rel >= self.scratch.len() {
            if self.n_fields == Some(0) {
                return Ok(Progress::End);
            }

            let data = match self.journal.enumerate_unique()? {
                Some(data) => data,
                None => return Ok(Progress::End),
            };

            self.delta += self.scratch.len() as u64;
            rel -= self.scratch.len();

            if let Some(n_fields) = self.n_fields.as_mut() {
                *n_fields -= 1;
            }

            self.scratch.clear();
            output::serialize_unique(&data, self.json, &mut self.scratch)?;
        }

        let n = (self.scratch.len() - rel).min(buf.len());
        buf[..n].copy_from_slice(&self.scratch[rel..rel + n]);

        Ok(Progress::Data(n))
    }
}

/// Drive a body source to completion, handing chunks to the response
/// body through the channel. Runs on a blocking thread because both the
/// journal handle and its wait primitive are thread-bound.
pub fn pump(mut source: impl BodySource, tx: Sender<io::Result<Vec<u8>>>) {
    let mut pos: u64 = 0;
    let mut chunk = vec![0u8; CHUNK_SIZE];

    loop {
        match source.read_at(pos, &mut chunk) {
            Ok(Progress::Data(n)) => {
                pos += n as u64;

                if block_on(tx.send(Ok(chunk[..n].to_vec()))).is_err() {
                    // The client hung up, the reader side is gone.
                    return;
                }
            }
            Ok(Progress::Idle) => {
                // Zero-length probe so a dropped connection is noticed
                // even while the journal stays idle in follow mode.
                if block_on(tx.send(Ok(Vec::new()))).is_err() {
                    return;
                }
            }
            Ok(Progress::End) => return,
            Err(e) => {
                // Headers are long gone; all that is left is aborting
                // the body so the client sees a truncated response.
                let _ = block_on(tx.send(Err(e)));
                return;
            }
        }
    }
}

/// The async read half of the pump channel, wrapped in a BufReader and
/// handed to tide as the chunked response body.
pub struct BodyReader {
    rx: Receiver<io::Result<Vec<u8>>>,
    chunk: Vec<u8>,
    offset: usize,
}

impl BodyReader {
    pub fn new(rx: Receiver<io::Result<Vec<u8>>>) -> Self {
        Self {
            rx,
            chunk: Vec::new(),
            offset: 0,
        }
    }
}

impl async_std::io::Read for BodyReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            if self.offset < self.chunk.len() {
                let n = (self.chunk.len() - self.offset).min(buf.len());
                buf[..n].copy_from_slice(&self.chunk[self.offset..self.offset + n]);
                self.offset += n;

                return Poll::Ready(Ok(n));
            }

            match Pin::new(&mut self.rx).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.chunk = chunk;
                    self.offset = 0;
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(0)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use async_std::channel::bounded;
    use async_std::prelude::*;
    use async_std::task::block_on;

    use crate::journal::memory::{demo_record, Journal, Store};
    use crate::request::RequestOptions;

    use super::{pump, seek_for, BodyReader, BodySource, EntryStream, FieldStream, Progress};

    fn test_store() -> Store {
        let store = Store::new();

        store.append(demo_record("a.service", "a", "1", "first"));
        store.append(demo_record("b.service", "b", "2", "second"));
        store.append(demo_record("a.service", "a", "1", "third"));

        store
    }

    fn entry_stream(store: &Store, opts: &RequestOptions) -> EntryStream {
        let mut journal = Journal::from_store(store.clone());

        for (key, value) in &opts.matches {
            journal.match_add(key, value).unwrap();
        }

        seek_for(&mut journal, opts).unwrap();

        EntryStream::new(journal, opts)
    }

    /// Drain a source with a given read granularity, checking that the
    /// byte stream is identical no matter how it is sliced.
    fn drain(source: &mut impl BodySource, step: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; step];
        let mut pos = 0u64;

        loop {
            match source.read_at(pos, &mut buf).unwrap() {
                Progress::Data(n) => {
                    out.extend_from_slice(&buf[..n]);
                    pos += n as u64;
                }
                Progress::End => return out,
                Progress::Idle => panic!("unexpected idle on a bounded stream"),
            }
        }
    }

    fn lines(bytes: &[u8]) -> Vec<String> {
        String::from_utf8(bytes.to_vec())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn serves_all_entries_in_order() {
        let store = test_store();
        let mut stream = entry_stream(&store, &RequestOptions::new());

        let body = lines(&drain(&mut stream, 4096));
        assert_eq!(body.len(), 3);
        assert!(body[0].ends_with(": first"));
        assert!(body[1].ends_with(": second"));
        assert!(body[2].ends_with(": third"));
    }

    #[test]
    fn arbitrary_read_granularity_is_loss_free() {
        let store = test_store();

        let reference = drain(&mut entry_stream(&store, &RequestOptions::new()), 4096);

        for step in [1, 2, 3, 7, 16] {
            let sliced = drain(&mut entry_stream(&store, &RequestOptions::new()), step);
            assert_eq!(sliced, reference, "granularity {step}");
        }
    }

    #[test]
    fn negative_skip_serves_the_tail() {
        let store = test_store();

        let mut opts = RequestOptions::new();
        opts.n_skip = -1;
        opts.n_entries = Some(1);

        let body = lines(&drain(&mut entry_stream(&store, &opts), 4096));
        assert_eq!(body.len(), 1);
        assert!(body[0].ends_with(": third"));

        // Two entries back from the end, then forward emission.
        let mut opts = RequestOptions::new();
        opts.n_skip = -2;

        let body = lines(&drain(&mut entry_stream(&store, &opts), 4096));
        assert_eq!(body.len(), 2);
        assert!(body[0].ends_with(": second"));
        assert!(body[1].ends_with(": third"));
    }

    #[test]
    fn positive_skip_jumps_forward() {
        let store = test_store();

        let mut opts = RequestOptions::new();
        opts.n_skip = 1;

        let body = lines(&drain(&mut entry_stream(&store, &opts), 4096));
        assert_eq!(body.len(), 2);
        assert!(body[0].ends_with(": second"));
        assert!(body[1].ends_with(": third"));
    }

    #[test]
    fn entry_budget_bounds_the_stream() {
        let store = test_store();

        let mut opts = RequestOptions::new();
        opts.n_entries = Some(2);

        let body = lines(&drain(&mut entry_stream(&store, &opts), 4096));
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn matches_constrain_the_window() {
        let store = test_store();

        let mut opts = RequestOptions::new();
        opts.matches
            .push(("_SYSTEMD_UNIT".to_string(), "a.service".to_string()));

        let body = lines(&drain(&mut entry_stream(&store, &opts), 4096));
        assert_eq!(body.len(), 2);
        assert!(body[0].ends_with(": first"));
        assert!(body[1].ends_with(": third"));
    }

    #[test]
    fn discrete_serves_exactly_the_named_entry() {
        let store = test_store();

        let cursor = {
            let mut journal = Journal::from_store(store.clone());
            journal.seek_head().unwrap();
            journal.next().unwrap();
            journal.next().unwrap();
            journal.cursor().unwrap()
        };

        let mut opts = RequestOptions::new();
        opts.cursor = Some(cursor);
        opts.discrete = true;
        opts.n_entries = Some(1);

        let body = lines(&drain(&mut entry_stream(&store, &opts), 4096));
        assert_eq!(body.len(), 1);
        assert!(body[0].ends_with(": second"));
    }

    #[test]
    fn discrete_with_skip_is_a_probe() {
        let store = test_store();

        let cursor = {
            let mut journal = Journal::from_store(store.clone());
            journal.seek_head().unwrap();
            journal.next().unwrap();
            journal.cursor().unwrap()
        };

        // The skip moves past the named entry, so the cursor check fails
        // and the body stays empty.
        let mut opts = RequestOptions::new();
        opts.cursor = Some(cursor);
        opts.discrete = true;
        opts.n_skip = 1;

        assert_eq!(drain(&mut entry_stream(&store, &opts), 4096), Vec::<u8>::new());
    }

    #[test]
    fn follow_reports_idle_then_picks_up_appends() {
        let store = Store::new();

        let mut opts = RequestOptions::new();
        opts.follow = true;

        let mut stream = entry_stream(&store, &opts);
        let mut buf = [0u8; 4096];

        // Nothing in the store yet: the bounded wait elapses.
        assert_eq!(stream.read_at(0, &mut buf).unwrap(), Progress::Idle);

        store.append(demo_record("late.service", "late", "9", "appended"));

        let n = match stream.read_at(0, &mut buf).unwrap() {
            Progress::Data(n) => n,
            other => panic!("expected data, got {other:?}"),
        };
        assert!(String::from_utf8_lossy(&buf[..n]).ends_with(": appended\n"));

        // End of data again, back to idling instead of terminating.
        assert_eq!(stream.read_at(n as u64, &mut buf).unwrap(), Progress::Idle);
    }

    #[test]
    #[should_panic(expected = "monotonic")]
    fn backward_reads_are_rejected() {
        let store = test_store();
        let mut stream = entry_stream(&store, &RequestOptions::new());

        let mut buf = [0u8; 4096];

        // Consume the first entry completely so the offset base moves.
        let n = match stream.read_at(0, &mut buf).unwrap() {
            Progress::Data(n) => n,
            other => panic!("expected data, got {other:?}"),
        };
        stream.read_at(n as u64, &mut buf).unwrap();

        // Asking for already-consumed bytes violates the contract.
        stream.read_at(0, &mut buf).unwrap();
    }

    #[test]
    fn field_stream_plain_and_capped() {
        let store = test_store();

        let mut journal = Journal::from_store(store.clone());
        journal.query_unique("_SYSTEMD_UNIT").unwrap();
        let mut stream = FieldStream::new(journal, false, None);
        assert_eq!(
            lines(&drain(&mut stream, 3)),
            vec!["a.service".to_string(), "b.service".to_string()]
        );

        let mut journal = Journal::from_store(store);
        journal.query_unique("_SYSTEMD_UNIT").unwrap();
        let mut stream = FieldStream::new(journal, true, Some(1));
        assert_eq!(
            lines(&drain(&mut stream, 4096)),
            vec!["{ \"_SYSTEMD_UNIT\" : \"a.service\" }".to_string()]
        );
    }

    #[test]
    fn pump_feeds_the_reader_end_to_end() {
        let store = test_store();

        let reference = drain(&mut entry_stream(&store, &RequestOptions::new()), 4096);

        let stream = entry_stream(&store, &RequestOptions::new());
        let (tx, rx) = bounded(2);

        let pump_thread = thread::spawn(move || pump(stream, tx));

        let mut body = Vec::new();
        block_on(BodyReader::new(rx).read_to_end(&mut body)).unwrap();
        pump_thread.join().unwrap();

        assert_eq!(body, reference);
    }

    #[test]
    fn pump_stops_when_the_reader_is_dropped() {
        let store = Store::new();

        let mut opts = RequestOptions::new();
        opts.follow = true;

        let stream = entry_stream(&store, &opts);
        let (tx, rx) = bounded(2);

        let pump_thread = thread::spawn(move || pump(stream, tx));

        // With the read side gone the next idle probe fails to send and
        // the pump winds down instead of polling forever.
        drop(rx);
        thread::sleep(Duration::from_millis(50));

        pump_thread.join().unwrap();
    }
}
