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

use std::collections::btree_map::BTreeMap;

// The journal access layer. There are two interchangeable backends:
//
//   - journald: the real system journal via the systemd crate.
//   - memory:   a self-contained in-memory store, used for tests and for
//     builds without the "systemd" feature (e.g. development hosts that
//     do not run journald).
//
// Both expose the same surface: open options, field matches, head / tail /
// cursor seeks, forward and backward stepping, a bounded wait for new
// entries, unique-value enumeration and the usage / cutoff numbers the
// machine document reports.
//
// The seek semantics are pinned here because the stream generator depends
// on them: a cursor seek resolves onto the cursor's own entry, so the
// first step in either direction lands on that entry itself. A tail seek
// resolves just past the last entry, so the first backward step both
// resolves the position and lands on the last entry. Callers fold their
// "advance to the first entry" step into the skip count accordingly.

#[cfg(any(test, not(feature = "systemd")))]
pub(crate) mod memory;
#[cfg(all(feature = "systemd", not(test)))]
mod journald;

#[cfg(any(test, not(feature = "systemd")))]
pub use memory::{Journal, OpenOptions};
#[cfg(all(feature = "systemd", not(test)))]
pub use journald::{Journal, OpenOptions};

pub type JournalRecord = BTreeMap<String, String>;

/// Snapshot of the entry a journal handle is currently positioned on.
#[derive(Debug, Clone)]
pub struct Entry {
    pub cursor: String,
    pub realtime_usec: u64,
    pub monotonic_usec: Option<u64>,
    pub fields: JournalRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The wait elapsed without the store gaining new entries.
    Timeout,
    /// New entries may be available, try stepping again.
    NewData,
}
