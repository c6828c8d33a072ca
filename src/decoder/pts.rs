// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Association of stream offsets with timestamps.
//!
//! Every decode unit written to the stream ring is tagged with the ring offset it starts at. When
//! the parser reports a header, the offset it has consumed identifies the unit the frame came
//! from, and therefore its timestamp.

use std::collections::VecDeque;

use log::warn;

/// What a decode unit carries besides its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtsMark {
    Timestamp(u64),
    /// The unit is the end-of-stream sentinel.
    EndOfStream,
}

/// Upper bound on the entries kept, in case the parser never catches up.
const MAX_ENTRIES: usize = 128;

#[derive(Debug, Default)]
pub struct PtsManager {
    entries: VecDeque<(u64, PtsMark)>,
}

impl PtsManager {
    pub fn new() -> Self {
        Default::default()
    }

    /// Records that the unit starting at `offset` carries `mark`.
    pub fn insert(&mut self, offset: u64, mark: PtsMark) {
        if let Some(&(last, _)) = self.entries.back() {
            if offset < last {
                warn!("out of order stream offset {} after {}", offset, last);
                self.entries.clear();
            }
        }

        if self.entries.len() == MAX_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back((offset, mark));
    }

    /// Returns the mark of the unit containing `offset`, forgetting every earlier unit.
    pub fn lookup(&mut self, offset: u64) -> Option<PtsMark> {
        let position = self.entries.iter().rposition(|&(o, _)| o <= offset)?;
        self.entries.drain(..position);

        self.entries.front().map(|&(_, mark)| mark)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
