// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Internal memory of a VP9 decoder instance.
//!
//! The working buffers and the motion-vector prediction buffers do not depend on the stream being
//! decoded, so they survive a stream reset: the instance being torn down hands them to its
//! replacement.

use log::debug;
use log::error;

use crate::backend::BufferAllocator;
use crate::backend::DmaBuffer;
use crate::decoder::DecoderError;
use crate::decoder::Result;

/// Names and sizes of the working buffers the firmware needs.
const WORKING_BUFFERS: &[(&str, usize)] = &[
    ("rpm", 0x400 * 2),
    ("short_term_rps", 0x800),
    ("picture_param", 0x2000),
    ("swap", 0x800),
    ("swap2", 0x800),
    ("local_memory", 0x800),
    ("ipp_line_buffer", 0x4000),
    ("sao_up", 0x2800),
    ("scale_lut", 0x8000),
    ("deblock_parameters", 0x8_0000),
    ("deblock_data", 0x8_0000),
    ("segment_map", 0xd800),
    ("probability_buffer", 0x1000 * 5),
    ("count_buffer", 0x300 * 4 * 4),
    ("motion_prediction_above", 0x1_0000),
    ("frame_map_mmu", 0x1200 * 4),
];

const PROBABILITY_BUFFER: &str = "probability_buffer";
const COUNT_BUFFER: &str = "count_buffer";

/// Bytes appended to each working buffer when overrun checking is enabled.
pub const CANARY_SIZE: usize = 64;
const CANARY_BYTE: u8 = 0xa5;

/// Size of a motion-vector prediction buffer, enough for 4096x2304.
pub const MPRED_BUFFER_SIZE: usize = 0x12_0000;

pub struct WorkingBuffers {
    buffers: Vec<DmaBuffer>,
    canaries: bool,
    secure: bool,
}

impl WorkingBuffers {
    pub fn allocate(
        allocator: &mut dyn BufferAllocator,
        secure: bool,
        check_overrun: bool,
    ) -> Result<Self> {
        // Secure buffers cannot be inspected by the CPU.
        let canaries = check_overrun && !secure;
        let extra = if canaries { CANARY_SIZE } else { 0 };

        let buffers = WORKING_BUFFERS
            .iter()
            .map(|&(name, size)| {
                allocator
                    .allocate(name, size + extra, secure)
                    .map_err(|source| DecoderError::Allocation { name, source })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut working = Self {
            buffers,
            canaries,
            secure,
        };
        working.arm_canaries();

        Ok(working)
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn buffers(&self) -> Vec<&DmaBuffer> {
        self.buffers.iter().collect()
    }

    fn index_of(name: &str) -> usize {
        WORKING_BUFFERS
            .iter()
            .position(|&(n, _)| n == name)
            .unwrap_or_default()
    }

    /// Returns the probability buffer, writable, and the count buffer.
    pub fn adaptation_buffers(&mut self) -> (&mut DmaBuffer, &DmaBuffer) {
        let probabilities = Self::index_of(PROBABILITY_BUFFER);
        let counts = Self::index_of(COUNT_BUFFER);
        debug_assert!(probabilities < counts);

        let (head, tail) = self.buffers.split_at_mut(counts);
        (&mut head[probabilities], &tail[0])
    }

    fn arm_canaries(&mut self) {
        if !self.canaries {
            return;
        }

        for buffer in &mut self.buffers {
            let size = buffer.size();
            if let Some(data) = buffer.data_mut() {
                data[size - CANARY_SIZE..].fill(CANARY_BYTE);
            }
        }
    }

    /// Fails if the firmware wrote past the end of any working buffer.
    pub fn check_canaries(&self) -> Result<()> {
        if !self.canaries {
            return Ok(());
        }

        for buffer in &self.buffers {
            let Some(data) = buffer.data() else {
                continue;
            };
            let size = buffer.size();
            if data[size - CANARY_SIZE..].iter().any(|&b| b != CANARY_BYTE) {
                error!("working buffer {} was overrun", buffer.name());
                return Err(DecoderError::BufferOverrun(buffer.name()));
            }
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn buffer_mut(&mut self, name: &str) -> &mut DmaBuffer {
        &mut self.buffers[Self::index_of(name)]
    }
}

/// Motion-vector prediction buffers.
///
/// The core writes the vectors of the frame being decoded into `current` and reads those of the
/// previous frame from `previous`. Buffers no longer needed go back to a small cache.
pub struct MpredBuffers {
    current: Option<DmaBuffer>,
    previous: Option<DmaBuffer>,
    cache: Vec<DmaBuffer>,
    cache_size: usize,
    secure: bool,
}

impl MpredBuffers {
    pub fn new(cache_size: usize, secure: bool) -> Self {
        Self {
            current: None,
            previous: None,
            cache: Vec::new(),
            cache_size,
            secure,
        }
    }

    /// Makes sure there is a buffer for the frame about to be decoded.
    pub fn ensure_current(&mut self, allocator: &mut dyn BufferAllocator) -> Result<&DmaBuffer> {
        let buffer = match self.current.take().or_else(|| self.cache.pop()) {
            Some(buffer) => buffer,
            None => allocator
                .allocate("mpred", MPRED_BUFFER_SIZE, self.secure)
                .map_err(|source| DecoderError::Allocation {
                    name: "mpred",
                    source,
                })?,
        };

        Ok(self.current.insert(buffer))
    }

    pub fn current(&self) -> Option<&DmaBuffer> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> Option<&DmaBuffer> {
        self.previous.as_ref()
    }

    /// The current frame is done: its vectors become the previous ones.
    pub fn rotate(&mut self) {
        let Some(current) = self.current.take() else {
            return;
        };

        if let Some(old) = self.previous.replace(current) {
            if self.cache.len() < self.cache_size {
                self.cache.push(old);
            } else {
                debug!("mpred cache full, freeing buffer");
            }
        }
    }

    /// Drops the vectors of the frame being decoded, keeping its buffer for reuse.
    pub fn discard_current(&mut self) {
        if let Some(current) = self.current.take() {
            self.cache.push(current);
        }
    }

    /// Moves every buffer back to the cache, forgetting which frames they belonged to.
    pub fn reclaim(&mut self) {
        self.cache.extend(self.previous.take());
        self.cache.extend(self.current.take());
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

/// The memory a decoder instance can hand over to its replacement.
pub struct InternalBuffers {
    pub working: WorkingBuffers,
    pub mpred: MpredBuffers,
}

impl InternalBuffers {
    pub fn allocate(
        allocator: &mut dyn BufferAllocator,
        secure: bool,
        check_overrun: bool,
        mpred_cache_size: usize,
    ) -> Result<Self> {
        Ok(Self {
            working: WorkingBuffers::allocate(allocator, secure, check_overrun)?,
            mpred: MpredBuffers::new(mpred_cache_size, secure),
        })
    }

    pub fn is_secure(&self) -> bool {
        self.working.is_secure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyAllocator;

    #[test]
    fn canaries_detect_overrun() {
        let mut allocator = DummyAllocator::default();
        let mut working = WorkingBuffers::allocate(&mut allocator, false, true).unwrap();
        assert!(working.check_canaries().is_ok());

        let buffer = working.buffer_mut("segment_map");
        let size = buffer.size();
        buffer.data_mut().unwrap()[size - CANARY_SIZE] = 0;

        assert!(matches!(
            working.check_canaries(),
            Err(DecoderError::BufferOverrun("segment_map"))
        ));
    }

    #[test]
    fn secure_buffers_skip_canaries() {
        let mut allocator = DummyAllocator::default();
        let working = WorkingBuffers::allocate(&mut allocator, true, true).unwrap();

        assert!(working.is_secure());
        assert!(working.check_canaries().is_ok());
        assert_eq!(
            working.buffers()[0].size(),
            WORKING_BUFFERS[0].1,
            "no canary space for secure buffers"
        );
    }

    #[test]
    fn allocation_failure_is_reported() {
        let mut allocator = DummyAllocator::failing_after(3);

        let err = WorkingBuffers::allocate(&mut allocator, false, false)
            .err()
            .unwrap();
        assert!(matches!(err, DecoderError::Allocation { name: "swap", .. }));
    }

    #[test]
    fn mpred_buffers_are_recycled() {
        let mut allocator = DummyAllocator::default();
        let mut mpred = MpredBuffers::new(1, false);

        let first = mpred.ensure_current(&mut allocator).unwrap().phys_addr();
        mpred.rotate();
        assert_eq!(mpred.previous().unwrap().phys_addr(), first);

        let second = mpred.ensure_current(&mut allocator).unwrap().phys_addr();
        assert_ne!(first, second);
        mpred.rotate();
        assert_eq!(mpred.cached(), 1);

        // The third frame reuses the first buffer.
        let third = mpred.ensure_current(&mut allocator).unwrap().phys_addr();
        assert_eq!(third, first);
        assert_eq!(allocator.allocations, 2);
    }
}
