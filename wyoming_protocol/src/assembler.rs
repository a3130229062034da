use log::{debug, warn};

/// Default cap on buffered PCM. Tunable through [`AudioAssembler::new`];
/// it bounds memory, it does not define a valid stream length.
pub const DEFAULT_MAX_AUDIO_BYTES: usize = 100_000;

/// What happened to a chunk handed to [`AudioAssembler::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The size guard tripped; `dropped` bytes of this chunk were discarded.
    Truncated { dropped: usize },
    /// `finalize` was already called; the chunk was ignored.
    Rejected,
}

/// Accumulates decoded PCM chunks in arrival order.
#[derive(Debug)]
pub struct AudioAssembler {
    buffer: Vec<u8>,
    max_bytes: usize,
    chunks: usize,
    truncated: bool,
    finalized: bool,
}

impl AudioAssembler {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_bytes,
            chunks: 0,
            truncated: false,
            finalized: false,
        }
    }

    pub fn append(&mut self, chunk: &[u8]) -> AppendOutcome {
        if self.finalized {
            warn!("⚠️ Ignoring {} bytes appended after finalize", chunk.len());
            return AppendOutcome::Rejected;
        }

        self.chunks += 1;
        let room = self.max_bytes.saturating_sub(self.buffer.len());
        if chunk.len() <= room {
            self.buffer.extend_from_slice(chunk);
            debug!(
                "🎵 Buffered chunk {}: {} bytes ({} total)",
                self.chunks,
                chunk.len(),
                self.buffer.len()
            );
            return AppendOutcome::Appended;
        }

        self.buffer.extend_from_slice(&chunk[..room]);
        if !self.truncated {
            warn!(
                "✂️ Audio stream truncated at {} bytes (size guard)",
                self.max_bytes
            );
        }
        self.truncated = true;
        AppendOutcome::Truncated {
            dropped: chunk.len() - room,
        }
    }

    /// Seal the buffer and return its contents. Later calls return the same bytes.
    pub fn finalize(&mut self) -> &[u8] {
        self.finalized = true;
        &self.buffer
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks
    }
}

impl Default for AudioAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AUDIO_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_in_order() {
        let mut assembler = AudioAssembler::default();
        assert_eq!(assembler.append(&[1, 2]), AppendOutcome::Appended);
        assert_eq!(assembler.append(&[]), AppendOutcome::Appended);
        assert_eq!(assembler.append(&[3, 4, 5, 6]), AppendOutcome::Appended);

        assert_eq!(assembler.finalize(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(assembler.chunk_count(), 3);
        assert!(!assembler.is_truncated());
    }

    #[test]
    fn test_size_guard_keeps_prefix() {
        let mut assembler = AudioAssembler::new(5);
        assert_eq!(assembler.append(&[1, 2, 3]), AppendOutcome::Appended);
        assert_eq!(
            assembler.append(&[4, 5, 6, 7]),
            AppendOutcome::Truncated { dropped: 2 }
        );
        assert_eq!(
            assembler.append(&[8]),
            AppendOutcome::Truncated { dropped: 1 }
        );

        assert!(assembler.is_truncated());
        assert_eq!(assembler.finalize(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut assembler = AudioAssembler::default();
        assembler.append(&[9, 9]);

        let first = assembler.finalize().to_vec();
        assert_eq!(assembler.append(&[1]), AppendOutcome::Rejected);
        let second = assembler.finalize().to_vec();

        assert_eq!(first, second);
        assert_eq!(second, vec![9, 9]);
        assert_eq!(assembler.chunk_count(), 1);
    }
}
