//! Newline framing shared by everything that reads line-delimited JSON off the
//! network: the survey stream client and the Ollama streaming reader.

/// Holds the unterminated tail of a byte stream between reads.
///
/// Bytes are buffered rather than text so that a multi-byte character split
/// across two reads is put back together before decoding. `\n` never occurs
/// inside a UTF-8 multi-byte sequence, so splitting on it is safe.
#[derive(Debug, Default)]
pub struct LineBuffer {
    carry: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every line it completed, without the newline.
    ///
    /// Complete lines that are not valid UTF-8 are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        // The carry never holds a newline between calls, so only the new
        // bytes need scanning.
        let Some(last_newline) = chunk.iter().rposition(|b| *b == b'\n') else {
            self.carry.extend_from_slice(chunk);
            return Vec::new();
        };

        let mut complete = std::mem::take(&mut self.carry);
        complete.extend_from_slice(&chunk[..last_newline]);
        self.carry.extend_from_slice(&chunk[last_newline + 1..]);

        complete
            .split(|b| *b == b'\n')
            .filter_map(|line| std::str::from_utf8(line).ok())
            .map(str::to_string)
            .collect()
    }

    /// Takes whatever is left once the source has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.carry);
        String::from_utf8(rest).ok()
    }

    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}
