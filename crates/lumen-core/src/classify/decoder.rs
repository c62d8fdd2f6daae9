//! Incremental UTF-8 decoding across arbitrary chunk boundaries.

/// Decodes a byte stream chunk by chunk.
///
/// Complete sequences are decoded immediately; a trailing incomplete
/// sequence (at most three bytes) is held until the next chunk. The
/// concatenated output equals `String::from_utf8_lossy` over the whole
/// input, however the input was split.
#[derive(Debug, Default, Clone)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `chunk`, returning everything that is now complete.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(chunk);

        let mut out = String::with_capacity(input.len());
        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush the decoder at end of stream. A dangling partial sequence
    /// decodes to a single U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_split(input: &[u8], cuts: &[usize]) -> String {
        let mut decoder = Utf8Decoder::new();
        let mut out = String::new();
        let mut start = 0;
        for &cut in cuts {
            out.push_str(&decoder.decode(&input[start..cut]));
            start = cut;
        }
        out.push_str(&decoder.decode(&input[start..]));
        out.push_str(&decoder.finish());
        out
    }

    #[test]
    fn every_single_split_matches_lossy() {
        let mut input = "┌─ Begin Model Training ─┐ 50% complete. 10_duty/serial01.json ✓\n"
            .as_bytes()
            .to_vec();
        input.extend_from_slice(&[0xFF, b'a', 0xE2, 0x94, b'b', 0xF0, 0x9F, 0x98]);
        let expected = String::from_utf8_lossy(&input).into_owned();

        for cut in 0..=input.len() {
            assert_eq!(decode_split(&input, &[cut]), expected, "split at {cut}");
        }
    }

    #[test]
    fn byte_at_a_time_matches_lossy() {
        let input = "µ=0.42 σ=0.07 → ok\n".as_bytes();
        let cuts: Vec<usize> = (1..input.len()).collect();
        assert_eq!(decode_split(input, &cuts), String::from_utf8_lossy(input));
    }

    #[test]
    fn holds_incomplete_tail() {
        let mut decoder = Utf8Decoder::new();
        // "é" is C3 A9.
        assert_eq!(decoder.decode(b"caf\xC3"), "caf");
        assert_eq!(decoder.decode(b"\xA9!"), "é!");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn dangling_tail_becomes_one_replacement() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"ok\xF0\x9F"), "ok");
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert_eq!(String::from_utf8_lossy(b"ok\xF0\x9F"), "ok\u{FFFD}");
    }
}
