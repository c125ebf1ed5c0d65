//! Run-length coding of pixel data: a sequence of `(count, byte)` pairs.

use crate::error::{PacsError, Result};

pub fn encode(raw: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(raw.len() / 2 + 2);
    let mut iter = raw.iter().copied().peekable();
    while let Some(byte) = iter.next() {
        let mut run: u8 = 1;
        while run < u8::MAX && iter.peek() == Some(&byte) {
            iter.next();
            run += 1;
        }
        encoded.push(run);
        encoded.push(byte);
    }
    encoded
}

pub fn decode(encoded: &[u8]) -> Result<Vec<u8>> {
    if encoded.len() % 2 != 0 {
        return Err(PacsError::Internal(format!(
            "RLE stream has odd length {}",
            encoded.len()
        )));
    }
    let mut raw = Vec::with_capacity(encoded.len() * 2);
    for pair in encoded.chunks_exact(2) {
        let (count, byte) = (pair[0], pair[1]);
        if count == 0 {
            return Err(PacsError::Internal("RLE stream contains an empty run".into()));
        }
        raw.extend(std::iter::repeat_n(byte, usize::from(count)));
    }
    Ok(raw)
}
