//! RecordIO framing: each record is `<decimal length>\n<bytes>`.

use bytes::{Buf, Bytes, BytesMut};

use super::DriverError;

/// Records longer than this are treated as a corrupt stream.
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// Incremental decoder fed with arbitrary chunks of the response body.
#[derive(Debug, Default)]
pub struct RecordIoDecoder {
    buf: BytesMut,
    /// Length of the record being read, once its header is consumed.
    pending: Option<usize>,
}

impl RecordIoDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Returns the next complete record, or `None` if more input is needed.
    pub fn next_record(&mut self) -> Result<Option<Bytes>, DriverError> {
        let len = match self.pending {
            Some(len) => len,
            None => {
                let Some(newline) = self.buf.iter().position(|b| *b == b'\n') else {
                    if self.buf.len() > 20 {
                        return Err(DriverError::Decode("record length header too long".into()));
                    }
                    return Ok(None);
                };
                let header = std::str::from_utf8(&self.buf[..newline])
                    .map_err(|_| DriverError::Decode("record length is not utf-8".into()))?;
                let len: usize = header
                    .trim()
                    .parse()
                    .map_err(|_| DriverError::Decode(format!("bad record length {header:?}")))?;
                if len > MAX_RECORD_LEN {
                    return Err(DriverError::Decode(format!("record of {len} bytes")));
                }
                self.buf.advance(newline + 1);
                self.pending = Some(len);
                len
            }
        };

        if self.buf.len() < len {
            return Ok(None);
        }
        self.pending = None;
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_split_across_chunks() {
        let mut decoder = RecordIoDecoder::new();
        decoder.push(b"5\nhel");
        assert_eq!(decoder.next_record().unwrap(), None);
        decoder.push(b"lo3\nab");
        assert_eq!(decoder.next_record().unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(decoder.next_record().unwrap(), None);
        decoder.push(b"c");
        assert_eq!(decoder.next_record().unwrap().as_deref(), Some(&b"abc"[..]));
        assert_eq!(decoder.next_record().unwrap(), None);
    }

    #[test]
    fn test_bad_header() {
        let mut decoder = RecordIoDecoder::new();
        decoder.push(b"x1\n");
        assert!(matches!(decoder.next_record(), Err(DriverError::Decode(_))));
    }
}
