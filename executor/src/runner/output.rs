use bytes::{BufMut, Bytes, BytesMut};

/// Collects container output up to a fixed size, dropping control bytes on
/// the way in.
///
/// Bytes `0x00..=0x1f` and `0x7f` are removed except tab, newline and
/// carriage return, and so are the UTF-8 encoded C1 controls `U+0080..=U+009F`.
/// Everything past `size_limit` (counted after stripping) is discarded and
/// marks the buffer as truncated.
pub struct OutputBuffer {
    size_limit: usize,
    bytes: BytesMut,
    truncated: bool,
    /// A `0xc2` lead byte whose continuation has not arrived yet.
    held_lead: bool,
}

const C1_LEAD: u8 = 0xc2;

fn is_kept(b: u8) -> bool {
    !matches!(b, 0x00..=0x08 | 0x0b | 0x0c | 0x0e..=0x1f | 0x7f)
}

impl OutputBuffer {
    pub fn new(size_limit: usize) -> Self {
        OutputBuffer {
            size_limit,
            bytes: BytesMut::new(),
            truncated: false,
            held_lead: false,
        }
    }

    pub fn append(&mut self, chunk: &[u8]) {
        for &b in chunk {
            if self.truncated {
                return;
            }
            if std::mem::take(&mut self.held_lead) {
                if matches!(b, 0x80..=0x9f) {
                    continue;
                }
                self.push(C1_LEAD);
            }
            if b == C1_LEAD {
                self.held_lead = true;
            } else if is_kept(b) {
                self.push(b);
            }
        }
    }

    fn push(&mut self, b: u8) {
        if self.bytes.len() >= self.size_limit {
            self.truncated = true;
        } else {
            self.bytes.put_u8(b);
        }
    }

    /// Whether more output arrived than could be kept. Once true, further
    /// input is ignored.
    pub fn is_oversized(&self) -> bool {
        self.truncated
    }

    /// Returns the collected bytes and whether they were truncated.
    pub fn finish(mut self) -> (Bytes, bool) {
        if std::mem::take(&mut self.held_lead) && !self.truncated {
            self.push(C1_LEAD);
        }
        (self.bytes.freeze(), self.truncated)
    }
}
