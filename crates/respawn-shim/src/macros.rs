/// Debug-only stderr line, gated on `RESPAWN_DEBUG` at load time.
///
/// Formats into a stack buffer and issues one raw `write(2)`; no heap, no
/// Rust TLS, no stdio locks. Safe inside a library constructor.
#[macro_export]
macro_rules! shim_debug {
    ($($arg:tt)*) => {
        {
            if $crate::state::DEBUG_ENABLED.load(std::sync::atomic::Ordering::Relaxed) {
                use std::fmt::Write;
                let mut buf = [0u8; 512];
                let mut wrapper = $crate::macros::StackWriter::new(&mut buf);
                let _ = write!(wrapper, "[respawn] ");
                let _ = write!(wrapper, $($arg)*);
                wrapper.finish_line();
                let _errno = $crate::state::ErrnoGuard::save();
                let _sigpipe = $crate::state::SigpipeGuard::block();
                unsafe { $crate::state::write_all(2, wrapper.as_bytes()) };
            }
        }
    };
}

/// Fixed-capacity, truncating formatter over a caller-provided buffer.
pub struct StackWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> StackWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.buf[..self.pos]).unwrap_or("")
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    pub fn is_full(&self) -> bool {
        self.pos == self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Append raw bytes, e.g. a path that is not valid UTF-8.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        let remaining = self.buf.len() - self.pos;
        let to_copy = std::cmp::min(bytes.len(), remaining);
        self.buf[self.pos..self.pos + to_copy].copy_from_slice(&bytes[..to_copy]);
        self.pos += to_copy;
    }

    /// Terminate with `\n`, overwriting the last byte if the buffer is full.
    pub fn finish_line(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        if self.is_full() {
            self.buf[self.pos - 1] = b'\n';
        } else {
            self.buf[self.pos] = b'\n';
            self.pos += 1;
        }
    }

    /// Consume the writer, keeping the borrow of the underlying buffer.
    pub fn into_bytes(self) -> &'a [u8] {
        let StackWriter { buf, pos } = self;
        &buf[..pos]
    }
}

impl<'a> std::fmt::Write for StackWriter<'a> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}
