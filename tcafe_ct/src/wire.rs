use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(display("truncated input reading {context}"))]
pub struct WireError {
    pub context: &'static str,
}

pub type Result<T, E = WireError> = std::result::Result<T, E>;

/// Checked cursor over the TLS-wire encoding RFC 6962 uses for leaves.
pub struct WireReader<'a> {
    input: &'a [u8],
    offset: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.input.len() - self.offset
    }

    pub fn read_bytes(&mut self, len: usize, context: &'static str) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(WireError { context });
        }
        let bytes = &self.input[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    pub fn read_u8(&mut self, context: &'static str) -> Result<u8> {
        Ok(self.read_bytes(1, context)?[0])
    }

    pub fn read_u16(&mut self, context: &'static str) -> Result<u16> {
        let bytes = self.read_bytes(2, context)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u24(&mut self, context: &'static str) -> Result<u32> {
        let bytes = self.read_bytes(3, context)?;
        Ok(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }

    pub fn read_u64(&mut self, context: &'static str) -> Result<u64> {
        let bytes = self.read_bytes(8, context)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(buf))
    }

    /// `opaque<0..2^24-1>`: a 3-byte length followed by that many bytes.
    pub fn read_u24_prefixed(&mut self, context: &'static str) -> Result<&'a [u8]> {
        let len = self.read_u24(context)? as usize;
        self.read_bytes(len, context)
    }

    /// `opaque<0..2^16-1>`: a 2-byte length followed by that many bytes.
    pub fn read_u16_prefixed(&mut self, context: &'static str) -> Result<&'a [u8]> {
        let len = self.read_u16(context)? as usize;
        self.read_bytes(len, context)
    }
}
