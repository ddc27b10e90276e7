use std::io::{self, Write};

use flate2::write::GzEncoder;
use flate2::Compression;

/// Writer that only counts bytes, so sizing never buffers the compressed output.
#[derive(Debug, Default)]
struct ByteCounter {
    written: u64,
}

impl Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn gzip_len(data: &[u8]) -> io::Result<u64> {
    let mut encoder = GzEncoder::new(ByteCounter::default(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?.written)
}

pub fn gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
pub fn gunzip(data: &[u8]) -> io::Result<Vec<u8>> {
    use std::io::Read;

    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}
