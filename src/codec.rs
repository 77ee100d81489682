//! Streaming helpers that move bytes between a container file and a stream,
//! either verbatim or through a block cipher, chunked through bounded buffers.
//!
//! Every loop polls the operation's [`Probe`] before the next read, so large
//! copies and encryptions stay cancellable. The cipher's `update` may emit
//! nothing for a given chunk (it buffers until a whole block is available);
//! only the final ciphertext length and content are significant, not the
//! intermediate write boundaries.

use std::io::{Read, Write};

use crate::crypto::Cipher;
use crate::error::SafeError;
use crate::progress::Probe;

/// Default chunk size for streaming operations.
pub const BUFFER_SIZE: usize = 1 << 20; // 1 MiB

/// Chunked byte-for-byte copy until `src` is exhausted. Returns bytes copied.
pub fn copy<R, W>(src: &mut R, dst: &mut W, buf: &mut [u8], probe: &Probe) -> Result<u64, SafeError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut total: u64 = 0;
    loop {
        probe.check()?;
        let n = src.read(buf)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])?;
        total += n as u64;
        probe.advance(n as u64);
    }
    Ok(total)
}

/// Copy exactly `length` bytes from `src` to `dst`. Errors if `src` ends early.
pub fn copy_exact<R, W>(
    src: &mut R,
    dst: &mut W,
    length: u64,
    buf: &mut [u8],
    probe: &Probe,
) -> Result<(), SafeError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut remaining = length;
    while remaining > 0 {
        probe.check()?;
        let take = remaining.min(buf.len() as u64) as usize;
        src.read_exact(&mut buf[..take])?;
        dst.write_all(&buf[..take])?;
        remaining -= take as u64;
        probe.advance(take as u64);
    }
    Ok(())
}

/// Push a plaintext stream through `cipher` into `dst`, finalizing the cipher
/// at EOF. Returns the total ciphertext length, which the caller persists as
/// the segment's length prefix.
pub fn encrypt<R, W>(
    src: &mut R,
    cipher: &mut dyn Cipher,
    dst: &mut W,
    buf: &mut [u8],
    probe: &Probe,
) -> Result<u64, SafeError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut written: u64 = 0;
    loop {
        probe.check()?;
        let n = src.read(buf)?;
        if n == 0 {
            break;
        }
        let out = cipher.update(&buf[..n])?;
        if !out.is_empty() {
            dst.write_all(&out)?;
            written += out.len() as u64;
        }
        probe.advance(n as u64);
    }
    let last = cipher.finalize()?;
    dst.write_all(&last)?;
    written += last.len() as u64;
    Ok(written)
}

/// Read exactly `length` ciphertext bytes from `src`, decrypt through `cipher`
/// and write the plaintext to `dst`. Returns the plaintext length.
pub fn decrypt<R, W>(
    src: &mut R,
    length: u64,
    cipher: &mut dyn Cipher,
    dst: &mut W,
    buf: &mut [u8],
    probe: &Probe,
) -> Result<u64, SafeError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut remaining = length;
    let mut written: u64 = 0;
    while remaining > 0 {
        probe.check()?;
        let take = remaining.min(buf.len() as u64) as usize;
        src.read_exact(&mut buf[..take])?;
        let out = cipher.update(&buf[..take])?;
        if !out.is_empty() {
            dst.write_all(&out)?;
            written += out.len() as u64;
        }
        remaining -= take as u64;
        probe.advance(take as u64);
    }
    let last = cipher.finalize()?;
    dst.write_all(&last)?;
    written += last.len() as u64;
    Ok(written)
}
