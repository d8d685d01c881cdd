//! Append-only log tailing primitives.

use std::io::SeekFrom;
use std::path::Path;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Read exactly `[start, end)` from `path`. The file is opened and closed per call.
pub(crate) async fn read_range(path: &Path, start: u64, end: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let len = end.saturating_sub(start) as usize;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Split every complete `\n`-terminated line off the front of `carry`,
/// leaving the unterminated remainder in place.
pub(crate) fn take_complete_lines(carry: &mut BytesMut) -> Vec<Bytes> {
    let mut lines = Vec::new();
    while let Some(pos) = carry.iter().position(|b| *b == b'\n') {
        let mut line = carry.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(pos - 1);
        }
        lines.push(line.freeze());
    }
    lines
}
