//! Compact tracks container (`.dpy`). Carries no geometry header: points are voxel
//! coordinates of the volume the tracks were computed on.
//!
//! Layout (little endian): magic `DPYT`, u64 track count, u64 offsets (count + 1, in points),
//! then all points as f32 triplets.

use crate::error::{PipelineError, Result};
use crate::tracking::Streamline;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs;
use std::io::Cursor;
use std::path::Path;

const MAGIC: &[u8; 4] = b"DPYT";

pub fn encode_dpy(streamlines: &[Streamline]) -> Vec<u8> {
    let n_points: usize = streamlines.iter().map(|s| s.len()).sum();
    let mut buf = Vec::with_capacity(12 + 8 * (streamlines.len() + 1) + 12 * n_points);
    buf.extend_from_slice(MAGIC);
    let _ = buf.write_u64::<LittleEndian>(streamlines.len() as u64);
    let mut offset = 0u64;
    let _ = buf.write_u64::<LittleEndian>(offset);
    for s in streamlines {
        offset += s.len() as u64;
        let _ = buf.write_u64::<LittleEndian>(offset);
    }
    for p in streamlines.iter().flatten() {
        for c in p {
            let _ = buf.write_f32::<LittleEndian>(*c as f32);
        }
    }
    buf
}

pub fn write_dpy(path: impl AsRef<Path>, streamlines: &[Streamline]) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, encode_dpy(streamlines)).map_err(|e| PipelineError::io(path, e))
}

pub fn read_dpy(path: impl AsRef<Path>) -> Result<Vec<Streamline>> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(PipelineError::MissingInput { path: path.to_path_buf() });
    }
    let bytes = fs::read(path).map_err(|e| PipelineError::io(path, e))?;
    decode_dpy(&bytes).map_err(|reason| PipelineError::malformed(path, reason))
}

pub fn decode_dpy(bytes: &[u8]) -> std::result::Result<Vec<Streamline>, String> {
    if bytes.len() < 20 || &bytes[0..4] != MAGIC {
        return Err("missing DPYT signature".to_string());
    }
    let mut cursor = Cursor::new(&bytes[4..]);
    let truncated = |_| "truncated container".to_string();
    let n_tracks = cursor.read_u64::<LittleEndian>().map_err(truncated)? as usize;
    let offsets_len = n_tracks.checked_add(1).and_then(|n| n.checked_mul(8)).ok_or("track count overflow")?;
    if bytes.len() < 12 + offsets_len {
        return Err("truncated offsets".to_string());
    }
    let offsets = (0..=n_tracks)
        .map(|_| cursor.read_u64::<LittleEndian>().map(|o| o as usize))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(truncated)?;
    if offsets.windows(2).any(|w| w[1] < w[0]) {
        return Err("offsets are not monotonic".to_string());
    }
    let n_points = *offsets.last().unwrap_or(&0);
    if bytes.len() != 12 + offsets_len + 12 * n_points {
        return Err(format!("expected {} points", n_points));
    }
    let mut streamlines = Vec::with_capacity(n_tracks);
    for w in offsets.windows(2) {
        let mut s = Vec::with_capacity(w[1] - w[0]);
        for _ in w[0]..w[1] {
            let mut p = [0.; 3];
            for c in p.iter_mut() {
                *c = cursor.read_f32::<LittleEndian>().map_err(truncated)? as f64;
            }
            s.push(p);
        }
        streamlines.push(s);
    }
    Ok(streamlines)
}
