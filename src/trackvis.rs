//! TrackVis (`.trk`, version 2) streamline files.
//!
//! The 1000 byte header carries the volume dims, voxel size and voxel order. Points are stored
//! in "voxmm" space (voxel coordinates scaled by the voxel size); this module converts to and
//! from voxel coordinates.

use crate::error::{PipelineError, Result};
use crate::tracking::Streamline;
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::Path;

const HDR_SIZE: i32 = 1000;
const MAGIC: &[u8; 6] = b"TRACK\0";

#[derive(Debug, Clone, PartialEq)]
pub struct TrkHeader {
    pub dim: [i16; 3],
    pub voxel_size: [f32; 3],
    pub voxel_order: [u8; 4],
    /// number of streamlines, 0 when unknown
    pub n_count: i32,
}

impl TrkHeader {
    pub fn new(dim: [usize; 3], voxel_size: [f64; 3], voxel_order: &str) -> Self {
        let mut order = [0u8; 4];
        order.iter_mut().zip(voxel_order.bytes().take(3)).for_each(|(o, b)| *o = b);
        Self {
            dim: [dim[0] as i16, dim[1] as i16, dim[2] as i16],
            voxel_size: [voxel_size[0] as f32, voxel_size[1] as f32, voxel_size[2] as f32],
            voxel_order: order,
            n_count: 0,
        }
    }

    pub fn voxel_order(&self) -> String {
        self.voxel_order.iter().take_while(|&&b| b != 0).map(|&b| b as char).collect()
    }
}

fn encode_header<W: Write>(w: &mut W, header: &TrkHeader, n_count: i32) -> std::io::Result<()> {
    w.write_all(MAGIC)?;
    for d in header.dim {
        w.write_i16::<LittleEndian>(d)?;
    }
    for v in header.voxel_size {
        w.write_f32::<LittleEndian>(v)?;
    }
    // origin
    w.write_all(&[0u8; 12])?;
    // n_scalars, scalar_name, n_properties, property_name
    w.write_i16::<LittleEndian>(0)?;
    w.write_all(&[0u8; 200])?;
    w.write_i16::<LittleEndian>(0)?;
    w.write_all(&[0u8; 200])?;
    // vox_to_ras is left unset, reserved
    w.write_all(&[0u8; 64])?;
    w.write_all(&[0u8; 444])?;
    w.write_all(&header.voxel_order)?;
    // pad2, image_orientation_patient, pad1, invert/swap flags
    w.write_all(&[0u8; 4])?;
    w.write_all(&[0u8; 24])?;
    w.write_all(&[0u8; 2])?;
    w.write_all(&[0u8; 6])?;
    w.write_i32::<LittleEndian>(n_count)?;
    w.write_i32::<LittleEndian>(2)?;
    w.write_i32::<LittleEndian>(HDR_SIZE)?;
    Ok(())
}

/// encodes streamlines given in voxel coordinates
pub fn encode_trk(header: &TrkHeader, streamlines: &[Streamline]) -> Vec<u8> {
    let n_points: usize = streamlines.iter().map(|s| s.len()).sum();
    let mut buf = Vec::with_capacity(HDR_SIZE as usize + 4 * streamlines.len() + 12 * n_points);
    // writes into a Vec cannot fail
    let _ = write_body(&mut buf, header, streamlines);
    buf
}

fn write_body(buf: &mut Vec<u8>, header: &TrkHeader, streamlines: &[Streamline]) -> std::io::Result<()> {
    encode_header(buf, header, streamlines.len() as i32)?;
    for s in streamlines {
        buf.write_i32::<LittleEndian>(s.len() as i32)?;
        for p in s {
            for c in 0..3 {
                buf.write_f32::<LittleEndian>(p[c] as f32 * header.voxel_size[c])?;
            }
        }
    }
    Ok(())
}

pub fn write_trk(path: impl AsRef<Path>, header: &TrkHeader, streamlines: &[Streamline]) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, encode_trk(header, streamlines)).map_err(|e| PipelineError::io(path, e))
}

pub fn read_trk(path: impl AsRef<Path>) -> Result<(TrkHeader, Vec<Streamline>)> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(PipelineError::MissingInput { path: path.to_path_buf() });
    }
    let bytes = fs::read(path).map_err(|e| PipelineError::io(path, e))?;
    decode_trk(&bytes).map_err(|reason| PipelineError::malformed(path, reason))
}

/// decodes a trk buffer, returning streamlines in voxel coordinates
pub fn decode_trk(bytes: &[u8]) -> std::result::Result<(TrkHeader, Vec<Streamline>), String> {
    if bytes.len() < HDR_SIZE as usize {
        return Err(format!("{} bytes is shorter than the header", bytes.len()));
    }
    if &bytes[0..5] != b"TRACK" {
        return Err("missing TRACK signature".to_string());
    }
    if LittleEndian::read_i32(&bytes[996..1000]) == HDR_SIZE {
        decode_with::<LittleEndian>(bytes)
    } else if BigEndian::read_i32(&bytes[996..1000]) == HDR_SIZE {
        decode_with::<BigEndian>(bytes)
    } else {
        Err("header size field is not 1000".to_string())
    }
}

fn decode_with<B: ByteOrder>(bytes: &[u8]) -> std::result::Result<(TrkHeader, Vec<Streamline>), String> {
    let mut dim = [0i16; 3];
    for (i, d) in dim.iter_mut().enumerate() {
        *d = B::read_i16(&bytes[6 + 2 * i..8 + 2 * i]);
    }
    let mut voxel_size = [0f32; 3];
    for (i, v) in voxel_size.iter_mut().enumerate() {
        *v = B::read_f32(&bytes[12 + 4 * i..16 + 4 * i]);
    }
    let n_scalars = B::read_i16(&bytes[36..38]).max(0) as usize;
    let n_properties = B::read_i16(&bytes[238..240]).max(0) as usize;
    let mut voxel_order = [0u8; 4];
    voxel_order.copy_from_slice(&bytes[948..952]);
    let n_count = B::read_i32(&bytes[988..992]);

    let header = TrkHeader { dim, voxel_size, voxel_order, n_count };
    let scale = voxel_size.map(|v| if v > 0. { v as f64 } else { 1. });

    let mut cursor = Cursor::new(&bytes[HDR_SIZE as usize..]);
    let body_len = bytes.len() - HDR_SIZE as usize;
    let mut streamlines = Vec::new();
    loop {
        if n_count > 0 && streamlines.len() == n_count as usize {
            break;
        }
        if cursor.position() as usize == body_len {
            if n_count > 0 {
                return Err(format!("expected {} streamlines, found {}", n_count, streamlines.len()));
            }
            break;
        }
        let n_points = cursor.read_i32::<B>().map_err(|_| "truncated streamline length".to_string())?;
        if n_points < 0 {
            return Err(format!("negative point count {}", n_points));
        }
        let record = (3 + n_scalars) * 4;
        let needed = n_points as usize * record + n_properties * 4;
        if body_len - (cursor.position() as usize) < needed {
            return Err(format!("streamline {} is truncated", streamlines.len()));
        }
        let mut s = Vec::with_capacity(n_points as usize);
        for _ in 0..n_points {
            let mut p = [0.; 3];
            for c in 0..3 {
                let v = cursor.read_f32::<B>().map_err(|e| e.to_string())?;
                p[c] = v as f64 / scale[c];
            }
            let mut skip = vec![0u8; n_scalars * 4];
            cursor.read_exact(&mut skip).map_err(|e| e.to_string())?;
            s.push(p);
        }
        let mut skip = vec![0u8; n_properties * 4];
        cursor.read_exact(&mut skip).map_err(|e| e.to_string())?;
        streamlines.push(s);
    }
    Ok((header, streamlines))
}
