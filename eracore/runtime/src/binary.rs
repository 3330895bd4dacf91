//! The compact binary save format: explicit little-endian reader/writer
//! with domain markers (zero runs, row/plane skips, end-of-data), UTF-16LE
//! length-prefixed strings, and compressed integers.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use era_common::{EraError, Result};

use crate::array::{parse_index_key, ArrayVar};
use crate::chara::RuntimeCharacter;
use crate::save;
use crate::value::Value;
use crate::vm::Vm;

const BD_HEADER: u64 = 0x0A1A0A0D41524589;
const BD_VERSION: u32 = 1808;
const BD_DATA_COUNT: u32 = 0;

// File-type tags: 0x00 normal, 0x01 global, 0x02 var, 0x03 chara-var.
#[allow(dead_code)]
const FT_NORMAL: u8 = 0x00;
#[allow(dead_code)]
const FT_GLOBAL: u8 = 0x01;
const FT_VAR: u8 = 0x02;
const FT_CHAR_VAR: u8 = 0x03;

const DT_INT: u8 = 0x00;
const DT_INT_1D: u8 = 0x01;
const DT_INT_2D: u8 = 0x02;
const DT_INT_3D: u8 = 0x03;
const DT_STR: u8 = 0x10;
const DT_STR_1D: u8 = 0x11;
const DT_STR_2D: u8 = 0x12;
const DT_STR_3D: u8 = 0x13;
const DT_SEP: u8 = 0xFD;
const DT_EOC: u8 = 0xFE;
const DT_EOF: u8 = 0xFF;

const EB_BYTE: u8 = 0xCF;
const EB_INT16: u8 = 0xD0;
const EB_INT32: u8 = 0xD1;
const EB_INT64: u8 = 0xD2;
const EB_STRING: u8 = 0xD8;
const EB_EOA1: u8 = 0xE0;
const EB_EOA2: u8 = 0xE1;
const EB_ZERO: u8 = 0xF0;
const EB_ZERO_A1: u8 = 0xF1;
const EB_ZERO_A2: u8 = 0xF2;
const EB_EOD: u8 = 0xFF;

const CHARA_ID_KEY: &str = "__ERAGO_ID__";
const MAX_DENSE_CELLS: usize = 1_000_000;

pub fn is_era_binary_data(data: &[u8]) -> bool {
    data.len() >= 16 && u64::from_le_bytes(data[..8].try_into().expect("8 bytes")) == BD_HEADER
}

// ---- writer ----

struct BinaryWriter {
    buf: Vec<u8>,
}

impl BinaryWriter {
    fn new() -> Self {
        Self { buf: Vec::with_capacity(4096) }
    }

    fn write_header(&mut self) {
        self.buf.extend_from_slice(&BD_HEADER.to_le_bytes());
        self.buf.extend_from_slice(&BD_VERSION.to_le_bytes());
        self.buf.extend_from_slice(&BD_DATA_COUNT.to_le_bytes());
    }

    fn byte(&mut self, b: u8) {
        self.buf.push(b);
    }

    fn int32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn int64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    // .NET BinaryWriter string: 7-bit-encoded byte length + UTF-16LE body.
    fn dotnet_string(&mut self, s: &str) {
        if s.is_empty() {
            self.seven_bit_int(0);
            return;
        }
        let units: Vec<u16> = s.encode_utf16().collect();
        self.seven_bit_int(units.len() * 2);
        for u in units {
            self.buf.extend_from_slice(&u.to_le_bytes());
        }
    }

    fn seven_bit_int(&mut self, v: usize) {
        let mut uv = v as u64;
        while uv >= 0x80 {
            self.buf.push((uv as u8) | 0x80);
            uv >>= 7;
        }
        self.buf.push(uv as u8);
    }

    fn compressed_int(&mut self, v: i64) {
        if (0..=EB_BYTE as i64).contains(&v) {
            self.buf.push(v as u8);
            return;
        }
        if (i16::MIN as i64..=i16::MAX as i64).contains(&v) {
            self.byte(EB_INT16);
            self.buf.extend_from_slice(&(v as i16).to_le_bytes());
            return;
        }
        if (i32::MIN as i64..=i32::MAX as i64).contains(&v) {
            self.byte(EB_INT32);
            self.buf.extend_from_slice(&(v as i32).to_le_bytes());
            return;
        }
        self.byte(EB_INT64);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn keyed_int(&mut self, key: &str, v: i64) {
        self.byte(DT_INT);
        self.dotnet_string(key);
        self.compressed_int(v);
    }

    fn keyed_str(&mut self, key: &str, s: &str) {
        self.byte(DT_STR);
        self.dotnet_string(key);
        self.dotnet_string(s);
    }

    fn keyed_int_1d(&mut self, key: &str, arr: &[i64]) {
        self.byte(DT_INT_1D);
        self.dotnet_string(key);
        self.int32(arr.len() as i32);
        let mut zeros = 0i64;
        for &v in arr {
            if v == 0 {
                zeros += 1;
                continue;
            }
            if zeros > 0 {
                self.byte(EB_ZERO);
                self.compressed_int(zeros);
                zeros = 0;
            }
            self.compressed_int(v);
        }
        self.byte(EB_EOD);
    }

    fn keyed_int_2d(&mut self, key: &str, arr: &[i64], d0: usize, d1: usize) {
        self.byte(DT_INT_2D);
        self.dotnet_string(key);
        self.int32(d0 as i32);
        self.int32(d1 as i32);
        let mut zeros = 0usize;
        let mut zero_rows = 0i64;
        for x in 0..d0 {
            for y in 0..d1 {
                let v = arr[x * d1 + y];
                if v == 0 {
                    zeros += 1;
                    continue;
                }
                if zero_rows > 0 {
                    self.byte(EB_ZERO_A1);
                    self.compressed_int(zero_rows);
                    zero_rows = 0;
                }
                if zeros > 0 {
                    self.byte(EB_ZERO);
                    self.compressed_int(zeros as i64);
                    zeros = 0;
                }
                self.compressed_int(v);
            }
            if zeros == d1 {
                zero_rows += 1;
            } else {
                self.byte(EB_EOA1);
            }
            zeros = 0;
        }
        self.byte(EB_EOD);
    }

    fn keyed_int_3d(&mut self, key: &str, arr: &[i64], d0: usize, d1: usize, d2: usize) {
        self.byte(DT_INT_3D);
        self.dotnet_string(key);
        self.int32(d0 as i32);
        self.int32(d1 as i32);
        self.int32(d2 as i32);
        let mut zeros = 0usize;
        let mut zero_rows = 0usize;
        let mut zero_planes = 0i64;
        for x in 0..d0 {
            for y in 0..d1 {
                for z in 0..d2 {
                    let v = arr[(x * d1 + y) * d2 + z];
                    if v == 0 {
                        zeros += 1;
                        continue;
                    }
                    if zero_planes > 0 {
                        self.byte(EB_ZERO_A2);
                        self.compressed_int(zero_planes);
                        zero_planes = 0;
                    }
                    if zero_rows > 0 {
                        self.byte(EB_ZERO_A1);
                        self.compressed_int(zero_rows as i64);
                        zero_rows = 0;
                    }
                    if zeros > 0 {
                        self.byte(EB_ZERO);
                        self.compressed_int(zeros as i64);
                        zeros = 0;
                    }
                    self.compressed_int(v);
                }
                if zeros == d2 {
                    zero_rows += 1;
                } else {
                    self.byte(EB_EOA1);
                }
                zeros = 0;
            }
            if zero_rows == d1 {
                zero_planes += 1;
            } else {
                self.byte(EB_EOA2);
            }
            zero_rows = 0;
        }
        self.byte(EB_EOD);
    }

    fn keyed_str_1d(&mut self, key: &str, arr: &[String]) {
        self.byte(DT_STR_1D);
        self.dotnet_string(key);
        self.int32(arr.len() as i32);
        let mut zeros = 0i64;
        for s in arr {
            if s.is_empty() {
                zeros += 1;
                continue;
            }
            if zeros > 0 {
                self.byte(EB_ZERO);
                self.compressed_int(zeros);
                zeros = 0;
            }
            self.byte(EB_STRING);
            self.dotnet_string(s);
        }
        self.byte(EB_EOD);
    }

    fn keyed_str_2d(&mut self, key: &str, arr: &[String], d0: usize, d1: usize) {
        self.byte(DT_STR_2D);
        self.dotnet_string(key);
        self.int32(d0 as i32);
        self.int32(d1 as i32);
        let mut zeros = 0usize;
        let mut zero_rows = 0i64;
        for x in 0..d0 {
            for y in 0..d1 {
                let s = &arr[x * d1 + y];
                if s.is_empty() {
                    zeros += 1;
                    continue;
                }
                if zero_rows > 0 {
                    self.byte(EB_ZERO_A1);
                    self.compressed_int(zero_rows);
                    zero_rows = 0;
                }
                if zeros > 0 {
                    self.byte(EB_ZERO);
                    self.compressed_int(zeros as i64);
                    zeros = 0;
                }
                self.byte(EB_STRING);
                self.dotnet_string(s);
            }
            if zeros == d1 {
                zero_rows += 1;
            } else {
                self.byte(EB_EOA1);
            }
            zeros = 0;
        }
        self.byte(EB_EOD);
    }

    fn keyed_str_3d(&mut self, key: &str, arr: &[String], d0: usize, d1: usize, d2: usize) {
        self.byte(DT_STR_3D);
        self.dotnet_string(key);
        self.int32(d0 as i32);
        self.int32(d1 as i32);
        self.int32(d2 as i32);
        let mut zeros = 0usize;
        let mut zero_rows = 0usize;
        let mut zero_planes = 0i64;
        for x in 0..d0 {
            for y in 0..d1 {
                for z in 0..d2 {
                    let s = &arr[(x * d1 + y) * d2 + z];
                    if s.is_empty() {
                        zeros += 1;
                        continue;
                    }
                    if zero_planes > 0 {
                        self.byte(EB_ZERO_A2);
                        self.compressed_int(zero_planes);
                        zero_planes = 0;
                    }
                    if zero_rows > 0 {
                        self.byte(EB_ZERO_A1);
                        self.compressed_int(zero_rows as i64);
                        zero_rows = 0;
                    }
                    if zeros > 0 {
                        self.byte(EB_ZERO);
                        self.compressed_int(zeros as i64);
                        zeros = 0;
                    }
                    self.byte(EB_STRING);
                    self.dotnet_string(s);
                }
                if zeros == d2 {
                    zero_rows += 1;
                } else {
                    self.byte(EB_EOA1);
                }
                zeros = 0;
            }
            if zero_rows == d1 {
                zero_planes += 1;
            } else {
                self.byte(EB_EOA2);
            }
            zero_rows = 0;
        }
        self.byte(EB_EOD);
    }
}

// ---- reader ----

struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    fn new(data: &'a [u8]) -> Result<Self> {
        let mut r = Self { data, pos: 0 };
        let hdr = r.u64()?;
        if hdr != BD_HEADER {
            return Err(EraError("invalid era binary header".into()));
        }
        let ver = r.u32()?;
        let count = r.u32()?;
        for _ in 0..count {
            let _ = r.u32()?;
        }
        if ver != BD_VERSION {
            return Err(EraError(format!("unsupported era binary version {}", ver)));
        }
        Ok(r)
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| EraError("unexpected end of data".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(EraError("unexpected end of data".into()));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn file_type(&mut self) -> Result<u8> {
        let b = self.byte()?;
        if b > FT_CHAR_VAR {
            return Err(EraError(format!("invalid save file type {}", b)));
        }
        Ok(b)
    }

    fn seven_bit_int(&mut self) -> Result<usize> {
        let mut result = 0usize;
        let mut shift = 0;
        while shift < 35 {
            let b = self.byte()?;
            result |= ((b & 0x7F) as usize) << shift;
            if b & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(EraError("invalid 7-bit encoded int".into()))
    }

    fn dotnet_string(&mut self) -> Result<String> {
        let n = self.seven_bit_int()?;
        if n == 0 {
            return Ok(String::new());
        }
        if n % 2 != 0 {
            return Err(EraError(format!("invalid utf16 byte length {}", n)));
        }
        let buf = self.take(n)?;
        let units: Vec<u16> = buf
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }

    fn compressed_int_with_first(&mut self, b: u8) -> Result<i64> {
        if b <= EB_BYTE {
            return Ok(b as i64);
        }
        match b {
            EB_INT16 => Ok(i16::from_le_bytes(self.take(2)?.try_into().expect("2 bytes")) as i64),
            EB_INT32 => Ok(self.i32()? as i64),
            EB_INT64 => self.i64(),
            _ => Err(EraError(format!("invalid compressed int marker 0x{:X}", b))),
        }
    }

    fn compressed_int(&mut self) -> Result<i64> {
        let b = self.byte()?;
        self.compressed_int_with_first(b)
    }

    fn var_code(&mut self) -> Result<(u8, String)> {
        let t = self.byte()?;
        if t == DT_SEP || t == DT_EOC || t == DT_EOF {
            return Ok((t, String::new()));
        }
        let key = self.dotnet_string()?;
        Ok((t, key))
    }

    fn dims(&mut self, rank: usize) -> Result<Vec<usize>> {
        let mut out = Vec::with_capacity(rank);
        for _ in 0..rank {
            let l = self.i32()?;
            if l < 0 {
                return Err(EraError("negative length".into()));
            }
            out.push(l as usize);
        }
        Ok(out)
    }

    // One run-length decoder covers all ranks; out-of-bounds cells drop.
    fn int_array(&mut self, rank: usize) -> Result<(Vec<i64>, Vec<usize>)> {
        let dims = self.dims(rank)?;
        let (d1, d2) = trailing_dims(&dims);
        let total: usize = dims.iter().product();
        let mut arr = vec![0i64; total];
        let (mut x, mut y, mut z) = (0usize, 0usize, 0usize);
        loop {
            let b = self.byte()?;
            match b {
                EB_EOD => break,
                EB_ZERO_A2 if rank >= 3 => {
                    x += self.compressed_int()? as usize;
                    y = 0;
                    z = 0;
                }
                EB_EOA2 if rank >= 3 => {
                    x += 1;
                    y = 0;
                    z = 0;
                }
                EB_ZERO_A1 if rank >= 2 => {
                    if rank == 2 {
                        x += self.compressed_int()? as usize;
                        y = 0;
                    } else {
                        y += self.compressed_int()? as usize;
                        z = 0;
                    }
                }
                EB_EOA1 if rank >= 2 => {
                    if rank == 2 {
                        x += 1;
                        y = 0;
                    } else {
                        y += 1;
                        z = 0;
                    }
                }
                EB_ZERO => {
                    let cnt = self.compressed_int()? as usize;
                    match rank {
                        1 => x += cnt,
                        2 => y += cnt,
                        _ => z += cnt,
                    }
                }
                _ => {
                    let v = self.compressed_int_with_first(b)?;
                    let off = flat_offset(rank, &dims, d1, d2, x, y, z);
                    if let Some(off) = off {
                        if off < arr.len() {
                            arr[off] = v;
                        }
                    }
                    match rank {
                        1 => x += 1,
                        2 => y += 1,
                        _ => z += 1,
                    }
                }
            }
        }
        Ok((arr, dims))
    }

    fn str_array(&mut self, rank: usize) -> Result<(Vec<String>, Vec<usize>)> {
        let dims = self.dims(rank)?;
        let (d1, d2) = trailing_dims(&dims);
        let total: usize = dims.iter().product();
        let mut arr = vec![String::new(); total];
        let (mut x, mut y, mut z) = (0usize, 0usize, 0usize);
        loop {
            let b = self.byte()?;
            match b {
                EB_EOD => break,
                EB_ZERO_A2 if rank >= 3 => {
                    x += self.compressed_int()? as usize;
                    y = 0;
                    z = 0;
                }
                EB_EOA2 if rank >= 3 => {
                    x += 1;
                    y = 0;
                    z = 0;
                }
                EB_ZERO_A1 if rank >= 2 => {
                    if rank == 2 {
                        x += self.compressed_int()? as usize;
                        y = 0;
                    } else {
                        y += self.compressed_int()? as usize;
                        z = 0;
                    }
                }
                EB_EOA1 if rank >= 2 => {
                    if rank == 2 {
                        x += 1;
                        y = 0;
                    } else {
                        y += 1;
                        z = 0;
                    }
                }
                EB_ZERO => {
                    let cnt = self.compressed_int()? as usize;
                    match rank {
                        1 => x += cnt,
                        2 => y += cnt,
                        _ => z += cnt,
                    }
                }
                EB_STRING => {
                    let s = self.dotnet_string()?;
                    let off = flat_offset(rank, &dims, d1, d2, x, y, z);
                    if let Some(off) = off {
                        if off < arr.len() {
                            arr[off] = s;
                        }
                    }
                    match rank {
                        1 => x += 1,
                        2 => y += 1,
                        _ => z += 1,
                    }
                }
                _ => return Err(EraError(format!("invalid string array marker 0x{:X}", b))),
            }
        }
        Ok((arr, dims))
    }
}

fn trailing_dims(dims: &[usize]) -> (usize, usize) {
    let d1 = dims.get(1).copied().unwrap_or(1);
    let d2 = dims.get(2).copied().unwrap_or(1);
    (d1, d2)
}

fn flat_offset(
    rank: usize,
    dims: &[usize],
    d1: usize,
    d2: usize,
    x: usize,
    y: usize,
    z: usize,
) -> Option<usize> {
    match rank {
        1 => {
            if x >= dims[0] {
                return None;
            }
            Some(x)
        }
        2 => {
            if x >= dims[0] || y >= d1 {
                return None;
            }
            Some(x * d1 + y)
        }
        _ => {
            if x >= dims[0] || y >= d1 || z >= d2 {
                return None;
            }
            Some((x * d1 + y) * d2 + z)
        }
    }
}

// ---- dense <-> sparse conversion ----

fn checked_dims(arr: &ArrayVar) -> Result<Vec<usize>> {
    let dims = if arr.dims.is_empty() { vec![1] } else { arr.dims.clone() };
    if dims.len() > 3 {
        return Err(EraError("array dimension > 3 is not supported in binary save".into()));
    }
    let mut total = 1usize;
    for &d in &dims {
        if d == 0 {
            total = 0;
            break;
        }
        total = total.saturating_mul(d);
        if total > MAX_DENSE_CELLS {
            return Err(EraError("array too large for binary save".into()));
        }
    }
    Ok(dims)
}

fn dense_offset(dims: &[usize], idx: &[i64]) -> Option<usize> {
    let mut off = 0usize;
    let mut mul = 1usize;
    for i in (0..dims.len()).rev() {
        let iv = idx.get(i).copied().unwrap_or(0);
        if iv < 0 || iv as usize >= dims[i] {
            return None;
        }
        off += iv as usize * mul;
        mul *= dims[i];
    }
    Some(off)
}

fn array_to_dense_int(arr: &ArrayVar) -> Result<(Vec<i64>, Vec<usize>)> {
    let dims = checked_dims(arr)?;
    let total: usize = dims.iter().product();
    let mut flat = vec![0i64; total];
    for (k, v) in &arr.data {
        let Some(idx) = parse_index_key(k) else { continue };
        if idx.is_empty() || idx.len() > dims.len() {
            continue;
        }
        if let Some(off) = dense_offset(&dims, &idx) {
            if off < flat.len() {
                flat[off] = v.as_int();
            }
        }
    }
    Ok((flat, dims))
}

fn array_to_dense_str(arr: &ArrayVar) -> Result<(Vec<String>, Vec<usize>)> {
    let dims = checked_dims(arr)?;
    let total: usize = dims.iter().product();
    let mut flat = vec![String::new(); total];
    for (k, v) in &arr.data {
        let Some(idx) = parse_index_key(k) else { continue };
        if idx.is_empty() || idx.len() > dims.len() {
            continue;
        }
        if let Some(off) = dense_offset(&dims, &idx) {
            if off < flat.len() {
                flat[off] = v.as_str();
            }
        }
    }
    Ok((flat, dims))
}

fn dense_int_to_array(flat: &[i64], dims: &[usize]) -> ArrayVar {
    let mut arr = ArrayVar::new(false, true, dims);
    let (d1, d2) = trailing_dims(dims);
    for (i, &v) in flat.iter().enumerate() {
        if v == 0 {
            continue;
        }
        let idx = unflatten(i, dims.len(), d1, d2);
        let _ = arr.set(&idx, Value::Int(v));
    }
    arr
}

fn dense_str_to_array(flat: &[String], dims: &[usize]) -> ArrayVar {
    let mut arr = ArrayVar::new(true, true, dims);
    let (d1, d2) = trailing_dims(dims);
    for (i, v) in flat.iter().enumerate() {
        if v.is_empty() {
            continue;
        }
        let idx = unflatten(i, dims.len(), d1, d2);
        let _ = arr.set(&idx, Value::Str(v.clone()));
    }
    arr
}

fn unflatten(i: usize, rank: usize, d1: usize, d2: usize) -> Vec<i64> {
    match rank {
        1 => vec![i as i64],
        2 => vec![(i / d1) as i64, (i % d1) as i64],
        _ => {
            let x = i / (d1 * d2);
            let rem = i % (d1 * d2);
            vec![x as i64, (rem / d2) as i64, (rem % d2) as i64]
        }
    }
}

fn write_array(bw: &mut BinaryWriter, key: &str, arr: &ArrayVar) -> Result<()> {
    if arr.is_string {
        let (flat, dims) = array_to_dense_str(arr).map_err(|e| EraError(format!("{}: {}", key, e)))?;
        match dims.len() {
            1 => bw.keyed_str_1d(key, &flat),
            2 => bw.keyed_str_2d(key, &flat, dims[0], dims[1]),
            3 => bw.keyed_str_3d(key, &flat, dims[0], dims[1], dims[2]),
            n => return Err(EraError(format!("{}: unsupported dims {}", key, n))),
        }
    } else {
        let (flat, dims) = array_to_dense_int(arr).map_err(|e| EraError(format!("{}: {}", key, e)))?;
        match dims.len() {
            1 => bw.keyed_int_1d(key, &flat),
            2 => bw.keyed_int_2d(key, &flat, dims[0], dims[1]),
            3 => bw.keyed_int_3d(key, &flat, dims[0], dims[1], dims[2]),
            n => return Err(EraError(format!("{}: unsupported dims {}", key, n))),
        }
    }
    Ok(())
}

impl Vm {
    pub(crate) fn encode_var_binary(
        &self,
        save_mes: &str,
        globals: &HashMap<String, Value>,
        arrays: &HashMap<String, ArrayVar>,
    ) -> Result<Vec<u8>> {
        let mut bw = BinaryWriter::new();
        bw.write_header();
        bw.byte(FT_VAR);
        bw.int64(self.save_unique_code);
        bw.int64(self.save_version);
        bw.dotnet_string(save_mes);

        let mut keys: Vec<&String> = globals.keys().collect();
        keys.sort();
        for key in keys {
            match &globals[key] {
                Value::Str(s) => bw.keyed_str(key, s),
                Value::Int(v) => bw.keyed_int(key, *v),
            }
        }
        let mut names: Vec<&String> = arrays.keys().collect();
        names.sort();
        for key in names {
            write_array(&mut bw, key, &arrays[key])?;
        }
        bw.byte(DT_EOF);
        Ok(bw.buf)
    }

    pub(crate) fn write_var_binary_file(
        &self,
        path: &Path,
        save_mes: &str,
        globals: &HashMap<String, Value>,
        arrays: &HashMap<String, ArrayVar>,
    ) -> Result<()> {
        let buf = self.encode_var_binary(save_mes, globals, arrays)?;
        fs::write(path, buf).map_err(|e| EraError(format!("write {}: {}", path.display(), e)))
    }

    pub(crate) fn read_var_binary_data(
        &self,
        data: &[u8],
    ) -> Result<(i64, i64, String, HashMap<String, Value>, HashMap<String, ArrayVar>)> {
        let mut br = BinaryReader::new(data)?;
        let ft = br.file_type()?;
        if ft != FT_VAR {
            return Err(EraError("not var save data".into()));
        }
        let unique = br.i64()?;
        let version = br.i64()?;
        let save_mes = br.dotnet_string()?;
        let mut globals = HashMap::new();
        let mut arrays = HashMap::new();
        loop {
            let (typ, key) = br.var_code()?;
            match typ {
                DT_EOF => return Ok((unique, version, save_mes, globals, arrays)),
                DT_SEP | DT_EOC => continue,
                DT_INT => {
                    globals.insert(key, Value::Int(br.compressed_int()?));
                }
                DT_STR => {
                    globals.insert(key, Value::Str(br.dotnet_string()?));
                }
                DT_INT_1D | DT_INT_2D | DT_INT_3D => {
                    let rank = (typ - DT_INT_1D) as usize + 1;
                    let (flat, dims) = br.int_array(rank)?;
                    arrays.insert(key, dense_int_to_array(&flat, &dims));
                }
                DT_STR_1D | DT_STR_2D | DT_STR_3D => {
                    let rank = (typ - DT_STR_1D) as usize + 1;
                    let (flat, dims) = br.str_array(rank)?;
                    arrays.insert(key, dense_str_to_array(&flat, &dims));
                }
                _ => return Err(EraError(format!("unsupported var data type 0x{:X}", typ))),
            }
        }
    }

    pub(crate) fn encode_chara_binary(
        &self,
        save_mes: &str,
        chars: &[RuntimeCharacter],
    ) -> Result<Vec<u8>> {
        let mut bw = BinaryWriter::new();
        bw.write_header();
        bw.byte(FT_CHAR_VAR);
        bw.int64(self.save_unique_code);
        bw.int64(self.save_version);
        bw.dotnet_string(save_mes);
        bw.int64(chars.len() as i64);
        for ch in chars {
            bw.byte(DT_SEP);
            bw.keyed_int(CHARA_ID_KEY, ch.id);
            let mut keys: Vec<&String> = ch.vars.keys().collect();
            keys.sort();
            for key in keys {
                match &ch.vars[key] {
                    Value::Str(s) => bw.keyed_str(key, s),
                    Value::Int(v) => bw.keyed_int(key, *v),
                }
            }
            bw.byte(DT_EOC);
        }
        bw.byte(DT_EOF);
        Ok(bw.buf)
    }

    pub(crate) fn write_chara_binary_file(
        &self,
        path: &Path,
        save_mes: &str,
        chars: &[RuntimeCharacter],
    ) -> Result<()> {
        let buf = self.encode_chara_binary(save_mes, chars)?;
        fs::write(path, buf).map_err(|e| EraError(format!("write {}: {}", path.display(), e)))
    }

    pub(crate) fn read_chara_binary_data(
        &self,
        data: &[u8],
    ) -> Result<(i64, i64, String, Vec<RuntimeCharacter>)> {
        let mut br = BinaryReader::new(data)?;
        let ft = br.file_type()?;
        if ft != FT_CHAR_VAR {
            return Err(EraError("not chara save data".into()));
        }
        let unique = br.i64()?;
        let version = br.i64()?;
        let save_mes = br.dotnet_string()?;
        let count = br.i64()?.max(0);
        let mut chars = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut id = -1i64;
            let mut vars = HashMap::new();
            loop {
                let (typ, key) = match br.var_code() {
                    Ok(v) => v,
                    Err(_) => return Ok((unique, version, save_mes, chars)),
                };
                match typ {
                    DT_SEP => continue,
                    DT_EOC => break,
                    DT_EOF => {
                        if id < 0 {
                            id = chars.len() as i64;
                        }
                        chars.push(RuntimeCharacter { id, vars });
                        return Ok((unique, version, save_mes, chars));
                    }
                    DT_INT => {
                        let v = br.compressed_int()?;
                        if key == CHARA_ID_KEY {
                            id = v;
                        } else {
                            vars.insert(key, Value::Int(v));
                        }
                    }
                    DT_STR => {
                        let s = br.dotnet_string()?;
                        if key == CHARA_ID_KEY {
                            if let Ok(parsed) = s.trim().parse() {
                                id = parsed;
                            }
                        } else {
                            vars.insert(key, Value::Str(s));
                        }
                    }
                    _ => {
                        return Err(EraError(format!(
                            "unsupported chara data type 0x{:X}",
                            typ
                        )))
                    }
                }
            }
            if id < 0 {
                id = chars.len() as i64;
            }
            chars.push(RuntimeCharacter { id, vars });
        }
        Ok((unique, version, save_mes, chars))
    }
}

/// Standalone converter used by the `savecodec` binary: auto-detects the
/// input format by magic and writes the requested output format.
pub fn convert_dat_file(kind: &str, input: &Path, output: &Path, to: &str) -> Result<()> {
    let kind = kind.trim().to_lowercase();
    let to = to.trim().to_lowercase();
    if kind != "var" && kind != "chara" {
        return Err(EraError(format!("unsupported kind {:?} (use var|chara)", kind)));
    }
    if to != "json" && to != "binary" {
        return Err(EraError(format!("unsupported output format {:?} (use json|binary)", to)));
    }

    let data = fs::read(input).map_err(|e| EraError(format!("read {}: {}", input.display(), e)))?;
    let is_bin = is_era_binary_data(&data);

    let shell = Vm::detached();
    if kind == "var" {
        let (unique, version, save_mes, globals, arrays) = if is_bin {
            shell.read_var_binary_data(&data)?
        } else {
            let snap = save::read_var_snapshot_json(&data)?;
            let globals = snap
                .globals
                .iter()
                .map(|(k, v)| (k.clone(), save::save_value_to_value(v)))
                .collect();
            let arrays = snap
                .arrays
                .iter()
                .map(|(k, v)| (k.clone(), save::snapshot_to_array(v)))
                .collect();
            (0, 1, snap.save_mes, globals, arrays)
        };
        if to == "json" {
            let snap = save::build_var_snapshot(&save_mes, &globals, &arrays);
            return save::write_json_file(output, &snap);
        }
        let mut shell = shell;
        shell.save_unique_code = unique;
        shell.save_version = version;
        return shell.write_var_binary_file(output, &save_mes, &globals, &arrays);
    }

    let (unique, version, save_mes, chars, indices) = if is_bin {
        let (u, v, mes, chars) = shell.read_chara_binary_data(&data)?;
        let indices: Vec<i64> = (0..chars.len() as i64).collect();
        (u, v, mes, chars, indices)
    } else {
        let snap = save::read_chara_snapshot_json(&data)?;
        let chars: Vec<RuntimeCharacter> = snap
            .characters
            .iter()
            .map(|item| RuntimeCharacter {
                id: item.id,
                vars: item
                    .vars
                    .iter()
                    .map(|(k, v)| (k.clone(), save::save_value_to_value(v)))
                    .collect(),
            })
            .collect();
        (0, 1, snap.save_mes, chars, snap.indices)
    };
    if to == "json" {
        let snap = save::build_chara_snapshot(&save_mes, &indices, &chars);
        return save::write_json_file(output, &snap);
    }
    let mut shell = shell;
    shell.save_unique_code = unique;
    shell.save_version = version;
    shell.write_chara_binary_file(output, &save_mes, &chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell() -> Vm {
        Vm::detached()
    }

    #[test]
    fn compressed_int_forms() {
        let mut bw = BinaryWriter::new();
        bw.compressed_int(5);
        bw.compressed_int(0xCF);
        bw.compressed_int(-1);
        bw.compressed_int(70_000);
        bw.compressed_int(1 << 40);
        assert_eq!(bw.buf[0], 5);
        assert_eq!(bw.buf[1], 0xCF);
        assert_eq!(bw.buf[2], EB_INT16);

        let data = bw.buf.clone();
        let mut r = BinaryReader { data: &data, pos: 0 };
        assert_eq!(r.compressed_int().unwrap(), 5);
        assert_eq!(r.compressed_int().unwrap(), 0xCF);
        assert_eq!(r.compressed_int().unwrap(), -1);
        assert_eq!(r.compressed_int().unwrap(), 70_000);
        assert_eq!(r.compressed_int().unwrap(), 1 << 40);
    }

    #[test]
    fn dotnet_string_round_trips_utf16() {
        let mut bw = BinaryWriter::new();
        bw.dotnet_string("héllo 漢字");
        bw.dotnet_string("");
        let data = bw.buf.clone();
        let mut r = BinaryReader { data: &data, pos: 0 };
        assert_eq!(r.dotnet_string().unwrap(), "héllo 漢字");
        assert_eq!(r.dotnet_string().unwrap(), "");
    }

    #[test]
    fn var_binary_round_trip() {
        let vm = shell();
        let mut globals = HashMap::new();
        globals.insert("A".to_string(), Value::Int(9));
        globals.insert("S".to_string(), Value::Str("text".to_string()));
        let mut arrays = HashMap::new();
        let mut arr = ArrayVar::new(false, false, &[5]);
        arr.set(&[1], Value::Int(22)).unwrap();
        arr.set(&[4], Value::Int(-7)).unwrap();
        arrays.insert("ARR".to_string(), arr);
        let mut sarr = ArrayVar::new(true, false, &[2, 3]);
        sarr.set(&[1, 2], Value::Str("z".to_string())).unwrap();
        arrays.insert("WORDS".to_string(), sarr);

        let buf = vm.encode_var_binary("mes", &globals, &arrays).unwrap();
        assert!(is_era_binary_data(&buf));
        let (unique, version, mes, g2, a2) = vm.read_var_binary_data(&buf).unwrap();
        assert_eq!(unique, vm.save_unique_code);
        assert_eq!(version, vm.save_version);
        assert_eq!(mes, "mes");
        assert_eq!(g2["A"], Value::Int(9));
        assert_eq!(g2["S"], Value::Str("text".to_string()));
        let mut arr2 = a2["ARR"].clone();
        assert_eq!(arr2.get(&[1]).unwrap(), Value::Int(22));
        assert_eq!(arr2.get(&[4]).unwrap(), Value::Int(-7));
        assert_eq!(arr2.get(&[0]).unwrap(), Value::Int(0));
        let mut sarr2 = a2["WORDS"].clone();
        assert_eq!(sarr2.get(&[1, 2]).unwrap(), Value::Str("z".to_string()));
    }

    #[test]
    fn chara_binary_round_trip() {
        let vm = shell();
        let mut vars = HashMap::new();
        vars.insert("HP".to_string(), Value::Int(10));
        vars.insert("NAME".to_string(), Value::Str("Rin".to_string()));
        let chars = vec![
            RuntimeCharacter { id: 3, vars },
            RuntimeCharacter { id: 5, vars: HashMap::new() },
        ];
        let buf = vm.encode_chara_binary("m", &chars).unwrap();
        let (_, _, mes, loaded) = vm.read_chara_binary_data(&buf).unwrap();
        assert_eq!(mes, "m");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, 3);
        assert_eq!(loaded[0].vars["HP"], Value::Int(10));
        assert_eq!(loaded[1].id, 5);
    }

    #[test]
    fn three_d_zero_planes_compress() {
        let vm = shell();
        let mut arr = ArrayVar::new(false, false, &[3, 2, 2]);
        arr.set(&[2, 1, 1], Value::Int(4)).unwrap();
        let mut arrays = HashMap::new();
        arrays.insert("CUBE".to_string(), arr);
        let buf = vm.encode_var_binary("", &HashMap::new(), &arrays).unwrap();
        let (_, _, _, _, a2) = vm.read_var_binary_data(&buf).unwrap();
        let mut cube = a2["CUBE"].clone();
        assert_eq!(cube.get(&[2, 1, 1]).unwrap(), Value::Int(4));
        assert_eq!(cube.get(&[0, 0, 0]).unwrap(), Value::Int(0));
    }
}
