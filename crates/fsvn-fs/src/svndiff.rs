//! svndiff delta encoding.
//!
//! The representation payload format: a 4-byte header (`"SVN"` + version
//! byte), then a sequence of windows. Each window is five varints
//! (source-view offset, source-view length, target-view length, stored
//! instruction length, stored new-data length) followed by the two
//! sections. Instructions copy from the source view, copy from earlier
//! target-view output (overlap allowed), or take bytes from the new-data
//! section.
//!
//! Version 1 wraps each section as `varint(original length)` + payload,
//! where the payload is zlib-compressed only when that is actually
//! smaller.
//!
//! Varints are MSB-first base-128 with the continuation bit set on every
//! byte but the last.
//!
//! The encoder performs greedy block matching against an aligned source
//! window, so appends and small edits produce short copy chains; it never
//! emits target-copy instructions, but the applier accepts them.

use std::collections::HashMap;
use std::io::{Read, Write};

use fsvn_error::{FsfsError, Result};

/// Target bytes per window.
const WINDOW_SIZE: usize = 100_000;
/// Block size for source matching.
const BLOCK: usize = 16;

const OP_COPY_SOURCE: u8 = 0;
const OP_COPY_TARGET: u8 = 1;
const OP_NEW: u8 = 2;

fn write_varint(out: &mut Vec<u8>, v: u64) {
    let mut buf = [0u8; 10];
    let mut i = buf.len() - 1;
    let mut v = v;
    buf[i] = (v & 0x7f) as u8;
    v >>= 7;
    while v > 0 {
        i -= 1;
        buf[i] = ((v & 0x7f) as u8) | 0x80;
        v >>= 7;
    }
    out.extend_from_slice(&buf[i..]);
}

fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value: u64 = 0;
    for _ in 0..10 {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| FsfsError::corrupt("svndiff: truncated varint"))?;
        *pos += 1;
        if value > u64::MAX >> 7 {
            return Err(FsfsError::corrupt("svndiff: varint overflow"));
        }
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(FsfsError::corrupt("svndiff: varint too long"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    CopySource { len: usize, offset: usize },
    New { len: usize },
}

fn encode_op_header(out: &mut Vec<u8>, selector: u8, len: usize) {
    if len > 0 && len <= 0x3f {
        out.push((selector << 6) | (len as u8));
    } else {
        out.push(selector << 6);
        write_varint(out, len as u64);
    }
}

/// Greedy block match of `target` against `source`, producing instructions
/// plus the new-data bytes they reference.
fn match_ops(source: &[u8], target: &[u8]) -> (Vec<Op>, Vec<u8>) {
    let mut ops = Vec::new();
    let mut new_data = Vec::new();

    if source.len() < BLOCK {
        if !target.is_empty() {
            ops.push(Op::New { len: target.len() });
            new_data.extend_from_slice(target);
        }
        return (ops, new_data);
    }

    let mut index: HashMap<&[u8], usize> = HashMap::with_capacity(source.len() / BLOCK + 1);
    let mut off = 0;
    while off + BLOCK <= source.len() {
        index.entry(&source[off..off + BLOCK]).or_insert(off);
        off += BLOCK;
    }

    let mut pos = 0;
    let mut lit_start = 0;
    while pos + BLOCK <= target.len() {
        let Some(&soff) = index.get(&target[pos..pos + BLOCK]) else {
            pos += 1;
            continue;
        };

        let mut len = BLOCK;
        while pos + len < target.len()
            && soff + len < source.len()
            && source[soff + len] == target[pos + len]
        {
            len += 1;
        }
        let mut back = 0;
        while pos - back > lit_start
            && soff > back
            && source[soff - back - 1] == target[pos - back - 1]
        {
            back += 1;
        }
        let (mpos, msoff, mlen) = (pos - back, soff - back, len + back);

        if mpos > lit_start {
            ops.push(Op::New {
                len: mpos - lit_start,
            });
            new_data.extend_from_slice(&target[lit_start..mpos]);
        }
        ops.push(Op::CopySource {
            len: mlen,
            offset: msoff,
        });
        pos = mpos + mlen;
        lit_start = pos;
    }
    if lit_start < target.len() {
        ops.push(Op::New {
            len: target.len() - lit_start,
        });
        new_data.extend_from_slice(&target[lit_start..]);
    }

    (ops, new_data)
}

/// Wrap one section for the wire: v0 raw; v1 length-prefixed, compressed
/// when compression wins.
fn encode_section(data: &[u8], version: u8) -> Result<Vec<u8>> {
    if version == 0 {
        return Ok(data.to_vec());
    }
    let mut out = Vec::with_capacity(data.len() + 2);
    write_varint(&mut out, data.len() as u64);
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).map_err(FsfsError::Io)?;
    let compressed = encoder.finish().map_err(FsfsError::Io)?;
    if compressed.len() < data.len() {
        out.extend_from_slice(&compressed);
    } else {
        out.extend_from_slice(data);
    }
    Ok(out)
}

fn decode_section(stored: &[u8], version: u8) -> Result<Vec<u8>> {
    if version == 0 {
        return Ok(stored.to_vec());
    }
    let mut pos = 0;
    let orig_len = usize::try_from(read_varint(stored, &mut pos)?)
        .map_err(|_| FsfsError::corrupt("svndiff: section length overflow"))?;
    let payload = &stored[pos..];
    if payload.len() == orig_len {
        return Ok(payload.to_vec());
    }
    let mut out = Vec::with_capacity(orig_len);
    flate2::read::ZlibDecoder::new(payload)
        .read_to_end(&mut out)
        .map_err(|e| FsfsError::corrupt(format!("svndiff: zlib section: {e}")))?;
    if out.len() != orig_len {
        return Err(FsfsError::corrupt(
            "svndiff: decompressed section length mismatch",
        ));
    }
    Ok(out)
}

fn encode_window(
    out: &mut Vec<u8>,
    source: &[u8],
    sview_offset: usize,
    sview_len: usize,
    target: &[u8],
    version: u8,
) -> Result<()> {
    let sview = &source[sview_offset..sview_offset + sview_len];
    let (ops, new_data) = match_ops(sview, target);

    let mut instr = Vec::new();
    for op in &ops {
        match *op {
            Op::CopySource { len, offset } => {
                encode_op_header(&mut instr, OP_COPY_SOURCE, len);
                write_varint(&mut instr, offset as u64);
            }
            Op::New { len } => encode_op_header(&mut instr, OP_NEW, len),
        }
    }

    let instr_stored = encode_section(&instr, version)?;
    let data_stored = encode_section(&new_data, version)?;

    write_varint(out, sview_offset as u64);
    write_varint(out, sview_len as u64);
    write_varint(out, target.len() as u64);
    write_varint(out, instr_stored.len() as u64);
    write_varint(out, data_stored.len() as u64);
    out.extend_from_slice(&instr_stored);
    out.extend_from_slice(&data_stored);
    Ok(())
}

/// Streaming svndiff encoder.
///
/// Feed target bytes with [`push`](Self::push); each call returns whatever
/// encoded bytes became ready. [`finish`](Self::finish) flushes the final
/// partial window.
#[derive(Debug)]
pub struct Encoder {
    source: Vec<u8>,
    version: u8,
    buf: Vec<u8>,
    /// Absolute target offset of the start of `buf`.
    target_offset: usize,
    header_pending: bool,
}

impl Encoder {
    pub fn new(source: Vec<u8>, version: u8) -> Self {
        debug_assert!(version <= 1, "unknown svndiff version {version}");
        Self {
            source,
            version,
            buf: Vec::new(),
            target_offset: 0,
            header_pending: true,
        }
    }

    fn header(&mut self, out: &mut Vec<u8>) {
        if self.header_pending {
            out.extend_from_slice(b"SVN");
            out.push(self.version);
            self.header_pending = false;
        }
    }

    /// The source window aligned with the current target window; appends
    /// and local edits then match within the view.
    fn source_view(&self) -> (usize, usize) {
        let offset = self.target_offset.min(self.source.len());
        let len = WINDOW_SIZE.min(self.source.len() - offset);
        (offset, len)
    }

    pub fn push(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        while self.buf.len() >= WINDOW_SIZE {
            self.header(&mut out);
            let rest = self.buf.split_off(WINDOW_SIZE);
            let chunk = std::mem::replace(&mut self.buf, rest);
            let (sview_offset, sview_len) = self.source_view();
            encode_window(
                &mut out,
                &self.source,
                sview_offset,
                sview_len,
                &chunk,
                self.version,
            )?;
            self.target_offset += chunk.len();
        }
        Ok(out)
    }

    pub fn finish(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.header(&mut out);
        if !self.buf.is_empty() {
            let chunk = std::mem::take(&mut self.buf);
            let (sview_offset, sview_len) = self.source_view();
            encode_window(
                &mut out,
                &self.source,
                sview_offset,
                sview_len,
                &chunk,
                self.version,
            )?;
        }
        Ok(out)
    }
}

/// One-shot encode of `target` as a delta against `source`.
pub fn encode(source: &[u8], target: &[u8], version: u8) -> Result<Vec<u8>> {
    let mut encoder = Encoder::new(source.to_vec(), version);
    let mut out = encoder.push(target)?;
    out.extend_from_slice(&encoder.finish()?);
    Ok(out)
}

/// Apply an svndiff delta to `source`, producing the target content.
pub fn apply(diff: &[u8], source: &[u8]) -> Result<Vec<u8>> {
    if diff.len() < 4 || &diff[0..3] != b"SVN" {
        return Err(FsfsError::corrupt("svndiff: bad magic"));
    }
    let version = diff[3];
    if version > 1 {
        return Err(FsfsError::corrupt(format!(
            "svndiff: unsupported version {version}"
        )));
    }

    let mut output = Vec::new();
    let mut pos = 4;
    while pos < diff.len() {
        let sview_offset = usize::try_from(read_varint(diff, &mut pos)?)
            .map_err(|_| FsfsError::corrupt("svndiff: offset overflow"))?;
        let sview_len = usize::try_from(read_varint(diff, &mut pos)?)
            .map_err(|_| FsfsError::corrupt("svndiff: length overflow"))?;
        let tview_len = usize::try_from(read_varint(diff, &mut pos)?)
            .map_err(|_| FsfsError::corrupt("svndiff: length overflow"))?;
        let instr_stored_len = usize::try_from(read_varint(diff, &mut pos)?)
            .map_err(|_| FsfsError::corrupt("svndiff: length overflow"))?;
        let data_stored_len = usize::try_from(read_varint(diff, &mut pos)?)
            .map_err(|_| FsfsError::corrupt("svndiff: length overflow"))?;

        let instr_end = pos
            .checked_add(instr_stored_len)
            .filter(|&e| e <= diff.len())
            .ok_or_else(|| FsfsError::corrupt("svndiff: truncated instruction section"))?;
        let data_end = instr_end
            .checked_add(data_stored_len)
            .filter(|&e| e <= diff.len())
            .ok_or_else(|| FsfsError::corrupt("svndiff: truncated new-data section"))?;

        let instr = decode_section(&diff[pos..instr_end], version)?;
        let new_data = decode_section(&diff[instr_end..data_end], version)?;
        pos = data_end;

        let sview_end = sview_offset
            .checked_add(sview_len)
            .filter(|&e| e <= source.len())
            .ok_or_else(|| FsfsError::corrupt("svndiff: source view outside source"))?;
        let sview = &source[sview_offset..sview_end];

        let mut tview: Vec<u8> = Vec::with_capacity(tview_len);
        let mut data_pos: usize = 0;
        let mut ip = 0;
        while ip < instr.len() {
            let byte = instr[ip];
            ip += 1;
            let selector = byte >> 6;
            let mut len = usize::from(byte & 0x3f);
            if len == 0 {
                len = usize::try_from(read_varint(&instr, &mut ip)?)
                    .map_err(|_| FsfsError::corrupt("svndiff: op length overflow"))?;
            }
            match selector {
                s if s == OP_COPY_SOURCE => {
                    let offset = usize::try_from(read_varint(&instr, &mut ip)?)
                        .map_err(|_| FsfsError::corrupt("svndiff: op offset overflow"))?;
                    let end = offset
                        .checked_add(len)
                        .filter(|&e| e <= sview.len())
                        .ok_or_else(|| {
                            FsfsError::corrupt("svndiff: source copy outside source view")
                        })?;
                    tview.extend_from_slice(&sview[offset..end]);
                }
                s if s == OP_COPY_TARGET => {
                    let offset = usize::try_from(read_varint(&instr, &mut ip)?)
                        .map_err(|_| FsfsError::corrupt("svndiff: op offset overflow"))?;
                    if offset >= tview.len() {
                        return Err(FsfsError::corrupt(
                            "svndiff: target copy from unwritten output",
                        ));
                    }
                    // Overlap is allowed and meaningful (run-length
                    // expansion), so copy a byte at a time.
                    for i in 0..len {
                        let b = tview[offset + i];
                        tview.push(b);
                    }
                }
                s if s == OP_NEW => {
                    let end = data_pos
                        .checked_add(len)
                        .filter(|&e| e <= new_data.len())
                        .ok_or_else(|| {
                            FsfsError::corrupt("svndiff: new-data section exhausted")
                        })?;
                    tview.extend_from_slice(&new_data[data_pos..end]);
                    data_pos = end;
                }
                _ => return Err(FsfsError::corrupt("svndiff: invalid instruction selector")),
            }
        }

        if tview.len() != tview_len {
            return Err(FsfsError::corrupt(format!(
                "svndiff: window produced {} bytes, header says {tview_len}",
                tview.len()
            )));
        }
        if data_pos != new_data.len() {
            return Err(FsfsError::corrupt("svndiff: unconsumed new data"));
        }
        output.extend_from_slice(&tview);
    }

    Ok(output)
}
