//! Encode/decode for the response stream and the task message.
//!
//! All multi-byte integers are little-endian. Every response frame is:
//! `[1-byte header-size N][N bytes header][zero padding to the fixed
//! envelope][body bytes]`. The MD5 digest covers the body bytes only.

use bytes::{BufMut, BytesMut};
use md5::{Digest, Md5};

use crate::error::WireError;
use crate::types::*;

type Result<T> = std::result::Result<T, WireError>;

// ── Helper: read/write primitives ────────────────────────────────────────

fn ensure(buf: &[u8], need: usize) -> Result<()> {
    if buf.len() < need {
        return Err(WireError::Truncated {
            expected: need,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn read_u8(buf: &mut &[u8]) -> Result<u8> {
    ensure(buf, 1)?;
    let v = buf[0];
    *buf = &buf[1..];
    Ok(v)
}

fn read_u16(buf: &mut &[u8]) -> Result<u16> {
    ensure(buf, 2)?;
    let v = u16::from_le_bytes([buf[0], buf[1]]);
    *buf = &buf[2..];
    Ok(v)
}

fn read_u32(buf: &mut &[u8]) -> Result<u32> {
    ensure(buf, 4)?;
    let v = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    *buf = &buf[4..];
    Ok(v)
}

fn read_i32(buf: &mut &[u8]) -> Result<i32> {
    ensure(buf, 4)?;
    let v = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    *buf = &buf[4..];
    Ok(v)
}

fn read_u64(buf: &mut &[u8]) -> Result<u64> {
    ensure(buf, 8)?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&buf[..8]);
    *buf = &buf[8..];
    Ok(u64::from_le_bytes(arr))
}

fn read_bytes(buf: &mut &[u8], n: usize) -> Result<Vec<u8>> {
    ensure(buf, n)?;
    let v = buf[..n].to_vec();
    *buf = &buf[n..];
    Ok(v)
}

fn read_fixed<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N]> {
    ensure(buf, N)?;
    let mut arr = [0u8; N];
    arr.copy_from_slice(&buf[..N]);
    *buf = &buf[N..];
    Ok(arr)
}

fn read_string_u16(buf: &mut &[u8], field: &str) -> Result<String> {
    let len = read_u16(buf)? as usize;
    let bytes = read_bytes(buf, len)?;
    String::from_utf8(bytes).map_err(|e| WireError::InvalidUtf8 {
        field: field.to_string(),
        source: e,
    })
}

fn read_string_u32(buf: &mut &[u8], field: &str) -> Result<String> {
    let len = read_u32(buf)? as usize;
    let bytes = read_bytes(buf, len)?;
    String::from_utf8(bytes).map_err(|e| WireError::InvalidUtf8 {
        field: field.to_string(),
        source: e,
    })
}

fn write_string_u16(out: &mut BytesMut, s: &str) {
    out.put_u16_le(s.len() as u16);
    out.put_slice(s.as_bytes());
}

fn write_string_u32(out: &mut BytesMut, s: &str) {
    out.put_u32_le(s.len() as u32);
    out.put_slice(s.as_bytes());
}

// ── Digest ───────────────────────────────────────────────────────────────

/// MD5 digest of a byte slice.
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    let hash = Md5::digest(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&hash);
    out
}

// ── Response header ──────────────────────────────────────────────────────

fn encode_header(h: &ResponseHeader) -> BytesMut {
    let mut out = BytesMut::with_capacity(32 + h.wname.len());
    out.put_u32_le(h.size);
    out.put_slice(&h.md5);
    write_string_u16(&mut out, &h.wname);
    out.put_u8(if h.continues { 1 } else { 0 });
    out
}

fn decode_header(mut buf: &[u8]) -> Result<ResponseHeader> {
    let size = read_u32(&mut buf)?;
    let md5 = read_fixed::<16>(&mut buf)?;
    let wname = read_string_u16(&mut buf, "wname")?;
    let continues = read_u8(&mut buf)? != 0;
    Ok(ResponseHeader {
        size,
        md5,
        wname,
        continues,
    })
}

/// Pad an encoded header into the fixed envelope:
/// `[1-byte size N][N header bytes][zeros]`.
pub fn wrap_header(h: &ResponseHeader) -> Result<Vec<u8>> {
    let inner = encode_header(h);
    if inner.len() > RESPONSE_HEADER_ENVELOPE - 1 || inner.len() > u8::MAX as usize {
        return Err(WireError::HeaderTooLarge(inner.len()));
    }
    let mut out = vec![0u8; RESPONSE_HEADER_ENVELOPE];
    out[0] = inner.len() as u8;
    out[1..1 + inner.len()].copy_from_slice(&inner);
    Ok(out)
}

/// Decode a header from its fixed envelope. A zero size byte aborts the
/// stream.
pub fn unwrap_header(envelope: &[u8]) -> Result<ResponseHeader> {
    if envelope.len() < RESPONSE_HEADER_ENVELOPE {
        return Err(WireError::EnvelopeTooSmall(envelope.len()));
    }
    let n = envelope[0] as usize;
    if n == 0 {
        return Err(WireError::ZeroHeaderSize);
    }
    decode_header(&envelope[1..1 + n])
}

// ── Response body ────────────────────────────────────────────────────────

/// Encode a response body.
pub fn encode_response_body(body: &ResponseBody) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(64);
    out.put_u32_le(body.rows.len() as u32);
    for row in &body.rows {
        out.put_u16_le(row.cols.len() as u16);
        for col in &row.cols {
            match col {
                Some(s) => {
                    out.put_u8(1);
                    write_string_u32(&mut out, s);
                }
                None => out.put_u8(0),
            }
        }
    }
    out.put_u8(if body.continues { 1 } else { 0 });
    match &body.error {
        Some(e) => {
            out.put_u8(1);
            out.put_u32_le(e.code);
            write_string_u16(&mut out, &e.msg);
        }
        None => out.put_u8(0),
    }
    out.to_vec()
}

/// Decode a response body.
pub fn decode_response_body(mut buf: &[u8]) -> Result<ResponseBody> {
    let num_rows = read_u32(&mut buf)? as usize;
    let mut rows = Vec::with_capacity(num_rows.min(65536));
    for _ in 0..num_rows {
        let num_cols = read_u16(&mut buf)? as usize;
        let mut cols = Vec::with_capacity(num_cols);
        for _ in 0..num_cols {
            let present = read_u8(&mut buf)? != 0;
            if present {
                cols.push(Some(read_string_u32(&mut buf, "col")?));
            } else {
                cols.push(None);
            }
        }
        rows.push(ResponseRow { cols });
    }
    let continues = read_u8(&mut buf)? != 0;
    let has_error = read_u8(&mut buf)? != 0;
    let error = if has_error {
        let code = read_u32(&mut buf)?;
        let msg = read_string_u16(&mut buf, "error_msg")?;
        Some(ResponseError { code, msg })
    } else {
        None
    };
    if !buf.is_empty() {
        return Err(WireError::Corruption(format!(
            "{} trailing bytes after response body",
            buf.len()
        )));
    }
    Ok(ResponseBody {
        rows,
        continues,
        error,
    })
}

// ── Frames ───────────────────────────────────────────────────────────────

/// Encode one frame: fixed header envelope followed by the body bytes.
/// The header's size, digest and continues flag are derived from the body.
pub fn encode_frame(wname: &str, body: &ResponseBody) -> Result<Vec<u8>> {
    let body_bytes = encode_response_body(body);
    if body_bytes.len() as u32 > MAX_BODY_SIZE {
        return Err(WireError::FrameTooLarge {
            size: body_bytes.len() as u32,
            max: MAX_BODY_SIZE,
        });
    }
    let header = ResponseHeader {
        size: body_bytes.len() as u32,
        md5: md5_digest(&body_bytes),
        wname: wname.to_string(),
        continues: body.continues,
    };
    let mut out = wrap_header(&header)?;
    out.extend_from_slice(&body_bytes);
    Ok(out)
}

/// Encode a whole logical response as a chain of frames, splitting the row
/// set every `max_rows_per_frame` rows. Every frame but the last carries
/// `continues = true`; a worker error rides on the final frame.
pub fn encode_response_stream(
    wname: &str,
    rows: &[ResponseRow],
    error: Option<ResponseError>,
    max_rows_per_frame: usize,
) -> Result<Vec<Vec<u8>>> {
    let per_frame = max_rows_per_frame.max(1);
    let mut chunks: Vec<&[ResponseRow]> = rows.chunks(per_frame).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }
    let last = chunks.len() - 1;
    let mut frames = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.iter().enumerate() {
        let body = ResponseBody {
            rows: chunk.to_vec(),
            continues: i != last,
            error: if i == last { error.clone() } else { None },
        };
        frames.push(encode_frame(wname, &body)?);
    }
    Ok(frames)
}

// ── Task message ─────────────────────────────────────────────────────────

/// Encode a task message.
pub fn encode_task_msg(msg: &TaskMsg) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(64);
    out.put_u64_le(msg.session);
    out.put_u32_le(msg.job_id);
    write_string_u16(&mut out, &msg.db);
    out.put_i32_le(msg.chunk_id);
    out.put_u16_le(msg.fragments.len() as u16);
    for frag in &msg.fragments {
        write_string_u16(&mut out, &frag.result_table);
        write_string_u32(&mut out, &frag.query);
        out.put_u16_le(frag.subchunks.len() as u16);
        for &sc in &frag.subchunks {
            out.put_i32_le(sc);
        }
    }
    out.put_u16_le(msg.scan_tables.len() as u16);
    for t in &msg.scan_tables {
        write_string_u16(&mut out, t);
    }
    out.put_i32_le(msg.scan_rating);
    out.to_vec()
}

/// Decode a task message.
pub fn decode_task_msg(mut buf: &[u8]) -> Result<TaskMsg> {
    let session = read_u64(&mut buf)?;
    let job_id = read_u32(&mut buf)?;
    let db = read_string_u16(&mut buf, "db")?;
    let chunk_id = read_i32(&mut buf)?;
    let num_frags = read_u16(&mut buf)? as usize;
    let mut fragments = Vec::with_capacity(num_frags);
    for _ in 0..num_frags {
        let result_table = read_string_u16(&mut buf, "result_table")?;
        let query = read_string_u32(&mut buf, "query")?;
        let num_sc = read_u16(&mut buf)? as usize;
        let mut subchunks = Vec::with_capacity(num_sc);
        for _ in 0..num_sc {
            subchunks.push(read_i32(&mut buf)?);
        }
        fragments.push(Fragment {
            result_table,
            query,
            subchunks,
        });
    }
    let num_tables = read_u16(&mut buf)? as usize;
    let mut scan_tables = Vec::with_capacity(num_tables);
    for _ in 0..num_tables {
        scan_tables.push(read_string_u16(&mut buf, "scan_table")?);
    }
    let scan_rating = read_i32(&mut buf)?;
    if !buf.is_empty() {
        return Err(WireError::Corruption(format!(
            "{} trailing bytes after task message",
            buf.len()
        )));
    }
    Ok(TaskMsg {
        session,
        job_id,
        db,
        chunk_id,
        fragments,
        scan_tables,
        scan_rating,
    })
}

// ── Tests ────────────────────────────────────────────────────────────────
