//! Raw ISO BMFF box access.
//!
//! The `mp4` crate drops fields the pipelines need (`hvcC`/`vpcC` bodies,
//! fragment run tables), so those are read from the buffered bytes here.

use bytes::Bytes;

use crate::error::{ClipError, Result};

pub(crate) struct BoxHeader {
    pub size: u64,
    pub header_len: u64,
    pub kind: [u8; 4],
}

/// Read a box header, `None` if more bytes are needed.
pub(crate) fn read_box_header(data: &[u8]) -> Result<Option<BoxHeader>> {
    if data.len() < 8 {
        return Ok(None);
    }
    let size32 = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let kind = [data[4], data[5], data[6], data[7]];

    let (size, header_len) = match size32 {
        0 => {
            return Err(ClipError::Container(format!(
                "open-ended {} box is not supported",
                String::from_utf8_lossy(&kind)
            )))
        }
        1 => {
            if data.len() < 16 {
                return Ok(None);
            }
            let mut large = [0u8; 8];
            large.copy_from_slice(&data[8..16]);
            (u64::from_be_bytes(large), 16)
        }
        n => (n as u64, 8),
    };

    if size < header_len {
        return Err(ClipError::Container(format!(
            "invalid {} box size {}",
            String::from_utf8_lossy(&kind),
            size
        )));
    }
    Ok(Some(BoxHeader {
        size,
        header_len,
        kind,
    }))
}

/// Child boxes of a container body as `(type, body)` pairs. Trailing bytes
/// too short for a header are ignored.
pub(crate) fn children(body: &[u8]) -> Result<Vec<([u8; 4], &[u8])>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        let rest = &body[pos..];
        let Some(header) = read_box_header(rest)? else {
            break;
        };
        if header.size > rest.len() as u64 {
            return Err(ClipError::Container(format!(
                "{} box overruns its parent",
                String::from_utf8_lossy(&header.kind)
            )));
        }
        let size = header.size as usize;
        out.push((header.kind, &rest[header.header_len as usize..size]));
        pos += size;
    }
    Ok(out)
}

pub(crate) fn find_child<'a>(body: &'a [u8], kind: &[u8; 4]) -> Result<Option<&'a [u8]>> {
    Ok(children(body)?
        .into_iter()
        .find(|(k, _)| k == kind)
        .map(|(_, b)| b))
}

/// Follow a path of first-match children, e.g. `mdia/minf/stbl`.
pub(crate) fn find_path<'a>(body: &'a [u8], path: &[&[u8; 4]]) -> Result<Option<&'a [u8]>> {
    let mut current = body;
    for kind in path {
        match find_child(current, kind)? {
            Some(child) => current = child,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// Big-endian field reader over a box body
pub(crate) struct Fields<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| ClipError::Container("truncated box field".to_string()))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(b))
    }

    /// Version and flags of a full box
    pub fn full_box(&mut self) -> Result<(u8, u32)> {
        let v = self.u32()?;
        Ok(((v >> 24) as u8, v & 0x00ff_ffff))
    }
}

fn tkhd_track_id(tkhd: &[u8]) -> Result<u32> {
    let mut f = Fields::new(tkhd);
    let (version, _) = f.full_box()?;
    f.skip(if version == 1 { 16 } else { 8 })?;
    f.u32()
}

/// SampleEntry and VisualSampleEntry fields before the child boxes
const VISUAL_SAMPLE_ENTRY_LEN: usize = 78;

const CONFIG_BOXES: [&[u8; 4]; 3] = [b"avcC", b"hvcC", b"vpcC"];

/// First visual sample entry of a track
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct VisualEntry {
    pub format: String,
    pub width: u16,
    pub height: u16,
    /// Type and body (without box header) of the decoder configuration box
    pub config: Option<([u8; 4], Bytes)>,
}

impl VisualEntry {
    /// Codec string in the `avc1.PPCCLL` / `hvc1.…` / `vp09.PP.LL.DD` forms
    pub fn codec(&self) -> String {
        self.config
            .as_ref()
            .and_then(|(kind, record)| codec_string(&self.format, kind, record))
            .unwrap_or_else(|| self.format.clone())
    }
}

/// Find the visual sample entry of `track_id` in a `moov` body.
pub(crate) fn visual_entry(moov: &[u8], track_id: u32) -> Result<Option<VisualEntry>> {
    for (kind, trak) in children(moov)? {
        if &kind != b"trak" {
            continue;
        }
        let Some(tkhd) = find_child(trak, b"tkhd")? else {
            continue;
        };
        if tkhd_track_id(tkhd)? != track_id {
            continue;
        }
        let Some(stsd) = find_path(trak, &[b"mdia", b"minf", b"stbl", b"stsd"])? else {
            return Ok(None);
        };
        // version, flags and entry count
        let entries = stsd.get(8..).unwrap_or_default();
        let Some((format, entry)) = children(entries)?.into_iter().next() else {
            return Ok(None);
        };
        if entry.len() < VISUAL_SAMPLE_ENTRY_LEN {
            return Err(ClipError::Container(format!(
                "short {} sample entry",
                String::from_utf8_lossy(&format)
            )));
        }

        let config = children(&entry[VISUAL_SAMPLE_ENTRY_LEN..])?
            .into_iter()
            .find(|(k, _)| CONFIG_BOXES.contains(&k))
            .map(|(k, body)| (k, Bytes::copy_from_slice(body)));

        return Ok(Some(VisualEntry {
            format: String::from_utf8_lossy(&format).into_owned(),
            width: u16::from_be_bytes([entry[24], entry[25]]),
            height: u16::from_be_bytes([entry[26], entry[27]]),
            config,
        }));
    }
    Ok(None)
}

fn codec_string(format: &str, config: &[u8; 4], record: &[u8]) -> Option<String> {
    match config {
        b"avcC" if record.len() >= 4 => Some(format!(
            "{}.{:02x}{:02x}{:02x}",
            format, record[1], record[2], record[3]
        )),
        b"hvcC" if record.len() >= 13 => Some(hevc_codec_string(format, record)),
        // full box: version and flags precede profile, level and bit depth
        b"vpcC" if record.len() >= 7 => Some(format!(
            "{}.{:02}.{:02}.{:02}",
            format,
            record[4],
            record[5],
            record[6] >> 4
        )),
        _ => None,
    }
}

fn hevc_codec_string(format: &str, record: &[u8]) -> String {
    let profile_space = ["", "A", "B", "C"][(record[1] >> 6) as usize];
    let tier = if record[1] & 0x20 != 0 { 'H' } else { 'L' };
    let profile_idc = record[1] & 0x1f;
    let compatibility =
        u32::from_be_bytes([record[2], record[3], record[4], record[5]]).reverse_bits();

    let mut codec = format!(
        "{}.{}{}.{:x}.{}{}",
        format, profile_space, profile_idc, compatibility, tier, record[12]
    );
    let constraints = &record[6..12];
    if let Some(last) = constraints.iter().rposition(|b| *b != 0) {
        for b in &constraints[..=last] {
            codec.push_str(&format!(".{:x}", b));
        }
    }
    codec
}
