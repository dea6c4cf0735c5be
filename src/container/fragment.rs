//! Sample tables of fragmented MP4 (`moof` / `traf` / `trun`).
//!
//! Offsets follow ISO/IEC 14496-12: an explicit `base_data_offset` wins,
//! `default-base-is-moof` or the first `traf` starts at the `moof`, and a
//! later `traf` continues where the previous one's data ended.

use bytes::Bytes;
use std::collections::HashMap;
use std::ops::Range;

use super::isobmff::{children, find_child, read_box_header, Fields};
use crate::error::{ClipError, Result};
use crate::types::SampleDescriptor;

const TFHD_BASE_DATA_OFFSET: u32 = 0x00_0001;
const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x00_0002;
const TFHD_DEFAULT_DURATION: u32 = 0x00_0008;
const TFHD_DEFAULT_SIZE: u32 = 0x00_0010;
const TFHD_DEFAULT_FLAGS: u32 = 0x00_0020;
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x02_0000;

const TRUN_DATA_OFFSET: u32 = 0x00_0001;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x00_0004;
const TRUN_DURATION: u32 = 0x00_0100;
const TRUN_SIZE: u32 = 0x00_0200;
const TRUN_FLAGS: u32 = 0x00_0400;
const TRUN_CTS_OFFSET: u32 = 0x00_0800;

/// `sample_is_non_sync_sample` in the sample flags
pub(crate) const SAMPLE_IS_NON_SYNC: u32 = 0x0001_0000;

/// Per-track defaults from `trex`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SampleDefaults {
    pub duration: u32,
    pub size: u32,
    pub flags: u32,
}

/// Read every `trex` under the `mvex` of a `moov` body.
pub(crate) fn read_trex(moov: &[u8]) -> Result<HashMap<u32, SampleDefaults>> {
    let mut defaults = HashMap::new();
    let Some(mvex) = find_child(moov, b"mvex")? else {
        return Ok(defaults);
    };
    for (kind, trex) in children(mvex)? {
        if &kind != b"trex" {
            continue;
        }
        let mut f = Fields::new(trex);
        f.full_box()?;
        let track_id = f.u32()?;
        f.skip(4)?;
        defaults.insert(
            track_id,
            SampleDefaults {
                duration: f.u32()?,
                size: f.u32()?,
                flags: f.u32()?,
            },
        );
    }
    Ok(defaults)
}

/// One sample located in the file
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FragmentSample {
    pub data: Range<usize>,
    pub dts: u64,
    pub duration: u32,
    pub cts_offset: i64,
    pub is_sync: bool,
}

impl FragmentSample {
    pub fn to_descriptor(&self, file: &[u8], timescale: u32) -> SampleDescriptor {
        let dts = self.dts as i64;
        SampleDescriptor {
            data: Bytes::copy_from_slice(&file[self.data.clone()]),
            dts,
            cts: dts + self.cts_offset,
            duration: self.duration,
            is_sync: self.is_sync,
            timescale,
        }
    }
}

/// Samples one `traf` contributes
#[derive(Debug)]
pub(crate) struct TrackFragment {
    pub track_id: u32,
    pub samples: Vec<FragmentSample>,
}

/// Decode time state carried from one fragment to the next
#[derive(Debug, Default)]
pub(crate) struct FragmentReader {
    defaults: HashMap<u32, SampleDefaults>,
    next_dts: HashMap<u32, u64>,
}

impl FragmentReader {
    pub fn new(defaults: HashMap<u32, SampleDefaults>) -> Self {
        Self {
            defaults,
            next_dts: HashMap::new(),
        }
    }

    /// Sample tables of the `moof` box at `moof` in `file`.
    ///
    /// Returns `None`, without consuming the fragment, until every sample
    /// payload it points at has been received.
    pub fn read_moof(&mut self, file: &[u8], moof: Range<usize>) -> Result<Option<Vec<TrackFragment>>> {
        let header = read_box_header(&file[moof.clone()])?
            .ok_or_else(|| ClipError::Container("truncated moof header".to_string()))?;
        let body = &file[moof.start + header.header_len as usize..moof.end];
        let moof_start = moof.start as u64;

        let mut next_dts = self.next_dts.clone();
        let mut fragments = Vec::new();
        let mut previous_end: Option<u64> = None;

        for (kind, traf) in children(body)? {
            if &kind != b"traf" {
                continue;
            }
            let fragment = self.read_traf(traf, moof_start, previous_end, &next_dts)?;
            previous_end = fragment.samples.last().map(|s| s.data.end as u64).or(previous_end);
            if let Some(last) = fragment.samples.last() {
                next_dts.insert(fragment.track_id, last.dts + last.duration as u64);
            }
            fragments.push(fragment);
        }

        let complete = fragments
            .iter()
            .flat_map(|f| &f.samples)
            .all(|s| s.data.end <= file.len());
        if !complete {
            return Ok(None);
        }

        self.next_dts = next_dts;
        Ok(Some(fragments))
    }

    fn read_traf(
        &self,
        traf: &[u8],
        moof_start: u64,
        previous_end: Option<u64>,
        next_dts: &HashMap<u32, u64>,
    ) -> Result<TrackFragment> {
        let tfhd = find_child(traf, b"tfhd")?
            .ok_or_else(|| ClipError::Container("traf without tfhd".to_string()))?;
        let mut f = Fields::new(tfhd);
        let (_, flags) = f.full_box()?;
        let track_id = f.u32()?;
        let trex = self.defaults.get(&track_id).copied().unwrap_or_default();

        let base_data_offset = if flags & TFHD_BASE_DATA_OFFSET != 0 {
            Some(f.u64()?)
        } else {
            None
        };
        if flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
            f.skip(4)?;
        }
        let defaults = SampleDefaults {
            duration: if flags & TFHD_DEFAULT_DURATION != 0 { f.u32()? } else { trex.duration },
            size: if flags & TFHD_DEFAULT_SIZE != 0 { f.u32()? } else { trex.size },
            flags: if flags & TFHD_DEFAULT_FLAGS != 0 { f.u32()? } else { trex.flags },
        };

        let base = match base_data_offset {
            Some(offset) => offset,
            None if flags & TFHD_DEFAULT_BASE_IS_MOOF != 0 => moof_start,
            None => previous_end.unwrap_or(moof_start),
        };

        let mut dts = match find_child(traf, b"tfdt")? {
            Some(tfdt) => {
                let mut f = Fields::new(tfdt);
                let (version, _) = f.full_box()?;
                if version == 1 {
                    f.u64()?
                } else {
                    f.u32()? as u64
                }
            }
            None => next_dts.get(&track_id).copied().unwrap_or(0),
        };

        let mut samples = Vec::new();
        let mut data_pos = base;
        for (kind, trun) in children(traf)? {
            if &kind != b"trun" {
                continue;
            }
            let mut f = Fields::new(trun);
            let (version, flags) = f.full_box()?;
            let count = f.u32()?;
            if flags & TRUN_DATA_OFFSET != 0 {
                let offset = f.i32()? as i64;
                data_pos = base.checked_add_signed(offset).ok_or_else(|| {
                    ClipError::Container(format!("trun data offset {} before file start", offset))
                })?;
            }
            let first_flags = if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
                Some(f.u32()?)
            } else {
                None
            };

            for i in 0..count {
                let duration = if flags & TRUN_DURATION != 0 { f.u32()? } else { defaults.duration };
                let size = if flags & TRUN_SIZE != 0 { f.u32()? } else { defaults.size };
                let sample_flags = if flags & TRUN_FLAGS != 0 {
                    f.u32()?
                } else if i == 0 {
                    first_flags.unwrap_or(defaults.flags)
                } else {
                    defaults.flags
                };
                let cts_offset = if flags & TRUN_CTS_OFFSET != 0 {
                    let raw = f.u32()?;
                    if version == 0 {
                        raw as i64
                    } else {
                        raw as i32 as i64
                    }
                } else {
                    0
                };

                let end = data_pos
                    .checked_add(size as u64)
                    .and_then(|end| usize::try_from(end).ok())
                    .ok_or_else(|| ClipError::Container("sample data out of range".to_string()))?;
                samples.push(FragmentSample {
                    data: data_pos as usize..end,
                    dts,
                    duration,
                    cts_offset,
                    is_sync: sample_flags & SAMPLE_IS_NON_SYNC == 0,
                });
                data_pos = end as u64;
                dts += duration as u64;
            }
        }

        Ok(TrackFragment { track_id, samples })
    }
}
