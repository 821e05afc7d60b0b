use std::mem;

use crate::NalUnit;

pub const NAL_TRAIL_N: u8 = 0;
pub const NAL_TRAIL_R: u8 = 1;
pub const NAL_IDR_W_RADL: u8 = 19;
pub const NAL_IDR_N_LP: u8 = 20;
pub const NAL_CRA: u8 = 21;
pub const NAL_VPS: u8 = 32;
pub const NAL_SPS: u8 = 33;
pub const NAL_PPS: u8 = 34;
pub const NAL_AUD: u8 = 35;
pub const NAL_PREFIX_SEI: u8 = 39;

pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Two-byte HEVC NAL header with layer 0 and temporal id 0.
#[must_use]
pub fn nal_header(nal_type: u8) -> [u8; 2] {
    [(nal_type & 0x3f) << 1, 0x01]
}

/// NAL type from a payload that starts at the NAL header.
#[must_use]
pub fn nal_type_of(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| (b >> 1) & 0x3f)
}

/// Builds an Annex-B NAL unit: start code, header, then `body`.
#[must_use]
pub fn annexb_nal(nal_type: u8, body: &[u8]) -> NalUnit {
    let mut data = Vec::with_capacity(START_CODE.len() + 2 + body.len());
    data.extend_from_slice(&START_CODE);
    data.extend_from_slice(&nal_header(nal_type));
    data.extend_from_slice(body);
    NalUnit { nal_type, data }
}

pub fn is_vcl(nal_type: u8) -> bool {
    nal_type <= 31
}

pub fn is_key_vcl(nal_type: u8) -> bool {
    (16..=21).contains(&nal_type)
}

pub fn is_parameter_set(nal_type: u8) -> bool {
    matches!(nal_type, NAL_VPS | NAL_SPS | NAL_PPS)
}

/// Offsets and lengths of every 3- or 4-byte start code in `data`.
pub fn find_start_codes(data: &[u8]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i + 3 <= data.len() {
        if i + 4 <= data.len() && data[i..i + 4] == START_CODE {
            out.push((i, 4));
            i += 4;
            continue;
        }
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            out.push((i, 3));
            i += 3;
            continue;
        }
        i += 1;
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSets {
    pub vps: Option<Vec<u8>>,
    pub sps: Option<Vec<u8>>,
    pub pps: Option<Vec<u8>>,
}

impl ParameterSets {
    /// VPS, SPS and PPS in that order, once all three have been seen.
    pub fn complete(&self) -> Option<Vec<Vec<u8>>> {
        Some(vec![
            self.vps.clone()?,
            self.sps.clone()?,
            self.pps.clone()?,
        ])
    }

    fn observe(&mut self, nal: &[u8]) {
        match nal_type_of(nal) {
            Some(NAL_VPS) => self.vps = Some(nal.to_vec()),
            Some(NAL_SPS) => self.sps = Some(nal.to_vec()),
            Some(NAL_PPS) => self.pps = Some(nal.to_vec()),
            _ => {}
        }
    }
}

/// Access unit recovered from the byte stream. NAL payloads exclude start codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledUnit {
    pub nalus: Vec<Vec<u8>>,
    pub is_keyframe: bool,
}

impl ReassembledUnit {
    pub fn nal_types(&self) -> Vec<u8> {
        self.nalus.iter().filter_map(|nal| nal_type_of(nal)).collect()
    }
}

/// Splits arbitrarily chunked Annex-B bytes back into access units.
///
/// A NAL is only emitted once the next start code has arrived, so chunk boundaries may fall
/// anywhere. A new access unit begins at a parameter set, AUD or prefix SEI following picture
/// data, or at a slice whose `first_slice_segment_in_pic_flag` is set.
#[derive(Debug, Default)]
pub struct NalReassembler {
    pending: Vec<u8>,
    current: Vec<Vec<u8>>,
    current_has_vcl: bool,
    current_has_key_vcl: bool,
    parameter_sets: ParameterSets,
    nal_count: u64,
}

impl NalReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<ReassembledUnit> {
        self.pending.extend_from_slice(chunk);
        let nalus = self.take_complete_nals(false);
        self.process_nals(nalus)
    }

    pub fn flush(&mut self) -> Vec<ReassembledUnit> {
        let nalus = self.take_complete_nals(true);
        let mut out = self.process_nals(nalus);
        if self.current_has_vcl && !self.current.is_empty() {
            out.push(self.finish_current());
        }
        self.current.clear();
        out
    }

    pub fn parameter_sets(&self) -> &ParameterSets {
        &self.parameter_sets
    }

    pub fn nal_count(&self) -> u64 {
        self.nal_count
    }

    fn process_nals(&mut self, nalus: Vec<Vec<u8>>) -> Vec<ReassembledUnit> {
        let mut out = Vec::new();
        for nal in nalus {
            let Some(nal_type) = nal_type_of(&nal) else {
                continue;
            };
            self.nal_count += 1;
            self.parameter_sets.observe(&nal);

            let opens_unit = if is_vcl(nal_type) {
                first_slice_in_picture(&nal)
            } else {
                is_parameter_set(nal_type) || matches!(nal_type, NAL_AUD | NAL_PREFIX_SEI)
            };
            if opens_unit && self.current_has_vcl {
                out.push(self.finish_current());
            }

            self.current.push(nal);
            if is_vcl(nal_type) {
                self.current_has_vcl = true;
                self.current_has_key_vcl |= is_key_vcl(nal_type);
            }
        }
        out
    }

    fn finish_current(&mut self) -> ReassembledUnit {
        let unit = ReassembledUnit {
            nalus: mem::take(&mut self.current),
            is_keyframe: self.current_has_key_vcl,
        };
        self.current_has_vcl = false;
        self.current_has_key_vcl = false;
        unit
    }

    fn take_complete_nals(&mut self, finalize: bool) -> Vec<Vec<u8>> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let mut start_codes = find_start_codes(&self.pending);
        if start_codes.is_empty() {
            if finalize {
                self.pending.clear();
            }
            return Vec::new();
        }
        if start_codes[0].0 > 0 {
            self.pending.drain(..start_codes[0].0);
            start_codes = find_start_codes(&self.pending);
        }

        let mut nalus = Vec::new();
        for window in start_codes.windows(2) {
            let (start, start_len) = window[0];
            let payload_start = start + start_len;
            let end = window[1].0;
            if end > payload_start {
                nalus.push(self.pending[payload_start..end].to_vec());
            }
        }

        match start_codes.last().copied() {
            Some((start, start_len)) if finalize => {
                if self.pending.len() > start + start_len {
                    nalus.push(self.pending[start + start_len..].to_vec());
                }
                self.pending.clear();
            }
            Some((start, _)) => {
                self.pending.drain(..start);
            }
            None => {}
        }
        nalus
    }
}

fn first_slice_in_picture(nal: &[u8]) -> bool {
    nal.get(2).is_none_or(|b| b & 0x80 != 0)
}
