//! Wire codec for dispatch messages.
//!
//! A message is `header[16] || payload`. The header's first four bytes are
//! the source token index (little-endian i32); the rest is reserved and
//! stays zero. The payload is either the raw bfloat16 hidden vector or an
//! FP8 E4M3 cast with one scale per 128 channels, the scales shipped as
//! f32 words or packed UE8M0 exponents.

use half::bf16;

use crate::config::{HEADER_BYTES, SCALE_GROUP, UE8M0_PACK};

/// FP8 E4M3 saturation bound.
const FP8_MAX: f32 = 448.0;

/// Floor applied to per-group amax so all-zero groups keep a usable scale.
const AMAX_FLOOR: f32 = 1e-4;

pub fn write_header(dst: &mut [u8], src_token_idx: i32) {
    dst[..HEADER_BYTES].fill(0);
    dst[..4].copy_from_slice(&src_token_idx.to_le_bytes());
}

pub fn read_src_index(msg: &[u8]) -> i32 {
    i32::from_le_bytes([msg[0], msg[1], msg[2], msg[3]])
}

/// Saturating f32 -> FP8 E4M3 conversion with round-to-nearest-even.
pub fn fp8_e4m3_encode(v: f32) -> u8 {
    if v.is_nan() {
        return 0x7f;
    }
    let sign = (v.is_sign_negative() as u8) << 7;
    let a = v.abs().min(FP8_MAX);

    // Subnormal domain: steps of 2^-9 below 2^-6.
    if a < 0.015625 {
        let q = (a * 512.0).round_ties_even() as u8;
        return if q >= 8 { sign | 0x08 } else { sign | q };
    }

    let bits = a.to_bits();
    let mut exp = ((bits >> 23) & 0xff) as i32 - 127;
    let frac = bits & 0x007f_ffff;

    // Keep 3 mantissa bits, round-to-nearest-even on the dropped 20.
    let mut mant = frac >> 20;
    let rest = frac & 0x000f_ffff;
    const HALF: u32 = 1 << 19;
    if rest > HALF || (rest == HALF && mant & 1 == 1) {
        mant += 1;
        if mant == 8 {
            mant = 0;
            exp += 1;
        }
    }
    if exp > 8 {
        // Rounded past the top bin; saturate.
        return sign | 0x7e;
    }
    sign | (((exp + 7) as u8) << 3) | mant as u8
}

pub fn fp8_e4m3_decode(b: u8) -> f32 {
    let sign = if b & 0x80 != 0 { -1.0f32 } else { 1.0 };
    let exp = ((b >> 3) & 0x0f) as i32;
    let mant = (b & 0x07) as f32;
    if exp == 0x0f && b & 0x07 == 0x07 {
        return f32::NAN;
    }
    if exp == 0 {
        sign * (mant / 8.0) * 0.015625
    } else {
        sign * (1.0 + mant / 8.0) * ((exp - 7) as f32).exp2()
    }
}

fn group_scale(group: &[bf16], round_scale: bool) -> f32 {
    let mut amax = 0f32;
    for &v in group {
        amax = amax.max(v.to_f32().abs());
    }
    let scale = amax.max(AMAX_FLOOR) / FP8_MAX;
    if round_scale { scale.log2().ceil().exp2() } else { scale }
}

/// Biased exponent byte of a power-of-two scale.
fn ue8m0_byte(scale: f32) -> u8 {
    ((scale.to_bits() >> 23) & 0xff) as u8
}

fn ue8m0_scale(byte: u8) -> f32 {
    f32::from_bits((byte as u32) << 23)
}

/// Packed receive tensors produced by the dispatch receive phase. Shapes
/// follow `[num_local_experts][packed_tokens]` with only the first
/// `recv_count[l]` positions of each expert row valid.
pub struct PackedRecvX {
    pub hidden: usize,
    pub num_local_experts: usize,
    pub packed_tokens: usize,
    pub data: PackedData,
}

pub enum PackedData {
    Bf16(Vec<bf16>),
    Fp8 { bytes: Vec<u8>, scales: PackedScales },
}

/// Scale layout is pack-major (`[l][pack][token]`), the column-major form
/// the downstream grouped GEMM consumes.
pub enum PackedScales {
    F32(Vec<f32>),
    Ue8m0(Vec<u32>),
}

impl PackedRecvX {
    /// Dequantize one received token to f32. Reference path for consumers
    /// and tests; the hot path hands the packed tensors out untouched.
    pub fn dequant_token(&self, local_expert: usize, pos: usize) -> Vec<f32> {
        let h = self.hidden;
        let tp = self.packed_tokens;
        let base = (local_expert * tp + pos) * h;
        match &self.data {
            PackedData::Bf16(data) => {
                data[base..base + h].iter().map(|v| v.to_f32()).collect()
            }
            PackedData::Fp8 { bytes, scales } => {
                let num_packs = h / SCALE_GROUP;
                let mut out = Vec::with_capacity(h);
                for pack in 0..num_packs {
                    let scale = match scales {
                        PackedScales::F32(s) => {
                            s[(local_expert * num_packs + pack) * tp + pos]
                        }
                        PackedScales::Ue8m0(s) => {
                            let words = num_packs.div_ceil(UE8M0_PACK);
                            let word =
                                s[(local_expert * words + pack / UE8M0_PACK) * tp + pos];
                            ue8m0_scale(word.to_le_bytes()[pack % UE8M0_PACK])
                        }
                    };
                    for i in 0..SCALE_GROUP {
                        out.push(fp8_e4m3_decode(bytes[base + pack * SCALE_GROUP + i]) * scale);
                    }
                }
                out
            }
        }
    }
}

/// One token on the wire. Implementations are selected once per launch and
/// monomorphized into the kernels.
pub trait TokenCodec {
    fn hidden(&self) -> usize;
    fn wire_payload_bytes(&self) -> usize;

    fn wire_msg_bytes(&self) -> usize {
        HEADER_BYTES + self.wire_payload_bytes()
    }

    fn alloc_packed(&self, num_local_experts: usize, packed_tokens: usize) -> PackedRecvX;

    /// Encode header and payload for one token into a staging slot.
    fn encode(&self, src_token_idx: i32, token: &[bf16], dst: &mut [u8]);

    /// Copy one received payload into the packed receive tensors at
    /// `(local_expert, pos)`.
    fn unpack(&self, payload: &[u8], local_expert: usize, pos: usize, out: &mut PackedRecvX);
}

pub struct Bf16Codec {
    pub hidden: usize,
}

impl TokenCodec for Bf16Codec {
    fn hidden(&self) -> usize {
        self.hidden
    }

    fn wire_payload_bytes(&self) -> usize {
        self.hidden * 2
    }

    fn alloc_packed(&self, num_local_experts: usize, packed_tokens: usize) -> PackedRecvX {
        PackedRecvX {
            hidden: self.hidden,
            num_local_experts,
            packed_tokens,
            data: PackedData::Bf16(vec![
                bf16::ZERO;
                num_local_experts * packed_tokens * self.hidden
            ]),
        }
    }

    fn encode(&self, src_token_idx: i32, token: &[bf16], dst: &mut [u8]) {
        assert_eq!(token.len(), self.hidden);
        write_header(dst, src_token_idx);
        let payload = &mut dst[HEADER_BYTES..HEADER_BYTES + self.hidden * 2];
        for (chunk, v) in payload.chunks_exact_mut(2).zip(token) {
            chunk.copy_from_slice(&v.to_bits().to_le_bytes());
        }
    }

    fn unpack(&self, payload: &[u8], local_expert: usize, pos: usize, out: &mut PackedRecvX) {
        let PackedData::Bf16(data) = &mut out.data else {
            panic!("bf16 codec paired with fp8 receive tensors");
        };
        let base = (local_expert * out.packed_tokens + pos) * self.hidden;
        for (i, chunk) in payload[..self.hidden * 2].chunks_exact(2).enumerate() {
            data[base + i] = bf16::from_bits(u16::from_le_bytes([chunk[0], chunk[1]]));
        }
    }
}

pub struct Fp8Codec {
    pub hidden: usize,
    pub round_scale: bool,
}

impl Fp8Codec {
    fn num_packs(&self) -> usize {
        self.hidden / SCALE_GROUP
    }

    fn quantize(&self, token: &[bf16], bytes: &mut [u8], mut sink: impl FnMut(usize, f32)) {
        for pack in 0..self.num_packs() {
            let group = &token[pack * SCALE_GROUP..(pack + 1) * SCALE_GROUP];
            let scale = group_scale(group, self.round_scale);
            let inv = scale.recip();
            for (i, &v) in group.iter().enumerate() {
                bytes[pack * SCALE_GROUP + i] = fp8_e4m3_encode(v.to_f32() * inv);
            }
            sink(pack, scale);
        }
    }
}

impl TokenCodec for Fp8Codec {
    fn hidden(&self) -> usize {
        self.hidden
    }

    fn wire_payload_bytes(&self) -> usize {
        self.hidden + self.num_packs() * 4
    }

    fn alloc_packed(&self, num_local_experts: usize, packed_tokens: usize) -> PackedRecvX {
        PackedRecvX {
            hidden: self.hidden,
            num_local_experts,
            packed_tokens,
            data: PackedData::Fp8 {
                bytes: vec![0; num_local_experts * packed_tokens * self.hidden],
                scales: PackedScales::F32(vec![
                    0.0;
                    num_local_experts * self.num_packs() * packed_tokens
                ]),
            },
        }
    }

    fn encode(&self, src_token_idx: i32, token: &[bf16], dst: &mut [u8]) {
        assert_eq!(token.len(), self.hidden);
        write_header(dst, src_token_idx);
        let (bytes, scales) =
            dst[HEADER_BYTES..HEADER_BYTES + self.wire_payload_bytes()].split_at_mut(self.hidden);
        self.quantize(token, bytes, |pack, scale| {
            scales[pack * 4..pack * 4 + 4].copy_from_slice(&scale.to_le_bytes());
        });
    }

    fn unpack(&self, payload: &[u8], local_expert: usize, pos: usize, out: &mut PackedRecvX) {
        let tp = out.packed_tokens;
        let PackedData::Fp8 { bytes, scales: PackedScales::F32(scales) } = &mut out.data else {
            panic!("fp8 codec paired with mismatched receive tensors");
        };
        let base = (local_expert * tp + pos) * self.hidden;
        bytes[base..base + self.hidden].copy_from_slice(&payload[..self.hidden]);
        for pack in 0..self.num_packs() {
            let wire = &payload[self.hidden + pack * 4..self.hidden + pack * 4 + 4];
            scales[(local_expert * self.num_packs() + pack) * tp + pos] =
                f32::from_le_bytes([wire[0], wire[1], wire[2], wire[3]]);
        }
    }
}

/// FP8 with power-of-two scales shipped as packed UE8M0 exponent bytes,
/// four packs per u32 word.
pub struct Ue8m0Codec {
    pub hidden: usize,
}

impl Ue8m0Codec {
    fn num_packs(&self) -> usize {
        self.hidden / SCALE_GROUP
    }

    fn num_scale_words(&self) -> usize {
        self.num_packs().div_ceil(UE8M0_PACK)
    }
}

impl TokenCodec for Ue8m0Codec {
    fn hidden(&self) -> usize {
        self.hidden
    }

    fn wire_payload_bytes(&self) -> usize {
        self.hidden + self.num_scale_words() * 4
    }

    fn alloc_packed(&self, num_local_experts: usize, packed_tokens: usize) -> PackedRecvX {
        PackedRecvX {
            hidden: self.hidden,
            num_local_experts,
            packed_tokens,
            data: PackedData::Fp8 {
                bytes: vec![0; num_local_experts * packed_tokens * self.hidden],
                scales: PackedScales::Ue8m0(vec![
                    0;
                    num_local_experts * self.num_scale_words() * packed_tokens
                ]),
            },
        }
    }

    fn encode(&self, src_token_idx: i32, token: &[bf16], dst: &mut [u8]) {
        assert_eq!(token.len(), self.hidden);
        write_header(dst, src_token_idx);
        let (bytes, scale_bytes) =
            dst[HEADER_BYTES..HEADER_BYTES + self.wire_payload_bytes()].split_at_mut(self.hidden);
        scale_bytes.fill(0);
        let inner = Fp8Codec { hidden: self.hidden, round_scale: true };
        inner.quantize(token, bytes, |pack, scale| {
            scale_bytes[pack] = ue8m0_byte(scale);
        });
    }

    fn unpack(&self, payload: &[u8], local_expert: usize, pos: usize, out: &mut PackedRecvX) {
        let tp = out.packed_tokens;
        let PackedData::Fp8 { bytes, scales: PackedScales::Ue8m0(scales) } = &mut out.data else {
            panic!("ue8m0 codec paired with mismatched receive tensors");
        };
        let base = (local_expert * tp + pos) * self.hidden;
        bytes[base..base + self.hidden].copy_from_slice(&payload[..self.hidden]);
        for word in 0..self.num_scale_words() {
            let wire = &payload[self.hidden + word * 4..self.hidden + word * 4 + 4];
            scales[(local_expert * self.num_scale_words() + word) * tp + pos] =
                u32::from_le_bytes([wire[0], wire[1], wire[2], wire[3]]);
        }
    }
}
