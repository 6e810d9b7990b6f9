//! Byte layout of each rank's symmetric region.
//!
//! Every rank's region is laid out identically, so a `(rank, offset)` pair
//! fully names any buffer in the world. Slot strides are sized for the
//! bf16 message, the largest of the supported codecs, so one layout serves
//! every launch specialization.

use crate::config::{AllToAllConfig, HEADER_BYTES};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Section {
    pub offset: usize,
    pub len: usize,
}

impl Section {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Per-expert sync cell: `expected[R] || received[R] || total_expected ||
/// total_received || completion || pad`, in i32 words.
fn sync_stride_words(num_ranks: usize) -> usize {
    (2 * num_ranks + 3).next_multiple_of(4)
}

#[derive(Clone, Debug)]
pub struct BufferLayout {
    num_ranks: usize,
    max_tokens: usize,
    hidden: usize,
    msg_bytes: usize,

    /// Sender-side slot counters, `[num_experts][num_ranks]` i32.
    pub counter: Section,
    /// Count-handshake words, `[num_local_experts][num_ranks]` i32.
    pub recv_count: Section,
    /// Dispatch receive slots, `[num_local_experts][num_ranks][max_tokens]`.
    pub recv_data: Section,
    /// Dispatch send staging, one encoded message per local token.
    pub send_staging: Section,
    /// Combine receive slots, `[num_local_experts][num_ranks][max_tokens]`,
    /// second axis indexed by the sending expert's owner rank.
    pub combine_recv: Section,
    /// Combine send payload staging, `[num_local_experts][packed_tokens][hidden]`
    /// bf16. Exposed to callers for zero-copy combine.
    pub combine_send_payload: Section,
    /// Combine send header staging, `[num_local_experts][packed_tokens]`.
    pub combine_send_header: Section,
    /// Combine arrival flags, `[num_experts]` i32.
    pub recv_flag: Section,
    /// Expert sync cells, `[num_experts]`.
    pub sync_info: Section,
    /// FP32 staging for the pure-EP reduction, `[max_tokens][hidden]` f32.
    pub reduce_src: Section,
    /// Reduction output window, same shape as `reduce_src`.
    pub reduce_dst: Section,

    pub total_bytes: usize,
}

impl BufferLayout {
    pub fn new(cfg: &AllToAllConfig) -> Self {
        let num_ranks = cfg.num_ranks;
        let num_local_experts = cfg.num_local_experts();
        let max_tokens = cfg.max_tokens_per_rank;
        let hidden = cfg.hidden;
        let packed_tokens = cfg.packed_tokens();
        let msg_bytes = HEADER_BYTES + 2 * hidden;
        let pair_slots = num_local_experts * num_ranks * max_tokens;

        let mut cursor = 0usize;
        let mut section = |len: usize| {
            let offset = cursor;
            cursor = (cursor + len).next_multiple_of(16);
            Section { offset, len }
        };

        let counter = section(cfg.num_experts * num_ranks * 4);
        let recv_count = section(num_local_experts * num_ranks * 4);
        let recv_data = section(pair_slots * msg_bytes);
        let send_staging = section(max_tokens * msg_bytes);
        let combine_recv = section(pair_slots * msg_bytes);
        let combine_send_payload = section(num_local_experts * packed_tokens * 2 * hidden);
        let combine_send_header = section(num_local_experts * packed_tokens * HEADER_BYTES);
        let recv_flag = section(cfg.num_experts * 4);
        let sync_info = section(cfg.num_experts * sync_stride_words(num_ranks) * 4);
        let reduce_src = section(max_tokens * hidden * 4);
        let reduce_dst = section(max_tokens * hidden * 4);
        drop(section);

        Self {
            num_ranks,
            max_tokens,
            hidden,
            msg_bytes,
            counter,
            recv_count,
            recv_data,
            send_staging,
            combine_recv,
            combine_send_payload,
            combine_send_header,
            recv_flag,
            sync_info,
            reduce_src,
            reduce_dst,
            total_bytes: cursor,
        }
    }

    /// Slot stride shared by dispatch and combine messages.
    pub fn msg_bytes(&self) -> usize {
        self.msg_bytes
    }

    pub fn counter_offset(&self, expert: usize, rank: usize) -> usize {
        self.counter.offset + (expert * self.num_ranks + rank) * 4
    }

    pub fn recv_count_offset(&self, local_expert: usize, src_rank: usize) -> usize {
        self.recv_count.offset + (local_expert * self.num_ranks + src_rank) * 4
    }

    pub fn recv_slot_offset(&self, local_expert: usize, src_rank: usize, slot: usize) -> usize {
        self.recv_data.offset
            + ((local_expert * self.num_ranks + src_rank) * self.max_tokens + slot)
                * self.msg_bytes
    }

    pub fn send_slot_offset(&self, token: usize) -> usize {
        self.send_staging.offset + token * self.msg_bytes
    }

    pub fn combine_recv_slot_offset(
        &self,
        local_expert: usize,
        owner_rank: usize,
        slot: usize,
    ) -> usize {
        self.combine_recv.offset
            + ((local_expert * self.num_ranks + owner_rank) * self.max_tokens + slot)
                * self.msg_bytes
    }

    pub fn combine_payload_offset(&self, local_expert: usize, pos: usize) -> usize {
        let packed_tokens = self.num_ranks * self.max_tokens;
        self.combine_send_payload.offset
            + (local_expert * packed_tokens + pos) * 2 * self.hidden
    }

    pub fn combine_header_offset(&self, local_expert: usize, pos: usize) -> usize {
        let packed_tokens = self.num_ranks * self.max_tokens;
        self.combine_send_header.offset
            + (local_expert * packed_tokens + pos) * HEADER_BYTES
    }

    pub fn flag_offset(&self, expert: usize) -> usize {
        self.recv_flag.offset + expert * 4
    }

    fn sync_base(&self, expert: usize) -> usize {
        self.sync_info.offset + expert * sync_stride_words(self.num_ranks) * 4
    }

    pub fn sync_expected_offset(&self, expert: usize, rank: usize) -> usize {
        self.sync_base(expert) + rank * 4
    }

    pub fn sync_received_offset(&self, expert: usize, rank: usize) -> usize {
        self.sync_base(expert) + (self.num_ranks + rank) * 4
    }

    pub fn sync_total_expected_offset(&self, expert: usize) -> usize {
        self.sync_base(expert) + 2 * self.num_ranks * 4
    }

    pub fn sync_total_received_offset(&self, expert: usize) -> usize {
        self.sync_base(expert) + (2 * self.num_ranks + 1) * 4
    }

    pub fn sync_completion_offset(&self, expert: usize) -> usize {
        self.sync_base(expert) + (2 * self.num_ranks + 2) * 4
    }
}

/// Byte footprint of one rank's symmetric region for a given geometry.
/// Callers sizing their own allocators ask this before building a world.
pub fn rdma_size_hint(cfg: &AllToAllConfig) -> usize {
    BufferLayout::new(cfg).total_bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AllToAllConfig {
        AllToAllConfig {
            num_ranks: 2,
            num_experts: 4,
            num_topk: 2,
            hidden: 128,
            max_tokens_per_rank: 4,
            node_size: 2,
            pure_ep: false,
        }
    }

    #[test]
    fn sections_are_aligned_and_disjoint() {
        let layout = BufferLayout::new(&cfg());
        let sections = [
            layout.counter,
            layout.recv_count,
            layout.recv_data,
            layout.send_staging,
            layout.combine_recv,
            layout.combine_send_payload,
            layout.combine_send_header,
            layout.recv_flag,
            layout.sync_info,
            layout.reduce_src,
            layout.reduce_dst,
        ];
        let mut prev_end = 0;
        for s in sections {
            assert_eq!(s.offset % 16, 0, "section at {} misaligned", s.offset);
            assert!(s.offset >= prev_end, "section at {} overlaps", s.offset);
            prev_end = s.end();
        }
        assert!(layout.total_bytes >= prev_end);
    }

    #[test]
    fn size_hint_matches_layout() {
        let cfg = cfg();
        assert_eq!(rdma_size_hint(&cfg), BufferLayout::new(&cfg).total_bytes);
    }

    #[test]
    fn slot_offsets_stride_by_message_size() {
        let layout = BufferLayout::new(&cfg());
        let msg = layout.msg_bytes();
        assert_eq!(msg, HEADER_BYTES + 256);
        assert_eq!(
            layout.recv_slot_offset(0, 0, 1) - layout.recv_slot_offset(0, 0, 0),
            msg
        );
        assert_eq!(
            layout.recv_slot_offset(1, 0, 0) - layout.recv_slot_offset(0, 1, 0),
            layout.max_tokens * msg
        );
        assert_eq!(
            layout.combine_recv_slot_offset(0, 1, 0)
                - layout.combine_recv_slot_offset(0, 0, 0),
            layout.max_tokens * msg
        );
    }

    #[test]
    fn sync_cells_do_not_collide() {
        let layout = BufferLayout::new(&cfg());
        let a = layout.sync_completion_offset(0);
        let b = layout.sync_expected_offset(1, 0);
        assert!(a < b);
        assert!(layout.sync_total_received_offset(3) < layout.sync_info.end());
    }
}
