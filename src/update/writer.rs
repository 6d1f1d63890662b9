//! Write policy: where a new generation's bytes go and how its checksum is
//! derived.
//!
//! Planning runs before the `Stage` record is journaled and performs every
//! read the new generation needs; the returned [`PendingWrite`] is executed
//! only after the record is durable. Published bytes are never changed: a
//! slot is written in place only past the end of the current generation, and
//! only while no other generation references it.

use super::request::{UpdateKind, UpdateReq};
use crate::checksum;
use crate::error::Result;
use crate::groups::{GroupAllocator, SlotRef};
use crate::index::Generation;
use crate::metrics::EngineMetrics;
use crate::wal::Journal;
use std::borrow::Cow;

/// Alignment of in-place writes.
const IO_ALIGN: u32 = 4096;

/// Placement and checksum of a generation about to be staged.
pub(crate) struct WritePlan<'a> {
    pub slot: Option<SlotRef>,
    pub len: u32,
    pub checksum: u32,
    pub pending: Option<PendingWrite<'a>>,
}

/// Bytes to write into the plan's slot once the stage is journaled.
pub(crate) struct PendingWrite<'a> {
    offset: u32,
    buf: Cow<'a, [u8]>,
    copy_on_write: bool,
}

pub(crate) struct WritePolicy<'e> {
    pub allocator: &'e GroupAllocator,
    pub metrics: &'e EngineMetrics,
    /// Synced before slots released by unsynced records are reused.
    pub journal: &'e Journal,
}

impl<'e> WritePolicy<'e> {
    fn allocate(&self, len: u32) -> Result<SlotRef> {
        self.allocator.allocate_with(len, || {
            self.journal.sync_then(|| self.allocator.release_pending())
        })
    }

    /// Plan an update against the current live generation.
    pub fn plan<'a>(
        &self,
        current: Option<&Generation>,
        req: &UpdateReq<'a>,
    ) -> Result<WritePlan<'a>> {
        match req.kind {
            UpdateKind::Remove => Ok(WritePlan {
                slot: None,
                len: 0,
                checksum: 0,
                pending: None,
            }),
            UpdateKind::Truncate => self.plan_truncate(current, req.length),
            UpdateKind::Write => {
                let delta_checksum = if req.without_checksum {
                    checksum::checksum(req.data)
                } else {
                    req.checksum
                };
                let cur_len = current.map_or(0, |g| g.meta().len);
                if req.offset >= cur_len {
                    self.plan_append(current, req.offset, req.data, delta_checksum)
                } else {
                    self.plan_overwrite(current, req.offset, req.data, delta_checksum)
                }
            }
        }
    }

    /// Write at or past the end of the current content.
    fn plan_append<'a>(
        &self,
        current: Option<&Generation>,
        offset: u32,
        data: &'a [u8],
        delta_checksum: u32,
    ) -> Result<WritePlan<'a>> {
        let cur_len = current.map_or(0, |g| g.meta().len);
        let cur_checksum = current.map_or(0, |g| g.meta().checksum);
        let cur_slot = current.and_then(Generation::slot);
        let hole = offset - cur_len;
        let new_len = offset + data.len() as u32;

        if new_len == cur_len {
            return Ok(WritePlan {
                slot: cur_slot.cloned(),
                len: cur_len,
                checksum: cur_checksum,
                pending: None,
            });
        }

        let checksum = if cur_len == 0 && offset == 0 {
            EngineMetrics::incr(&self.metrics.checksum_reuse);
            delta_checksum
        } else {
            EngineMetrics::incr(&self.metrics.checksum_combine);
            let with_hole =
                checksum::combine(cur_checksum, checksum::zeros(hole as u64), hole as u64);
            checksum::combine(with_hole, delta_checksum, data.len() as u64)
        };

        if let Some(slot) = cur_slot.filter(|s| s.can_extend(cur_len) && s.slot_size() >= new_len) {
            EngineMetrics::incr(&self.metrics.safe_write_direct_append);
            let payload = with_leading_zeros(hole, data);
            let pending = self.in_place(slot, cur_len, payload)?;
            return Ok(WritePlan {
                slot: Some(slot.clone()),
                len: new_len,
                checksum,
                pending: Some(pending),
            });
        }

        let slot = self.allocate(new_len)?;
        let (buf, copy_on_write) = match current.filter(|_| cur_len > 0) {
            Some(generation) => {
                EngineMetrics::incr(&self.metrics.safe_write_indirect_append);
                let mut buf = self.read_old(generation, cur_len)?;
                buf.resize(offset as usize, 0);
                buf.extend_from_slice(data);
                (Cow::Owned(buf), true)
            }
            None => (with_leading_zeros(offset, data), false),
        };
        Ok(WritePlan {
            slot: Some(slot),
            len: new_len,
            checksum,
            pending: Some(PendingWrite {
                offset: 0,
                buf,
                copy_on_write,
            }),
        })
    }

    /// Write that touches existing content: always into a new slot.
    fn plan_overwrite<'a>(
        &self,
        current: Option<&Generation>,
        offset: u32,
        data: &'a [u8],
        delta_checksum: u32,
    ) -> Result<WritePlan<'a>> {
        let cur_len = current.map_or(0, |g| g.meta().len);
        let end = offset + data.len() as u32;
        let new_len = cur_len.max(end);

        let (buf, checksum) = match current {
            Some(_) if offset == 0 && end >= cur_len => {
                EngineMetrics::incr(&self.metrics.checksum_reuse);
                (Cow::Borrowed(data), delta_checksum)
            }
            Some(generation) => {
                let mut buf = self.read_old(generation, cur_len)?;
                buf.resize(new_len as usize, 0);
                buf[offset as usize..end as usize].copy_from_slice(data);
                EngineMetrics::incr(&self.metrics.checksum_recalculate);
                let checksum = checksum::checksum(&buf);
                (Cow::Owned(buf), checksum)
            }
            None => (Cow::Borrowed(data), delta_checksum),
        };

        let slot = self.allocate(new_len)?;
        Ok(WritePlan {
            slot: Some(slot),
            len: new_len,
            checksum,
            pending: Some(PendingWrite {
                offset: 0,
                buf,
                copy_on_write: true,
            }),
        })
    }

    fn plan_truncate<'a>(
        &self,
        current: Option<&Generation>,
        length: u32,
    ) -> Result<WritePlan<'a>> {
        let cur_len = current.map_or(0, |g| g.meta().len);
        let cur_checksum = current.map_or(0, |g| g.meta().checksum);
        let cur_slot = current.and_then(Generation::slot);

        if length <= cur_len {
            EngineMetrics::incr(&self.metrics.safe_write_truncate_shorten);
            let checksum = match current {
                Some(generation) if length < cur_len => {
                    EngineMetrics::incr(&self.metrics.checksum_recalculate);
                    checksum::checksum(&generation.read(0, length)?)
                }
                _ => {
                    EngineMetrics::incr(&self.metrics.checksum_reuse);
                    cur_checksum
                }
            };
            return Ok(WritePlan {
                slot: cur_slot.filter(|_| length > 0).cloned(),
                len: length,
                checksum,
                pending: None,
            });
        }

        let grow = length - cur_len;
        EngineMetrics::incr(&self.metrics.checksum_combine);
        let checksum = checksum::combine(cur_checksum, checksum::zeros(grow as u64), grow as u64);

        if let Some(slot) = cur_slot.filter(|s| s.can_extend(cur_len) && s.slot_size() >= length) {
            EngineMetrics::incr(&self.metrics.safe_write_truncate_extend);
            let zeros = Cow::Owned(vec![0u8; grow as usize]);
            let pending = self.in_place(slot, cur_len, zeros)?;
            return Ok(WritePlan {
                slot: Some(slot.clone()),
                len: length,
                checksum,
                pending: Some(pending),
            });
        }

        let slot = self.allocate(length)?;
        let (buf, copy_on_write) = match current.filter(|_| cur_len > 0) {
            Some(generation) => {
                let mut buf = self.read_old(generation, cur_len)?;
                buf.resize(length as usize, 0);
                (buf, true)
            }
            None => (vec![0u8; length as usize], false),
        };
        Ok(WritePlan {
            slot: Some(slot),
            len: length,
            checksum,
            pending: Some(PendingWrite {
                offset: 0,
                buf: Cow::Owned(buf),
                copy_on_write,
            }),
        })
    }

    /// Prepare an in-place write of `payload` at `start`, widened down to
    /// the alignment boundary with the existing tail bytes.
    fn in_place<'a>(
        &self,
        slot: &SlotRef,
        start: u32,
        payload: Cow<'a, [u8]>,
    ) -> Result<PendingWrite<'a>> {
        let aligned = start - start % IO_ALIGN;
        if aligned == start {
            return Ok(PendingWrite {
                offset: start,
                buf: payload,
                copy_on_write: false,
            });
        }

        let tail_len = start - aligned;
        let mut buf = vec![0u8; tail_len as usize];
        slot.read_at(aligned, &mut buf)?;
        EngineMetrics::incr(&self.metrics.safe_write_read_tail_times);
        EngineMetrics::add(&self.metrics.safe_write_read_tail_bytes, tail_len as u64);

        buf.extend_from_slice(&payload);
        Ok(PendingWrite {
            offset: aligned,
            buf: Cow::Owned(buf),
            copy_on_write: false,
        })
    }

    /// Read the current content for copying into a new slot.
    fn read_old(&self, generation: &Generation, len: u32) -> Result<Vec<u8>> {
        let _timer = EngineMetrics::timer(
            &self.metrics.copy_on_write_read_times,
            &self.metrics.copy_on_write_read_latency,
        );
        let buf = generation.read(0, len)?;
        EngineMetrics::add(&self.metrics.copy_on_write_read_bytes, buf.len() as u64);
        Ok(buf)
    }

    /// Write planned bytes into `slot`.
    pub fn execute(&self, slot: &SlotRef, pending: &PendingWrite<'_>) -> Result<()> {
        let _cow_timer = pending.copy_on_write.then(|| {
            EngineMetrics::timer(
                &self.metrics.copy_on_write_times,
                &self.metrics.copy_on_write_latency,
            )
        });
        let _timer =
            EngineMetrics::timer(&self.metrics.pwrite_times, &self.metrics.pwrite_latency);
        slot.write_at(pending.offset, &pending.buf)
    }
}

fn with_leading_zeros(zeros: u32, data: &[u8]) -> Cow<'_, [u8]> {
    if zeros == 0 {
        return Cow::Borrowed(data);
    }
    let mut buf = vec![0u8; zeros as usize];
    buf.extend_from_slice(data);
    Cow::Owned(buf)
}
