// NVMe queue management
// Reference: NVM Express Base Specification 2.0, Section 6
//
// Queue pointers (SQ tail, CQ head, phase) are persistent state owned by the
// queue; they are never reset in the data path and only die with the queue.

use core::marker::PhantomData;
use core::ptr;

use super::command::{Command, CompletionEntry};
use super::NvmeError;
use crate::arch::x86_64::{io, pit};
use crate::memory::{self, frame::PhysFrame, PAGE_SIZE};

/// Doorbell byte offset for queue `queue_id`:
/// SQ tail at `0x1000 + (2·id) · stride`, CQ head at `0x1000 + (2·id+1) · stride`.
const fn doorbell_offset(queue_id: u16, completion: bool, stride: u64) -> u64 {
    0x1000 + ((queue_id as u64) * 2 + completion as u64) * stride
}

pub struct Submission;
pub struct Completion;

pub trait QueueKind {
    type Entry;
    const IS_COMPLETION: bool;
}

impl QueueKind for Submission {
    type Entry = Command;
    const IS_COMPLETION: bool = false;
}

impl QueueKind for Completion {
    type Entry = CompletionEntry;
    const IS_COMPLETION: bool = true;
}

/// One ring: an owned DMA buffer addressed by physical base + index, plus
/// the doorbell that tells the controller about our progress.
pub struct Queue<K: QueueKind> {
    doorbell: *mut u32,
    entries: *mut K::Entry,
    size: usize,
    frames: PhysFrame,
    frame_count: usize,
    phys: u64,
    _kind: PhantomData<K>,
}

// SAFETY: the raw pointers reference queue DMA memory and an MMIO doorbell
// owned by this queue; access is serialized by the QueuePair's lock.
unsafe impl<K: QueueKind> Send for Queue<K> {}

impl<K: QueueKind> Queue<K> {
    /// Allocate a zeroed, page-aligned DMA ring and locate its doorbell.
    pub fn new(mmio_virt: u64, queue_id: u16, size: usize, stride: u64) -> Result<Self, NvmeError> {
        let bytes = size * core::mem::size_of::<K::Entry>();
        let frame_count = bytes.div_ceil(PAGE_SIZE as usize);
        let frames = memory::allocate_dma_frames(frame_count).ok_or(NvmeError::Alloc)?;
        let phys = frames.as_u64();
        let virt = memory::phys_to_virt(phys);

        let doorbell =
            (mmio_virt + doorbell_offset(queue_id, K::IS_COMPLETION, stride)) as *mut u32;

        Ok(Self {
            doorbell,
            entries: virt as *mut K::Entry,
            size,
            frames,
            frame_count,
            phys,
            _kind: PhantomData,
        })
    }

    pub fn phys_addr(&self) -> u64 {
        self.phys
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn ring_doorbell(&self, value: u32) {
        // The command/head update must be visible before the doorbell write.
        io::barrier();
        // SAFETY: doorbell points into the mapped BAR0 window.
        unsafe { ptr::write_volatile(self.doorbell, value) };
        io::barrier();
    }

    /// Return the ring memory to the frame allocator.
    pub fn release(self) {
        memory::free_frames(self.frames, self.frame_count);
    }
}

impl Queue<Submission> {
    /// Write a command at `tail` and ring the doorbell with the new tail.
    pub fn push(&mut self, command: Command, tail: usize) -> usize {
        // SAFETY: tail < size and entries spans size entries of DMA memory.
        unsafe {
            ptr::write_volatile(self.entries.add(tail), command);
        }
        let new_tail = (tail + 1) % self.size;
        self.ring_doorbell(new_tail as u32);
        new_tail
    }
}

impl Queue<Completion> {
    /// Check for a completion at `head` with the expected phase. Consuming
    /// an entry advances the head (wrapping flips the caller's phase) and
    /// rings the CQ doorbell.
    pub fn pop(&mut self, head: usize, phase: bool) -> Option<(CompletionEntry, usize, bool)> {
        // SAFETY: head < size; the status word is read volatile because the
        // controller writes it behind our back.
        let entry = unsafe {
            let slot = self.entries.add(head);
            let status = ptr::read_volatile(&(*slot).status);
            if ((status & 0x1) != 0) != phase {
                return None;
            }
            ptr::read_volatile(slot)
        };

        let new_head = (head + 1) % self.size;
        let new_phase = if new_head == 0 { !phase } else { phase };
        self.ring_doorbell(new_head as u32);
        Some((entry, new_head, new_phase))
    }
}

/// A submission/completion queue pair with its persistent pointers.
pub struct QueuePair {
    id: u16,
    sq: Queue<Submission>,
    cq: Queue<Completion>,
    sq_tail: usize,
    sq_head: usize,
    cq_head: usize,
    phase: bool,
    next_cid: u16,
}

impl QueuePair {
    pub fn new(
        mmio_virt: u64,
        queue_id: u16,
        sq_entries: usize,
        cq_entries: usize,
        stride: u64,
    ) -> Result<Self, NvmeError> {
        let sq = Queue::new(mmio_virt, queue_id, sq_entries, stride)?;
        let cq = match Queue::new(mmio_virt, queue_id, cq_entries, stride) {
            Ok(cq) => cq,
            Err(e) => {
                sq.release();
                return Err(e);
            }
        };
        Ok(Self {
            id: queue_id,
            sq,
            cq,
            sq_tail: 0,
            sq_head: 0,
            cq_head: 0,
            phase: true,
            next_cid: 1,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn sq_phys(&self) -> u64 {
        self.sq.phys_addr()
    }

    pub fn cq_phys(&self) -> u64 {
        self.cq.phys_addr()
    }

    pub fn sq_entries(&self) -> usize {
        self.sq.size()
    }

    pub fn cq_entries(&self) -> usize {
        self.cq.size()
    }

    fn assign_cid(&mut self) -> u16 {
        let cid = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1);
        if self.next_cid == 0 {
            // Command id 0 is never handed out.
            self.next_cid = 1;
        }
        cid
    }

    /// Submit a command and poll its completion with a deadline.
    ///
    /// Completions carrying a stale command id (from a command that already
    /// timed out) are consumed and ignored.
    pub fn submit(
        &mut self,
        mut command: Command,
        timeout_ms: u64,
    ) -> Result<CompletionEntry, NvmeError> {
        // The tail may never overtake the head.
        if (self.sq_tail + 1) % self.sq.size() == self.sq_head {
            return Err(NvmeError::QueueFull);
        }

        let cid = self.assign_cid();
        command.set_command_id(cid);

        self.sq_tail = self.sq.push(command, self.sq_tail);

        let mut found: Option<CompletionEntry> = None;
        let cq = &mut self.cq;
        let cq_head = &mut self.cq_head;
        let phase = &mut self.phase;
        let sq_head = &mut self.sq_head;

        let result = pit::deadline_poll(
            || {
                while let Some((entry, new_head, new_phase)) = cq.pop(*cq_head, *phase) {
                    *cq_head = new_head;
                    *phase = new_phase;
                    *sq_head = entry.sq_head as usize;
                    if entry.command_id == cid {
                        found = Some(entry);
                        return true;
                    }
                    log::debug!(
                        "NVMe: dropping late completion (cid {} != {})",
                        entry.command_id,
                        cid
                    );
                }
                false
            },
            1,
            timeout_ms,
        );

        match (result, found) {
            (pit::PollResult::Completed, Some(entry)) => {
                if entry.status_field() != 0 {
                    log::error!(
                        "NVMe: command {:#x} failed: type={} code={:#x}",
                        cid,
                        entry.status_type(),
                        entry.status_code()
                    );
                    return Err(NvmeError::DeviceError);
                }
                Ok(entry)
            }
            _ => Err(NvmeError::Timeout),
        }
    }

    /// Free both rings.
    pub fn release(self) {
        self.sq.release();
        self.cq.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doorbell_offsets() {
        // DSTRD=0 → stride 4 bytes.
        assert_eq!(doorbell_offset(0, false, 4), 0x1000);
        assert_eq!(doorbell_offset(0, true, 4), 0x1004);
        assert_eq!(doorbell_offset(1, false, 4), 0x1008);
        assert_eq!(doorbell_offset(1, true, 4), 0x100C);
        // DSTRD=1 → stride 8 bytes.
        assert_eq!(doorbell_offset(1, true, 8), 0x1018);
    }
}
