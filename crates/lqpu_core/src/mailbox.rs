//! Linux firmware channel: the VideoCore property mailbox.
//!
//! Property requests go through `ioctl` on `/dev/vcio`; shared memory and
//! the peripheral window are reached by mapping `/dev/mem`.

use crate::firmware::{Firmware, MemHandle, RegisterIo};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use lqpu_common::firmware::{
    REQUEST, RESPONSE_OK, TAG_ENABLE_QPU, TAG_END, TAG_EXECUTE_QPU, TAG_MEM_ALLOC, TAG_MEM_FREE,
    TAG_MEM_LOCK, TAG_MEM_UNLOCK,
};
use lqpu_common::mmio::PAGE_SIZE;
use log::{debug, trace, warn};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsFd, AsRawFd};

/// Character device of the property mailbox.
pub const MAILBOX_DEVICE: &str = "/dev/vcio";

/// Physical memory device used for all host mappings.
pub const MEM_DEVICE: &str = "/dev/mem";

const fn iowr(kind: u32, nr: u32, size: usize) -> libc::c_ulong {
    ((3u32 << 30) | ((size as u32) << 16) | (kind << 8) | nr) as libc::c_ulong
}

/// `_IOWR(100, 0, char *)`: submit one property message.
pub const IOCTL_MBOX_PROPERTY: libc::c_ulong = iowr(100, 0, size_of::<*mut libc::c_char>());

/// Index of the first response word in a single-tag message.
const VALUE_WORD: usize = 5;

/// Encodes a single-tag property message.
///
/// Layout: total byte size, request code, tag, value buffer size, request
/// size, the arguments, the end tag. The value buffer doubles as the
/// response buffer, so it is never smaller than one word.
pub fn encode_property(tag: u32, args: &[u32]) -> Vec<u32> {
    let value_words = args.len().max(1);
    let mut msg = Vec::with_capacity(VALUE_WORD + value_words + 1);
    msg.push(0);
    msg.push(REQUEST);
    msg.push(tag);
    msg.push((value_words * 4) as u32);
    msg.push((args.len() * 4) as u32);
    msg.extend_from_slice(args);
    msg.resize(VALUE_WORD + value_words, 0);
    msg.push(TAG_END);
    msg[0] = (msg.len() * 4) as u32;
    msg
}

/// Extracts the first response word, if the firmware accepted the message.
pub fn decode_property(msg: &[u32]) -> Option<u32> {
    if msg.len() <= VALUE_WORD || msg[1] != RESPONSE_OK {
        return None;
    }
    Some(msg[VALUE_WORD])
}

/// Process-wide ownership of the accelerator.
static CLAIMED: AtomicBool = AtomicBool::new(false);

/// The property mailbox opened on `/dev/vcio`.
#[derive(Debug)]
pub struct VcMailbox {
    device: File,
}

impl VcMailbox {
    pub fn open() -> io::Result<Self> {
        let device = File::open(MAILBOX_DEVICE)?;
        debug!("opened {MAILBOX_DEVICE} as fd {}", device.as_raw_fd());
        Ok(Self { device })
    }

    /// Sends one property request and returns its first response word.
    fn property(&self, tag: u32, args: &[u32]) -> Option<u32> {
        let mut msg = encode_property(tag, args);
        // SAFETY: `msg` is a complete property buffer whose first word holds
        // its byte length; the firmware writes at most that many bytes back.
        let ret = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                IOCTL_MBOX_PROPERTY as _,
                msg.as_mut_ptr(),
            )
        };
        if ret < 0 {
            warn!(
                "mailbox ioctl for tag {tag:#x} failed: {}",
                io::Error::last_os_error()
            );
            return None;
        }
        let value = decode_property(&msg);
        trace!("tag {tag:#x} {args:x?} -> {value:x?}");
        if value.is_none() {
            warn!("firmware rejected tag {tag:#x} with code {:#x}", msg[1]);
        }
        value
    }

    /// Maps `size` bytes of physical memory at `base`.
    ///
    /// Returns the page-aligned mapping start along with the pointer to
    /// `base` inside it.
    fn map_physical(base: u32, size: u32) -> io::Result<(NonNull<u8>, usize)> {
        let offset = (base % PAGE_SIZE) as usize;
        let mem = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(MEM_DEVICE)?;

        // SAFETY: a fresh shared mapping of /dev/mem at a page-aligned
        // offset; no existing memory is aliased or replaced.
        let mapped = unsafe {
            mmap(
                core::ptr::null_mut(),
                size as usize + offset,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                mem.as_fd(),
                u64::from(base) - offset as u64,
            )?
        };
        let start = NonNull::new(mapped.cast::<u8>()).ok_or(io::ErrorKind::InvalidData)?;
        // SAFETY: `offset` is less than one page and inside the mapping.
        Ok((unsafe { start.add(offset) }, offset))
    }

    /// # Safety
    ///
    /// `ptr` must come from `map_physical` with the same `size`.
    unsafe fn unmap_physical(ptr: NonNull<u8>, size: u32) {
        let offset = ptr.as_ptr() as usize % PAGE_SIZE as usize;
        // SAFETY: undoes the `offset` added by `map_physical`.
        let start = unsafe { ptr.as_ptr().sub(offset) };
        // SAFETY: guaranteed by the caller.
        if let Err(e) = unsafe { munmap(start.cast(), size as usize + offset) } {
            warn!("munmap at {start:p} failed: {e}");
        }
    }
}

impl Firmware for VcMailbox {
    type Registers = MmioWindow;

    fn channel_id(&self) -> u32 {
        self.device.as_raw_fd() as u32
    }

    fn claim(&self) -> bool {
        CLAIMED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn unclaim(&self) {
        CLAIMED.store(false, Ordering::Release);
    }

    fn set_qpu_enabled(&self, enable: bool) -> bool {
        self.property(TAG_ENABLE_QPU, &[enable as u32]) == Some(0)
    }

    fn mem_alloc(&self, size: u32, align: u32, flags: u32) -> Option<MemHandle> {
        self.property(TAG_MEM_ALLOC, &[size, align, flags])
            .and_then(MemHandle::new)
    }

    fn mem_lock(&self, handle: MemHandle) -> Option<u32> {
        self.property(TAG_MEM_LOCK, &[handle.get()])
            .filter(|&bus| bus != 0)
    }

    fn mem_unlock(&self, handle: MemHandle) -> bool {
        self.property(TAG_MEM_UNLOCK, &[handle.get()]) == Some(0)
    }

    fn mem_free(&self, handle: MemHandle) -> bool {
        self.property(TAG_MEM_FREE, &[handle.get()]) == Some(0)
    }

    fn execute_qpu(&self, num: u32, control: u32, noflush: bool, timeout_ms: u32) -> u32 {
        self.property(
            TAG_EXECUTE_QPU,
            &[num, control, noflush as u32, timeout_ms],
        )
        .unwrap_or(u32::MAX)
    }

    fn map_registers(&self, phys: u32, size: u32) -> Option<MmioWindow> {
        match Self::map_physical(phys, size) {
            Ok((ptr, _)) => Some(MmioWindow {
                ptr,
                len: size as usize,
            }),
            Err(e) => {
                warn!("mapping peripherals at {phys:#010x}: {e}");
                None
            }
        }
    }

    fn unmap_registers(&self, registers: &mut MmioWindow) {
        if registers.len == 0 {
            return;
        }
        // SAFETY: the window was created by `map_registers` with this length.
        unsafe { Self::unmap_physical(registers.ptr, registers.len as u32) };
        registers.len = 0;
    }

    fn map_memory(&self, phys: u32, size: u32) -> Option<NonNull<u8>> {
        match Self::map_physical(phys, size) {
            Ok((ptr, _)) => Some(ptr),
            Err(e) => {
                warn!("mapping shared memory at {phys:#010x}: {e}");
                None
            }
        }
    }

    unsafe fn unmap_memory(&self, ptr: NonNull<u8>, size: u32) {
        // SAFETY: forwarded from the caller's contract.
        unsafe { Self::unmap_physical(ptr, size) }
    }
}

/// The V3D register window mapped from `/dev/mem`.
///
/// Every access is bounds-checked and volatile. Once unmapped the window
/// has length zero and any access panics.
#[derive(Debug)]
pub struct MmioWindow {
    ptr: NonNull<u8>,
    len: usize,
}

impl MmioWindow {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl RegisterIo for MmioWindow {
    fn read(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.len, "register offset {offset:#x} out of bounds");
        // SAFETY: in bounds of the live mapping, and V3D offsets are
        // word-aligned.
        unsafe { core::ptr::read_volatile(self.ptr.as_ptr().add(offset).cast::<u32>()) }
    }

    fn write(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.len, "register offset {offset:#x} out of bounds");
        // SAFETY: as for `read`.
        unsafe {
            core::ptr::write_volatile(self.ptr.as_ptr().add(offset).cast::<u32>(), value);
        }
    }

    fn host_address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}
