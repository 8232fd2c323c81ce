//! Platform discovery.
//!
//! Works out where the peripheral registers live, how shared memory must be
//! allocated and how bus addresses translate to host-mappable physical
//! addresses. The vendor host library is consulted when present; every value
//! it cannot provide falls back to the first-generation defaults.

use crate::error::{LqpuError, Result};
use lqpu_common::firmware::{MEM_FLAG_DIRECT, MEM_FLAG_L1_NONALLOCATING};
use lqpu_common::mmio::{
    BUS_ALIAS_MASK, DEFAULT_PERI_ADDR, DEFAULT_PERI_SIZE, GEN1_SDRAM_ADDR, GEN1_UNCACHED_MAP,
};
use log::{debug, info, warn};
use std::ffi::{CString, c_void};

/// Library consulted when no override is configured.
pub const DEFAULT_HOST_LIBRARY: &str = "libbcm_host.so";

/// Environment variable naming an alternative host library.
pub const HOST_LIBRARY_ENV: &str = "LQPU_BCM_HOST";

/// Memory-map parameters of the running board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInfo {
    /// Allocation flags passed to `mem_alloc`; encodes the cache policy.
    pub mem_flags: u32,
    /// Offset added to a bus address before its alias bits are stripped.
    pub mem_map: u32,
    /// Physical base of the peripheral register window.
    pub peri_addr: u32,
    /// Byte size of the peripheral register window.
    pub peri_size: u32,
}

impl HostInfo {
    /// First-generation defaults.
    ///
    /// With the L2 cache in use, shared memory is allocated through the
    /// L1-non-allocating alias and needs no offset. Bypassing it selects the
    /// uncached alias, which first-generation boards expose at a fixed
    /// physical offset.
    pub fn defaults(use_l2_cache: bool) -> Self {
        Self {
            mem_flags: if use_l2_cache {
                MEM_FLAG_L1_NONALLOCATING
            } else {
                MEM_FLAG_DIRECT
            },
            mem_map: if use_l2_cache { 0 } else { GEN1_UNCACHED_MAP },
            peri_addr: DEFAULT_PERI_ADDR,
            peri_size: DEFAULT_PERI_SIZE,
        }
    }

    /// Combines the defaults with whatever `library` reports.
    ///
    /// Each accessor falls back independently. A board whose SDRAM is not at
    /// the first-generation address cannot see the VideoCore L2 from the
    /// host, so the uncached flag and a zero offset are forced regardless of
    /// `use_l2_cache`.
    pub fn from_library(library: Option<&dyn HostLibrary>, use_l2_cache: bool) -> Self {
        let mut info = Self::defaults(use_l2_cache);
        let Some(library) = library else {
            return info;
        };

        match library.sdram_address() {
            Some(sdram) if sdram != GEN1_SDRAM_ADDR => {
                debug!("SDRAM at {sdram:#010x}; host cannot see the L2, using uncached memory");
                info.mem_flags = MEM_FLAG_DIRECT;
                info.mem_map = 0;
            }
            Some(_) => {}
            None => warn!("host library does not report the SDRAM address"),
        }
        match library.peripheral_address() {
            Some(addr) => info.peri_addr = addr,
            None => warn!("host library does not report the peripheral address"),
        }
        match library.peripheral_size() {
            Some(size) => info.peri_size = size,
            None => warn!("host library does not report the peripheral size"),
        }
        info
    }

    /// Runs discovery according to `discovery`.
    ///
    /// # Arguments
    ///
    /// * `discovery` - Load the vendor library or take fixed parameters.
    /// * `use_l2_cache` - With `false` allocations bypass the L2 cache, also
    ///   for fixed parameters. The fixed memory map offset is kept.
    ///
    /// # Errors
    ///
    /// [`LqpuError::LibraryMissing`] when strict discovery finds no library.
    pub fn discover(discovery: &Discovery, use_l2_cache: bool) -> Result<Self> {
        let info = match discovery {
            Discovery::Fixed(info) if use_l2_cache => *info,
            Discovery::Fixed(info) => Self {
                mem_flags: MEM_FLAG_DIRECT,
                ..*info
            },
            Discovery::Probe { library, strict } => match BcmHost::open(library) {
                Some(host) => Self::from_library(Some(&host), use_l2_cache),
                None if *strict => return Err(LqpuError::LibraryMissing),
                None => {
                    warn!("{library} not available, using first-generation defaults");
                    Self::defaults(use_l2_cache)
                }
            },
        };
        info!(
            "platform: peripherals {:#010x}+{:#x}, mem flags {:#x}, mem map {:#x}",
            info.peri_addr, info.peri_size, info.mem_flags, info.mem_map
        );
        Ok(info)
    }

    /// Translates a bus address to the physical address the host maps.
    ///
    /// This is the only place the alias bits are stripped.
    pub fn bus_to_phys(&self, bus: u32) -> u32 {
        bus.wrapping_add(self.mem_map) & !BUS_ALIAS_MASK
    }
}

/// How the session learns the board's memory map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    /// Load the named vendor library. With `strict` a missing library is an
    /// error instead of a fallback to defaults.
    Probe { library: String, strict: bool },
    /// Use the given parameters without probing anything.
    Fixed(HostInfo),
}

impl Default for Discovery {
    fn default() -> Self {
        Self::Probe {
            library: std::env::var(HOST_LIBRARY_ENV)
                .unwrap_or_else(|_| DEFAULT_HOST_LIBRARY.to_string()),
            strict: false,
        }
    }
}

/// The three accessors exported by the vendor host library.
pub trait HostLibrary {
    /// Bus address of SDRAM; `0xC000_0000` means the L2 cache is off.
    fn sdram_address(&self) -> Option<u32>;
    /// Physical base of the peripheral window.
    fn peripheral_address(&self) -> Option<u32>;
    /// Length in bytes of the peripheral window.
    fn peripheral_size(&self) -> Option<u32>;
}

type Accessor = unsafe extern "C" fn() -> u32;

/// `libbcm_host` loaded with `dlopen`.
///
/// Symbols are resolved individually; a missing one reads as `None`.
pub struct BcmHost {
    handle: *mut c_void,
    sdram_address: Option<Accessor>,
    peripheral_address: Option<Accessor>,
    peripheral_size: Option<Accessor>,
}

impl BcmHost {
    /// Loads `path`, returning `None` if the loader cannot find it.
    pub fn open(path: &str) -> Option<Self> {
        let path_cstr = CString::new(path).ok()?;

        // SAFETY: `path_cstr` is a valid NUL-terminated string that outlives
        // the call; a null return is handled below.
        let handle = unsafe { libc::dlopen(path_cstr.as_ptr(), libc::RTLD_LAZY) };
        if handle.is_null() {
            return None;
        }
        debug!("loaded {path}");

        Some(Self {
            handle,
            sdram_address: Self::symbol(handle, "bcm_host_get_sdram_address"),
            peripheral_address: Self::symbol(handle, "bcm_host_get_peripheral_address"),
            peripheral_size: Self::symbol(handle, "bcm_host_get_peripheral_size"),
        })
    }

    fn symbol(handle: *mut c_void, name: &str) -> Option<Accessor> {
        let name = CString::new(name).ok()?;
        // SAFETY: `handle` came from a successful dlopen and is still open;
        // `name` is NUL-terminated.
        let sym = unsafe { libc::dlsym(handle, name.as_ptr()) };
        if sym.is_null() {
            return None;
        }
        // SAFETY: the bcm_host accessors take no arguments and return an
        // unsigned int, matching `Accessor`.
        Some(unsafe { std::mem::transmute::<*mut c_void, Accessor>(sym) })
    }

    fn call(accessor: Option<Accessor>) -> Option<u32> {
        // SAFETY: the pointer was resolved from the library that `self`
        // keeps loaded, and the accessors have no preconditions.
        accessor.map(|f| unsafe { f() })
    }
}

impl HostLibrary for BcmHost {
    fn sdram_address(&self) -> Option<u32> {
        Self::call(self.sdram_address)
    }

    fn peripheral_address(&self) -> Option<u32> {
        Self::call(self.peripheral_address)
    }

    fn peripheral_size(&self) -> Option<u32> {
        Self::call(self.peripheral_size)
    }
}

impl Drop for BcmHost {
    fn drop(&mut self) {
        // SAFETY: `handle` came from dlopen and is closed exactly once here;
        // no resolved symbol outlives `self`.
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}
