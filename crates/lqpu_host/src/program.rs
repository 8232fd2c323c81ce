//! The embedded QPU program.

use lqpu_core::ProgramImage;

/// The file named by `LQPU_PROGRAM` at build time, or empty.
static EMBEDDED: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/program.bin"));

const NOP: u64 = 0x1000_09e7_009e_7000;
const THREAD_END: u64 = 0x3000_09e7_009e_7000;

/// Ends the thread at once. The two trailing instructions fill the delay
/// slots after the thread-end signal.
pub const HALT_INSTRUCTIONS: [u64; 3] = [THREAD_END, NOP, NOP];

static HALT: [u8; 24] = instruction_bytes(HALT_INSTRUCTIONS);

const fn instruction_bytes(words: [u64; 3]) -> [u8; 24] {
    let mut out = [0u8; 24];
    let mut i = 0;
    while i < words.len() {
        let bytes = words[i].to_le_bytes();
        let mut j = 0;
        while j < 8 {
            out[i * 8 + j] = bytes[j];
            j += 1;
        }
        i += 1;
    }
    out
}

/// Whether a real program was embedded.
pub fn is_embedded() -> bool {
    !EMBEDDED.is_empty()
}

pub fn program() -> ProgramImage<'static> {
    if is_embedded() {
        ProgramImage::new(EMBEDDED)
    } else {
        ProgramImage::new(&HALT)
    }
}
