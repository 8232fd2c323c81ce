//! Embeds the QPU program named by `LQPU_PROGRAM`.
//!
//! The file is copied to `$OUT_DIR/program.bin` verbatim. Without the
//! variable an empty file is written and the binary falls back to a program
//! that ends its thread immediately.
use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;

fn main() -> io::Result<()> {
    let out_dir = PathBuf::from(env::var_os("OUT_DIR").ok_or(io::ErrorKind::NotFound)?);
    let target = out_dir.join("program.bin");

    println!("cargo:rerun-if-env-changed=LQPU_PROGRAM");
    match env::var_os("LQPU_PROGRAM") {
        Some(path) => {
            let path = PathBuf::from(path);
            println!("cargo:rerun-if-changed={}", path.display());
            fs::copy(&path, &target)?;
        }
        None => fs::write(&target, [])?,
    }
    Ok(())
}
