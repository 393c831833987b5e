use std::env;
use std::fs;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-env-changed=BPF_BLOCK_TRACE_PATH");

    let Ok(out_dir) = env::var("OUT_DIR") else {
        return;
    };

    // Packaging builds inject the compiled object; embed a stable copy of it.
    match env::var("BPF_BLOCK_TRACE_PATH") {
        Ok(source) if fs::metadata(&source).is_ok() => {
            let dest = PathBuf::from(out_dir).join("block-trace");
            fs::copy(&source, &dest)
                .unwrap_or_else(|e| panic!("Failed to copy block-trace eBPF object: {}", e));
            println!("cargo:rustc-env=BPF_BLOCK_TRACE_FILE={}", dest.display());
        }
        Ok(source) => {
            println!("cargo:warning=BPF_BLOCK_TRACE_PATH={} does not exist", source);
        }
        Err(_) => {}
    }
}
