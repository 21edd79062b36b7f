fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Rebuild triggers
    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-env-changed=LLAMA_LIB_DIR");

    #[cfg(feature = "llama-inference")]
    link_llama()?;

    Ok(())
}

/// Link the prebuilt llama.cpp shared library.
///
/// Build it first:
///   cmake -B build -DBUILD_SHARED_LIBS=ON && cmake --build build
/// then point LLAMA_LIB_DIR at the directory holding libllama.
#[cfg(feature = "llama-inference")]
fn link_llama() -> Result<(), Box<dyn std::error::Error>> {
    use std::path::PathBuf;

    let lib_dir = match std::env::var("LLAMA_LIB_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => PathBuf::from("../llama.cpp/build"),
    };

    let llama_lib_exists = lib_dir.join("libllama.so").exists()
        || lib_dir.join("libllama.dylib").exists()
        || lib_dir.join("llama.dll").exists();

    if !llama_lib_exists {
        panic!(
            "llama-inference feature enabled but libllama not found in {}.\n\
             Set LLAMA_LIB_DIR to the llama.cpp build directory.",
            lib_dir.display()
        );
    }

    let lib_abs = std::fs::canonicalize(&lib_dir)?;
    println!("cargo:rustc-link-search=native={}", lib_abs.display());
    println!("cargo:rustc-link-lib=dylib=llama");

    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os == "macos" {
        println!("cargo:rustc-link-lib=c++");
    } else if target_os == "linux" {
        println!("cargo:rustc-link-lib=stdc++");
    }

    Ok(())
}
