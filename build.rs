fn main() {
    // Copper's structured log macros intern their format strings into this directory.
    println!(
        "cargo:rustc-env=LOG_INDEX_DIR={}",
        std::env::var("OUT_DIR").unwrap()
    );
}
