fn main() {
    println!("cargo:rerun-if-changed=src");
    println!("cargo:rerun-if-changed=cbindgen.toml");

    let crate_dir = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => dir,
        Err(_) => return,
    };
    let config = cbindgen::Config::from_file("cbindgen.toml").unwrap_or_default();

    // Header generation is best effort so a parse hiccup never blocks the
    // library build itself.
    match cbindgen::Builder::new()
        .with_crate(crate_dir)
        .with_config(config)
        .generate()
    {
        Ok(bindings) => {
            bindings.write_to_file("include/mx_engine.h");
        }
        Err(e) => println!("cargo:warning=unable to generate C bindings: {e}"),
    }
}
