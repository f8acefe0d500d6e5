use std::env;
use std::path::PathBuf;

fn main() {
    // Generate the C header for the embedding API
    let crate_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let output_path = PathBuf::from(&crate_dir).join("include").join("mire.h");

    std::fs::create_dir_all(PathBuf::from(&crate_dir).join("include")).ok();

    let config = cbindgen::Config {
        language: cbindgen::Language::C,
        include_guard: Some("MIRE_H".to_string()),
        ..Default::default()
    };

    if let Err(e) = cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
        .map(|bindings| bindings.write_to_file(&output_path))
    {
        eprintln!("Warning: Failed to generate C header: {}", e);
    }
}
