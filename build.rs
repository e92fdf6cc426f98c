//! Build script for the provider protocol stubs.
//!
//! The generated code is committed as `src/protocol.rs`, so normal builds only
//! check that it is present. To regenerate after editing the proto file:
//! `cargo build --features regenerate-proto`.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto = std::path::Path::new("proto/provider.proto");
    let checked_in = std::path::Path::new("src/protocol.rs");

    println!("cargo:rerun-if-changed={}", proto.display());
    println!("cargo:rerun-if-changed={}", checked_in.display());

    #[cfg(feature = "regenerate-proto")]
    {
        let out_dir = std::path::PathBuf::from("src");
        tonic_prost_build::configure()
            .build_client(false)
            .out_dir(&out_dir)
            .compile_protos(&["proto/provider.proto"], &["proto"])?;

        let generated = out_dir.join("provider.v1.rs");
        if generated.exists() {
            std::fs::rename(generated, checked_in)?;
        }
    }

    if !checked_in.exists() {
        return Err(format!(
            "missing protocol stubs '{}'; run with --features regenerate-proto",
            checked_in.display()
        )
        .into());
    }

    Ok(())
}
