use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);

    // The sidecar is a server towards the build client and a client
    // towards the backends, so both stub halves are needed. The
    // descriptor set feeds the reflection service.
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .file_descriptor_set_path(out_dir.join("sidecar_descriptor.bin"))
        .compile(
            &[
                "../proto/publish_build_event.proto",
                "../proto/bytestream.proto",
                "../proto/remote_execution.proto",
            ],
            &["../proto"],
        )?;
    Ok(())
}
