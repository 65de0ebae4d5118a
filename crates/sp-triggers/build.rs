// SPDX-License-Identifier: Apache-2.0

//! Generates the Envoy ext-proc v3 server stub from the trimmed proto in
//! `proto/`. Only the server half is needed: this process is always the
//! `ExternalProcessor` service, never its client.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    let out_dir = std::env::var("OUT_DIR")?;
    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .file_descriptor_set_path(std::path::Path::new(&out_dir).join("ext_proc_descriptor.bin"))
        .compile_protos(&["proto/ext_proc.proto"], &["proto"])?;

    // KServe's GRPCInferenceService: server half only, same reasoning as
    // above. No reflection descriptor needed here.
    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(&["proto/inference.proto"], &["proto"])?;
    Ok(())
}
