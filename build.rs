fn main() -> Result<(), Box<dyn std::error::Error>> {
    // SAFETY: single-threaded build script, no concurrent env access.
    unsafe {
        std::env::set_var("PROTOC", protobuf_src::protoc());
    }

    tonic_prost_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["proto/worker.proto"], &["proto/"])?;
    Ok(())
}
