fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/openstate.proto");

    // Use protox (pure-Rust protobuf compiler) so no system `protoc` is needed.
    let fds = protox::compile(["proto/openstate.proto"], ["proto/"])?;

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_fds(fds)?;

    Ok(())
}
