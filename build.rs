fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored protoc so no system install is needed
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    tonic_build::compile_protos("proto/clusrun.proto")?;
    println!("cargo:rerun-if-changed=proto/clusrun.proto");
    Ok(())
}
