//! Compiles the minimal Meshtastic protobuf subset in `proto/mesh.proto`
//! into `radio::proto` at build time.

fn main() -> std::io::Result<()> {
    println!("cargo:rerun-if-changed=proto/mesh.proto");

    let protoc = protoc_bin_vendored::protoc_bin_path()
        .expect("protoc-bin-vendored failed to locate a vendored protoc binary");
    std::env::set_var("PROTOC", protoc);

    prost_build::compile_protos(&["proto/mesh.proto"], &["proto/"])
}
