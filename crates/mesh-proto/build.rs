fn main() {
    println!("cargo:rerun-if-changed=proto/mesh.proto");
    prost_build::compile_protos(&["proto/mesh.proto"], &["proto/"])
        .expect("failed to compile mesh.proto");
}
