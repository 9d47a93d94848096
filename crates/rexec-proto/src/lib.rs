pub mod v1 {
    tonic::include_proto!("rexec.v1");
}
