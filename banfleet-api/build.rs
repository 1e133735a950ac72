fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[
                "proto/orch/v1/control.proto",
                "proto/orch/v1/report.proto",
                "proto/orch/v1/rule.proto",
                "proto/orch/v1/strategy.proto",
                "proto/orch/v1/orch.proto",
                "proto/orch/v1/auth.proto",
                "proto/agent/v1/control.proto",
            ],
            &["proto"],
        )?;
    Ok(())
}
