fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The plugin serves DevicePlugin and dials Registration; tests need the
    // opposite pair to play the kubelet.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/deviceplugin/v1beta1/api.proto"], &["proto"])?;
    Ok(())
}
