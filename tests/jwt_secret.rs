use std::process::Command;

#[test]
fn fails_without_jwt_secret() {
    let exe = env!("CARGO_BIN_EXE_marketplace-billing");
    let output = Command::new(exe)
        .env_remove("JWT_SECRET")
        .env("BILLING_STORE", "memory")
        .output()
        .expect("failed to run billing binary");
    assert!(!output.status.success());
}
