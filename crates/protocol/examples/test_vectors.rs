//! Generate pairing test vectors for device manager interop testing.
//!
//! Run with: cargo run --package protocol --example test_vectors

use protocol::{CryptoEngine, KeyMaterial, KeySource, MessageFormatter, DEFAULT_SALT};

const DRIVER_ID: &str = "5591944b-b354-404e-b714-70652e94ef03";
const PASSCODE: &str = "0f6e1b7a-4c57-4d2b-9d7e-0b1f2e3c4d5e";

fn main() {
    // Test vector 1: PBKDF2 key from the default salt
    let key = KeyMaterial::derive(DEFAULT_SALT, PASSCODE);
    println!("=== derived_key ===");
    println!("salt:     {}", DEFAULT_SALT);
    println!("passcode: {}", PASSCODE);
    println!("key:      {}", key.as_hex());
    println!();

    let mut crypto = CryptoEngine::new();
    crypto
        .configure(KeySource::EncryptionKey(key.as_hex().to_string()))
        .expect("derived key is valid hex");
    let formatter = MessageFormatter::new(DRIVER_ID, "Test Vectors");

    // Test vector 2: pair request (random fields differ per run)
    print_test_vector("pair", &formatter.pair(&crypto).expect("pair"));

    // Test vector 3: encrypted ping
    let ping = formatter.ping().expect("ping");
    let ciphertext = crypto.encrypt_envelope(&ping).expect("encrypt");
    print_test_vector("ping", &ping);
    println!("ciphertext ({} bytes): {}", ciphertext.len(), hex_string(&ciphertext));
}

fn print_test_vector(name: &str, json: &str) {
    println!("=== {} ===", name);
    println!("json: {}", json);
    println!();
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
