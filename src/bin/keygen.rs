//! Shared signing secret generator for exit-pass deployments.
//!
//! This utility generates a random 32-byte secret and outputs:
//! - The secret as hex, ready for `EXIT_PASS_SIGNING_SECRET`
//! - A config file snippet written to the output directory
//!
//! Usage:
//!   cargo run --bin exit-pass-keygen [output-dir]

use color_eyre::eyre::WrapErr;
use exit_pass::token::SigningKey;
use rand::RngCore;
use std::env;
use std::fs;
use std::path::PathBuf;

const SECRET_LEN: usize = 32;

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    println!("Signing secret generator for exit-pass\n");

    // Get output directory from args or use current directory
    let output_dir = match env::args().nth(1) {
        Some(dir) => PathBuf::from(dir),
        None => env::current_dir().wrap_err("Failed to get current directory")?,
    };
    fs::create_dir_all(&output_dir).wrap_err("Failed to create output directory")?;

    let mut secret = [0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut secret);
    let secret_hex = hex::encode(secret);

    // Round-trip through the parser the gate uses.
    SigningKey::from_hex(&secret_hex)?;

    let snippet_path = output_dir.join("exit-pass-secret.toml");
    let snippet = format!(
        "# Generated: {}\n# Share with every device that issues or verifies exit passes.\nsigning_secret = \"{secret_hex}\"\n",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );
    fs::write(&snippet_path, snippet).wrap_err("Failed to write config snippet")?;

    println!("Secret ({SECRET_LEN} bytes): {secret_hex}");
    println!("\nConfig snippet saved to: {}", snippet_path.display());
    println!("  WARNING: Keep this file secure! Anyone holding it can mint exit passes.");
    println!("\nOr export it:\n  export EXIT_PASS_SIGNING_SECRET={secret_hex}");

    Ok(())
}
