//! Basic usage example for the firmware bundle format.

use bytes::Bytes;
use fwup_bundle::{decode, encode, BundleKey, BundleLayout, RECORD_STRIDE};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Firmware Bundle Example ===\n");

    // 1. Seal a firmware image
    println!("1. Encoding a 2.5 KB firmware image...");
    let key = BundleKey::new(*b"example-key-0001");
    let firmware = Bytes::from((0..2500u32).map(|i| i as u8).collect::<Vec<_>>());

    let bundle = encode(&firmware, 4, "test works", &key)?;
    println!("   Bundle size: {} bytes", bundle.len());

    // 2. Inspect the layout without the key
    println!("\n2. Re-deriving record layout...");
    let layout = BundleLayout::from_bundle(&bundle)?;
    println!("   Version: {}", layout.version);
    println!("   Firmware size: {} bytes", layout.total_plain_size);
    println!("   Firmware chunks: {}", layout.num_chunks());
    for (i, record) in layout.firmware.iter().enumerate() {
        println!(
            "   chunk {:>2} at offset {:>5}: {} ciphertext bytes",
            record.header.chunk_index,
            i * RECORD_STRIDE,
            record.header.padded_length
        );
    }

    // 3. Verify and decrypt
    println!("\n3. Decoding...");
    let decoded = decode(&bundle, &key)?;
    println!("   Release message: {:?}", decoded.message);
    println!("   Firmware matches: {}", decoded.firmware == firmware);

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
