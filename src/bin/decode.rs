//! Decode slimlink control frames from hex or base64.
//!
//! Usage: cargo run --bin decode <hex_or_base64_string>

use base64::Engine;
use slimlink::codec;
use slimlink::msg::Command;
use slimlink::transport::describe;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <hex_or_base64_string>", args[0]);
        std::process::exit(1);
    }

    let input = args[1].trim();
    let data = decode_input(input);

    println!("Raw bytes ({} bytes): {:02x?}", data.len(), data);
    println!();

    decode_frames(&data);
}

fn decode_input(input: &str) -> Vec<u8> {
    // Try hex first (all chars are 0-9, a-f, A-F)
    if input.chars().all(|c| c.is_ascii_hexdigit())
        && input.len().is_multiple_of(2)
        && let Ok(d) = (0..input.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&input[i..i + 2], 16))
            .collect()
    {
        return d;
    }

    // Try base64
    if let Ok(d) = base64::engine::general_purpose::STANDARD.decode(input) {
        return d;
    }

    // Try base64 URL-safe variant
    if let Ok(d) = base64::engine::general_purpose::URL_SAFE.decode(input) {
        return d;
    }

    eprintln!("Failed to decode as hex or base64");
    std::process::exit(1);
}

fn decode_frames(data: &[u8]) {
    if data.is_empty() {
        println!("Empty data");
        return;
    }

    let mut rest = data;
    let mut index = 0;
    loop {
        match codec::decode(rest) {
            Ok(Some((frame, remaining))) => {
                let tag = frame
                    .tag()
                    .map(|t| String::from_utf8_lossy(&t).into_owned())
                    .unwrap_or_else(|| "????".to_string());
                println!("Frame[{index}]: tag={tag} length={}", frame.length());
                match Command::decode(&frame) {
                    Ok(cmd) => {
                        println!("  {}", describe(&cmd));
                        println!("  {cmd:#?}");
                    }
                    Err(e) => {
                        println!("  Undecodable: {e}");
                        println!("  Payload hex: {:02x?}", frame.payload());
                    }
                }
                println!();
                rest = remaining;
                index += 1;
            }
            Ok(None) => {
                if !rest.is_empty() {
                    println!("Incomplete trailing frame: {} bytes", rest.len());
                }
                break;
            }
            Err(e) => {
                eprintln!("Malformed frame: {e}");
                break;
            }
        }
    }

    println!("{index} frame(s)");
}
