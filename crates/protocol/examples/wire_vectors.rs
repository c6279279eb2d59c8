//! Print wire vectors for interop testing against other exec clients.
//!
//! Run with: cargo run --package exec-protocol --example wire_vectors

use exec_protocol::Frame;

fn main() {
    print_vector("tty_size_default", &Frame::tty_size(80, 24));
    print_vector("stdin_enter", &Frame::stdin(b"\r".to_vec()));
    print_vector("stdin_ctrl_c", &Frame::stdin(vec![0x03]));
    print_vector("stdout_prompt", &Frame::Stdout("sh-3.2 🥳$".as_bytes().to_vec()));
}

fn print_vector(name: &str, frame: &Frame) {
    match frame.to_json() {
        Ok(json) => println!("{}: {}", name, json),
        Err(e) => eprintln!("{}: failed to encode: {}", name, e),
    }
}
