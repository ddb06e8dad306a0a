use std::process::exit;

fn main() {
    if let Err(e) = changeops::run() {
        eprintln!("Error: {}", e);
        exit(e.exit_code());
    }
}
