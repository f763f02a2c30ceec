use clap::Parser;
use curb::Args;

// --------------------------------------------------
fn main() {
    if let Err(e) = curb::run(Args::parse()) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
