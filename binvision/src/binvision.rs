fn main() {
    if let Err(e) = binvision_core::run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
