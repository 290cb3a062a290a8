fn main() {
    if let Err(err) = unstable_server::run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}
