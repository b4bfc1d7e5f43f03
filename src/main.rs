fn main() {
    if let Err(err) = hybrid_trips::app::run() {
        eprintln!("application startup failed: {err}");
        std::process::exit(1);
    }
}
