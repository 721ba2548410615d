fn main() {
    let args: Vec<String> = std::env::args().collect();
    std::process::exit(shuttle::worker::file::entry(&args));
}
