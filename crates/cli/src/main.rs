fn main() {
    if let Err(error) = tile_reservoir_cli::run(std::env::args_os()) {
        eprintln!("{error:#}");
        std::process::exit(1);
    }
}
