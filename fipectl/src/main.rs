use clap::Parser;

fn main() {
    let cli = fipectl::Cli::parse();
    if let Err(err) = fipectl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
