fn main() {
    if let Err(e) = egress6::run_cli() {
        eprintln!("{e:?}");
        std::process::exit(1);
    }
}
