fn main() {
    std::process::exit(relaybus::app::startup::startup());
}
