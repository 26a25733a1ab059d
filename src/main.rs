mod app;
mod capture;
mod cli;
mod config;
mod ui;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("simpleshot=info"))
        .init();

    if let Err(code) = cli::handle_cli_if_requested() {
        std::process::exit(code);
    }

    app::run();
}
