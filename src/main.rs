use rust_dc::{app, config};

#[tokio::main]
async fn main() {
    let config = config::Config::from_env();
    config::init_tracing(&config);
    tracing::info!(dir = %config.data_dir.display(), "rust-dc booted");

    if let Err(err) = app::run(config).await {
        eprintln!("rust-dc: {err:#}");
        std::process::exit(1);
    }
}
