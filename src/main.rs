use foresight_lib::state::{load_config, AppState};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load config: {}", e);
            std::process::exit(2);
        }
    };

    let state = match AppState::new(config) {
        Ok(state) => state,
        Err(e) => {
            log::error!("Failed to start: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = foresight_lib::run(state).await {
        log::error!("Stopped on fatal error: {}", e);
        std::process::exit(1);
    }
}
