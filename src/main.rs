use actix_web::{web, App, HttpServer};
use anyhow::Context;
use potato_disease::config::{LoadPolicy, Settings};
use potato_disease::server;
use potato_disease::state::AppState;
use potato_disease::util::init_tracing;
use std::path::PathBuf;
use std::{env, process};
use tracing::info;

const USAGE: &str = "usage: ./potato-server [config file]";

fn get_args() -> Option<PathBuf> {
    let args: Vec<String> = env::args().collect();
    if args.len() > 2 {
        println!("{USAGE}");
        process::exit(1);
    }
    args.get(1).map(PathBuf::from)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config_file = get_args();
    let settings = Settings::load(config_file.as_deref()).context("invalid configuration")?;
    init_tracing(&settings.log);

    if settings.load == LoadPolicy::Eager {
        info!("loading model before serving");
    }
    let state = web::Data::new(AppState::from_settings(&settings).with_context(|| {
        format!(
            "could not load model from {}",
            settings.model_path.display()
        )
    })?);

    info!("listening on {}:{}", settings.host, settings.port);

    // Start the HTTP server
    HttpServer::new(move || App::new().configure(server::configure(state.clone())))
        .bind((settings.host.as_str(), settings.port))?
        .run()
        .await?;

    Ok(())
}
