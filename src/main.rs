use std::sync::Arc;
use std::time::Duration;

use actix::Actor;
use actix_cors::Cors;
use actix_web::{http, middleware::Logger, web, App, HttpServer};
use env_logger::Env;
use log::{error, info};

use taskline_chat::app_state::{AppState, Stores};
use taskline_chat::auth::Authentication;
use taskline_chat::chat;
use taskline_chat::chat_db::MongoDB;
use taskline_chat::chat_server::ChatServer;
use taskline_chat::clock::{Clock, SystemClock};
use taskline_chat::config::{Config, StoreBackend};
use taskline_chat::directory::StaticDirectory;
use taskline_chat::store::run_retention_sweep;

const RETENTION_SWEEP_EVERY: Duration = Duration::from_secs(60 * 60);

fn other_error(e: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = Config::from_env().map_err(|e| {
        error!("invalid configuration: {e}");
        other_error(e)
    })?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let stores = match &config.store {
        StoreBackend::Mongo { uri } => {
            let mongodb = MongoDB::init(uri, &config.database_name)
                .await
                .map_err(other_error)?;
            mongodb.ensure_indexes(config.limits.retention).await.map_err(other_error)?;
            info!("using MongoDB database {}", config.database_name);
            Stores::mongo(&mongodb, clock.clone(), &config.limits)
        }
        StoreBackend::Memory => {
            info!("using the in-memory store; nothing survives a restart");
            Stores::in_memory(clock.clone(), &config.limits, Arc::new(StaticDirectory::new()))
        }
    };

    actix_web::rt::spawn(run_retention_sweep(
        stores.messages.clone(),
        clock.clone(),
        config.limits.clone(),
        RETENTION_SWEEP_EVERY,
    ));

    let chat_server = ChatServer::new().start();
    let state = AppState::new(config.clone(), chat_server, stores, clock);
    let frontend_origin = config.frontend_origin.clone();

    info!("Server running at http://{}", config.bind_addr);
    info!("Allowed CORS Origin: {}", frontend_origin);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin(&frontend_origin)
            .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
            .allowed_headers(vec![
                http::header::CONTENT_TYPE,
                http::header::ACCEPT,
                http::header::AUTHORIZATION,
            ])
            .expose_headers(vec![taskline_chat::auth::AUTH_ERROR_HEADER])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .wrap(Authentication::new(state.verifier.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .app_data(web::Data::new(state.clone()))
            .configure(chat::configure)
    })
    .bind(&config.bind_addr)?
    .run()
    .await
}
