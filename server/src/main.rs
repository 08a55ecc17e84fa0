use std::path::PathBuf;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use clap::Parser;

use server::auth::{IdentityVerifier, StaticTokenVerifier};
use server::connection::ws_index;
use server::server::spawn_server;
use server::store::{CanvasStore, FileCanvasStore};

/// Real-time collaborative canvas session server.
#[derive(Parser)]
struct Opts {
    /// Address to bind the websocket endpoint to.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,
    /// Directory holding one JSON document per canvas.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,
    /// JSON file mapping bearer tokens to user identities.
    #[arg(long, default_value = "./tokens.json")]
    tokens: PathBuf,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let opts = Opts::parse();
    std::fs::create_dir_all(&opts.data_dir)?;

    let store: Arc<dyn CanvasStore> = Arc::new(FileCanvasStore::new(opts.data_dir.clone()));
    let verifier: Arc<dyn IdentityVerifier> = Arc::new(StaticTokenVerifier::from_file(&opts.tokens)?);
    let verifier = web::Data::from(verifier);

    let srv_tx = spawn_server(store);

    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(web::Data::new(srv_tx.clone()))
            .app_data(verifier.clone())
            .route("/ws", web::get().to(ws_index))
    })
    .bind(&opts.bind)?
    .run()
    .await
}
