// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Minimal `actix-web` HTTP facade (§6), implementing exactly the routes
//! the specification lists and nothing more: `GET /search`, `PUT`/`DELETE
//! /databases/{db}/features/{key}`, `GET /databases`, `GET /health`, and
//! `PUT /savepoints[/{db}]`. Errors are translated per §7's documented
//! status codes.

use std::sync::Arc;

use actix_web::{delete, get, put, web, App, HttpResponse, HttpServer, Responder};
use serde::{Deserialize, Serialize};

use annforest::registry::DatabaseRegistry;
use annforest::{Config, Error};

struct AppState {
    registry: DatabaseRegistry,
    config: Config,
}

#[derive(Deserialize)]
struct SearchQuery {
    database: String,
    key: i32,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    10
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(e: &Error) -> HttpResponse {
    match e {
        Error::NotFound | Error::Timeout => HttpResponse::NotFound().json(ErrorBody { error: e.to_string() }),
        Error::SearchError(_) => {
            log::warn!("search failed: {e}");
            HttpResponse::NotFound().json(ErrorBody { error: e.to_string() })
        }
        Error::Invariant(_) | Error::Csv(_) | Error::Json(_) | Error::TargetNotExist => {
            HttpResponse::UnprocessableEntity().json(ErrorBody { error: e.to_string() })
        }
        Error::Io(_) | Error::Binlog(_) => {
            log::error!("internal error: {e}");
            HttpResponse::InternalServerError().json(ErrorBody { error: "internal error".into() })
        }
    }
}

#[get("/search")]
async fn search(state: web::Data<AppState>, query: web::Query<SearchQuery>) -> impl Responder {
    let db = match state.registry.get(&query.database) {
        Ok(db) => db,
        Err(e) => return error_response(&e),
    };

    let timeout = state.config.search_timeout();
    let query = query.into_inner();
    let result = web::block(move || db.search_item_with_deadline(query.key, query.limit, None, timeout)).await;

    match result {
        Ok(Ok(keys)) => HttpResponse::Ok().json(keys),
        Ok(Err(e)) => error_response(&e),
        Err(_) => HttpResponse::InternalServerError().json(ErrorBody { error: "search task panicked".into() }),
    }
}

#[derive(Deserialize)]
struct FeaturesBody {
    features: Vec<f64>,
}

#[put("/databases/{db}/features/{key}")]
async fn put_features(state: web::Data<AppState>, path: web::Path<(String, i32)>, body: web::Json<FeaturesBody>) -> impl Responder {
    let (db_name, key) = path.into_inner();
    let db = match state.registry.get(&db_name) {
        Ok(db) => db,
        Err(e) => return error_response(&e),
    };

    match db.put(key, body.into_inner().features) {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(e) => error_response(&e),
    }
}

#[delete("/databases/{db}/features/{key}")]
async fn delete_features(state: web::Data<AppState>, path: web::Path<(String, i32)>) -> impl Responder {
    let (db_name, key) = path.into_inner();
    let db = match state.registry.get(&db_name) {
        Ok(db) => db,
        Err(e) => return error_response(&e),
    };

    match db.delete(key) {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(e) => error_response(&e),
    }
}

#[get("/databases")]
async fn list_databases(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.registry.names())
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().finish()
}

/// Schedules an asynchronous savepoint (Key↔ID Map flush) for one database,
/// or every database when `{db}` is omitted. Accepted immediately; the
/// actual write happens on a spawned task.
#[put("/savepoints/{db}")]
async fn savepoint_one(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let name = path.into_inner();
    match state.registry.get(&name) {
        Ok(db) => {
            actix_rt::spawn(async move {
                if let Err(e) = db.save_keymap() {
                    log::error!("savepoint failed for {name}: {e}");
                }
            });
            HttpResponse::Accepted().finish()
        }
        Err(e) => error_response(&e),
    }
}

#[put("/savepoints")]
async fn savepoint_all(state: web::Data<AppState>) -> impl Responder {
    for name in state.registry.names() {
        if let Ok(db) = state.registry.get(&name) {
            actix_rt::spawn(async move {
                if let Err(e) = db.save_keymap() {
                    log::error!("savepoint failed for {name}: {e}");
                }
            });
        }
    }
    HttpResponse::Accepted().finish()
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config = Config::new();
    let scratch_dir = config.data_dir().join(".scratch");
    let registry = DatabaseRegistry::open(config.data_dir(), &scratch_dir)
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    registry.spawn_apply_engines(config.apply_interval());

    let state = Arc::new(AppState { registry, config: config.clone() });
    let workers = config.worker_threads();

    log::info!("annforest-server listening on 127.0.0.1:8080");

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::from(state.clone()))
            .service(search)
            .service(put_features)
            .service(delete_features)
            .service(list_databases)
            .service(health)
            .service(savepoint_one)
            .service(savepoint_all)
    })
    .workers(workers)
    .shutdown_timeout(config.shutdown_timeout().as_secs())
    .bind(("127.0.0.1", 8080))?
    .run();

    server.await
}
