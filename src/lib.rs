// src/lib.rs

use sea_orm::DatabaseConnection;
use services::relay::RelayService;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub relay: RelayService,
}

pub mod entities {
    pub mod prelude;
    pub mod transfers;
}

pub mod services {
    pub mod attestation;
    pub mod chains;
    pub mod event_watcher;
    pub mod executor;
    pub mod ledger;
    pub mod relay;
}

pub mod models;
pub mod handlers;
pub mod jobs;
