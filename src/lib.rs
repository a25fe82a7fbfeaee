#[macro_use]
extern crate rocket;

#[macro_use]
extern crate log;

#[cfg(test)]
#[macro_use]
extern crate backend_test;

use rocket::{Build, Rocket};

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod rate_limit;
pub mod validation;

pub use config::Config;

use config::{ConfigFairing, DatabaseFairing};
use logging::LoggerFairing;
use rate_limit::RateLimitFairing;

/// Construct the server, ready to launch.
pub fn build() -> Rocket<Build> {
    rocket::build()
        .mount("/", api::routes())
        .attach(LoggerFairing)
        .attach(ConfigFairing)
        .attach(DatabaseFairing)
        .attach(RateLimitFairing)
}

/// Connect to the test database deployment.
/// The commit protocol uses multi-document transactions, so this must be a
/// replica set, not a standalone server.
#[cfg(test)]
async fn db_client() -> mongodb::Client {
    let db_uri =
        std::env::var("DB_URI").unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
    mongodb::Client::with_uri_str(&db_uri)
        .await
        .expect("Failed to connect to the test database")
}

/// Get a fresh database name, random to avoid collisions between tests.
#[cfg(test)]
fn database() -> String {
    let random: u32 = rand::random();
    format!("test{random}")
}

/// Construct the server against an existing database connection, bypassing
/// the database fairing so each test gets its own isolated database.
#[cfg(test)]
async fn rocket_for_db(client: mongodb::Client, db_name: &str) -> Rocket<Build> {
    let db = client.database(db_name);
    model::mongodb::ensure_indexes_exist(&db)
        .await
        .expect("Failed to create indexes on the test database");
    rocket::build()
        .mount("/", api::routes())
        .attach(ConfigFairing)
        .attach(RateLimitFairing)
        .manage(client)
        .manage(db)
}
