pub mod schema;
pub mod models;

pub mod url;
pub mod pool;
pub mod migrations;

pub mod dims;
pub mod staging;
pub mod copy;
pub mod partition;
pub mod merge;
pub mod quality;

pub use diesel::{Connection, PgConnection};
